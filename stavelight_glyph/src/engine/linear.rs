// Linear backend.
//
// `LinearEvaluator` is a single affine layer from the standardised descriptor
// to one output per trainable shape. Outputs are unbounded during training
// and clamped to [0, 1] when turned into grades. Weights start at zero and are
// fitted by normalised least-mean-squares: each sample moves every row by
// `rate * error * x / (1 + |x|^2)`, which keeps the step stable whatever the
// descriptor's magnitude. Epoch order comes from a seeded `StaveRng`, as in
// the network backend.

use super::blob::{self, BackendTag};
use super::{
    EvaluationEngine, Layer, ModelError, Normalizer, StartingMode, TrainingOutcome,
    build_training_set, rank_outputs, sample_error,
};
use crate::config::LinearParams;
use crate::glyph::Evaluation;
use crate::moments::{FeatureVector, MOMENT_COUNT};
use crate::population::Population;
use crate::shape::Shape;
use crate::training::{CancelFlag, TrainingMonitor};
use serde::{Deserialize, Serialize};
use stavelight_prng::StaveRng;
use std::fmt::Write as _;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct LinearModel {
    shapes: Vec<Shape>,
    normalizer: Normalizer,
    layer: Layer,
    epochs_trained: usize,
}

impl LinearModel {
    fn fresh(normalizer: Normalizer) -> Self {
        Self {
            shapes: Shape::TRAINABLE.to_vec(),
            normalizer,
            layer: Layer::zeros(MOMENT_COUNT, Shape::TRAINABLE.len()),
            epochs_trained: 0,
        }
    }

    fn fits(&self) -> bool {
        self.shapes == Shape::TRAINABLE
            && self.normalizer.has_dim(MOMENT_COUNT)
            && self.layer.inputs == MOMENT_COUNT
            && self.layer.outputs == Shape::TRAINABLE.len()
    }

    fn update(&mut self, x: &[f64], target: usize, rate: f64) -> f64 {
        let y = self.layer.affine(x);
        let error = sample_error(&y, target);
        let norm = 1.0 + x.iter().map(|v| v * v).sum::<f64>();
        let inputs = self.layer.inputs;
        for (o, yo) in y.iter().enumerate() {
            let t = if o == target { 1.0 } else { 0.0 };
            let g = rate * (t - yo) / norm;
            let row = self.layer.row_mut(o);
            for (w, xi) in row[..inputs].iter_mut().zip(x) {
                *w += g * xi;
            }
            row[inputs] += g;
        }
        error
    }

    fn mse(&self, inputs: &[Vec<f64>], targets: &[usize]) -> f64 {
        if inputs.is_empty() {
            return 0.0;
        }
        let total: f64 = inputs
            .iter()
            .zip(targets)
            .map(|(x, &t)| sample_error(&self.layer.affine(x), t))
            .sum();
        total / inputs.len() as f64
    }
}

/// Affine classifier fitted by normalised LMS.
pub struct LinearEvaluator {
    params: LinearParams,
    model: Option<LinearModel>,
}

impl LinearEvaluator {
    pub fn new(params: LinearParams) -> Self {
        Self {
            params,
            model: None,
        }
    }

    pub fn params(&self) -> &LinearParams {
        &self.params
    }
}

impl Default for LinearEvaluator {
    fn default() -> Self {
        Self::new(LinearParams::default())
    }
}

impl EvaluationEngine for LinearEvaluator {
    fn name(&self) -> &str {
        "linear"
    }

    fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    fn evaluate(&self, features: &FeatureVector) -> Vec<Evaluation> {
        let Some(model) = &self.model else {
            return Vec::new();
        };
        let x = model.normalizer.apply(features.as_slice());
        rank_outputs(&model.layer.affine(&x))
    }

    fn train(
        &mut self,
        population: &Population,
        monitor: &mut dyn TrainingMonitor,
        mode: StartingMode,
        cancel: &CancelFlag,
    ) -> TrainingOutcome {
        let set = build_training_set(population, monitor);
        let mut model = match (mode, self.model.take()) {
            (StartingMode::WarmStart, Some(model)) if model.fits() => model,
            (StartingMode::WarmStart, previous) => {
                warn!(
                    engine = self.name(),
                    trained = previous.is_some(),
                    "warm start impossible, training from scratch"
                );
                LinearModel::fresh(Normalizer::fit(&set.inputs, MOMENT_COUNT))
            }
            (StartingMode::FromScratch, _) => {
                LinearModel::fresh(Normalizer::fit(&set.inputs, MOMENT_COUNT))
            }
        };

        let inputs: Vec<Vec<f64>> = set.inputs.iter().map(|x| model.normalizer.apply(x)).collect();
        let mut mse = model.mse(&inputs, &set.targets);
        monitor.training_started(model.epochs_trained, mse);

        let mut rng = StaveRng::new(self.params.seed);
        let mut order: Vec<usize> = (0..inputs.len()).collect();
        let mut epochs = 0;
        let mut cancelled = false;
        while epochs < self.params.max_epochs {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            rng.shuffle(&mut order);
            let mut total = 0.0;
            for &i in &order {
                total += model.update(&inputs[i], set.targets[i], self.params.learning_rate);
            }
            mse = if order.is_empty() { 0.0 } else { total / order.len() as f64 };
            epochs += 1;
            model.epochs_trained += 1;
            monitor.epoch_ended(model.epochs_trained, mse);
            if mse <= self.params.max_error {
                break;
            }
        }

        info!(
            engine = self.name(),
            epochs,
            mse,
            cancelled,
            samples = set.len(),
            skipped = set.skipped,
            "training finished"
        );
        self.model = Some(model);
        TrainingOutcome {
            epochs,
            final_mse: mse,
            cancelled,
            samples: set.len(),
            skipped: set.skipped,
        }
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        let Some(model) = &self.model else {
            let _ = writeln!(out, "linear: untrained");
            return out;
        };
        let (min, max, mean_abs) = model.layer.stats();
        let _ = writeln!(
            out,
            "linear: {} inputs, {} outputs, {} epochs, weights min {min:+.4} max {max:+.4} mean|w| {mean_abs:.4}",
            model.layer.inputs, model.layer.outputs, model.epochs_trained
        );
        for (o, shape) in model.shapes.iter().enumerate() {
            let row = model.layer.row(o);
            let norm = row[..model.layer.inputs].iter().map(|w| w * w).sum::<f64>().sqrt();
            let _ = writeln!(
                out,
                "  {:<16} |w| {norm:.4} bias {:+.4}",
                shape.name(),
                row[model.layer.inputs]
            );
        }
        out
    }

    fn save(&self) -> Result<Vec<u8>, ModelError> {
        blob::encode(BackendTag::Linear, &self.model)
    }

    fn load(&mut self, bytes: &[u8]) -> Result<(), ModelError> {
        let model: Option<LinearModel> = blob::decode(BackendTag::Linear, bytes)?;
        if let Some(model) = &model {
            blob::check_vocabulary(&model.shapes)?;
            if !model.fits() {
                return Err(ModelError::InputSize {
                    expected: MOMENT_COUNT,
                    found: model.layer.inputs,
                });
            }
            if !model.layer.is_well_formed() {
                return Err(ModelError::Malformed("weight table does not match layer shape"));
            }
        }
        self.model = model;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap;
    use crate::population::Sample;
    use crate::training::{NullMonitor, RecordingMonitor};

    fn population() -> Population {
        let shapes = [Shape::Dot, Shape::Sharp, Shape::WholeNote];
        let samples = shapes
            .iter()
            .flat_map(|&shape| {
                [12, 16, 20].into_iter().map(move |size| {
                    let glyph = bitmap::reference(shape, 0, 0, size).unwrap();
                    Sample::new(format!("{shape}-{size}"), glyph, shape)
                })
            })
            .collect();
        Population::new("linear", samples)
    }

    #[test]
    fn untrained_matches_nothing() {
        let engine = LinearEvaluator::default();
        let glyph = bitmap::reference(Shape::Sharp, 0, 0, 16).unwrap();
        assert_eq!(engine.classify(&glyph, 0.0).unwrap(), None);
        assert!(engine.dump().contains("untrained"));
    }

    #[test]
    fn error_decreases() {
        let mut engine = LinearEvaluator::default();
        let mut monitor = RecordingMonitor::default();
        let outcome = engine.train(
            &population(),
            &mut monitor,
            StartingMode::FromScratch,
            &CancelFlag::new(),
        );
        let (start_epoch, initial) = monitor.started.unwrap();
        assert_eq!(start_epoch, 0);
        // Zero weights give every sample an error of 1/9.
        assert!((initial - 1.0 / 9.0).abs() < 1e-12);
        assert!(outcome.final_mse < initial);
        assert_eq!(outcome.samples, 9);
    }

    #[test]
    fn grades_stay_in_range() {
        let mut engine = LinearEvaluator::default();
        let pop = population();
        engine.train(&pop, &mut NullMonitor, StartingMode::FromScratch, &CancelFlag::new());
        for sample in pop.samples() {
            let features = crate::moments::extract(&sample.glyph).unwrap();
            let evals = engine.evaluate(&features);
            assert_eq!(evals.len(), Shape::TRAINABLE.len());
            assert!(evals.iter().all(|e| (0.0..=100.0).contains(&e.grade)));
            assert!(evals.windows(2).all(|w| w[0].grade >= w[1].grade));
        }
    }

    #[test]
    fn deterministic_and_round_trips() {
        let pop = population();
        let mut a = LinearEvaluator::default();
        let mut b = LinearEvaluator::default();
        a.train(&pop, &mut NullMonitor, StartingMode::FromScratch, &CancelFlag::new());
        b.train(&pop, &mut NullMonitor, StartingMode::FromScratch, &CancelFlag::new());
        let blob = a.save().unwrap();
        assert_eq!(blob, b.save().unwrap());

        let mut c = LinearEvaluator::default();
        c.load(&blob).unwrap();
        assert_eq!(c.save().unwrap(), blob);
    }

    #[test]
    fn load_rejects_short_weight_table() {
        let mut model = LinearModel::fresh(Normalizer::identity(MOMENT_COUNT));
        model.layer.weights.truncate(10);
        let bytes = blob::encode(BackendTag::Linear, &Some(model)).unwrap();
        let mut engine = LinearEvaluator::default();
        assert!(matches!(engine.load(&bytes), Err(ModelError::Malformed(_))));
        assert!(!engine.is_trained());
    }

    #[test]
    fn loading_an_untrained_blob_clears_the_model() {
        let mut engine = LinearEvaluator::default();
        engine.train(&population(), &mut NullMonitor, StartingMode::FromScratch, &CancelFlag::new());
        let empty = LinearEvaluator::default().save().unwrap();
        engine.load(&empty).unwrap();
        assert!(!engine.is_trained());
    }
}
