// Perceptron backend.
//
// `GlyphNetwork` maps the standardised Legendre descriptor through one hidden
// layer of sigmoid units to one sigmoid output per trainable shape. Training
// is online back-propagation with momentum against one-hot targets. Every
// epoch visits the samples in an order drawn from a `StaveRng` seeded by
// `NetworkParams::seed`, so a given population, mode and seed always produce
// the same weights.
//
// The model (vocabulary, normaliser, both layers) is `None` until the first
// training or load; an untrained network evaluates to nothing, which callers
// read as no match.

use super::blob::{self, BackendTag};
use super::{
    EvaluationEngine, Layer, ModelError, Normalizer, StartingMode, TrainingOutcome,
    build_training_set, rank_outputs, sample_error, sigmoid,
};
use crate::config::NetworkParams;
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
struct NetworkModel {
    shapes: Vec<Shape>,
    normalizer: Normalizer,
    hidden: Layer,
    output: Layer,
    /// Epochs accumulated over every training call on this model.
    epochs_trained: usize,
}

impl NetworkModel {
    fn fresh(params: &NetworkParams, normalizer: Normalizer, rng: &mut StaveRng) -> Self {
        let outputs = Shape::TRAINABLE.len();
        let hidden = Layer::random(MOMENT_COUNT, params.hidden_units, params.init_range, rng);
        let output = Layer::random(params.hidden_units, outputs, params.init_range, rng);
        Self {
            shapes: Shape::TRAINABLE.to_vec(),
            normalizer,
            hidden,
            output,
            epochs_trained: 0,
        }
    }

    /// Hidden activations and outputs for an already standardised input.
    fn forward(&self, x: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let hidden: Vec<f64> = self.hidden.affine(x).into_iter().map(sigmoid).collect();
        let output = self.output.affine(&hidden).into_iter().map(sigmoid).collect();
        (hidden, output)
    }

    /// One online update; returns the sample's error before the update.
    fn backprop(&mut self, x: &[f64], target: usize, step: &Step, velocity: &mut Velocity) -> f64 {
        let (hidden, output) = self.forward(x);
        let error = sample_error(&output, target);

        let out_delta: Vec<f64> = output
            .iter()
            .enumerate()
            .map(|(o, &y)| {
                let t = if o == target { 1.0 } else { 0.0 };
                (t - y) * y * (1.0 - y)
            })
            .collect();
        // Hidden deltas read the output weights before they move.
        let hid_delta: Vec<f64> = hidden
            .iter()
            .enumerate()
            .map(|(j, &h)| {
                let back: f64 = out_delta
                    .iter()
                    .enumerate()
                    .map(|(o, d)| d * self.output.row(o)[j])
                    .sum();
                back * h * (1.0 - h)
            })
            .collect();

        update_layer(&mut self.output, &hidden, &out_delta, step, &mut velocity.output);
        update_layer(&mut self.hidden, x, &hid_delta, step, &mut velocity.hidden);
        error
    }

    fn mse(&self, inputs: &[Vec<f64>], targets: &[usize]) -> f64 {
        if inputs.is_empty() {
            return 0.0;
        }
        let total: f64 = inputs
            .iter()
            .zip(targets)
            .map(|(x, &t)| sample_error(&self.forward(x).1, t))
            .sum();
        total / inputs.len() as f64
    }

    /// Both weight tables match their shapes and chain into one another.
    fn check_layers(&self) -> Result<(), ModelError> {
        if !self.hidden.is_well_formed() || !self.output.is_well_formed() {
            return Err(ModelError::Malformed("weight table does not match layer shape"));
        }
        if self.hidden.outputs == 0 || self.output.inputs != self.hidden.outputs {
            return Err(ModelError::Malformed("output layer does not read the hidden layer"));
        }
        if self.output.outputs != self.shapes.len() {
            return Err(ModelError::Malformed("output layer does not match the vocabulary"));
        }
        Ok(())
    }

    /// Whether this model can continue training under `params`.
    fn fits(&self, params: &NetworkParams) -> bool {
        self.shapes == Shape::TRAINABLE
            && self.normalizer.has_dim(MOMENT_COUNT)
            && self.hidden.inputs == MOMENT_COUNT
            && self.hidden.outputs == params.hidden_units
            && self.output.inputs == params.hidden_units
            && self.output.outputs == Shape::TRAINABLE.len()
    }
}

struct Step {
    learning_rate: f64,
    momentum: f64,
}

/// Previous weight change of each layer, for the momentum term.
struct Velocity {
    hidden: Vec<f64>,
    output: Vec<f64>,
}

fn update_layer(layer: &mut Layer, input: &[f64], delta: &[f64], step: &Step, prev: &mut [f64]) {
    let width = layer.inputs + 1;
    for (o, d) in delta.iter().enumerate() {
        let row = layer.row_mut(o);
        for (i, w) in row.iter_mut().enumerate() {
            let xi = if i < width - 1 { input[i] } else { 1.0 };
            let k = o * width + i;
            let change = step.learning_rate * d * xi + step.momentum * prev[k];
            *w += change;
            prev[k] = change;
        }
    }
}

/// One-hidden-layer sigmoid perceptron.
pub struct GlyphNetwork {
    params: NetworkParams,
    model: Option<NetworkModel>,
}

impl GlyphNetwork {
    pub fn new(params: NetworkParams) -> Self {
        Self {
            params,
            model: None,
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// Epochs accumulated by the current model, zero when untrained.
    pub fn epochs_trained(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.epochs_trained)
    }
}

impl Default for GlyphNetwork {
    fn default() -> Self {
        Self::new(NetworkParams::default())
    }
}

impl EvaluationEngine for GlyphNetwork {
    fn name(&self) -> &str {
        "network"
    }

    fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    fn evaluate(&self, features: &FeatureVector) -> Vec<Evaluation> {
        let Some(model) = &self.model else {
            return Vec::new();
        };
        let x = model.normalizer.apply(features.as_slice());
        rank_outputs(&model.forward(&x).1)
    }

    fn train(
        &mut self,
        population: &Population,
        monitor: &mut dyn TrainingMonitor,
        mode: StartingMode,
        cancel: &CancelFlag,
    ) -> TrainingOutcome {
        let set = build_training_set(population, monitor);
        let mut rng = StaveRng::new(self.params.seed);

        let mut model = match (mode, self.model.take()) {
            (StartingMode::WarmStart, Some(model)) if model.fits(&self.params) => model,
            (StartingMode::WarmStart, previous) => {
                warn!(
                    engine = self.name(),
                    trained = previous.is_some(),
                    "warm start impossible, training from scratch"
                );
                let normalizer = Normalizer::fit(&set.inputs, MOMENT_COUNT);
                NetworkModel::fresh(&self.params, normalizer, &mut rng)
            }
            (StartingMode::FromScratch, _) => {
                let normalizer = Normalizer::fit(&set.inputs, MOMENT_COUNT);
                NetworkModel::fresh(&self.params, normalizer, &mut rng)
            }
        };

        let inputs: Vec<Vec<f64>> = set.inputs.iter().map(|x| model.normalizer.apply(x)).collect();
        let targets = &set.targets;
        let step = Step {
            learning_rate: self.params.learning_rate,
            momentum: self.params.momentum,
        };
        let mut velocity = Velocity {
            hidden: vec![0.0; model.hidden.weights.len()],
            output: vec![0.0; model.output.weights.len()],
        };

        let mut mse = model.mse(&inputs, targets);
        monitor.training_started(model.epochs_trained, mse);

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
                total += model.backprop(&inputs[i], targets[i], &step, &mut velocity);
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
            let _ = writeln!(out, "network: untrained");
            return out;
        };
        let _ = writeln!(
            out,
            "network: {} inputs, {} hidden, {} outputs, {} epochs",
            model.hidden.inputs, model.hidden.outputs, model.output.outputs, model.epochs_trained
        );
        for (name, layer) in [("hidden", &model.hidden), ("output", &model.output)] {
            let (min, max, mean_abs) = layer.stats();
            let _ = writeln!(
                out,
                "  {name:<6} weights: min {min:+.4} max {max:+.4} mean|w| {mean_abs:.4}"
            );
        }
        for (o, shape) in model.shapes.iter().enumerate() {
            let bias = model.output.row(o)[model.output.inputs];
            let _ = writeln!(out, "  {:<16} bias {bias:+.4}", shape.name());
        }
        out
    }

    fn save(&self) -> Result<Vec<u8>, ModelError> {
        blob::encode(BackendTag::Network, &self.model)
    }

    fn load(&mut self, bytes: &[u8]) -> Result<(), ModelError> {
        let model: Option<NetworkModel> = blob::decode(BackendTag::Network, bytes)?;
        if let Some(model) = &model {
            blob::check_vocabulary(&model.shapes)?;
            if model.hidden.inputs != MOMENT_COUNT || !model.normalizer.has_dim(MOMENT_COUNT) {
                return Err(ModelError::InputSize {
                    expected: MOMENT_COUNT,
                    found: model.hidden.inputs,
                });
            }
            model.check_layers()?;
            // Adopt the stored topology so a later warm start continues it.
            self.params.hidden_units = model.hidden.outputs;
        }
        self.model = model;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap;
    use crate::moments;
    use crate::population::Sample;
    use crate::training::{NullMonitor, RecordingMonitor};

    fn population() -> Population {
        let mut samples = Vec::new();
        for shape in Shape::TRAINABLE {
            for (k, size) in [14, 18, 22, 26].into_iter().enumerate() {
                let glyph = bitmap::reference(shape, 0, 0, size).unwrap();
                samples.push(Sample::new(format!("{shape}-{k}"), glyph, shape));
            }
        }
        Population::new("test", samples)
    }

    fn quick_params() -> NetworkParams {
        NetworkParams {
            max_epochs: 40,
            ..NetworkParams::default()
        }
    }

    #[test]
    fn untrained_network_matches_nothing() {
        let net = GlyphNetwork::default();
        let glyph = bitmap::reference(Shape::Dot, 0, 0, 10).unwrap();
        assert!(!net.is_trained());
        assert_eq!(net.classify(&glyph, 0.0).unwrap(), None);
    }

    #[test]
    fn training_reduces_error_and_reports_epochs() {
        let mut net = GlyphNetwork::new(quick_params());
        let mut monitor = RecordingMonitor::default();
        let outcome = net.train(
            &population(),
            &mut monitor,
            StartingMode::FromScratch,
            &CancelFlag::new(),
        );
        assert_eq!(outcome.samples, 36);
        assert_eq!(outcome.skipped, 0);
        assert!(!outcome.cancelled);
        assert_eq!(monitor.glyphs, 36);
        let (_, initial) = monitor.started.unwrap();
        assert_eq!(monitor.epochs.len(), outcome.epochs);
        assert_eq!(monitor.epochs[0].0, 1);
        assert!(outcome.final_mse < initial);
    }

    #[test]
    fn learns_reference_shapes() {
        let pop = population();
        let mut net = GlyphNetwork::default();
        net.train(&pop, &mut NullMonitor, StartingMode::FromScratch, &CancelFlag::new());
        let correct = pop
            .samples()
            .iter()
            .filter(|s| {
                net.classify(&s.glyph, 0.0).unwrap().map(|e| e.shape) == Some(s.shape)
            })
            .count();
        assert!(correct * 4 >= pop.len() * 3, "{correct}/{} correct", pop.len());
    }

    #[test]
    fn same_seed_same_weights() {
        let pop = population();
        let mut a = GlyphNetwork::new(quick_params());
        let mut b = GlyphNetwork::new(quick_params());
        a.train(&pop, &mut NullMonitor, StartingMode::FromScratch, &CancelFlag::new());
        b.train(&pop, &mut NullMonitor, StartingMode::FromScratch, &CancelFlag::new());
        assert_eq!(a.save().unwrap(), b.save().unwrap());
    }

    #[test]
    fn save_load_classifies_identically() {
        let pop = population();
        let mut net = GlyphNetwork::new(quick_params());
        net.train(&pop, &mut NullMonitor, StartingMode::FromScratch, &CancelFlag::new());
        let blob = net.save().unwrap();

        let mut restored = GlyphNetwork::default();
        restored.load(&blob).unwrap();
        for sample in pop.samples() {
            let features = moments::extract(&sample.glyph).unwrap();
            assert_eq!(net.evaluate(&features), restored.evaluate(&features));
        }
        assert_eq!(restored.params().hidden_units, net.params().hidden_units);
    }

    #[test]
    fn warm_start_continues_epoch_count() {
        let pop = population();
        let params = NetworkParams {
            max_epochs: 5,
            max_error: 0.0,
            ..NetworkParams::default()
        };
        let mut net = GlyphNetwork::new(params);
        net.train(&pop, &mut NullMonitor, StartingMode::FromScratch, &CancelFlag::new());
        let mut monitor = RecordingMonitor::default();
        net.train(&pop, &mut monitor, StartingMode::WarmStart, &CancelFlag::new());
        assert_eq!(monitor.started.unwrap().0, 5);
        assert_eq!(net.epochs_trained(), 10);
    }

    #[test]
    fn warm_start_on_untrained_falls_back() {
        let mut net = GlyphNetwork::new(quick_params());
        let outcome = net.train(
            &population(),
            &mut NullMonitor,
            StartingMode::WarmStart,
            &CancelFlag::new(),
        );
        assert!(net.is_trained());
        assert!(outcome.epochs > 0);
    }

    #[test]
    fn cancelled_before_first_epoch() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut net = GlyphNetwork::new(quick_params());
        let outcome = net.train(&population(), &mut NullMonitor, StartingMode::FromScratch, &cancel);
        assert!(outcome.cancelled);
        assert_eq!(outcome.epochs, 0);
    }

    #[test]
    fn empty_population_trains_to_zero_error() {
        let mut net = GlyphNetwork::new(quick_params());
        let outcome = net.train(
            &Population::new("empty", Vec::new()),
            &mut NullMonitor,
            StartingMode::FromScratch,
            &CancelFlag::new(),
        );
        assert_eq!(outcome.samples, 0);
        assert_eq!(outcome.final_mse, 0.0);
        assert_eq!(outcome.epochs, 1);
    }

    #[test]
    fn load_rejects_linear_blob() {
        let linear = crate::engine::LinearEvaluator::default();
        let blob = linear.save().unwrap();
        let mut net = GlyphNetwork::default();
        assert!(matches!(net.load(&blob), Err(ModelError::WrongBackend { .. })));
    }

    #[test]
    fn load_rejects_inconsistent_layers() {
        let fresh = || {
            NetworkModel::fresh(
                &quick_params(),
                Normalizer::identity(MOMENT_COUNT),
                &mut StaveRng::new(1),
            )
        };
        let mut truncated = fresh();
        truncated.output.weights.pop();
        let mut rewired = fresh();
        rewired.output = Layer::zeros(3, Shape::TRAINABLE.len());

        for model in [truncated, rewired] {
            let bytes = blob::encode(BackendTag::Network, &Some(model)).unwrap();
            let mut net = GlyphNetwork::default();
            assert!(matches!(net.load(&bytes), Err(ModelError::Malformed(_))));
            assert!(!net.is_trained());
        }

        let bytes = blob::encode(BackendTag::Network, &Some(fresh())).unwrap();
        assert!(GlyphNetwork::default().load(&bytes).is_ok());
    }

    #[test]
    fn dump_describes_layers() {
        let mut net = GlyphNetwork::new(quick_params());
        assert!(net.dump().contains("untrained"));
        net.train(&population(), &mut NullMonitor, StartingMode::FromScratch, &CancelFlag::new());
        let text = net.dump();
        assert!(text.contains("24 hidden"));
        assert!(text.contains("f_clef"));
    }
}
