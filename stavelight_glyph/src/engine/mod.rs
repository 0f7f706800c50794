// Evaluation engines: trainable glyph classifiers.
//
// `EvaluationEngine` is the one contract both backends honour:
// - `network.rs`: `GlyphNetwork`, a one-hidden-layer sigmoid perceptron
//   trained by online back-propagation with momentum.
// - `linear.rs`:  `LinearEvaluator`, a single affine layer trained by
//   normalised least-mean-squares updates.
// - `blob.rs`:    the versioned, checksummed byte format both use for
//   `save`/`load`.
//
// Both backends read the same Legendre descriptor (see `moments.rs`),
// standardise it with per-coefficient statistics captured at from-scratch
// training, and emit one output per trainable physical shape. An output in
// [0, 1] maps to a grade in [0, 100].
//
// Training runs against a prepared `Population` snapshot and never touches a
// registry. It reports to a `TrainingMonitor`, checks the cancel flag between
// epochs, and given the same population, starting state, mode and seed it
// ends with bit-identical parameters.

pub mod blob;
pub mod linear;
pub mod network;

pub use blob::ModelError;
pub use linear::LinearEvaluator;
pub use network::GlyphNetwork;

use crate::glyph::{Evaluation, Glyph, grades};
use crate::moments::{self, FeatureError, FeatureVector, MOMENT_COUNT};
use crate::population::Population;
use crate::shape::Shape;
use crate::training::{CancelFlag, TrainingMonitor};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stavelight_prng::StaveRng;
use tracing::warn;

/// How training treats the parameters already in the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingMode {
    /// Discard current parameters and re-initialise from the seed.
    FromScratch,
    /// Continue from the current parameters.
    WarmStart,
}

/// Summary of one `train` call.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingOutcome {
    /// Epochs actually completed.
    pub epochs: usize,
    /// Mean squared error of the last completed epoch.
    pub final_mse: f64,
    /// Stopped early because the cancel flag was raised.
    pub cancelled: bool,
    /// Samples used for fitting.
    pub samples: usize,
    /// Samples skipped because no descriptor could be computed.
    pub skipped: usize,
}

pub trait EvaluationEngine: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    fn is_trained(&self) -> bool;

    /// Every trainable shape with its grade, best first. Ties keep the
    /// vocabulary order. An untrained engine returns nothing.
    fn evaluate(&self, features: &FeatureVector) -> Vec<Evaluation>;

    /// Best evaluation whose grade reaches `min_grade`, or `None` when no
    /// shape clears the threshold.
    fn classify(&self, glyph: &Glyph, min_grade: f64) -> Result<Option<Evaluation>, FeatureError> {
        self.classify_within(glyph, min_grade, &|_| true)
    }

    /// Like `classify`, but shapes rejected by `accept` are passed over in
    /// favour of the next best.
    fn classify_within(
        &self,
        glyph: &Glyph,
        min_grade: f64,
        accept: &dyn Fn(Shape) -> bool,
    ) -> Result<Option<Evaluation>, FeatureError> {
        let features = moments::extract(glyph)?;
        Ok(self
            .evaluate(&features)
            .into_iter()
            .find(|e| e.grade >= min_grade && accept(e.shape)))
    }

    fn train(
        &mut self,
        population: &Population,
        monitor: &mut dyn TrainingMonitor,
        mode: StartingMode,
        cancel: &CancelFlag,
    ) -> TrainingOutcome;

    /// Diagnostic description of the current parameters.
    fn dump(&self) -> String;

    fn save(&self) -> Result<Vec<u8>, ModelError>;

    /// Replace the current parameters with a blob written by `save`.
    fn load(&mut self, blob: &[u8]) -> Result<(), ModelError>;
}

// ---------------------------------------------------------------------------
// Shared numerics
// ---------------------------------------------------------------------------

/// Per-coefficient standardisation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Normalizer {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl Normalizer {
    pub(crate) fn identity(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            std: vec![1.0; dim],
        }
    }

    pub(crate) fn fit(inputs: &[Vec<f64>], dim: usize) -> Self {
        if inputs.is_empty() {
            return Self::identity(dim);
        }
        let n = inputs.len() as f64;
        let mut mean = vec![0.0; dim];
        for x in inputs {
            for (m, v) in mean.iter_mut().zip(x) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= n;
        }
        let mut std = vec![0.0; dim];
        for x in inputs {
            for ((s, v), m) in std.iter_mut().zip(x).zip(&mean) {
                *s += (v - m) * (v - m);
            }
        }
        for s in &mut std {
            *s = (*s / n).sqrt();
            // Constant coefficients carry no information; leave them centred.
            if *s < 1e-12 {
                *s = 1.0;
            }
        }
        Self { mean, std }
    }

    /// Mean and deviation tables cover `dim` coefficients each.
    pub(crate) fn has_dim(&self, dim: usize) -> bool {
        self.mean.len() == dim && self.std.len() == dim
    }

    pub(crate) fn apply(&self, raw: &[f64]) -> Vec<f64> {
        raw.iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }
}

/// Fully connected layer; row `o` holds the input weights of output `o`
/// followed by its bias.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Layer {
    pub(crate) inputs: usize,
    pub(crate) outputs: usize,
    pub(crate) weights: Vec<f64>,
}

impl Layer {
    pub(crate) fn zeros(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs,
            outputs,
            weights: vec![0.0; outputs * (inputs + 1)],
        }
    }

    /// Uniform weights in `[-range, range)`.
    pub(crate) fn random(inputs: usize, outputs: usize, range: f64, rng: &mut StaveRng) -> Self {
        let weights = (0..outputs * (inputs + 1))
            .map(|_| rng.range_f64(-range, range))
            .collect();
        Self {
            inputs,
            outputs,
            weights,
        }
    }

    /// Weight table matches the declared shape.
    pub(crate) fn is_well_formed(&self) -> bool {
        self.outputs
            .checked_mul(self.inputs + 1)
            .is_some_and(|n| n == self.weights.len())
    }

    pub(crate) fn row(&self, o: usize) -> &[f64] {
        let width = self.inputs + 1;
        &self.weights[o * width..(o + 1) * width]
    }

    pub(crate) fn row_mut(&mut self, o: usize) -> &mut [f64] {
        let width = self.inputs + 1;
        &mut self.weights[o * width..(o + 1) * width]
    }

    /// Affine map `W x + b`.
    pub(crate) fn affine(&self, x: &[f64]) -> Vec<f64> {
        (0..self.outputs)
            .map(|o| {
                let row = self.row(o);
                let dot: f64 = row[..self.inputs].iter().zip(x).map(|(w, v)| w * v).sum();
                dot + row[self.inputs]
            })
            .collect()
    }

    /// Smallest, largest and mean absolute weight.
    pub(crate) fn stats(&self) -> (f64, f64, f64) {
        if self.weights.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let min = self.weights.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean_abs = self.weights.iter().map(|w| w.abs()).sum::<f64>() / self.weights.len() as f64;
        (min, max, mean_abs)
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Turn raw outputs into evaluations, best first.
pub(crate) fn rank_outputs(outputs: &[f64]) -> Vec<Evaluation> {
    let mut evals: Vec<Evaluation> = Shape::TRAINABLE
        .iter()
        .zip(outputs)
        .map(|(&shape, &out)| Evaluation::new(shape, grades::MAX_GRADE * out.clamp(0.0, 1.0)))
        .collect();
    // Stable sort keeps vocabulary order between equal grades.
    evals.sort_by(|a, b| b.grade.total_cmp(&a.grade));
    evals
}

/// Descriptor and target unit of each usable sample, in population order.
pub(crate) struct TrainingSet {
    pub(crate) inputs: Vec<Vec<f64>>,
    pub(crate) targets: Vec<usize>,
    pub(crate) skipped: usize,
}

impl TrainingSet {
    pub(crate) fn len(&self) -> usize {
        self.inputs.len()
    }
}

/// Extract descriptors for the whole population in parallel, then report
/// each sample to the monitor in population order.
pub(crate) fn build_training_set(
    population: &Population,
    monitor: &mut dyn TrainingMonitor,
) -> TrainingSet {
    let extracted: Vec<Result<FeatureVector, FeatureError>> = population
        .samples()
        .par_iter()
        .map(|sample| moments::extract(&sample.glyph))
        .collect();

    let mut set = TrainingSet {
        inputs: Vec::with_capacity(extracted.len()),
        targets: Vec::with_capacity(extracted.len()),
        skipped: 0,
    };
    for (sample, features) in population.samples().iter().zip(extracted) {
        monitor.glyph_processed(&sample.glyph);
        let Some(target) = sample.shape.trainable_index() else {
            warn!(sample = %sample.name, shape = %sample.shape, "skipping non-trainable sample");
            set.skipped += 1;
            continue;
        };
        match features {
            Ok(features) => {
                debug_assert_eq!(features.len(), MOMENT_COUNT);
                set.inputs.push(features.as_slice().to_vec());
                set.targets.push(target);
            }
            Err(err) => {
                warn!(sample = %sample.name, %err, "skipping sample");
                set.skipped += 1;
            }
        }
    }
    set
}

/// Squared error against a one-hot target, averaged over outputs.
pub(crate) fn sample_error(outputs: &[f64], target: usize) -> f64 {
    let sum: f64 = outputs
        .iter()
        .enumerate()
        .map(|(o, y)| {
            let t = if o == target { 1.0 } else { 0.0 };
            (t - y) * (t - y)
        })
        .sum();
    sum / outputs.len().max(1) as f64
}
