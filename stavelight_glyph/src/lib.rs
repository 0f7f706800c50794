// Stavelight glyph engine
//
// Glyph classification and pattern correction for optical music recognition.
// Segmentation upstream turns a binarised page into pixel runs grouped into
// glyphs; this crate describes each glyph with orthogonal moments, scores it
// against a shape vocabulary with a trainable classifier, and repairs
// glyphs that segmentation split apart by merging them back when the
// classifier recognises the merged form.
//
// Architecture:
// - run.rs: Pixel runs, the smallest geometric unit
// - geometry.rs: Integer pixel rectangles
// - shape.rs: Shape vocabulary, physical-shape mapping, trainable flag
// - glyph.rs: Sections, glyphs, evaluations and grade thresholds
// - bitmap.rs: Glyphs from ink masks, plus reference drawings per shape
// - moments.rs: Order-10 Legendre moment descriptor
// - engine/: Classifier contract with network and linear backends, and the
//   versioned model blob
// - population.rs: Sample repositories and population preparation
// - training.rs: Training coordinator, monitors, background training tasks
// - registry.rs: Per-system glyph registry with an R-tree spatial index
// - pattern.rs: Pattern passes and the engine that sequences them
// - config.rs: JSON engine configuration
//
// Everything is deterministic: feature extraction is pure, training is
// seeded, and pattern passes visit anchors and candidates in a fixed order.

pub mod bitmap;
pub mod config;
pub mod engine;
pub mod geometry;
pub mod glyph;
pub mod moments;
pub mod pattern;
pub mod population;
pub mod registry;
pub mod run;
pub mod shape;
pub mod training;

pub use engine::{EvaluationEngine, GlyphNetwork, LinearEvaluator, StartingMode, TrainingOutcome};
pub use glyph::{Evaluation, Glyph, GlyphId};
pub use shape::Shape;
