// Shape vocabulary.
//
// Every glyph label is a `Shape`. Several surface shapes collapse onto one
// physical shape (an augmentation dot and a staccato are the same ink as a
// plain dot; a cue-size F clef is an F clef once moments remove scale). The
// classifier only ever sees and predicts physical shapes, and only those
// flagged trainable: stems, ledgers and text are found by dedicated detectors
// upstream and never reach the network.
//
// A handful of shapes are bookkeeping markers with no physical form at all.
// Resolving them yields `WeirdShape`, which population preparation treats as
// a reason to drop the sample.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Dot,
    AugmentationDot,
    Staccato,
    Fermata,
    FermataBelow,
    NoteheadBlack,
    WholeNote,
    Sharp,
    Flat,
    Natural,
    FClef,
    FClefSmall,
    Stem,
    Ledger,
    Text,
    Composite,
    Continuation,
}

/// The shape has no canonical physical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("shape {0} has no physical form")]
pub struct WeirdShape(pub Shape);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown shape name: {0:?}")]
pub struct UnknownShapeName(pub String);

impl Shape {
    pub const ALL: [Shape; 17] = [
        Shape::Dot,
        Shape::AugmentationDot,
        Shape::Staccato,
        Shape::Fermata,
        Shape::FermataBelow,
        Shape::NoteheadBlack,
        Shape::WholeNote,
        Shape::Sharp,
        Shape::Flat,
        Shape::Natural,
        Shape::FClef,
        Shape::FClefSmall,
        Shape::Stem,
        Shape::Ledger,
        Shape::Text,
        Shape::Composite,
        Shape::Continuation,
    ];

    /// Physical shapes the classifier is trained on, in output-unit order.
    pub const TRAINABLE: [Shape; 9] = [
        Shape::Dot,
        Shape::Fermata,
        Shape::FermataBelow,
        Shape::NoteheadBlack,
        Shape::WholeNote,
        Shape::Sharp,
        Shape::Flat,
        Shape::Natural,
        Shape::FClef,
    ];

    /// The "dot avatars": every surface shape sharing the dot's ink.
    pub const DOTS: [Shape; 3] = [Shape::Dot, Shape::AugmentationDot, Shape::Staccato];

    pub fn name(self) -> &'static str {
        match self {
            Shape::Dot => "dot",
            Shape::AugmentationDot => "augmentation_dot",
            Shape::Staccato => "staccato",
            Shape::Fermata => "fermata",
            Shape::FermataBelow => "fermata_below",
            Shape::NoteheadBlack => "notehead_black",
            Shape::WholeNote => "whole_note",
            Shape::Sharp => "sharp",
            Shape::Flat => "flat",
            Shape::Natural => "natural",
            Shape::FClef => "f_clef",
            Shape::FClefSmall => "f_clef_small",
            Shape::Stem => "stem",
            Shape::Ledger => "ledger",
            Shape::Text => "text",
            Shape::Composite => "composite",
            Shape::Continuation => "continuation",
        }
    }

    /// Canonical physical shape, or `WeirdShape` for bookkeeping markers.
    pub fn resolve_physical(self) -> Result<Shape, WeirdShape> {
        match self {
            Shape::AugmentationDot | Shape::Staccato => Ok(Shape::Dot),
            Shape::FClefSmall => Ok(Shape::FClef),
            Shape::Composite | Shape::Continuation => Err(WeirdShape(self)),
            other => Ok(other),
        }
    }

    /// Whether the shape is a trainable physical shape.
    pub fn is_trainable(self) -> bool {
        self.trainable_index().is_some()
    }

    /// Output-unit index of a trainable physical shape.
    pub fn trainable_index(self) -> Option<usize> {
        Shape::TRAINABLE.iter().position(|&s| s == self)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Shape {
    type Err = UnknownShapeName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Shape::ALL
            .iter()
            .copied()
            .find(|shape| shape.name() == s)
            .ok_or_else(|| UnknownShapeName(s.to_string()))
    }
}
