// Pixel runs.
//
// A `Run` is a maximal sequence of same-level pixels along one axis. The
// direction (horizontal or vertical) is carried by the owning `Section`, not
// by the run itself, so `start` is an abscissa for horizontal runs and an
// ordinate for vertical ones.
//
// Runs are immutable apart from two things: `translate` shifts `start` in
// place, and the owning section records itself through the crate-private
// `set_section`. Nothing else may alter a run once built.

use crate::glyph::SectionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("invalid run: negative length {length} at start {start}")]
    InvalidRun { start: i32, length: i32 },
    #[error("run of length {length} at start {start} ends outside the coordinate range")]
    OutOfRange { start: i32, length: i32 },
}

/// A contiguous run of pixels sharing one gray level.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawRun", into = "RawRun")]
pub struct Run {
    start: i32,
    length: i32,
    /// Average gray level, 0 for fully black and 255 for fully white.
    level: u8,
    section: Option<SectionId>,
}

impl Run {
    /// Build a run. A negative `length` is rejected, and so is a run whose
    /// `stop` does not fit in an `i32`.
    pub fn new(start: i32, length: i32, level: u8) -> Result<Self, RunError> {
        if length < 0 {
            return Err(RunError::InvalidRun { start, length });
        }
        if i32::try_from(start as i64 + length as i64 - 1).is_err() {
            return Err(RunError::OutOfRange { start, length });
        }
        Ok(Self {
            start,
            length,
            level,
            section: None,
        })
    }

    pub fn start(&self) -> i32 {
        self.start
    }

    pub fn length(&self) -> i32 {
        self.length
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Coordinate of the last pixel: `start + length - 1`.
    pub fn stop(&self) -> i32 {
        self.start + self.length - 1
    }

    /// Length of the part shared with `other`. Callers pre-filter for
    /// adjacency; a result `<= 0` means the runs do not overlap.
    pub fn common_overlap(&self, other: &Run) -> i32 {
        let start = self.start.max(other.start);
        let stop = self.stop().min(other.stop());
        stop.saturating_sub(start).saturating_add(1)
    }

    /// Shift the run along its own axis.
    pub fn translate(&mut self, delta: i32) {
        self.start += delta;
    }

    /// Section this run belongs to, if it has been attached.
    pub fn section(&self) -> Option<SectionId> {
        self.section
    }

    pub(crate) fn set_section(&mut self, section: SectionId) {
        self.section = Some(section);
    }

    /// Exact comparison of start, length and level. The section link does
    /// not take part.
    pub fn is_identical(&self, other: &Run) -> bool {
        self.start == other.start && self.length == other.length && self.level == other.level
    }
}

impl PartialEq for Run {
    fn eq(&self, other: &Self) -> bool {
        self.is_identical(other)
    }
}

impl Eq for Run {}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{Run {}/{}@{}}}", self.start, self.length, self.level)
    }
}

/// Wire form of a run. Deserialisation goes through `Run::new` so stored
/// repositories cannot smuggle in a negative length.
#[derive(Serialize, Deserialize)]
struct RawRun {
    start: i32,
    length: i32,
    #[serde(default)]
    level: u8,
}

impl TryFrom<RawRun> for Run {
    type Error = RunError;

    fn try_from(raw: RawRun) -> Result<Self, Self::Error> {
        Run::new(raw.start, raw.length, raw.level)
    }
}

impl From<Run> for RawRun {
    fn from(run: Run) -> Self {
        RawRun {
            start: run.start,
            length: run.length,
            level: run.level,
        }
    }
}
