// Glyphs: bounded aggregates of pixel runs.
//
// A `Glyph` owns an ordered list of `Section`s, each a group of runs laid out
// at consecutive positions along one orientation (rows for horizontal runs,
// columns for vertical runs). Segmentation upstream produces the sections; this
// crate never invents pixels, it only regroups supplied geometry into
// compounds.
//
// Glyph state that pattern passes mutate (shape, evaluation, supersession) is
// only reachable through `GlyphRegistry`. A glyph without an id has not been
// registered yet, which is how transient compounds are represented.

use crate::geometry::Rectangle;
use crate::run::Run;
use crate::shape::Shape;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlyphId(pub u64);

impl fmt::Display for GlyphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a section within its glyph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectionId(pub u32);

// ---------------------------------------------------------------------------
// Evaluation and grades
// ---------------------------------------------------------------------------

/// A classifier verdict. Grades run from 0 to 100 and are only comparable
/// between evaluations produced by the same trained engine.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub shape: Shape,
    pub grade: f64,
}

impl Evaluation {
    pub fn new(shape: Shape, grade: f64) -> Self {
        Self { shape, grade }
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:.2})", self.shape, self.grade)
    }
}

/// Standard grade thresholds.
pub mod grades {
    /// Accept any evaluation the engine is willing to produce.
    pub const NO_MIN_GRADE: f64 = 0.0;
    /// Upper end of the grade scale.
    pub const MAX_GRADE: f64 = 100.0;
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Horizontal,
    Vertical,
}

/// Runs at consecutive positions. For a horizontal section, run `i` lies on
/// row `first_pos + i` and its `start`/`stop` are abscissae.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "SectionRecord", into = "SectionRecord")]
pub struct Section {
    id: SectionId,
    orientation: Orientation,
    first_pos: i32,
    runs: Vec<Run>,
}

impl Section {
    pub fn new(id: SectionId, orientation: Orientation, first_pos: i32, mut runs: Vec<Run>) -> Self {
        for run in &mut runs {
            run.set_section(id);
        }
        Self {
            id,
            orientation,
            first_pos,
            runs,
        }
    }

    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn first_pos(&self) -> i32 {
        self.first_pos
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Number of pixels.
    pub fn weight(&self) -> i64 {
        self.runs.iter().map(|r| r.length() as i64).sum()
    }

    pub fn bounds(&self) -> Rectangle {
        let mut lo = i32::MAX;
        let mut hi = i32::MIN;
        let mut first = None;
        let mut last = None;
        for (i, run) in self.runs.iter().enumerate() {
            if run.length() == 0 {
                continue;
            }
            lo = lo.min(run.start());
            hi = hi.max(run.stop());
            let pos = self.first_pos + i as i32;
            first.get_or_insert(pos);
            last = Some(pos);
        }
        let (Some(first), Some(last)) = (first, last) else {
            return Rectangle::new(0, 0, 0, 0);
        };
        match self.orientation {
            Orientation::Horizontal => Rectangle::from_corners(lo, first, hi, last),
            Orientation::Vertical => Rectangle::from_corners(first, lo, last, hi),
        }
    }

    /// Pixel coordinates `(x, y)`, run by run.
    pub fn pixels(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        let orientation = self.orientation;
        self.runs.iter().enumerate().flat_map(move |(i, run)| {
            let pos = self.first_pos + i as i32;
            (run.start()..=run.stop()).map(move |c| match orientation {
                Orientation::Horizontal => (c, pos),
                Orientation::Vertical => (pos, c),
            })
        })
    }

    pub fn translate(&mut self, dx: i32, dy: i32) {
        let (along, across) = match self.orientation {
            Orientation::Horizontal => (dx, dy),
            Orientation::Vertical => (dy, dx),
        };
        self.first_pos += across;
        for run in &mut self.runs {
            run.translate(along);
        }
    }

    /// Same orientation, position and runs. Section ids are ignored.
    pub fn is_identical(&self, other: &Section) -> bool {
        self.orientation == other.orientation
            && self.first_pos == other.first_pos
            && self.runs.len() == other.runs.len()
            && self.runs.iter().zip(&other.runs).all(|(a, b)| a.is_identical(b))
    }

    fn renumbered(&self, id: SectionId) -> Section {
        Section::new(id, self.orientation, self.first_pos, self.runs.clone())
    }
}

/// Wire form of a section; rebuilding through `Section::new` restores the
/// run back-references.
#[derive(Serialize, Deserialize)]
struct SectionRecord {
    #[serde(default)]
    id: u32,
    orientation: Orientation,
    first_pos: i32,
    runs: Vec<Run>,
}

impl From<SectionRecord> for Section {
    fn from(record: SectionRecord) -> Self {
        Section::new(
            SectionId(record.id),
            record.orientation,
            record.first_pos,
            record.runs,
        )
    }
}

impl From<Section> for SectionRecord {
    fn from(section: Section) -> Self {
        SectionRecord {
            id: section.id.0,
            orientation: section.orientation,
            first_pos: section.first_pos,
            runs: section.runs,
        }
    }
}

// ---------------------------------------------------------------------------
// Glyph
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Glyph {
    id: Option<GlyphId>,
    sections: Vec<Section>,
    bounds: Rectangle,
    shape: Option<Shape>,
    evaluation: Option<Evaluation>,
    is_virtual: bool,
    compound: bool,
    parts: SmallVec<[GlyphId; 2]>,
    vip: bool,
    superseded_by: Option<GlyphId>,
}

impl Glyph {
    /// An unregistered glyph over the given sections.
    pub fn new(sections: Vec<Section>) -> Self {
        let bounds = sections
            .iter()
            .fold(Rectangle::new(0, 0, 0, 0), |acc, s| acc.union(&s.bounds()));
        Self {
            id: None,
            sections,
            bounds,
            shape: None,
            evaluation: None,
            is_virtual: false,
            compound: false,
            parts: SmallVec::new(),
            vip: false,
            superseded_by: None,
        }
    }

    /// A synthesised glyph with no pixels of its own, e.g. an inferred
    /// symbol. It still carries bounds so it can be indexed.
    pub fn new_virtual(bounds: Rectangle, shape: Shape) -> Self {
        let mut glyph = Glyph::new(Vec::new());
        glyph.bounds = bounds;
        glyph.shape = Some(shape);
        glyph.is_virtual = true;
        glyph
    }

    /// Merge the sections of `parts` into one unregistered compound.
    pub fn compound_of(parts: &[&Glyph]) -> Glyph {
        let sections = parts
            .iter()
            .flat_map(|g| g.sections.iter())
            .enumerate()
            .map(|(i, s)| s.renumbered(SectionId(i as u32)))
            .collect();
        let mut compound = Glyph::new(sections);
        compound.compound = true;
        compound.parts = parts.iter().filter_map(|g| g.id).collect();
        compound.vip = parts.iter().any(|g| g.vip);
        compound
    }

    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn with_vip(mut self, vip: bool) -> Self {
        self.vip = vip;
        self
    }

    pub fn id(&self) -> Option<GlyphId> {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: GlyphId) {
        self.id = Some(id);
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn bounds(&self) -> Rectangle {
        self.bounds
    }

    /// Number of pixels over all sections.
    pub fn weight(&self) -> i64 {
        self.sections.iter().map(Section::weight).sum()
    }

    pub fn shape(&self) -> Option<Shape> {
        self.shape
    }

    pub fn set_shape(&mut self, shape: Option<Shape>) {
        self.shape = shape;
    }

    pub fn evaluation(&self) -> Option<Evaluation> {
        self.evaluation
    }

    /// Record a classifier verdict; the glyph takes the evaluated shape.
    pub fn set_evaluation(&mut self, evaluation: Evaluation) {
        self.shape = Some(evaluation.shape);
        self.evaluation = Some(evaluation);
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn is_compound(&self) -> bool {
        self.compound
    }

    pub fn parts(&self) -> &[GlyphId] {
        &self.parts
    }

    pub fn is_vip(&self) -> bool {
        self.vip
    }

    pub fn set_vip(&mut self, vip: bool) {
        self.vip = vip;
    }

    pub fn superseded_by(&self) -> Option<GlyphId> {
        self.superseded_by
    }

    pub(crate) fn set_superseded_by(&mut self, compound: GlyphId) {
        self.superseded_by = Some(compound);
    }

    /// Not replaced by a compound.
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }

    pub fn pixels(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.sections.iter().flat_map(Section::pixels)
    }

    pub fn translate(&mut self, dx: i32, dy: i32) {
        for section in &mut self.sections {
            section.translate(dx, dy);
        }
        self.bounds = self.bounds.translated(dx, dy);
    }

    /// Same bounds and the same sections, in order.
    pub fn has_same_geometry(&self, other: &Glyph) -> bool {
        self.bounds == other.bounds
            && self.sections.len() == other.sections.len()
            && self
                .sections
                .iter()
                .zip(&other.sections)
                .all(|(a, b)| a.is_identical(b))
    }
}

impl fmt::Display for Glyph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "glyph{id}")?,
            None => f.write_str("glyph(transient)")?,
        }
        if let Some(shape) = self.shape {
            write!(f, " {shape}")?;
        }
        write!(f, " {}", self.bounds)
    }
}
