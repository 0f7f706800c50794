// Labelled training populations.
//
// A `SampleRepository` names its samples and hands out their glyphs; it has
// two standing selections, "core" (curated) and "whole" (every labelled
// sample), with core always a subset of whole. `prepare_population` turns a
// list of names into a clean `Population`: every surviving sample carries a
// trainable physical shape, and every dropped one is recorded with exactly
// one `SampleIssue`. Drops and trainable shapes missing from the result are
// logged with `warn!` and never fail the preparation.
//
// `MemoryRepository` is the in-process implementation, loadable from JSON:
//
//   {"samples": [{"name": "dot-1", "core": true, "shape": "dot",
//                 "sections": [{"orientation": "horizontal", "first_pos": 3,
//                               "runs": [{"start": 0, "length": 2}]}]}]}

use crate::glyph::{Glyph, Section};
use crate::shape::{Shape, WeirdShape};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Population
// ---------------------------------------------------------------------------

/// A glyph with its physical shape label.
#[derive(Clone, Debug)]
pub struct Sample {
    pub name: String,
    pub glyph: Glyph,
    pub shape: Shape,
}

impl Sample {
    pub fn new(name: impl Into<String>, glyph: Glyph, shape: Shape) -> Self {
        Self {
            name: name.into(),
            glyph,
            shape,
        }
    }
}

/// Named, ordered training set.
#[derive(Clone, Debug, Default)]
pub struct Population {
    name: String,
    samples: Vec<Sample>,
}

impl Population {
    pub fn new(name: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample count per shape.
    pub fn shape_counts(&self) -> BTreeMap<Shape, usize> {
        let mut counts = BTreeMap::new();
        for sample in &self.samples {
            *counts.entry(sample.shape).or_insert(0) += 1;
        }
        counts
    }

    /// Trainable shapes with no sample, in vocabulary order.
    pub fn missing_shapes(&self) -> Vec<Shape> {
        let present: BTreeSet<Shape> = self.samples.iter().map(|s| s.shape).collect();
        Shape::TRAINABLE
            .iter()
            .copied()
            .filter(|s| !present.contains(s))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Preparation
// ---------------------------------------------------------------------------

/// Why a named sample did not make it into a population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SampleIssue {
    #[error("sample could not be resolved to a labelled glyph")]
    UnresolvedSample,
    #[error("physical shape {0} is not trainable")]
    NonTrainableShape(Shape),
    #[error("shape {0} has no physical form")]
    WeirdShape(Shape),
}

impl From<WeirdShape> for SampleIssue {
    fn from(weird: WeirdShape) -> Self {
        SampleIssue::WeirdShape(weird.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedSample {
    pub name: String,
    pub issue: SampleIssue,
}

/// Result of `prepare_population`.
#[derive(Debug, Clone)]
pub struct PreparedPopulation {
    pub population: Population,
    pub dropped: Vec<DroppedSample>,
    /// Trainable shapes absent from `population`.
    pub missing: Vec<Shape>,
}

/// Resolve `names` against `repository` into a population of trainable
/// samples, in name order.
pub fn prepare_population<R: SampleRepository + ?Sized>(
    population_name: &str,
    names: &[String],
    repository: &R,
) -> PreparedPopulation {
    let mut samples = Vec::with_capacity(names.len());
    let mut dropped = Vec::new();

    for name in names {
        match resolve_sample(name, repository) {
            Ok(sample) => samples.push(sample),
            Err(issue) => {
                warn!(sample = %name, %issue, "dropping sample");
                dropped.push(DroppedSample {
                    name: name.clone(),
                    issue,
                });
            }
        }
    }

    let population = Population::new(population_name, samples);
    let missing = population.missing_shapes();
    for shape in &missing {
        warn!(population = population_name, %shape, "no sample covers trainable shape");
    }
    debug!(
        population = population_name,
        kept = population.len(),
        dropped = dropped.len(),
        "population prepared"
    );
    PreparedPopulation {
        population,
        dropped,
        missing,
    }
}

fn resolve_sample<R: SampleRepository + ?Sized>(
    name: &str,
    repository: &R,
) -> Result<Sample, SampleIssue> {
    let glyph = repository.glyph(name).ok_or(SampleIssue::UnresolvedSample)?;
    let shape = glyph.shape().ok_or(SampleIssue::UnresolvedSample)?;
    let physical = shape.resolve_physical()?;
    if !physical.is_trainable() {
        return Err(SampleIssue::NonTrainableShape(physical));
    }
    Ok(Sample::new(name, glyph, physical))
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// Source of named, labelled sample glyphs.
pub trait SampleRepository {
    /// Sample names of the whole repository, or of the core selection when
    /// `use_whole` is false. Core names are always a subset of whole names.
    fn base(&self, use_whole: bool) -> Vec<String>;

    /// A fresh copy of the named sample's glyph, with its label as shape.
    fn glyph(&self, name: &str) -> Option<Glyph>;
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository io: {0}")]
    Io(#[from] std::io::Error),
    #[error("repository parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate sample name {0:?}")]
    DuplicateName(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SampleRecord {
    name: String,
    #[serde(default)]
    core: bool,
    #[serde(default)]
    shape: Option<Shape>,
    #[serde(default)]
    vip: bool,
    sections: Vec<Section>,
}

#[derive(Default, Serialize, Deserialize)]
struct RepositoryFile {
    samples: Vec<SampleRecord>,
}

/// In-memory repository, optionally backed by a JSON file.
#[derive(Clone, Debug, Default)]
pub struct MemoryRepository {
    records: Vec<SampleRecord>,
    index: BTreeMap<String, usize>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(json: &str) -> Result<Self, RepositoryError> {
        let file: RepositoryFile = serde_json::from_str(json)?;
        let mut repository = Self::new();
        for record in file.samples {
            repository.push(record)?;
        }
        Ok(repository)
    }

    pub fn to_json_string(&self) -> Result<String, RepositoryError> {
        let file = RepositoryFile {
            samples: self.records.clone(),
        };
        Ok(serde_json::to_string(&file)?)
    }

    /// Add a sample. Its label is the glyph's current shape.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        glyph: &Glyph,
        core: bool,
    ) -> Result<(), RepositoryError> {
        self.push(SampleRecord {
            name: name.into(),
            core,
            shape: glyph.shape(),
            vip: glyph.is_vip(),
            sections: glyph.sections().to_vec(),
        })
    }

    fn push(&mut self, record: SampleRecord) -> Result<(), RepositoryError> {
        if self.index.contains_key(&record.name) {
            return Err(RepositoryError::DuplicateName(record.name));
        }
        self.index.insert(record.name.clone(), self.records.len());
        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl SampleRepository for MemoryRepository {
    fn base(&self, use_whole: bool) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| use_whole || r.core)
            .map(|r| r.name.clone())
            .collect()
    }

    fn glyph(&self, name: &str) -> Option<Glyph> {
        let record = &self.records[*self.index.get(name)?];
        let mut glyph = Glyph::new(record.sections.clone()).with_vip(record.vip);
        glyph.set_shape(record.shape);
        Some(glyph)
    }
}
