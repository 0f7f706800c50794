// Pattern-correction passes.
//
// A pass repairs one confusable situation in a system. `CompoundPass` is the
// generic form: for every anchor glyph whose shape is in `anchors`, it looks
// for glyphs of an `adjacency` shape whose bounds overlap the anchor's,
// merges anchor and candidate into a transient compound, and asks the
// evaluation engine about it. The first candidate that classifies to an
// accepted shape wins. Its compound is committed and the pass moves on to
// the next anchor without trying the remaining candidates.
//
// Ordering is fixed so results are reproducible:
// - anchors are the active glyphs with an anchor shape at pass start, in id
//   order; an anchor absorbed by an earlier compound in the same pass is
//   skipped;
// - candidates come from the registry's spatial lookup, sorted by left x,
//   then top y, then id.
//
// Candidates are tried one at a time because each commit changes which
// glyphs remain available. A failure while handling one anchor (a stale
// glyph, a degenerate compound) is logged and the pass carries on with the
// next anchor.
//
// `PatternEngine` runs its passes in registration order; each pass sees the
// corrections of the ones before it. Independent systems run in parallel,
// each on its own registry.

use crate::config::{ConfigError, PatternParams};
use crate::engine::EvaluationEngine;
use crate::glyph::{GlyphId, grades};
use crate::moments::FeatureError;
use crate::registry::{GlyphRegistry, RegistryError};
use crate::shape::Shape;
use rayon::prelude::*;
use thiserror::Error;
use tracing::warn;

/// Log at `info` for VIP glyphs and at `debug` otherwise.
macro_rules! vip_log {
    ($vip:expr, $($arg:tt)+) => {
        if $vip {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

#[derive(Debug, Error)]
enum AnchorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
}

pub trait PatternPass: Send + Sync {
    fn name(&self) -> &str;

    /// Run over one system; returns the number of corrections committed.
    fn run(&self, registry: &mut GlyphRegistry, engine: &dyn EvaluationEngine) -> usize;
}

/// Merge an anchor with an overlapping neighbour when the engine recognises
/// the pair as one symbol.
#[derive(Clone, Debug, PartialEq)]
pub struct CompoundPass {
    pub name: String,
    pub anchors: Vec<Shape>,
    pub adjacency: Vec<Shape>,
    /// Shapes a compound may classify to. Empty accepts any shape.
    pub accepted_results: Vec<Shape>,
    pub min_grade: f64,
}

impl CompoundPass {
    /// A fermata whose dot was segmented apart from its arc.
    pub fn fermata_dot() -> Self {
        Self {
            name: "fermata_dot".into(),
            anchors: vec![Shape::Fermata, Shape::FermataBelow],
            adjacency: Shape::DOTS.to_vec(),
            accepted_results: vec![Shape::Fermata, Shape::FermataBelow],
            min_grade: grades::NO_MIN_GRADE,
        }
    }

    /// An F clef whose dots were segmented apart from its body.
    pub fn clef_dot() -> Self {
        Self {
            name: "clef_dot".into(),
            anchors: vec![Shape::FClef, Shape::FClefSmall],
            adjacency: Shape::DOTS.to_vec(),
            accepted_results: vec![Shape::FClef],
            min_grade: grades::NO_MIN_GRADE,
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "fermata_dot" => Some(Self::fermata_dot()),
            "clef_dot" => Some(Self::clef_dot()),
            _ => None,
        }
    }

    pub fn with_min_grade(mut self, min_grade: f64) -> Self {
        self.min_grade = min_grade;
        self
    }

    fn accepts(&self, shape: Shape) -> bool {
        self.accepted_results.is_empty() || self.accepted_results.contains(&shape)
    }

    /// Try the candidates of one anchor in order; true if one was committed.
    fn process_anchor(
        &self,
        registry: &mut GlyphRegistry,
        engine: &dyn EvaluationEngine,
        anchor_id: GlyphId,
    ) -> Result<bool, AnchorError> {
        let anchor = registry.active(anchor_id)?;
        let vip = anchor.is_vip();
        vip_log!(vip, pass = %self.name, anchor = %anchor, evaluation = ?anchor.evaluation(), "checking anchor");

        let candidates: Vec<GlyphId> = registry
            .lookup_intersecting(anchor.bounds())
            .into_iter()
            .filter(|&id| id != anchor_id)
            .filter(|&id| {
                registry
                    .get(id)
                    .and_then(|g| g.shape())
                    .is_some_and(|s| self.adjacency.contains(&s))
            })
            .collect();

        for candidate in candidates {
            let candidate_vip = vip || registry.get(candidate).is_some_and(|g| g.is_vip());
            vip_log!(candidate_vip, pass = %self.name, anchor = %anchor_id, %candidate, "trying candidate");

            let compound = registry.build_transient_compound(&[anchor_id, candidate])?;
            let verdict =
                engine.classify_within(&compound, self.min_grade, &|shape| self.accepts(shape))?;
            let Some(evaluation) = verdict else {
                continue;
            };

            let compound_vip = compound.is_vip();
            let id = registry.add_glyph(compound);
            registry.set_evaluation(id, evaluation)?;
            vip_log!(compound_vip, pass = %self.name, compound = %id, %evaluation, "compound committed");
            return Ok(true);
        }
        Ok(false)
    }
}

impl PatternPass for CompoundPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, registry: &mut GlyphRegistry, engine: &dyn EvaluationEngine) -> usize {
        let anchors: Vec<GlyphId> = registry
            .active_ids()
            .into_iter()
            .filter(|&id| {
                registry
                    .get(id)
                    .and_then(|g| g.shape())
                    .is_some_and(|s| self.anchors.contains(&s))
            })
            .collect();

        let mut committed = 0;
        for anchor in anchors {
            if registry.get(anchor).is_some_and(|g| !g.is_active()) {
                continue;
            }
            match self.process_anchor(registry, engine, anchor) {
                Ok(true) => committed += 1,
                Ok(false) => {}
                Err(err) => warn!(pass = %self.name, %anchor, %err, "anchor skipped"),
            }
        }
        committed
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Corrections committed by each pass over one system, in run order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatternReport {
    pub passes: Vec<(String, usize)>,
}

impl PatternReport {
    pub fn total(&self) -> usize {
        self.passes.iter().map(|(_, n)| n).sum()
    }
}

#[derive(Default)]
pub struct PatternEngine {
    passes: Vec<Box<dyn PatternPass>>,
}

impl PatternEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The passes named in `params`, in the listed order.
    pub fn from_config(params: &PatternParams) -> Result<Self, ConfigError> {
        let mut engine = Self::new();
        for name in &params.passes {
            let pass = CompoundPass::preset(name)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown pattern pass {name:?}")))?;
            engine.push(pass.with_min_grade(params.min_grade));
        }
        Ok(engine)
    }

    pub fn push(&mut self, pass: impl PatternPass + 'static) {
        self.passes.push(Box::new(pass));
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass over one system.
    pub fn run_system(&self, registry: &mut GlyphRegistry, engine: &dyn EvaluationEngine) -> PatternReport {
        let passes = self
            .passes
            .iter()
            .map(|pass| {
                let count = pass.run(registry, engine);
                tracing::debug!(pass = pass.name(), count, "pass finished");
                (pass.name().to_string(), count)
            })
            .collect();
        PatternReport { passes }
    }

    /// Run every pass over several independent systems in parallel. Reports
    /// follow the order of `systems`.
    pub fn run_systems(
        &self,
        systems: &mut [GlyphRegistry],
        engine: &dyn EvaluationEngine,
    ) -> Vec<PatternReport> {
        systems
            .par_iter_mut()
            .map(|registry| self.run_system(registry, engine))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap;
    use crate::engine::{ModelError, StartingMode, TrainingOutcome};
    use crate::geometry::Rectangle;
    use crate::glyph::{Evaluation, Glyph};
    use crate::moments::FeatureVector;
    use crate::population::Population;
    use crate::registry::GlyphIdAllocator;
    use crate::training::{CancelFlag, TrainingMonitor};

    /// Classifies everything as one fixed shape.
    struct Always(Option<Evaluation>);

    impl EvaluationEngine for Always {
        fn name(&self) -> &str {
            "always"
        }

        fn is_trained(&self) -> bool {
            true
        }

        fn evaluate(&self, _features: &FeatureVector) -> Vec<Evaluation> {
            self.0.into_iter().collect()
        }

        fn train(
            &mut self,
            population: &Population,
            _monitor: &mut dyn TrainingMonitor,
            _mode: StartingMode,
            _cancel: &CancelFlag,
        ) -> TrainingOutcome {
            TrainingOutcome {
                epochs: 0,
                final_mse: 0.0,
                cancelled: false,
                samples: population.len(),
                skipped: 0,
            }
        }

        fn dump(&self) -> String {
            String::new()
        }

        fn save(&self) -> Result<Vec<u8>, ModelError> {
            Ok(Vec::new())
        }

        fn load(&mut self, _blob: &[u8]) -> Result<(), ModelError> {
            Ok(())
        }
    }

    fn accept_fermata() -> Always {
        Always(Some(Evaluation::new(Shape::Fermata, 80.0)))
    }

    fn dot(x: i32, y: i32) -> Glyph {
        bitmap::reference(Shape::Dot, x, y, 4).unwrap()
    }

    /// A fermata arc with two dots inside its box, left one first in
    /// spatial order but registered last.
    fn fermata_with_two_dots() -> (GlyphRegistry, GlyphId, GlyphId, GlyphId) {
        let mut reg = GlyphRegistry::new();
        let fermata = reg.add_glyph(bitmap::reference(Shape::Fermata, 0, 0, 20).unwrap());
        let right = reg.add_glyph(dot(12, 10));
        let left = reg.add_glyph(dot(4, 10));
        (reg, fermata, left, right)
    }

    #[test]
    fn first_accepted_candidate_wins() {
        let (mut reg, fermata, left, right) = fermata_with_two_dots();
        let count = CompoundPass::fermata_dot().run(&mut reg, &accept_fermata());
        assert_eq!(count, 1);

        let active = reg.active_ids();
        assert!(active.contains(&right));
        assert!(!active.contains(&left));
        let compound = reg.get(*active.last().unwrap()).unwrap();
        assert_eq!(compound.parts(), &[fermata, left]);
        assert_eq!(compound.shape(), Some(Shape::Fermata));
        assert_eq!(compound.evaluation().unwrap().grade, 80.0);
    }

    #[test]
    fn repeated_runs_commit_the_same_compounds() {
        let outcome = || {
            let (mut reg, ..) = fermata_with_two_dots();
            let count = CompoundPass::fermata_dot().run(&mut reg, &accept_fermata());
            let committed: Vec<(Rectangle, Vec<GlyphId>)> = reg
                .glyphs()
                .filter(|g| g.is_compound())
                .map(|g| (g.bounds(), g.parts().to_vec()))
                .collect();
            (count, committed)
        };
        assert_eq!(outcome(), outcome());
    }

    #[test]
    fn rejected_shapes_commit_nothing() {
        let (mut reg, ..) = fermata_with_two_dots();
        let sharp = Always(Some(Evaluation::new(Shape::Sharp, 99.0)));
        assert_eq!(CompoundPass::fermata_dot().run(&mut reg, &sharp), 0);
        assert_eq!(CompoundPass::fermata_dot().run(&mut reg, &Always(None)), 0);
        assert_eq!(reg.active_count(), 3);
    }

    #[test]
    fn a_dot_is_absorbed_only_once() {
        let mut reg = GlyphRegistry::new();
        let first = reg.add_glyph(bitmap::reference(Shape::Fermata, 0, 0, 20).unwrap());
        let second = reg.add_glyph(bitmap::reference(Shape::FermataBelow, 8, 0, 20).unwrap());
        let shared = reg.add_glyph(dot(10, 8));
        let count = CompoundPass::fermata_dot().run(&mut reg, &accept_fermata());
        assert_eq!(count, 1);
        assert!(!reg.get(first).unwrap().is_active());
        assert!(reg.get(second).unwrap().is_active());
        assert!(!reg.get(shared).unwrap().is_active());
    }

    #[test]
    fn compound_already_on_record_replaces_its_parts() {
        let arc = bitmap::reference(Shape::Fermata, 0, 0, 20).unwrap();
        let spot = dot(8, 10);
        let merged = Glyph::compound_of(&[&arc, &spot]);
        let mut reg = GlyphRegistry::new();
        let anchor = reg.add_glyph(arc);
        let candidate = reg.add_glyph(spot);
        // Unlabelled glyph carrying the same pixels as anchor + candidate.
        let copy = reg.add_glyph(Glyph::new(merged.sections().to_vec()));

        let pass = CompoundPass::fermata_dot();
        assert_eq!(pass.run(&mut reg, &accept_fermata()), 1);
        assert_eq!(pass.run(&mut reg, &accept_fermata()), 0);
        assert_eq!(reg.active_ids(), vec![copy]);
        assert_eq!(reg.get(anchor).unwrap().superseded_by(), Some(copy));
        assert_eq!(reg.get(candidate).unwrap().superseded_by(), Some(copy));
        assert_eq!(reg.get(copy).unwrap().shape(), Some(Shape::Fermata));
    }

    #[test]
    fn failing_anchor_does_not_stop_the_pass() {
        let mut reg = GlyphRegistry::new();
        // Pixel-less anchor and dot: their compound has nothing to describe.
        let bounds = Rectangle::new(100, 100, 10, 10);
        reg.add_glyph(Glyph::new_virtual(bounds, Shape::Fermata));
        reg.add_glyph(Glyph::new_virtual(Rectangle::new(102, 102, 2, 2), Shape::Dot));
        reg.add_glyph(bitmap::reference(Shape::Fermata, 0, 0, 20).unwrap());
        reg.add_glyph(dot(8, 10));
        assert_eq!(CompoundPass::fermata_dot().run(&mut reg, &accept_fermata()), 1);
    }

    #[test]
    fn engine_runs_passes_in_order() {
        let params = PatternParams::default();
        let engine = PatternEngine::from_config(&params).unwrap();
        assert_eq!(engine.pass_names(), vec!["fermata_dot", "clef_dot"]);

        let (mut reg, ..) = fermata_with_two_dots();
        let report = engine.run_system(&mut reg, &accept_fermata());
        assert_eq!(
            report.passes,
            vec![("fermata_dot".to_string(), 1), ("clef_dot".to_string(), 0)]
        );
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn unknown_pass_names_are_rejected() {
        let params = PatternParams {
            passes: vec!["nope".into()],
            ..PatternParams::default()
        };
        assert!(PatternEngine::from_config(&params).is_err());
    }

    #[test]
    fn systems_run_in_parallel_with_distinct_ids() {
        let allocator = GlyphIdAllocator::new();
        let mut systems: Vec<GlyphRegistry> = (0..4)
            .map(|_| {
                let mut reg = GlyphRegistry::with_allocator(allocator.clone());
                reg.add_glyph(bitmap::reference(Shape::Fermata, 0, 0, 20).unwrap());
                reg.add_glyph(dot(8, 10));
                reg
            })
            .collect();
        let mut engine = PatternEngine::new();
        engine.push(CompoundPass::fermata_dot());
        let reports = engine.run_systems(&mut systems, &accept_fermata());
        assert!(reports.iter().all(|r| r.total() == 1));

        let mut ids: Vec<GlyphId> = systems
            .iter()
            .flat_map(|reg| reg.glyphs().filter_map(|g| g.id()))
            .collect();
        let n = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), n);
    }
}
