// Pattern engine against a trained classifier.
//
// Builds several systems in which segmentation split fermatas and F clefs
// from their dots, trains a network on reference drawings, and runs the
// configured passes over all systems in parallel. Whatever the network
// decides, the bookkeeping must hold: every reported correction is one
// committed compound with an accepted shape, its parts are superseded and
// out of the spatial index, and a second identical run reproduces the same
// compounds.

use stavelight_glyph::bitmap;
use stavelight_glyph::config::{EngineConfig, NetworkParams};
use stavelight_glyph::engine::{EvaluationEngine, GlyphNetwork, StartingMode};
use stavelight_glyph::geometry::Rectangle;
use stavelight_glyph::glyph::{Glyph, GlyphId};
use stavelight_glyph::pattern::PatternEngine;
use stavelight_glyph::population::{Population, Sample};
use stavelight_glyph::registry::{GlyphIdAllocator, GlyphRegistry};
use stavelight_glyph::shape::Shape;
use stavelight_glyph::training::{CancelFlag, NullMonitor};

fn trained_network() -> GlyphNetwork {
    let samples = Shape::TRAINABLE
        .iter()
        .flat_map(|&shape| {
            [14, 18, 22].into_iter().map(move |size| {
                let glyph = bitmap::reference(shape, 0, 0, size).unwrap();
                Sample::new(format!("{shape}-{size}"), glyph, shape)
            })
        })
        .collect();
    let mut network = GlyphNetwork::new(NetworkParams {
        max_epochs: 120,
        ..NetworkParams::default()
    });
    network.train(
        &Population::new("reference", samples),
        &mut NullMonitor,
        StartingMode::FromScratch,
        &CancelFlag::new(),
    );
    network
}

/// A fermata arc drawn without its dot.
fn fermata_arc(x: i32, y: i32, size: i32) -> Glyph {
    bitmap::from_fn(Rectangle::new(x, y, size, size), |u, v| {
        let r = u * u + (v - 0.4) * (v - 0.4);
        v <= 0.4 && (0.55..=1.0).contains(&r)
    })
    .with_shape(Shape::Fermata)
}

fn dot(x: i32, y: i32, size: i32) -> Glyph {
    bitmap::reference(Shape::Dot, x, y, size).unwrap()
}

fn system(allocator: &GlyphIdAllocator, offset: i32) -> GlyphRegistry {
    let mut reg = GlyphRegistry::with_allocator(allocator.clone());
    reg.add_glyph(fermata_arc(offset, 0, 24));
    reg.add_glyph(dot(offset + 10, 13, 4));
    let clef = bitmap::reference(Shape::FClef, offset + 40, 0, 24).unwrap();
    reg.add_glyph(clef);
    reg.add_glyph(dot(offset + 58, 6, 3));
    reg.add_glyph(bitmap::reference(Shape::Sharp, offset + 80, 0, 20).unwrap());
    reg
}

fn committed(reg: &GlyphRegistry) -> Vec<(Rectangle, Vec<GlyphId>, Option<Shape>)> {
    reg.glyphs()
        .filter(|g| g.is_compound())
        .map(|g| (g.bounds(), g.parts().to_vec(), g.shape()))
        .collect()
}

#[test]
fn corrections_are_consistent_and_reproducible() {
    let network = trained_network();
    assert!(network.is_trained());
    let engine = PatternEngine::from_config(&EngineConfig::default().patterns).unwrap();

    let run = || {
        let allocator = GlyphIdAllocator::new();
        let mut systems: Vec<GlyphRegistry> =
            (0..3).map(|i| system(&allocator, i * 200)).collect();
        let reports = engine.run_systems(&mut systems, &network);
        (reports, systems)
    };

    let (reports, systems) = run();
    assert_eq!(reports.len(), 3);
    for (report, reg) in reports.iter().zip(&systems) {
        let compounds = committed(reg);
        assert_eq!(report.total(), compounds.len());
        for (_, parts, shape) in &compounds {
            assert!(matches!(
                shape,
                Some(Shape::Fermata | Shape::FermataBelow | Shape::FClef)
            ));
            for part in parts {
                let glyph = reg.get(*part).unwrap();
                assert!(!glyph.is_active());
                assert!(!reg.active_ids().contains(part));
            }
        }
        assert_eq!(reg.active_count(), reg.active_ids().len());
    }

    // Fresh allocators restart at 1, so ids match as well as geometry.
    let (again, systems_again) = run();
    assert_eq!(reports, again);
    for (a, b) in systems.iter().zip(&systems_again) {
        assert_eq!(committed(a), committed(b));
    }
}

#[test]
fn rerunning_a_system_commits_nothing_more() {
    let network = trained_network();
    let engine = PatternEngine::from_config(&EngineConfig::default().patterns).unwrap();
    let allocator = GlyphIdAllocator::new();
    let mut reg = system(&allocator, 0);
    let first = engine.run_system(&mut reg, &network);
    assert_eq!(committed(&reg).len(), first.total());
    // Absorbed dots are gone and rejected pairs classify the same way again.
    let second = engine.run_system(&mut reg, &network);
    assert_eq!(second.total(), 0);
    assert_eq!(committed(&reg).len(), first.total());
}
