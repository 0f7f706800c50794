// Stavelight glyph trainer: CLI entry point.
//
// Trains an evaluation engine on a sample repository and saves the model.
// The pipeline: load repository → prepare population → background training
// (progress printed from the event channel) → save blob → resubstitution
// accuracy report.
//
// Usage:
//   cargo run -p stavelight_glyph --bin glyph_trainer -- <repository.json>
//     [--core] [--engine network|linear] [--config engine.json] [--seed N]
//     [--out model.bin] [--warm model.bin] [--synthetic N]
//
// `--synthetic N` replaces the repository with reference drawings of every
// trainable shape at N sizes. Log verbosity follows RUST_LOG (default info).

use stavelight_glyph::bitmap;
use stavelight_glyph::config::EngineConfig;
use stavelight_glyph::engine::{EvaluationEngine, GlyphNetwork, LinearEvaluator, StartingMode};
use stavelight_glyph::glyph::grades;
use stavelight_glyph::population::{MemoryRepository, SampleRepository};
use stavelight_glyph::shape::Shape;
use stavelight_glyph::training::{TrainingCoordinator, TrainingEvent};
use std::collections::BTreeMap;
use std::error::Error;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let repository_path = args.get(1).filter(|s| !s.starts_with("--")).cloned();
    let use_whole = !args.iter().any(|a| a == "--core");
    let engine_name: String = parse_flag(&args, "--engine").unwrap_or_else(|| "network".to_string());
    let config_path: Option<String> = parse_flag(&args, "--config");
    let seed: Option<u64> = parse_flag(&args, "--seed");
    let out_path: String = parse_flag(&args, "--out").unwrap_or_else(|| "model.bin".to_string());
    let warm_path: Option<String> = parse_flag(&args, "--warm");
    let synthetic: Option<usize> = parse_flag(&args, "--synthetic");

    let mut config = match &config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(seed) = seed {
        config.network.seed = seed;
        config.linear.seed = seed;
    }

    let repository = match (synthetic, &repository_path) {
        (Some(sizes), _) => synthetic_repository(sizes)?,
        (None, Some(path)) => MemoryRepository::load(path)?,
        (None, None) => {
            eprintln!("usage: glyph_trainer <repository.json> [--core] [--engine network|linear] [--config engine.json] [--seed N] [--out model.bin] [--warm model.bin] [--synthetic N]");
            std::process::exit(2);
        }
    };

    println!("=== Stavelight Glyph Trainer ===");
    let coordinator = TrainingCoordinator::new(repository);
    let sizes = coordinator.population_sizes();
    println!("Repository: {} core / {} whole samples", sizes.core, sizes.whole);
    println!("Population: {}", if use_whole { "whole" } else { "core" });

    let mut engine: Box<dyn EvaluationEngine> = match engine_name.as_str() {
        "network" => Box::new(GlyphNetwork::new(config.network.clone())),
        "linear" => Box::new(LinearEvaluator::new(config.linear.clone())),
        other => return Err(format!("unknown engine {other:?}, expected network or linear").into()),
    };
    println!("Engine: {}", engine.name());

    let mode = match &warm_path {
        Some(path) => {
            engine.load(&std::fs::read(path)?)?;
            println!("Warm start from {path}");
            StartingMode::WarmStart
        }
        None => StartingMode::FromScratch,
    };

    let task = coordinator.spawn(use_whole, engine, mode);
    for event in task.events().iter() {
        match event {
            TrainingEvent::Started { epoch, mse } => {
                println!("  start at epoch {epoch}, mse {mse:.6}");
            }
            TrainingEvent::EpochEnded { epoch, mse } if epoch == 1 || epoch % 25 == 0 => {
                println!("  epoch {epoch:>5}  mse {mse:.6}");
            }
            TrainingEvent::Finished(outcome) => {
                println!(
                    "Finished: {} epochs, mse {:.6}, {} samples ({} skipped){}",
                    outcome.epochs,
                    outcome.final_mse,
                    outcome.samples,
                    outcome.skipped,
                    if outcome.cancelled { ", cancelled" } else { "" }
                );
            }
            _ => {}
        }
    }
    let (engine, _) = task.join()?;

    std::fs::write(&out_path, engine.save()?)?;
    println!("Model written to {out_path}");

    report_accuracy(&coordinator, use_whole, engine.as_ref())?;
    Ok(())
}

/// Reference drawings of every trainable shape at `sizes` sizes, half of
/// them in the core selection.
fn synthetic_repository(sizes: usize) -> Result<MemoryRepository, Box<dyn Error>> {
    let mut repository = MemoryRepository::new();
    for shape in Shape::TRAINABLE {
        for k in 0..sizes {
            let size = 12 + 3 * k as i32;
            if let Some(glyph) = bitmap::reference(shape, 0, 0, size) {
                repository.insert(format!("{shape}-{size}"), &glyph, k % 2 == 0)?;
            }
        }
    }
    Ok(repository)
}

/// Classify every training sample again and print per-shape hit rates.
fn report_accuracy<R: SampleRepository>(
    coordinator: &TrainingCoordinator<R>,
    use_whole: bool,
    engine: &dyn EvaluationEngine,
) -> Result<(), Box<dyn Error>> {
    let prepared = coordinator.prepare(use_whole);
    let mut per_shape: BTreeMap<Shape, (usize, usize)> = BTreeMap::new();
    for sample in prepared.population.samples() {
        let verdict = engine.classify(&sample.glyph, grades::NO_MIN_GRADE)?;
        let entry = per_shape.entry(sample.shape).or_insert((0, 0));
        entry.1 += 1;
        if verdict.map(|e| e.shape) == Some(sample.shape) {
            entry.0 += 1;
        }
    }

    println!();
    println!("Resubstitution accuracy:");
    let (mut hits, mut total) = (0, 0);
    for (shape, (ok, n)) in &per_shape {
        println!("  {:<16} {ok:>4}/{n:<4}", shape.name());
        hits += ok;
        total += n;
    }
    if total > 0 {
        println!("  {:<16} {hits:>4}/{total:<4} ({:.1}%)", "all", 100.0 * hits as f64 / total as f64);
    }
    for shape in &prepared.missing {
        println!("  {:<16} not covered", shape.name());
    }
    Ok(())
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}
