// Training coordination.
//
// `TrainingCoordinator` owns a sample repository, prepares the core or whole
// population from it and drives an `EvaluationEngine` over the result. The
// repository is an explicit constructor argument, so several coordinators
// (and several engines) can coexist in one process.
//
// Training either runs inline (`train`) or as a background `TrainingTask`
// (`spawn`). The task prepares its population on the calling thread, then
// moves the snapshot and the engine to a worker thread; nothing it does
// touches a glyph registry. Progress flows back as `TrainingEvent`s on an
// `mpsc` channel, and the caller decides where to consume them. A shared
// `CancelFlag` stops training cooperatively at the next epoch boundary.
//
// Monitors are observers: `NullMonitor` ignores everything,
// `RecordingMonitor` keeps a log for summaries and tests, `ChannelMonitor`
// forwards to a channel.

use crate::engine::{EvaluationEngine, StartingMode, TrainingOutcome};
use crate::glyph::Glyph;
use crate::population::{PreparedPopulation, SampleRepository, prepare_population};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::info;

// ---------------------------------------------------------------------------
// Monitors
// ---------------------------------------------------------------------------

/// Observer of a training run. Calls may come from a worker thread.
pub trait TrainingMonitor {
    /// Before the first epoch: epochs already on the model and its error.
    fn training_started(&mut self, epoch: usize, mse: f64);

    fn epoch_ended(&mut self, epoch: usize, mse: f64);

    /// Once per population sample, in population order.
    fn glyph_processed(&mut self, glyph: &Glyph);
}

pub struct NullMonitor;

impl TrainingMonitor for NullMonitor {
    fn training_started(&mut self, _epoch: usize, _mse: f64) {}
    fn epoch_ended(&mut self, _epoch: usize, _mse: f64) {}
    fn glyph_processed(&mut self, _glyph: &Glyph) {}
}

/// Keeps every notification.
#[derive(Clone, Debug, Default)]
pub struct RecordingMonitor {
    pub started: Option<(usize, f64)>,
    pub epochs: Vec<(usize, f64)>,
    pub glyphs: usize,
}

impl TrainingMonitor for RecordingMonitor {
    fn training_started(&mut self, epoch: usize, mse: f64) {
        self.started = Some((epoch, mse));
    }

    fn epoch_ended(&mut self, epoch: usize, mse: f64) {
        self.epochs.push((epoch, mse));
    }

    fn glyph_processed(&mut self, _glyph: &Glyph) {
        self.glyphs += 1;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TrainingEvent {
    Started { epoch: usize, mse: f64 },
    /// `count` samples processed so far.
    GlyphProcessed { count: usize },
    EpochEnded { epoch: usize, mse: f64 },
    Finished(TrainingOutcome),
}

/// Forwards notifications to a channel. A closed receiver is ignored;
/// training does not depend on anyone listening.
pub struct ChannelMonitor {
    tx: Sender<TrainingEvent>,
    processed: usize,
}

impl ChannelMonitor {
    pub fn new(tx: Sender<TrainingEvent>) -> Self {
        Self { tx, processed: 0 }
    }
}

impl TrainingMonitor for ChannelMonitor {
    fn training_started(&mut self, epoch: usize, mse: f64) {
        let _ = self.tx.send(TrainingEvent::Started { epoch, mse });
    }

    fn epoch_ended(&mut self, epoch: usize, mse: f64) {
        let _ = self.tx.send(TrainingEvent::EpochEnded { epoch, mse });
    }

    fn glyph_processed(&mut self, _glyph: &Glyph) {
        self.processed += 1;
        let _ = self.tx.send(TrainingEvent::GlyphProcessed {
            count: self.processed,
        });
    }
}

// ---------------------------------------------------------------------------
// Cancellation and tasks
// ---------------------------------------------------------------------------

/// Cooperative stop request, checked by engines between epochs.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("training thread panicked")]
    Panicked,
}

/// Handle on a background training run.
pub struct TrainingTask {
    events: Receiver<TrainingEvent>,
    cancel: CancelFlag,
    thread: JoinHandle<(Box<dyn EvaluationEngine>, TrainingOutcome)>,
}

impl TrainingTask {
    /// Progress events. The channel closes when the worker exits, after a
    /// final `Finished`.
    pub fn events(&self) -> &Receiver<TrainingEvent> {
        &self.events
    }

    /// Ask the worker to stop at the next epoch boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Wait for the worker and take back the engine.
    pub fn join(self) -> Result<(Box<dyn EvaluationEngine>, TrainingOutcome), TrainingError> {
        self.thread.join().map_err(|_| TrainingError::Panicked)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Sizes of the two standing selections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PopulationSizes {
    pub core: usize,
    pub whole: usize,
}

pub struct TrainingCoordinator<R> {
    repository: R,
}

impl<R: SampleRepository> TrainingCoordinator<R> {
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn population_sizes(&self) -> PopulationSizes {
        PopulationSizes {
            core: self.repository.base(false).len(),
            whole: self.repository.base(true).len(),
        }
    }

    /// Prepare the whole selection, or the core one.
    pub fn prepare(&self, use_whole: bool) -> PreparedPopulation {
        let name = if use_whole { "whole" } else { "core" };
        prepare_population(name, &self.repository.base(use_whole), &self.repository)
    }

    /// Prepare a population and train `engine` on it, on this thread.
    pub fn train(
        &self,
        use_whole: bool,
        engine: &mut dyn EvaluationEngine,
        monitor: &mut dyn TrainingMonitor,
        mode: StartingMode,
        cancel: &CancelFlag,
    ) -> TrainingOutcome {
        let prepared = self.prepare(use_whole);
        info!(
            engine = engine.name(),
            population = prepared.population.name(),
            samples = prepared.population.len(),
            dropped = prepared.dropped.len(),
            ?mode,
            "training"
        );
        engine.train(&prepared.population, monitor, mode, cancel)
    }

    /// Prepare a population here, then train `engine` on a worker thread.
    pub fn spawn(
        &self,
        use_whole: bool,
        mut engine: Box<dyn EvaluationEngine>,
        mode: StartingMode,
    ) -> TrainingTask {
        let prepared = self.prepare(use_whole);
        let population = prepared.population;
        info!(
            engine = engine.name(),
            population = population.name(),
            samples = population.len(),
            dropped = prepared.dropped.len(),
            ?mode,
            "starting background training"
        );

        let (tx, rx) = mpsc::channel();
        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();
        let thread = thread::spawn(move || {
            let mut monitor = ChannelMonitor::new(tx.clone());
            let outcome = engine.train(&population, &mut monitor, mode, &worker_cancel);
            let _ = tx.send(TrainingEvent::Finished(outcome.clone()));
            (engine, outcome)
        });

        TrainingTask {
            events: rx,
            cancel,
            thread,
        }
    }
}
