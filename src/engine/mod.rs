//! Collection processing engine: scheduler, worker pool, and lifecycle.
//!
//! # Architecture
//!
//! ```text
//! source ─► feeder ─► [input queue] ─► worker × N ─► [output queue] ─► dispatcher ─► listeners
//!                                          │
//!                          stage chain, error policy, restarts
//! ```
//!
//! - `process()` initializes the source and one instance of every stage per
//!   worker on the caller's thread, then starts the threads and returns.
//! - `pause()` / `resume()` gate the feeder; in-flight entities finish.
//! - `stop()` lets every loop finish its current entity; `kill()` also
//!   cancels blocked queue operations. Both end the run as aborted and
//!   neither blocks; use [`CollectionProcessingEngine::wait`] for that.
//! - Every run gets fresh per-run state; nothing leaks between runs.

pub mod builder;
pub(crate) mod checkpointer;
pub(crate) mod dispatcher;
pub mod error;
pub(crate) mod feeder;
pub mod id;
pub mod policy;
pub mod queue;
pub mod report;
pub mod restart;
pub(crate) mod run;
pub mod source;
pub mod stage;
pub mod state;
pub mod status;
pub(crate) mod worker;

pub use builder::EngineBuilder;
pub use error::{FaultKind, FaultRecord, StageFault};
pub use feeder::SOURCE_STAGE_NAME;
pub use id::EntityId;
pub use report::{PerformanceReport, RunOutcome, RunSummary, StageReport};
pub use source::{EntitySource, SourceContext};
pub use stage::{
    selection_filter, stage_factory, ProcessingStage, SelectionFilter, StageContext,
    StageDescriptor, StageFactory,
};
pub use state::EngineState;
pub use status::{EntityProcessStatus, StageTiming, StatusCallbackListener};

use crate::checkpoint::{CheckpointManager, SynchPointRegistry};
use crate::config::CpeDescription;
use crate::error::{CpeError, Result, ResultExt};
use crate::types::{Entity, Progress};
use checkpointer::Checkpointer;
use dispatcher::{Completion, Dispatcher};
use feeder::Feeder;
use queue::{bounded_queue, CancellationToken};
use run::{RunContext, RunEvent, SharedSource};
use state::Lifecycle;
use status::ListenerRegistry;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use worker::Worker;

struct EngineShared {
    description: CpeDescription,
    stages: Vec<StageDescriptor>,
    source: SharedSource,
    registry: SynchPointRegistry,
    listeners: Arc<ListenerRegistry>,
    lifecycle: Arc<Lifecycle>,
    current: Mutex<Option<Arc<RunContext>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    last_summary: Arc<Mutex<Option<RunSummary>>>,
}

/// The collection processing engine.
///
/// Built with [`EngineBuilder`]. One engine runs one collection at a time
/// and may be re-run once the previous run has ended.
pub struct CollectionProcessingEngine {
    shared: Arc<EngineShared>,
}

impl CollectionProcessingEngine {
    pub fn builder(description: CpeDescription) -> EngineBuilder {
        EngineBuilder::new(description)
    }

    pub(crate) fn from_parts(
        description: CpeDescription,
        stages: Vec<StageDescriptor>,
        source: Box<dyn EntitySource>,
        registry: SynchPointRegistry,
        listeners: Vec<Arc<dyn StatusCallbackListener>>,
    ) -> Self {
        let registry_listeners = Arc::new(ListenerRegistry::new());
        for listener in listeners {
            registry_listeners.add(listener);
        }
        Self {
            shared: Arc::new(EngineShared {
                description,
                stages,
                source: Arc::new(Mutex::new(source)),
                registry,
                listeners: registry_listeners,
                lifecycle: Arc::new(Lifecycle::new()),
                current: Mutex::new(None),
                handles: Mutex::new(Vec::new()),
                last_summary: Arc::new(Mutex::new(None)),
            }),
        }
    }

    pub fn description(&self) -> &CpeDescription {
        &self.shared.description
    }

    /// Start a run.
    ///
    /// Initialization happens on the calling thread; a failing source or
    /// stage is returned here and no terminal callback fires. Once this
    /// returns `Ok`, the run ends with exactly one
    /// `collection_process_complete` or `aborted`.
    pub fn process(&self) -> Result<()> {
        self.shared.process()
    }

    pub fn pause(&self) -> Result<()> {
        self.shared.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.shared.resume()
    }

    /// Request a cooperative stop. The run ends as aborted.
    pub fn stop(&self) -> Result<()> {
        self.shared.stop()
    }

    /// Cancel the run immediately, discarding undelivered entities.
    pub fn kill(&self) -> Result<()> {
        self.shared.kill()
    }

    pub fn is_processing(&self) -> bool {
        self.shared.lifecycle.current().is_active()
    }

    pub fn state(&self) -> EngineState {
        self.shared.lifecycle.current()
    }

    /// Block until the current run has ended and its terminal callback fired
    pub fn wait(&self) -> EngineState {
        self.shared.lifecycle.wait_inactive()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<EngineState> {
        self.shared.lifecycle.wait_inactive_timeout(timeout)
    }

    pub fn add_status_callback_listener(&self, listener: Arc<dyn StatusCallbackListener>) {
        self.shared.listeners.add(listener);
    }

    pub fn remove_status_callback_listener(
        &self,
        listener: &Arc<dyn StatusCallbackListener>,
    ) -> bool {
        self.shared.listeners.remove(listener)
    }

    /// Skip `stage` for the rest of the current run
    pub fn disable_stage(&self, stage: &str) -> Result<()> {
        let run = self.shared.active_run()?;
        let runtime = run
            .stage(stage)
            .ok_or_else(|| CpeError::UnknownStage(stage.to_string()))?;
        runtime.disable("disabled by request");
        Ok(())
    }

    pub fn enable_stage(&self, stage: &str) -> Result<()> {
        let run = self.shared.active_run()?;
        let runtime = run
            .stage(stage)
            .ok_or_else(|| CpeError::UnknownStage(stage.to_string()))?;
        runtime.enable();
        Ok(())
    }

    /// Statistics of the current run, or of the last finished one
    pub fn performance_report(&self) -> PerformanceReport {
        if let Some(summary) = self.last_summary() {
            return summary.report;
        }
        self.shared
            .current_run()
            .map(|run| run.report())
            .unwrap_or_default()
    }

    /// Source progress plus an `entities` record for the current run
    pub fn progress(&self) -> Vec<Progress> {
        let mut progress = self.shared.lock_source().progress();
        let completed = self
            .shared
            .current_run()
            .map(|run| run.counters.completed.load(Ordering::Relaxed))
            .unwrap_or(0);
        progress.push(Progress::new(
            "entities",
            completed,
            self.shared.description.num_to_process,
        ));
        progress
    }

    /// Summary of the last run that reached a terminal state
    pub fn last_summary(&self) -> Option<RunSummary> {
        self.shared
            .last_summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A control handle that does not keep the engine alive
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Drop for CollectionProcessingEngine {
    fn drop(&mut self) {
        if self.is_processing() {
            let _ = self.shared.kill();
        }
        self.shared.join_threads();
    }
}

/// Weak control handle, safe to hold from inside a listener.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Weak<EngineShared>,
}

impl EngineHandle {
    fn upgrade(&self) -> Result<Arc<EngineShared>> {
        self.shared.upgrade().ok_or(CpeError::NotRunning)
    }

    pub fn pause(&self) -> Result<()> {
        self.upgrade()?.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.upgrade()?.resume()
    }

    pub fn stop(&self) -> Result<()> {
        self.upgrade()?.stop()
    }

    pub fn kill(&self) -> Result<()> {
        self.upgrade()?.kill()
    }

    pub fn is_processing(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|s| s.lifecycle.current().is_active())
    }

    pub fn state(&self) -> Option<EngineState> {
        self.shared.upgrade().map(|s| s.lifecycle.current())
    }
}

impl EngineShared {
    fn lock_source(&self) -> MutexGuard<'_, Box<dyn EntitySource>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_run(&self) -> Option<Arc<RunContext>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn active_run(&self) -> Result<Arc<RunContext>> {
        if !self.lifecycle.current().is_active() {
            return Err(CpeError::NotRunning);
        }
        self.current_run().ok_or(CpeError::NotRunning)
    }

    fn join_threads(&self) {
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("cpe").to_string();
            if handle.join().is_err() {
                tracing::error!("Thread '{}' panicked", name);
            }
        }
    }

    fn process(&self) -> Result<()> {
        match self.lifecycle.transition(EngineState::Initializing) {
            Ok(_) => {}
            Err(CpeError::InvalidTransition { from, .. }) => {
                return Err(CpeError::AlreadyRunning(from))
            }
            Err(e) => return Err(e),
        }
        self.join_threads();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;

        tracing::info!("Initializing run '{}'", self.description.name);
        let initialized = catch_unwind(AssertUnwindSafe(|| self.initialize()))
            .unwrap_or_else(|panic| {
                if catch_unwind(AssertUnwindSafe(|| self.lock_source().close())).is_err() {
                    tracing::error!("Source panicked in close");
                }
                Err(CpeError::Initialization {
                    component: "run".to_string(),
                    source: error::fault_from_panic(panic),
                })
            });
        let prepared = match initialized {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!("Initialization of run '{}' failed: {}", self.description.name, e);
                let _ = self.lifecycle.transition(EngineState::Idle);
                return Err(e);
            }
        };

        self.start(prepared)
    }

    /// Load the checkpoint, then initialize the source and stage instances
    fn initialize(&self) -> Result<Prepared> {
        let source_key = self.lock_source().compatibility_key();

        let checkpointer = match &self.description.checkpoint {
            Some(settings) => {
                let mut registry = self.registry.clone();
                for name in &settings.allowed_types {
                    registry.allow_name(name.clone());
                }
                let manager = CheckpointManager::new(&settings.file, registry);
                Some(Checkpointer::new(manager, settings, source_key.clone()))
            }
            None => None,
        };

        let restored = match &checkpointer {
            Some(cp) => cp
                .manager()
                .load(&source_key)
                .context("Failed to load checkpoint")?,
            None => None,
        };

        {
            let mut source = self.lock_source();
            let ctx = SourceContext {
                starting_entity_id: self.description.starting_entity_id.clone(),
                resuming: restored.is_some(),
            };
            source
                .initialize(&ctx)
                .map_err(|fault| CpeError::Initialization {
                    component: "source".to_string(),
                    source: fault,
                })?;
            if let Some(checkpoint) = &restored {
                if let Err(fault) = source.restore(&checkpoint.synch_point) {
                    source.close();
                    return Err(CpeError::Initialization {
                        component: "source (restoring checkpoint)".to_string(),
                        source: fault,
                    });
                }
                tracing::info!(
                    "Resuming from checkpoint with {} entities already completed",
                    checkpoint.entities_completed
                );
            }
        }

        let thread_count = self.description.effective_thread_count();
        let mut workers: Vec<Vec<Box<dyn ProcessingStage>>> = Vec::with_capacity(thread_count);
        for worker_index in 0..thread_count {
            let mut instances = Vec::with_capacity(self.stages.len());
            for stage in &self.stages {
                match stage.instantiate(worker_index, 0) {
                    Ok(instance) => instances.push(instance),
                    Err(fault) => {
                        for mut created in workers.into_iter().flatten().chain(instances) {
                            created.close();
                        }
                        self.lock_source().close();
                        return Err(CpeError::Initialization {
                            component: format!("stage '{}'", stage.name()),
                            source: fault,
                        });
                    }
                }
            }
            workers.push(instances);
        }

        Ok(Prepared {
            checkpointer,
            workers,
        })
    }

    fn start(&self, prepared: Prepared) -> Result<()> {
        let Prepared {
            checkpointer,
            workers,
        } = prepared;

        let cancel = CancellationToken::new();
        let (input_tx, input_rx) =
            bounded_queue::<Entity>(self.description.input_queue_size, cancel.clone());
        let (output_tx, output_rx) =
            bounded_queue::<Completion>(self.description.output_queue_size, cancel.clone());

        let run = Arc::new(RunContext::new(
            &self.description,
            &self.stages,
            cancel,
            self.source.clone(),
            checkpointer,
        ));
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(run.clone());
        *self
            .last_summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        self.listeners
            .notify("initialization_complete", |l| l.initialization_complete());
        self.lifecycle.transition(EngineState::Running)?;
        tracing::info!(
            "Run '{}' started with {} worker(s), {} stage(s)",
            self.description.name,
            workers.len(),
            self.stages.len()
        );

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);

        let dispatcher = Dispatcher::new(
            run.clone(),
            self.lifecycle.clone(),
            self.listeners.clone(),
            output_rx,
            input_rx.clone(),
            self.last_summary.clone(),
        );
        match spawn("cpe-dispatcher".to_string(), move || dispatcher.run()) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                // Nothing else is running yet, so no callback will follow.
                run.abort("failed to start dispatcher");
                let _ = self.lifecycle.transition(EngineState::Aborted);
                return Err(e);
            }
        }

        for (index, instances) in workers.into_iter().enumerate() {
            let worker = Worker::new(
                index,
                run.clone(),
                input_rx.clone(),
                output_tx.clone(),
                instances,
            );
            match spawn(format!("cpe-worker-{}", index), move || worker.run()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    run.abort("failed to start worker");
                    return Err(e);
                }
            }
        }
        drop(input_rx);

        let feeder = Feeder::new(run.clone(), self.lifecycle.clone(), input_tx, output_tx);
        match spawn("cpe-feeder".to_string(), move || feeder.run()) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                run.abort("failed to start feeder");
                return Err(e);
            }
        }

        match Checkpointer::spawn_ticker(&run) {
            Ok(Some(handle)) => handles.push(handle),
            Ok(None) => {}
            Err(e) => tracing::warn!("Checkpoint ticker not started: {}", e),
        }

        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let run = self.active_run()?;
        if !self
            .lifecycle
            .transition_from(EngineState::Running, EngineState::Paused)
        {
            return Err(CpeError::InvalidTransition {
                from: self.lifecycle.current(),
                to: EngineState::Paused,
            });
        }
        run.control.pause();
        run.send_event(RunEvent::Paused);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let run = self.active_run()?;
        if !self
            .lifecycle
            .transition_from(EngineState::Paused, EngineState::Running)
        {
            return Err(CpeError::InvalidTransition {
                from: self.lifecycle.current(),
                to: EngineState::Running,
            });
        }
        run.control.resume();
        run.send_event(RunEvent::Resumed);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let run = self.active_run()?;
        tracing::info!("Stop requested for run '{}'", run.name);
        run.stop("stop requested");
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        let run = self.active_run()?;
        run.abort("kill requested");
        Ok(())
    }
}

/// Output of a successful initialization.
struct Prepared {
    checkpointer: Option<Checkpointer>,
    workers: Vec<Vec<Box<dyn ProcessingStage>>>,
}

fn spawn<F>(name: String, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|e| CpeError::Thread(format!("failed to spawn {}: {}", name, e)))
}
