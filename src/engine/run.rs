//! Per-run state shared by the feeder, workers, dispatcher, and ticker.
//!
//! A fresh [`RunContext`] is created by every `process()` call and retired
//! when the run reaches a terminal state; nothing survives between runs.

use crate::config::CpeDescription;
use crate::engine::checkpointer::Checkpointer;
use crate::engine::id::StageId;
use crate::engine::policy::{PolicyDecision, StageErrorPolicy};
use crate::engine::queue::CancellationToken;
use crate::engine::report::{PerformanceReport, RunCounters, StageStats};
use crate::engine::restart::RestartSupervisor;
use crate::engine::source::EntitySource;
use crate::engine::stage::StageDescriptor;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Source shared between the engine and the run's threads.
pub(crate) type SharedSource = Arc<Mutex<Box<dyn EntitySource>>>;

/// Lifecycle notifications routed through the dispatcher thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunEvent {
    Paused,
    Resumed,
}

/// Mutable runtime state of one configured stage.
pub(crate) struct StageRuntime {
    pub id: StageId,
    pub descriptor: StageDescriptor,
    pub restarts: RestartSupervisor,
    pub stats: StageStats,
    error_policy: Mutex<StageErrorPolicy>,
    disabled: AtomicBool,
    batch_counter: AtomicU64,
}

impl StageRuntime {
    fn new(id: StageId, descriptor: StageDescriptor) -> Self {
        let settings = &descriptor.settings;
        Self {
            id,
            restarts: RestartSupervisor::new(settings.restart_policy),
            error_policy: Mutex::new(StageErrorPolicy::new(settings.error_policy)),
            stats: StageStats::default(),
            disabled: AtomicBool::new(false),
            batch_counter: AtomicU64::new(0),
            descriptor,
        }
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Disable the stage; returns `true` if it was enabled before
    pub fn disable(&self, reason: &str) -> bool {
        let was_enabled = !self.disabled.swap(true, Ordering::SeqCst);
        if was_enabled {
            tracing::warn!("Stage '{}' disabled: {}", self.name(), reason);
        }
        was_enabled
    }

    pub fn enable(&self) -> bool {
        let was_disabled = self.disabled.swap(false, Ordering::SeqCst);
        if was_disabled {
            tracing::info!("Stage '{}' re-enabled", self.name());
        }
        was_disabled
    }

    pub fn record_success(&self) {
        self.policy().record_success();
    }

    pub fn record_fault(&self) -> PolicyDecision {
        let mut policy = self.policy();
        let decision = policy.record_fault();
        tracing::debug!(
            "Stage '{}' error window: {}/{} faults",
            self.name(),
            policy.faults_in_window(),
            policy.window().len()
        );
        decision
    }

    /// Count one processed entity; `true` when a batch boundary is crossed
    pub fn tick_batch(&self) -> bool {
        let batch = u64::from(self.descriptor.settings.batch_size.max(1));
        let count = self.batch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        count % batch == 0
    }

    fn policy(&self) -> MutexGuard<'_, StageErrorPolicy> {
        self.error_policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
struct ControlFlags {
    paused: bool,
    stopping: bool,
}

/// Pause and stop signals for the feeder and workers.
#[derive(Debug, Default)]
pub(crate) struct RunControl {
    flags: Mutex<ControlFlags>,
    wake: Condvar,
}

impl RunControl {
    fn flags(&self) -> MutexGuard<'_, ControlFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pause(&self) {
        self.flags().paused = true;
    }

    pub fn resume(&self) {
        self.flags().paused = false;
        self.wake.notify_all();
    }

    pub fn request_stop(&self) {
        self.flags().stopping = true;
        self.wake.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.flags().paused
    }

    pub fn is_stopping(&self) -> bool {
        self.flags().stopping
    }

    /// Block while paused. Returns `false` once a stop was requested.
    pub fn wait_while_paused(&self) -> bool {
        let flags = self.flags();
        let flags = self
            .wake
            .wait_while(flags, |f| f.paused && !f.stopping)
            .unwrap_or_else(PoisonError::into_inner);
        !flags.stopping
    }
}

/// Everything one run's threads share.
pub(crate) struct RunContext {
    pub name: String,
    pub stages: Vec<StageRuntime>,
    pub control: RunControl,
    /// Cancelled by `kill()`; wakes every blocked queue operation.
    pub cancel: CancellationToken,
    /// Cancelled when the run has finished; stops the checkpoint ticker.
    pub shutdown: CancellationToken,
    pub counters: RunCounters,
    pub source: SharedSource,
    pub checkpointer: Option<Checkpointer>,
    pub num_to_process: Option<u64>,
    pub drop_entity_on_fault: bool,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    abort_reason: Mutex<Option<String>>,
    events_tx: Sender<RunEvent>,
    events_rx: Receiver<RunEvent>,
}

impl RunContext {
    pub fn new(
        description: &CpeDescription,
        stages: &[StageDescriptor],
        cancel: CancellationToken,
        source: SharedSource,
        checkpointer: Option<Checkpointer>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            name: description.name.clone(),
            stages: stages
                .iter()
                .enumerate()
                .map(|(i, d)| StageRuntime::new(StageId(i as u32), d.clone()))
                .collect(),
            control: RunControl::default(),
            cancel,
            shutdown: CancellationToken::new(),
            counters: RunCounters::default(),
            source,
            checkpointer,
            num_to_process: description.num_to_process,
            drop_entity_on_fault: description.drop_entity_on_fault,
            started: Instant::now(),
            started_at: Utc::now(),
            abort_reason: Mutex::new(None),
            events_tx,
            events_rx,
        }
    }

    pub fn lock_source(&self) -> MutexGuard<'_, Box<dyn EntitySource>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stage(&self, name: &str) -> Option<&StageRuntime> {
        self.stages.iter().find(|s| s.name() == name)
    }

    /// Cooperative stop: loops exit after their current entity.
    pub fn stop(&self, reason: &str) {
        self.set_abort_reason(reason);
        self.control.request_stop();
    }

    /// Forced stop: also cancels every blocked queue operation.
    pub fn abort(&self, reason: &str) {
        self.set_abort_reason(reason);
        self.control.request_stop();
        if self.cancel.cancel() {
            tracing::warn!("Run '{}' killed: {}", self.name, reason);
        }
    }

    /// Whether the run will end as aborted
    pub fn is_aborting(&self) -> bool {
        self.control.is_stopping()
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_abort_reason(&self, reason: &str) {
        let mut slot = self
            .abort_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }

    pub fn send_event(&self, event: RunEvent) {
        // The receiver lives in this context, so the send cannot fail.
        let _ = self.events_tx.send(event);
    }

    pub fn events(&self) -> &Receiver<RunEvent> {
        &self.events_rx
    }

    /// Entities between listener `batch_process_complete` callbacks
    pub fn listener_batch_size(&self) -> u64 {
        self.stages
            .iter()
            .filter(|s| !s.is_disabled())
            .map(|s| u64::from(s.descriptor.settings.batch_size.max(1)))
            .min()
            .unwrap_or(1)
    }

    pub fn report(&self) -> PerformanceReport {
        PerformanceReport {
            entities_dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            entities_completed: self.counters.completed.load(Ordering::Relaxed),
            entities_discarded: self.counters.discarded.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            stages: self
                .stages
                .iter()
                .map(|s| s.stats.snapshot(s.name(), s.is_disabled()))
                .collect(),
        }
    }
}
