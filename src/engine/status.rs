//! Per-entity status and lifecycle listeners.
//!
//! # Delivery rules
//!
//! - Every callback to one listener is serialized by that listener's gate,
//!   so implementations never see two callbacks at once.
//! - A panicking listener is logged and skipped; other listeners and later
//!   callbacks still run.
//! - Exactly one of `collection_process_complete` / `aborted` fires per run
//!   that reached `Running`.

use crate::engine::error::FaultRecord;
use crate::engine::id::EntityId;
use crate::types::Entity;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Time spent in one stage call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    pub elapsed: Duration,
}

/// Outcome of one entity's traversal of the stage chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityProcessStatus {
    entity_id: EntityId,
    entity_key: String,
    faults: Vec<FaultRecord>,
    failed_stage: Option<String>,
    visited: Vec<String>,
    timings: Vec<StageTiming>,
    skipped: bool,
}

impl EntityProcessStatus {
    pub fn new(entity_id: EntityId, entity_key: impl Into<String>) -> Self {
        Self {
            entity_id,
            entity_key: entity_key.into(),
            faults: Vec::new(),
            failed_stage: None,
            visited: Vec::new(),
            timings: Vec::new(),
            skipped: false,
        }
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn entity_key(&self) -> &str {
        &self.entity_key
    }

    /// No stage faulted
    pub fn is_ok(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn is_failed(&self) -> bool {
        !self.faults.is_empty()
    }

    /// Faults in the order they were raised
    pub fn faults(&self) -> &[FaultRecord] {
        &self.faults
    }

    /// First stage that faulted
    pub fn failed_stage(&self) -> Option<&str> {
        self.failed_stage.as_deref()
    }

    /// Stages that were invoked for this entity, in order
    pub fn stages_visited(&self) -> &[String] {
        &self.visited
    }

    pub fn timings(&self) -> &[StageTiming] {
        &self.timings
    }

    pub fn total_time(&self) -> Duration {
        self.timings.iter().map(|t| t.elapsed).sum()
    }

    /// Traversal ended before the last stage
    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    pub(crate) fn record_call(&mut self, stage: &str, elapsed: Duration) {
        self.visited.push(stage.to_string());
        self.timings.push(StageTiming {
            stage: stage.to_string(),
            elapsed,
        });
    }

    pub(crate) fn record_fault(&mut self, fault: FaultRecord) {
        if self.failed_stage.is_none() {
            self.failed_stage = Some(fault.stage.clone());
        }
        self.faults.push(fault);
    }

    pub(crate) fn mark_skipped(&mut self) {
        self.skipped = true;
    }
}

/// Observer of a run's lifecycle and per-entity outcomes.
///
/// Every method has a no-op default.
pub trait StatusCallbackListener: Send + Sync {
    /// The run passed initialization; entities are about to flow.
    fn initialization_complete(&self) {}

    /// A batch of entities completed.
    fn batch_process_complete(&self) {}

    /// One entity finished. `entity` is `None` when a fatal fault withheld it.
    fn entity_process_complete(&self, _entity: Option<&Entity>, _status: &EntityProcessStatus) {}

    fn paused(&self) {}

    fn resumed(&self) {}

    /// The run ended normally.
    fn collection_process_complete(&self) {}

    /// The run ended through `stop`, `kill`, a terminate policy, or a fatal fault.
    fn aborted(&self) {}
}

struct RegisteredListener {
    listener: Arc<dyn StatusCallbackListener>,
    gate: Arc<Mutex<()>>,
}

/// Registered listeners with per-listener serialization.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<RegisteredListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn StatusCallbackListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RegisteredListener {
                listener,
                gate: Arc::new(Mutex::new(())),
            });
    }

    /// Remove a listener by identity. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn StatusCallbackListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|r| Arc::as_ptr(&r.listener) as *const () != target);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke `callback` on every listener.
    ///
    /// The list is snapshotted first, so listeners may add or remove
    /// listeners from inside a callback.
    pub fn notify<F>(&self, event: &str, callback: F)
    where
        F: Fn(&dyn StatusCallbackListener),
    {
        let snapshot: Vec<(Arc<dyn StatusCallbackListener>, Arc<Mutex<()>>)> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| (r.listener.clone(), r.gate.clone()))
            .collect();

        for (listener, gate) in snapshot {
            let _guard = gate.lock().unwrap_or_else(PoisonError::into_inner);
            let result = catch_unwind(AssertUnwindSafe(|| callback(listener.as_ref())));
            if result.is_err() {
                tracing::error!("Listener panicked during '{}' callback", event);
            }
        }
    }
}
