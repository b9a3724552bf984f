//! Checkpoint cadence for a run.
//!
//! Checkpoints are taken:
//! - every N completed entities (dispatcher thread), or every T ms
//!   (dedicated `cpe-checkpoint` ticker thread)
//! - when the run is paused
//! - when the run ends aborted
//!
//! A run that completes normally deletes its checkpoint.

use crate::checkpoint::{CheckpointFile, CheckpointManager};
use crate::config::{CheckpointSettings, CheckpointUnit};
use crate::engine::run::RunContext;
use crossbeam_channel::{select, tick};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct Checkpointer {
    manager: CheckpointManager,
    unit: CheckpointUnit,
    frequency: u64,
    source_key: String,
    write_lock: Mutex<()>,
}

impl Checkpointer {
    pub fn new(
        manager: CheckpointManager,
        settings: &CheckpointSettings,
        source_key: String,
    ) -> Self {
        Self {
            manager,
            unit: settings.unit,
            frequency: settings.frequency.max(1),
            source_key,
            write_lock: Mutex::new(()),
        }
    }

    pub fn manager(&self) -> &CheckpointManager {
        &self.manager
    }

    /// Called by the dispatcher after each completed entity
    pub fn on_completed(&self, run: &RunContext, completed: u64) {
        if self.unit == CheckpointUnit::Entities && completed % self.frequency == 0 {
            self.take(run);
        }
    }

    /// Write a checkpoint now. Failures are logged, never propagated.
    pub fn take(&self, run: &RunContext) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_locked(run);
    }

    /// Delete the checkpoint after a normal completion
    pub fn discard(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.manager.remove() {
            Ok(()) => tracing::debug!("Checkpoint {:?} removed", self.manager.path()),
            Err(e) => tracing::warn!(
                "Failed to remove checkpoint {:?}: {}",
                self.manager.path(),
                e
            ),
        }
    }

    fn write_locked(&self, run: &RunContext) {
        let Some(point) = run.lock_source().synch_point() else {
            tracing::debug!("Source has no synch point; checkpoint skipped");
            return;
        };
        let file = CheckpointFile::new(self.source_key.clone(), point, run.report());
        if let Err(e) = self.manager.write(&file) {
            tracing::warn!("Failed to write checkpoint {:?}: {}", self.manager.path(), e);
        }
    }

    /// Start the time-based ticker when the cadence is in milliseconds
    pub fn spawn_ticker(run: &Arc<RunContext>) -> std::io::Result<Option<JoinHandle<()>>> {
        let interval = match &run.checkpointer {
            Some(cp) if cp.unit == CheckpointUnit::Millis => Duration::from_millis(cp.frequency),
            _ => return Ok(None),
        };

        let run = run.clone();
        std::thread::Builder::new()
            .name("cpe-checkpoint".to_string())
            .spawn(move || {
                tracing::debug!("Checkpoint ticker started ({:?})", interval);
                let ticker = tick(interval);
                loop {
                    let fired = select! {
                        recv(ticker) -> _ => true,
                        recv(run.shutdown.receiver()) -> _ => false,
                    };
                    if !fired {
                        break;
                    }
                    if run.control.is_paused() {
                        continue;
                    }
                    if let Some(cp) = &run.checkpointer {
                        let _guard = cp.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
                        if run.shutdown.is_cancelled() {
                            break;
                        }
                        cp.write_locked(&run);
                    }
                }
                tracing::debug!("Checkpoint ticker exiting");
            })
            .map(Some)
    }
}
