//! Dispatcher thread: drains the output queue into listener callbacks.
//!
//! This is the only thread that invokes listener callbacks after
//! initialization, and the only thread that ends a run. Once the output
//! queue closes (every worker and the feeder have exited) or the run is
//! killed, it:
//!
//! 1. Delivers any must-deliver completion still queued and counts the rest
//!    as discarded, along with anything left in the input queue.
//! 2. Writes a final checkpoint (aborted) or deletes it (completed).
//! 3. Closes the source and records the run summary.
//! 4. Fires exactly one of `collection_process_complete` / `aborted`.
//! 5. Moves the engine to `Finished` / `Aborted`.

use crate::engine::queue::QueueConsumer;
use crate::engine::report::{RunOutcome, RunSummary};
use crate::engine::run::{RunContext, RunEvent};
use crate::engine::state::{EngineState, Lifecycle};
use crate::engine::status::{EntityProcessStatus, ListenerRegistry};
use crate::types::Entity;
use chrono::Utc;
use crossbeam_channel::select;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

/// One finished entity on its way to the listeners.
pub(crate) struct Completion {
    pub entity: Option<Entity>,
    pub status: EntityProcessStatus,
    /// Delivered even when the run is killed before it is dispatched.
    pub must_deliver: bool,
}

impl Completion {
    pub fn new(entity: Option<Entity>, status: EntityProcessStatus) -> Self {
        Self {
            entity,
            status,
            must_deliver: false,
        }
    }

    pub fn must_deliver(entity: Option<Entity>, status: EntityProcessStatus) -> Self {
        Self {
            entity,
            status,
            must_deliver: true,
        }
    }
}

enum Step {
    Deliver(Completion),
    Event(RunEvent),
    Closed,
    Killed,
}

pub(crate) struct Dispatcher {
    run: Arc<RunContext>,
    lifecycle: Arc<Lifecycle>,
    listeners: Arc<ListenerRegistry>,
    output: QueueConsumer<Completion>,
    input: QueueConsumer<Entity>,
    summary: Arc<Mutex<Option<RunSummary>>>,
    since_batch: u64,
}

impl Dispatcher {
    pub fn new(
        run: Arc<RunContext>,
        lifecycle: Arc<Lifecycle>,
        listeners: Arc<ListenerRegistry>,
        output: QueueConsumer<Completion>,
        input: QueueConsumer<Entity>,
        summary: Arc<Mutex<Option<RunSummary>>>,
    ) -> Self {
        Self {
            run,
            lifecycle,
            listeners,
            output,
            input,
            summary,
            since_batch: 0,
        }
    }

    pub fn run(mut self) {
        tracing::info!("Dispatcher thread started");

        loop {
            let step = select! {
                recv(self.output.receiver()) -> msg => match msg {
                    Ok(completion) => Step::Deliver(completion),
                    Err(_) => Step::Closed,
                },
                recv(self.run.events()) -> event => match event {
                    Ok(event) => Step::Event(event),
                    Err(_) => Step::Closed,
                },
                recv(self.run.cancel.receiver()) -> _ => Step::Killed,
            };

            match step {
                Step::Deliver(completion) => self.deliver(completion),
                Step::Event(event) => self.handle_event(event),
                Step::Closed => {
                    self.drain_events();
                    break;
                }
                Step::Killed => {
                    self.drain_after_kill();
                    break;
                }
            }
        }

        let leftover = self.input.drain().len() as u64;
        if leftover > 0 {
            tracing::debug!("{} undispatched entities discarded", leftover);
        }
        self.run.counters.add_discarded(leftover);
        self.finish();
    }

    /// Receive until every producer is gone, delivering only must-deliver items
    fn drain_after_kill(&mut self) {
        let mut discarded = 0u64;
        let receiver = self.output.receiver().clone();
        for completion in receiver.iter() {
            if completion.must_deliver {
                self.deliver(completion);
            } else {
                discarded += 1;
            }
        }
        if discarded > 0 {
            tracing::debug!("{} completed entities discarded by kill", discarded);
        }
        self.run.counters.add_discarded(discarded);
    }

    /// Handle pause/resume requests that raced with the end of the run
    fn drain_events(&mut self) {
        let events = self.run.events().clone();
        for event in events.try_iter() {
            self.handle_event(event);
        }
    }

    fn deliver(&mut self, completion: Completion) {
        let Completion { entity, status, .. } = completion;
        let counted = status.entity_id().is_assigned();
        let completed = if counted {
            self.run.counters.completed.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.run.counters.completed.load(Ordering::Relaxed)
        };

        self.listeners.notify("entity_process_complete", |l| {
            l.entity_process_complete(entity.as_ref(), &status)
        });
        drop(entity);

        if !counted {
            return;
        }

        self.since_batch += 1;
        if self.since_batch >= self.run.listener_batch_size() {
            self.since_batch = 0;
            self.listeners
                .notify("batch_process_complete", |l| l.batch_process_complete());
        }

        if let Some(checkpointer) = &self.run.checkpointer {
            checkpointer.on_completed(&self.run, completed);
        }
    }

    fn handle_event(&mut self, event: RunEvent) {
        match event {
            RunEvent::Paused => {
                if let Some(checkpointer) = &self.run.checkpointer {
                    checkpointer.take(&self.run);
                }
                tracing::info!("Run '{}' paused", self.run.name);
                self.listeners.notify("paused", |l| l.paused());
            }
            RunEvent::Resumed => {
                tracing::info!("Run '{}' resumed", self.run.name);
                self.listeners.notify("resumed", |l| l.resumed());
            }
        }
    }

    fn finish(self) {
        let aborted = self.run.is_aborting();
        self.run.shutdown.cancel();

        if let Some(checkpointer) = &self.run.checkpointer {
            if aborted {
                checkpointer.take(&self.run);
            } else {
                checkpointer.discard();
            }
        }

        self.run.lock_source().close();

        let report = self.run.report();
        let summary = RunSummary {
            outcome: if aborted {
                RunOutcome::Aborted
            } else {
                RunOutcome::Completed
            },
            abort_reason: self.run.abort_reason(),
            started_at: self.run.started_at,
            finished_at: Utc::now(),
            report,
        };
        tracing::info!(
            "Run '{}' {:?}: {} dispatched, {} completed, {} discarded, {} faults",
            self.run.name,
            summary.outcome,
            summary.report.entities_dispatched,
            summary.report.entities_completed,
            summary.report.entities_discarded,
            summary.report.faults
        );
        *self.summary.lock().unwrap_or_else(PoisonError::into_inner) = Some(summary);

        let terminal = if aborted {
            self.listeners.notify("aborted", |l| l.aborted());
            EngineState::Aborted
        } else {
            self.listeners.notify("collection_process_complete", |l| {
                l.collection_process_complete()
            });
            EngineState::Finished
        };

        if let Err(e) = self.lifecycle.transition(terminal) {
            tracing::error!("Failed to record end of run: {}", e);
        }
        tracing::info!("Dispatcher thread exiting");
    }
}
