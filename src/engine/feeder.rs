//! Feeder thread: pulls entities from the source into the input queue.
//!
//! The feeder is the only thread that calls `has_next`/`get_next`. It
//! assigns dispatch ids, enforces `num_to_process`, and blocks while the run
//! is paused. Dropping its queue producer on exit is what signals end of
//! stream to the workers. A panic in the source is a fatal source fault, so
//! the run aborts instead of ending as if the source were exhausted.

use crate::engine::dispatcher::Completion;
use crate::engine::error::{fault_from_panic, FaultKind};
use crate::engine::id::EntityId;
use crate::engine::queue::QueueProducer;
use crate::engine::run::RunContext;
use crate::engine::state::{EngineState, Lifecycle};
use crate::engine::status::EntityProcessStatus;
use crate::engine::StageFault;
use crate::types::Entity;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Stage name under which source faults are reported.
pub const SOURCE_STAGE_NAME: &str = "<source>";

pub(crate) struct Feeder {
    run: Arc<RunContext>,
    lifecycle: Arc<Lifecycle>,
    input: QueueProducer<Entity>,
    output: QueueProducer<Completion>,
}

impl Feeder {
    pub fn new(
        run: Arc<RunContext>,
        lifecycle: Arc<Lifecycle>,
        input: QueueProducer<Entity>,
        output: QueueProducer<Completion>,
    ) -> Self {
        Self {
            run,
            lifecycle,
            input,
            output,
        }
    }

    pub fn run(self) {
        tracing::info!("Feeder thread started");
        let mut next_id = EntityId(0);

        loop {
            if !self.run.control.wait_while_paused() {
                tracing::debug!("Feeder stopping on request");
                break;
            }

            if let Some(max) = self.run.num_to_process {
                if next_id.0 >= max {
                    tracing::info!("Dispatched {} entities; num_to_process reached", max);
                    break;
                }
            }

            let next = {
                let mut source = self.run.lock_source();
                catch_unwind(AssertUnwindSafe(|| {
                    if source.has_next() {
                        Some(source.get_next())
                    } else {
                        None
                    }
                }))
                .unwrap_or_else(|panic| Some(Err(fault_from_panic(panic))))
            };

            match next {
                None => {
                    tracing::debug!("Source exhausted");
                    break;
                }
                Some(Ok(mut entity)) => {
                    entity.assign_id(next_id);
                    next_id = next_id.next();
                    self.run.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    if self.input.put(entity).is_err() {
                        self.run.counters.add_discarded(1);
                        break;
                    }
                }
                Some(Err(fault)) => {
                    if !self.report_source_fault(fault) {
                        break;
                    }
                }
            }
        }

        if !self.run.is_aborting() {
            self.lifecycle
                .transition_from(EngineState::Running, EngineState::Finishing);
        }
        tracing::info!(
            "Feeder thread exiting ({} entities dispatched)",
            next_id.0
        );
    }

    /// Report a `get_next` fault. Returns whether feeding should continue.
    fn report_source_fault(&self, fault: StageFault) -> bool {
        self.run.counters.faults.fetch_add(1, Ordering::Relaxed);
        let mut status = EntityProcessStatus::new(EntityId::UNASSIGNED, "");
        status.record_fault(fault.record(SOURCE_STAGE_NAME));
        status.mark_skipped();

        if fault.kind() == FaultKind::Fatal {
            tracing::error!("Fatal source fault: {}", fault);
            let _ = self.output.put(Completion::must_deliver(None, status));
            self.run.abort(&format!("fatal source fault: {}", fault.message()));
            return false;
        }

        tracing::warn!("Source fault: {}", fault);
        if self.output.put(Completion::new(None, status)).is_err() {
            return false;
        }
        true
    }
}
