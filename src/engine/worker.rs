//! Worker thread: runs the stage chain over entities from the input queue.
//!
//! # Architecture
//!
//! Each worker owns one instance of every stage. For each entity it visits
//! the stages in configured order, skipping disabled stages and stages whose
//! selection filter rejects the entity, and consults the stage's error
//! policy and restart supervisor on every fault:
//!
//! - **Recoverable / Timeout**: recorded; the error window decides whether
//!   to proceed, disable the stage, or terminate the run.
//! - **StageUnusable**: as above, plus a restart request. Within budget the
//!   worker swaps in a freshly initialized instance. A replacement whose
//!   `initialize` fails consumes the restart and the budget's exhaustion
//!   action (disable or terminate) applies at once, since the old instance
//!   is unusable.
//! - **Fatal** (or a panic, including one in a replacement's `initialize`):
//!   the entity is withheld, its status is delivered, and the run is killed.

use crate::engine::dispatcher::Completion;
use crate::engine::error::{fault_from_panic, FaultKind, StageFault};
use crate::engine::policy::PolicyDecision;
use crate::engine::queue::{QueueConsumer, QueueProducer};
use crate::engine::restart::RestartDecision;
use crate::engine::run::{RunContext, StageRuntime};
use crate::engine::stage::ProcessingStage;
use crate::engine::status::EntityProcessStatus;
use crate::types::Entity;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// How an entity's traversal ended.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Deliver,
    Terminate(String),
    Fatal(String),
}

pub(crate) struct Worker {
    index: usize,
    run: Arc<RunContext>,
    input: QueueConsumer<Entity>,
    output: QueueProducer<Completion>,
    instances: Vec<Box<dyn ProcessingStage>>,
}

impl Worker {
    pub fn new(
        index: usize,
        run: Arc<RunContext>,
        input: QueueConsumer<Entity>,
        output: QueueProducer<Completion>,
        instances: Vec<Box<dyn ProcessingStage>>,
    ) -> Self {
        Self {
            index,
            run,
            input,
            output,
            instances,
        }
    }

    pub fn run(mut self) {
        tracing::info!("Worker {} started", self.index);
        let mut processed = 0u64;

        while let Some(mut entity) = self.input.take() {
            if self.run.is_aborting() {
                // Keep draining so a feeder blocked on a full queue can exit.
                self.run.counters.add_discarded(1);
                continue;
            }

            let (status, verdict) = self.process(&mut entity);
            processed += 1;

            match verdict {
                Verdict::Deliver => {
                    if self.output.put(Completion::new(Some(entity), status)).is_err() {
                        self.run.counters.add_discarded(1);
                    }
                }
                Verdict::Terminate(reason) => {
                    self.put_must_deliver(Completion::must_deliver(Some(entity), status));
                    self.run.abort(&reason);
                }
                Verdict::Fatal(reason) => {
                    drop(entity);
                    self.put_must_deliver(Completion::must_deliver(None, status));
                    self.run.abort(&reason);
                }
            }
        }

        self.finish();
        tracing::info!(
            "Worker {} exiting ({} entities processed)",
            self.index,
            processed
        );
    }

    /// Queue a terminating status; it can only be lost if the output queue
    /// is already cancelled, in which case it is counted as discarded.
    fn put_must_deliver(&self, completion: Completion) {
        if self.output.put(completion).is_err() {
            tracing::warn!("Worker {} lost a terminating status", self.index);
            self.run.counters.add_discarded(1);
        }
    }

    fn process(&mut self, entity: &mut Entity) -> (EntityProcessStatus, Verdict) {
        let run = self.run.clone();
        let mut status = EntityProcessStatus::new(entity.id(), entity.key());
        let last = run.stages.len().saturating_sub(1);

        for (idx, runtime) in run.stages.iter().enumerate() {
            if runtime.is_disabled() {
                runtime.stats.record_skipped();
                continue;
            }
            if !runtime.descriptor.accepts(entity) {
                runtime.stats.record_filtered();
                continue;
            }

            let result = self.call_stage(idx, runtime, entity, &mut status);
            if runtime.tick_batch() {
                self.batch_complete(idx, runtime);
            }

            let Err(fault) = result else {
                runtime.record_success();
                continue;
            };

            run.counters.faults.fetch_add(1, Ordering::Relaxed);
            status.record_fault(fault.record(runtime.name()));

            if !fault.kind().is_policy_governed() {
                return self.fatal(runtime, entity, status, &fault);
            }

            tracing::warn!(
                "Stage '{}' fault on {} ({}): {}",
                runtime.name(),
                entity.id(),
                entity.key(),
                fault
            );

            let mut decision = runtime.record_fault();
            if fault.kind() == FaultKind::StageUnusable {
                match self.restart(idx, runtime) {
                    Ok(restart) => decision = decision.escalate(restart),
                    Err(panic) => {
                        status.record_fault(panic.record(runtime.name()));
                        return self.fatal(runtime, entity, status, &panic);
                    }
                }
            }

            match decision {
                PolicyDecision::Proceed => {}
                PolicyDecision::Disable => {
                    runtime.disable("error threshold or restart budget exceeded");
                }
                PolicyDecision::Terminate => {
                    if idx < last {
                        status.mark_skipped();
                    }
                    return (
                        status,
                        Verdict::Terminate(format!(
                            "stage '{}' exceeded its error policy",
                            runtime.name()
                        )),
                    );
                }
            }

            if run.drop_entity_on_fault {
                if idx < last {
                    status.mark_skipped();
                }
                break;
            }
        }

        (status, Verdict::Deliver)
    }

    fn fatal(
        &self,
        runtime: &StageRuntime,
        entity: &Entity,
        mut status: EntityProcessStatus,
        fault: &StageFault,
    ) -> (EntityProcessStatus, Verdict) {
        tracing::error!(
            "Fatal fault in stage '{}' on {}: {}",
            runtime.name(),
            entity.id(),
            fault
        );
        status.mark_skipped();
        let reason = format!(
            "fatal fault in stage '{}': {}",
            runtime.name(),
            fault.message()
        );
        (status, Verdict::Fatal(reason))
    }

    /// Invoke one stage, converting panics and overruns into faults
    fn call_stage(
        &mut self,
        idx: usize,
        runtime: &StageRuntime,
        entity: &mut Entity,
        status: &mut EntityProcessStatus,
    ) -> Result<(), StageFault> {
        let stage = &mut self.instances[idx];
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| stage.process_entity(entity)))
            .unwrap_or_else(|panic| Err(fault_from_panic(panic)));
        let elapsed = started.elapsed();

        let result = match (result, runtime.descriptor.settings.timeout()) {
            (Ok(()), Some(limit)) if elapsed > limit => Err(StageFault::timeout(format!(
                "call took {:?}, limit is {:?}",
                elapsed, limit
            ))),
            (result, _) => result,
        };

        status.record_call(runtime.name(), elapsed);
        runtime.stats.record_call(elapsed, result.is_err());
        result
    }

    fn batch_complete(&mut self, idx: usize, runtime: &StageRuntime) {
        let stage = &mut self.instances[idx];
        match catch_unwind(AssertUnwindSafe(|| stage.batch_process_complete())) {
            Ok(Ok(())) => {}
            Ok(Err(fault)) => tracing::warn!(
                "Stage '{}' batch_process_complete failed: {}",
                runtime.name(),
                fault
            ),
            Err(_) => tracing::error!(
                "Stage '{}' panicked in batch_process_complete",
                runtime.name()
            ),
        }
    }

    /// Handle a restart request for stage `idx`.
    ///
    /// Returns `Err` with a fatal fault when the replacement panics while
    /// initializing.
    fn restart(
        &mut self,
        idx: usize,
        runtime: &StageRuntime,
    ) -> Result<PolicyDecision, StageFault> {
        let count = match runtime.restarts.request_restart() {
            RestartDecision::Restart(count) => count,
            RestartDecision::Disable => return Ok(PolicyDecision::Disable),
            RestartDecision::Terminate => return Ok(PolicyDecision::Terminate),
        };
        runtime.stats.record_restart();

        let worker_index = self.index;
        let created = catch_unwind(AssertUnwindSafe(|| {
            runtime.descriptor.instantiate(worker_index, count)
        }))
        .map_err(fault_from_panic)?;

        match created {
            Ok(fresh) => {
                let mut old = std::mem::replace(&mut self.instances[idx], fresh);
                if catch_unwind(AssertUnwindSafe(|| old.close())).is_err() {
                    tracing::error!("Stage '{}' panicked in close", runtime.name());
                }
                tracing::info!(
                    "Worker {} restarted stage '{}' (restart {})",
                    self.index,
                    runtime.name(),
                    count
                );
                Ok(PolicyDecision::Proceed)
            }
            Err(fault) => {
                tracing::warn!(
                    "Worker {} failed to re-initialize stage '{}': {}",
                    self.index,
                    runtime.name(),
                    fault
                );
                Ok(match runtime.restarts.exhausted() {
                    RestartDecision::Terminate => PolicyDecision::Terminate,
                    _ => PolicyDecision::Disable,
                })
            }
        }
    }

    /// End-of-run hooks on every owned instance
    fn finish(&mut self) {
        let completed_normally = !self.run.is_aborting();
        for (stage, runtime) in self.instances.iter_mut().zip(self.run.stages.iter()) {
            if completed_normally && !runtime.is_disabled() {
                match catch_unwind(AssertUnwindSafe(|| stage.collection_process_complete())) {
                    Ok(Ok(())) => {}
                    Ok(Err(fault)) => tracing::warn!(
                        "Stage '{}' collection_process_complete failed: {}",
                        runtime.name(),
                        fault
                    ),
                    Err(_) => tracing::error!(
                        "Stage '{}' panicked in collection_process_complete",
                        runtime.name()
                    ),
                }
            }
            if catch_unwind(AssertUnwindSafe(|| stage.close())).is_err() {
                tracing::error!("Stage '{}' panicked in close", runtime.name());
            }
        }
    }
}
