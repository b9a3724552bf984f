//! Restart supervisor for stages that report themselves unusable.
//!
//! The counter is cumulative for the whole run and shared by every worker
//! instance of the stage. It is independent of the error window: an
//! unusable-stage fault updates both.

use crate::config::{RestartAction, RestartPolicy};
use std::sync::atomic::{AtomicU32, Ordering};

/// Outcome of a restart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Re-create the instance; carries the new restart count.
    Restart(u32),
    /// Budget exhausted with `Continue`: skip the stage from now on.
    Disable,
    /// Budget exhausted with `Terminate`: end the run.
    Terminate,
}

#[derive(Debug)]
pub struct RestartSupervisor {
    policy: RestartPolicy,
    restarts: AtomicU32,
}

impl RestartSupervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            restarts: AtomicU32::new(0),
        }
    }

    /// Count one restart request and decide how to handle it
    pub fn request_restart(&self) -> RestartDecision {
        let count = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        if count <= self.policy.max_restart_count {
            return RestartDecision::Restart(count);
        }
        self.exhausted()
    }

    /// Decision once no further restart can help
    pub fn exhausted(&self) -> RestartDecision {
        match self.policy.action {
            RestartAction::Continue => RestartDecision::Disable,
            RestartAction::Terminate => RestartDecision::Terminate,
        }
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}
