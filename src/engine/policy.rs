//! Per-stage sliding-window error policy.
//!
//! Every stage call outcome, success or fault, is pushed into a window of
//! the last `max_error_sample_size` outcomes. When the number of faults in
//! the window exceeds `max_error_count`, the stage's configured
//! [`ErrorAction`] applies.

use crate::config::{ErrorAction, ErrorPolicy};
use std::collections::VecDeque;

/// What the worker should do after recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Below threshold, or over threshold with `Continue`.
    Proceed,
    /// Skip this stage for the rest of the run.
    Disable,
    /// End the run as aborted.
    Terminate,
}

impl PolicyDecision {
    /// The stronger of two decisions
    pub fn escalate(self, other: PolicyDecision) -> PolicyDecision {
        use PolicyDecision::*;
        match (self, other) {
            (Terminate, _) | (_, Terminate) => Terminate,
            (Disable, _) | (_, Disable) => Disable,
            _ => Proceed,
        }
    }
}

/// Fixed-capacity window of recent stage outcomes.
#[derive(Debug, Clone)]
pub struct ErrorWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
    faults: usize,
}

impl ErrorWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            outcomes: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            faults: 0,
        }
    }

    /// Push one outcome (`true` = fault), evicting the oldest when full
    pub fn push(&mut self, fault: bool) {
        if self.outcomes.len() == self.capacity {
            if let Some(true) = self.outcomes.pop_front() {
                self.faults -= 1;
            }
        }
        self.outcomes.push_back(fault);
        if fault {
            self.faults += 1;
        }
    }

    pub fn faults(&self) -> usize {
        self.faults
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.outcomes.clear();
        self.faults = 0;
    }
}

/// Error window plus the policy that judges it.
#[derive(Debug, Clone)]
pub struct StageErrorPolicy {
    policy: ErrorPolicy,
    window: ErrorWindow,
}

impl StageErrorPolicy {
    pub fn new(policy: ErrorPolicy) -> Self {
        Self {
            window: ErrorWindow::new(policy.max_error_sample_size as usize),
            policy,
        }
    }

    pub fn record_success(&mut self) {
        self.window.push(false);
    }

    /// Record a fault and decide what happens next
    pub fn record_fault(&mut self) -> PolicyDecision {
        self.window.push(true);
        if self.window.faults() <= self.policy.max_error_count as usize {
            return PolicyDecision::Proceed;
        }
        match self.policy.action {
            ErrorAction::Continue => PolicyDecision::Proceed,
            ErrorAction::Disable => PolicyDecision::Disable,
            ErrorAction::Terminate => PolicyDecision::Terminate,
        }
    }

    pub fn faults_in_window(&self) -> usize {
        self.window.faults()
    }

    pub fn window(&self) -> &ErrorWindow {
        &self.window
    }

    pub fn policy(&self) -> &ErrorPolicy {
        &self.policy
    }
}
