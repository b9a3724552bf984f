//! Engine lifecycle state machine.
//!
//! ```text
//! Idle ─► Initializing ─► Running ⇄ Paused
//!              │             │        │
//!              ▼             ▼        │
//!             Idle       Finishing ◄──┘
//!                            │
//!                 Finished ◄─┴─► Aborted
//! ```
//!
//! `Finished` and `Aborted` are terminal for a run; a new `process()` starts
//! again from `Initializing`. A failed initialization returns to `Idle`.

use crate::error::{CpeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Initializing,
    Running,
    Paused,
    Finishing,
    Finished,
    Aborted,
}

impl EngineState {
    /// A run is in progress (entities may still flow or callbacks are pending)
    pub fn is_active(self) -> bool {
        matches!(
            self,
            EngineState::Initializing
                | EngineState::Running
                | EngineState::Paused
                | EngineState::Finishing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Finished | EngineState::Aborted)
    }

    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Idle | Finished | Aborted, Initializing)
                | (Initializing, Running | Idle)
                | (Running, Paused | Finishing | Finished | Aborted)
                | (Paused, Running | Finishing | Finished | Aborted)
                | (Finishing, Finished | Aborted)
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared engine state with change notification.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: Mutex<EngineState>,
    changed: Condvar,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&self, next: EngineState) -> Result<EngineState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = *state;
        if !prev.can_transition_to(next) {
            return Err(CpeError::InvalidTransition {
                from: prev,
                to: next,
            });
        }
        *state = next;
        tracing::debug!("Engine state {} -> {}", prev, next);
        self.changed.notify_all();
        Ok(prev)
    }

    /// Move to `next` only if currently in `from`
    pub fn transition_from(&self, from: EngineState, next: EngineState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from || !from.can_transition_to(next) {
            return false;
        }
        *state = next;
        tracing::debug!("Engine state {} -> {}", from, next);
        self.changed.notify_all();
        true
    }

    /// Block until the state is not active
    pub fn wait_inactive(&self) -> EngineState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self
            .changed
            .wait_while(state, |s| s.is_active())
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }

    /// Block until the state is not active or `timeout` elapses
    pub fn wait_inactive_timeout(&self, timeout: Duration) -> Option<EngineState> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.is_active() {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, result) = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if result.timed_out() && state.is_active() {
                return None;
            }
        }
        Some(*state)
    }
}
