//! Per-stage settings
//!
//! Each configured stage carries a name, batching and timeout settings, and
//! two independent policies:
//!
//! - [`ErrorPolicy`] - sliding-window fault threshold and the action taken
//!   once the window holds more than `max_error_count` faults
//! - [`RestartPolicy`] - how many times an unusable stage may be re-created
//!   and what happens after that
//!
//! # Defaults
//!
//! | Setting                 | Default     |
//! |-------------------------|-------------|
//! | `batch_size`            | 1           |
//! | `timeout_ms`            | 100000      |
//! | `max_error_count`       | 100         |
//! | `max_error_sample_size` | 1000        |
//! | error action            | `Terminate` |
//! | `max_restart_count`     | 30          |
//! | restart action          | `Terminate` |

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of faults tolerated inside the error window
pub const DEFAULT_MAX_ERROR_COUNT: u32 = 100;

/// Default size of the error window, in stage outcomes
pub const DEFAULT_MAX_ERROR_SAMPLE_SIZE: u32 = 1000;

/// Default number of restarts allowed per stage per run
pub const DEFAULT_MAX_RESTART_COUNT: u32 = 30;

/// Default stage call timeout in milliseconds
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 100_000;

/// Action taken once a stage's error window exceeds its threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ErrorAction {
    /// Keep routing entities to the stage
    Continue,
    /// End the whole run as aborted
    #[default]
    Terminate,
    /// Skip the stage for the rest of the run
    Disable,
}

/// Action taken once a stage has been restarted too many times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RestartAction {
    /// Keep the run going without the stage
    Continue,
    /// End the whole run as aborted
    #[default]
    Terminate,
}

/// Sliding-window error threshold for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPolicy {
    /// Faults tolerated in the window; one more triggers `action`
    pub max_error_count: u32,
    /// Number of most recent outcomes kept in the window
    pub max_error_sample_size: u32,
    pub action: ErrorAction,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            max_error_count: DEFAULT_MAX_ERROR_COUNT,
            max_error_sample_size: DEFAULT_MAX_ERROR_SAMPLE_SIZE,
            action: ErrorAction::default(),
        }
    }
}

/// Restart budget for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub max_restart_count: u32,
    pub action: RestartAction,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restart_count: DEFAULT_MAX_RESTART_COUNT,
            action: RestartAction::default(),
        }
    }
}

/// Settings for one configured stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Unique stage name
    pub name: String,
    /// Entities between `batch_process_complete` calls
    pub batch_size: u32,
    /// Stage call timeout in milliseconds; 0 disables the check
    pub timeout_ms: u64,
    pub error_policy: ErrorPolicy,
    pub restart_policy: RestartPolicy,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            batch_size: 1,
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            error_policy: ErrorPolicy::default(),
            restart_policy: RestartPolicy::default(),
        }
    }
}

impl StageSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_error_policy(
        mut self,
        max_error_count: u32,
        max_error_sample_size: u32,
        action: ErrorAction,
    ) -> Self {
        self.error_policy = ErrorPolicy {
            max_error_count,
            max_error_sample_size,
            action,
        };
        self
    }

    pub fn with_restart_policy(mut self, max_restart_count: u32, action: RestartAction) -> Self {
        self.restart_policy = RestartPolicy {
            max_restart_count,
            action,
        };
        self
    }

    /// Stage call timeout, or `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}
