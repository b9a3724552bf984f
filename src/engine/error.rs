//! Faults raised by sources and stages during a run.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// How the engine should treat a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// Per-entity failure; counted against the stage's error window.
    Recoverable,
    /// The stage call returned after its configured timeout.
    Timeout,
    /// The stage cannot serve further entities until it is re-created.
    StageUnusable,
    /// Ends the run immediately, bypassing every policy.
    Fatal,
}

impl FaultKind {
    /// Whether this fault goes through the stage error policy
    pub fn is_policy_governed(self) -> bool {
        !matches!(self, FaultKind::Fatal)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Recoverable => "recoverable",
            FaultKind::Timeout => "timeout",
            FaultKind::StageUnusable => "stage-unusable",
            FaultKind::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// A fault raised by a source or stage.
#[derive(Error, Debug)]
#[error("{kind} fault: {message}")]
pub struct StageFault {
    kind: FaultKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl StageFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Recoverable, message)
    }

    pub fn unusable(message: impl Into<String>) -> Self {
        Self::new(FaultKind::StageUnusable, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Fatal, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message)
    }

    /// Wrap an arbitrary error as a fault of the given kind
    pub fn from_error<E>(kind: FaultKind, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    /// Wrap an `anyhow::Error` raised by stage code
    pub fn from_anyhow(kind: FaultKind, err: anyhow::Error) -> Self {
        Self {
            kind,
            message: format!("{:#}", err),
            source: Some(err.into()),
        }
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Snapshot of this fault attributed to `stage`
    pub fn record(&self, stage: &str) -> FaultRecord {
        FaultRecord {
            stage: stage.to_string(),
            kind: self.kind,
            message: self.message.clone(),
        }
    }
}

/// A fault as it appears in an entity's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub stage: String,
    pub kind: FaultKind,
    pub message: String,
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} fault: {}", self.stage, self.kind, self.message)
    }
}

/// Turn a caught panic payload into a fatal fault
pub(crate) fn fault_from_panic(payload: Box<dyn std::any::Any + Send>) -> StageFault {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    StageFault::fatal(format!("panicked: {}", message))
}
