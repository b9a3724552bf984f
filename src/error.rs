//! Error handling for the collection processing engine
//!
//! This module defines the crate-level error type returned by the engine
//! control surface, configuration loading, and checkpoint persistence.
//! Faults raised by sources and stages while a run is in progress are
//! reported through [`crate::engine::StageFault`] instead and never surface
//! here.

use crate::checkpoint::CheckpointError;
use crate::engine::state::EngineState;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum CpeError {
    /// Errors related to description loading, saving, or validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// A source or stage failed while the engine was initializing a run
    #[error("Initialization of {component} failed: {source}")]
    Initialization {
        component: String,
        #[source]
        source: crate::engine::StageFault,
    },

    /// Errors related to checkpoint persistence and validation
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// `process()` was called while a run is still active
    #[error("Engine is already processing (state: {0})")]
    AlreadyRunning(EngineState),

    /// A control operation needs an active run
    #[error("Engine is not processing")]
    NotRunning,

    /// The requested lifecycle transition is not valid from the current state
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: EngineState, to: EngineState },

    /// A stage name did not match any configured stage
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// Errors related to thread management
    #[error("Thread error: {0}")]
    Thread(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CpeError>,
    },
}

impl CpeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CpeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &CpeError {
        match self {
            CpeError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, CpeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, CheckpointError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| CpeError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| CpeError::from(e).with_context(f()))
    }
}
