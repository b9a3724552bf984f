//! Checkpoint persistence
//!
//! A checkpoint records how far the source has got (its [`SynchPoint`]) and
//! the performance report at that moment, so an interrupted run can resume
//! instead of starting over.
//!
//! # Files
//!
//! - `<file>` - the current checkpoint, JSON
//! - `<file>.tmp` - written first, then renamed over `<file>`
//! - `<file>.prev` - a copy of the checkpoint that `<file>` replaced
//!
//! `<file>` is only ever replaced by a rename, so at every point it holds
//! either the old checkpoint or the new one.
//!
//! # Loading
//!
//! A checkpoint is only handed to the source when its resume-position type
//! is on the [`SynchPointRegistry`] and it was written for the same source
//! (matching compatibility key). Anything else fails closed.

pub mod synch_point;

pub use synch_point::{ResumePosition, SynchPoint, SynchPointRegistry};

use crate::engine::report::PerformanceReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current checkpoint file format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Errors raised while writing or loading checkpoints
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The stored resume-position type is not on the allow-list
    #[error("synch point type '{type_name}' rejected by filter")]
    Rejected { type_name: String },

    /// The checkpoint was written for a different source
    #[error("checkpoint belongs to source '{found}', expected '{expected}'")]
    Incompatible { expected: String, found: String },

    #[error("expected synch point type '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },

    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),
}

/// On-disk checkpoint contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub version: u32,
    /// Source compatibility key at the time of writing
    pub source_key: String,
    pub written_at: DateTime<Utc>,
    pub entities_completed: u64,
    pub synch_point: SynchPoint,
    pub report: PerformanceReport,
}

impl CheckpointFile {
    pub fn new(
        source_key: impl Into<String>,
        synch_point: SynchPoint,
        report: PerformanceReport,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            source_key: source_key.into(),
            written_at: Utc::now(),
            entities_completed: report.entities_completed,
            synch_point,
            report,
        }
    }
}

/// Reads, writes, and removes the checkpoint file of one run.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
    registry: SynchPointRegistry,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>, registry: SynchPointRegistry) -> Self {
        Self {
            path: path.into(),
            registry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn registry(&self) -> &SynchPointRegistry {
        &self.registry
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Path of the checkpoint replaced by the last write
    pub fn previous_path(&self) -> PathBuf {
        sibling(&self.path, ".prev")
    }

    /// Write `checkpoint`, keeping the replaced file as `<file>.prev`
    pub fn write(&self, checkpoint: &CheckpointFile) -> Result<(), CheckpointError> {
        let content = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = sibling(&self.path, ".tmp");
        std::fs::write(&tmp, content)?;
        if self.path.exists() {
            std::fs::copy(&self.path, self.previous_path())?;
        }
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(
            "Checkpoint written to {:?} ({} entities completed)",
            self.path,
            checkpoint.entities_completed
        );
        Ok(())
    }

    /// Load and validate the checkpoint, if one exists.
    ///
    /// `source_key` is the compatibility key of the source about to resume.
    pub fn load(&self, source_key: &str) -> Result<Option<CheckpointFile>, CheckpointError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)?;
        let checkpoint: CheckpointFile = serde_json::from_str(&content)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(checkpoint.version));
        }
        self.registry.check(&checkpoint.synch_point)?;
        if checkpoint.source_key != source_key {
            return Err(CheckpointError::Incompatible {
                expected: source_key.to_string(),
                found: checkpoint.source_key,
            });
        }

        tracing::info!(
            "Loaded checkpoint {:?} written at {} ({} entities completed)",
            self.path,
            checkpoint.written_at,
            checkpoint.entities_completed
        );
        Ok(Some(checkpoint))
    }

    /// Delete the checkpoint and its predecessor
    pub fn remove(&self) -> Result<(), CheckpointError> {
        for path in [self.path.clone(), self.previous_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
