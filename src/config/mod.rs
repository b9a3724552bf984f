//! Engine configuration
//!
//! A [`CpeDescription`] describes one collection processing run:
//! - Worker pool size and deployment mode
//! - Input/output queue capacities
//! - Entity cap (`num_to_process`) and starting entity id
//! - Checkpoint file, cadence, and allowed resume-position types
//! - The ordered list of stages with their error and restart policies
//!
//! Stage *implementations* are not part of the description; they are wired
//! by name through [`crate::engine::EngineBuilder`].
//!
//! # Files
//!
//! Descriptions load from TOML by default, or JSON when the file extension
//! is `.json`.
//!
//! # Example
//!
//! ```ignore
//! use cpe_rs::config::CpeDescription;
//!
//! let description = CpeDescription::load("pipeline.toml")?;
//! description.validate()?;
//! description.save("pipeline.json")?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{CpeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default capacity of the queue between the source and the workers
pub const DEFAULT_INPUT_QUEUE_SIZE: usize = 5;

/// Default capacity of the queue between the workers and the dispatcher
pub const DEFAULT_OUTPUT_QUEUE_SIZE: usize = 5;

/// Default number of worker threads
pub const DEFAULT_THREAD_COUNT: usize = 1;

/// Default time-based checkpoint cadence in milliseconds
pub const DEFAULT_CHECKPOINT_FREQUENCY_MS: u64 = 1000;

/// How stage instances are deployed across workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Deployment {
    /// `processing_unit_thread_count` workers, one stage instance each
    #[default]
    Immediate,
    /// A single worker regardless of the configured thread count
    SingleThreaded,
}

/// Unit of the checkpoint cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CheckpointUnit {
    /// Every `frequency` completed entities
    Entities,
    /// Every `frequency` milliseconds
    #[default]
    Millis,
}

/// Checkpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Checkpoint file path
    pub file: PathBuf,
    /// Cadence, in `unit`
    pub frequency: u64,
    pub unit: CheckpointUnit,
    /// Resume-position type names accepted when loading a checkpoint
    pub allowed_types: Vec<String>,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            file: PathBuf::from("cpe.checkpoint.json"),
            frequency: DEFAULT_CHECKPOINT_FREQUENCY_MS,
            unit: CheckpointUnit::default(),
            allowed_types: Vec::new(),
        }
    }
}

impl CheckpointSettings {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            ..Default::default()
        }
    }

    pub fn every_entities(mut self, count: u64) -> Self {
        self.unit = CheckpointUnit::Entities;
        self.frequency = count;
        self
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.unit = CheckpointUnit::Millis;
        self.frequency = interval.as_millis() as u64;
        self
    }
}

/// Description of a collection processing run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpeDescription {
    /// Name used in logs and reports
    pub name: String,
    pub processing_unit_thread_count: usize,
    pub input_queue_size: usize,
    pub output_queue_size: usize,
    /// Stop pulling from the source after this many entities
    pub num_to_process: Option<u64>,
    /// Passed to the source at initialization
    pub starting_entity_id: Option<String>,
    pub deployment: Deployment,
    /// End an entity's traversal at its first fault
    pub drop_entity_on_fault: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointSettings>,
    pub stages: Vec<StageSettings>,
}

impl Default for CpeDescription {
    fn default() -> Self {
        Self {
            name: "cpe".to_string(),
            processing_unit_thread_count: DEFAULT_THREAD_COUNT,
            input_queue_size: DEFAULT_INPUT_QUEUE_SIZE,
            output_queue_size: DEFAULT_OUTPUT_QUEUE_SIZE,
            num_to_process: None,
            starting_entity_id: None,
            deployment: Deployment::default(),
            drop_entity_on_fault: false,
            checkpoint: None,
            stages: Vec::new(),
        }
    }
}

impl CpeDescription {
    /// Load a description from TOML, or JSON for `.json` files
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CpeError::Config(format!("Failed to read description {:?}: {}", path, e))
        })?;

        if is_json(path) {
            serde_json::from_str(&content).map_err(|e| {
                CpeError::Config(format!("Failed to parse description {:?}: {}", path, e))
            })
        } else {
            toml::from_str(&content).map_err(|e| {
                CpeError::Config(format!("Failed to parse description {:?}: {}", path, e))
            })
        }
    }

    /// Save the description as TOML, or JSON for `.json` files
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self).map_err(|e| {
                CpeError::Serialization(format!("Failed to serialize description: {}", e))
            })?
        } else {
            toml::to_string_pretty(self).map_err(|e| {
                CpeError::Serialization(format!("Failed to serialize description: {}", e))
            })?
        };

        std::fs::write(path, content).map_err(|e| {
            CpeError::Config(format!("Failed to write description {:?}: {}", path, e))
        })
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.processing_unit_thread_count == 0 {
            return Err(CpeError::Config(
                "processing_unit_thread_count must be at least 1".to_string(),
            ));
        }
        if self.input_queue_size == 0 || self.output_queue_size == 0 {
            return Err(CpeError::Config(
                "queue sizes must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(CpeError::Config("stage name must not be empty".to_string()));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(CpeError::Config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.batch_size == 0 {
                return Err(CpeError::Config(format!(
                    "stage '{}': batch_size must be at least 1",
                    stage.name
                )));
            }
            if stage.error_policy.max_error_sample_size == 0 {
                return Err(CpeError::Config(format!(
                    "stage '{}': max_error_sample_size must be at least 1",
                    stage.name
                )));
            }
        }

        if let Some(checkpoint) = &self.checkpoint {
            if checkpoint.frequency == 0 {
                return Err(CpeError::Config(
                    "checkpoint frequency must be at least 1".to_string(),
                ));
            }
            if checkpoint.file.as_os_str().is_empty() {
                return Err(CpeError::Config("checkpoint file must be set".to_string()));
            }
        }

        Ok(())
    }

    /// Number of worker threads actually started
    pub fn effective_thread_count(&self) -> usize {
        match self.deployment {
            Deployment::Immediate => self.processing_unit_thread_count.max(1),
            Deployment::SingleThreaded => 1,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageSettings> {
        self.stages.iter().find(|s| s.name == name)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}
