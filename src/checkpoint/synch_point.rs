//! Resume positions and the type allow-list applied when loading them.
//!
//! A source describes its position with any serde type implementing
//! [`ResumePosition`]. The position is stored as a tagged JSON value
//! ([`SynchPoint`]); the tag is checked against a [`SynchPointRegistry`]
//! before anything is decoded, so a checkpoint naming a type that was never
//! registered fails closed.

use crate::checkpoint::CheckpointError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A serializable source position.
pub trait ResumePosition: Serialize + DeserializeOwned {
    /// Stable name stored alongside the serialized value.
    const TYPE_NAME: &'static str;
}

/// A tagged, serialized resume position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchPoint {
    type_name: String,
    data: serde_json::Value,
}

impl SynchPoint {
    pub fn new<T: ResumePosition>(position: &T) -> Result<Self, CheckpointError> {
        let data = serde_json::to_value(position)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        Ok(Self {
            type_name: T::TYPE_NAME.to_string(),
            data,
        })
    }

    /// Build from an already-serialized value
    pub fn from_parts(type_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            type_name: type_name.into(),
            data,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Decode into `T`, which must carry the stored type name
    pub fn decode<T: ResumePosition>(&self) -> Result<T, CheckpointError> {
        if self.type_name != T::TYPE_NAME {
            return Err(CheckpointError::TypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                found: self.type_name.clone(),
            });
        }
        T::deserialize(&self.data).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }
}

/// Allow-list of resume-position types accepted from checkpoint files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynchPointRegistry {
    allowed: BTreeSet<String>,
}

impl SynchPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow<T: ResumePosition>(mut self) -> Self {
        self.allowed.insert(T::TYPE_NAME.to_string());
        self
    }

    pub fn allow_name(&mut self, type_name: impl Into<String>) {
        self.allowed.insert(type_name.into());
    }

    pub fn is_allowed(&self, type_name: &str) -> bool {
        self.allowed.contains(type_name)
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    /// Reject a point whose type is not on the list
    pub fn check(&self, point: &SynchPoint) -> Result<(), CheckpointError> {
        if self.is_allowed(point.type_name()) {
            Ok(())
        } else {
            Err(CheckpointError::Rejected {
                type_name: point.type_name().to_string(),
            })
        }
    }
}
