//! Core data types for the collection processing engine
//!
//! This module contains the unit of work that flows through a run and the
//! progress records reported by sources and stages.
//!
//! # Main Types
//!
//! - [`Entity`] - One unit of work with a stable id, a key, and an opaque payload
//! - [`Progress`] - A completed/total pair in a named unit (entities, bytes, files)
//!
//! # Payloads
//!
//! The engine never inspects an entity's payload. Sources and stages agree on
//! a concrete payload type and use [`Entity::payload`] / [`Entity::payload_mut`]
//! to downcast it.

use crate::engine::id::EntityId;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// One unit of work flowing through the pipeline
pub struct Entity {
    id: EntityId,
    key: String,
    payload: Box<dyn Any + Send>,
}

impl Entity {
    /// Create a new entity; its id is assigned when the engine dispatches it
    pub fn new<P: Any + Send>(key: impl Into<String>, payload: P) -> Self {
        Self {
            id: EntityId::UNASSIGNED,
            key: key.into(),
            payload: Box::new(payload),
        }
    }

    /// Dispatch id within the current run
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Source-defined key (document URI, row number, file name)
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Borrow the payload as `P`, if it is one
    pub fn payload<P: Any>(&self) -> Option<&P> {
        self.payload.downcast_ref::<P>()
    }

    /// Mutably borrow the payload as `P`, if it is one
    pub fn payload_mut<P: Any>(&mut self) -> Option<&mut P> {
        self.payload.downcast_mut::<P>()
    }

    /// Replace the payload, possibly with a different type
    pub fn set_payload<P: Any + Send>(&mut self, payload: P) {
        self.payload = Box::new(payload);
    }

    pub(crate) fn assign_id(&mut self, id: EntityId) {
        self.id = id;
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Progress in a named unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Unit name, e.g. "entities" or "bytes"
    pub unit: String,
    /// Amount completed so far
    pub completed: u64,
    /// Total amount, when known up front
    pub total: Option<u64>,
}

impl Progress {
    pub fn new(unit: impl Into<String>, completed: u64, total: Option<u64>) -> Self {
        Self {
            unit: unit.into(),
            completed,
            total,
        }
    }

    /// Completed fraction in `0.0..=1.0`, when the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.completed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_payload_downcast() {
        let mut entity = Entity::new("doc-1", String::from("hello"));
        assert_eq!(entity.key(), "doc-1");
        assert!(!entity.id().is_assigned());
        assert_eq!(entity.payload::<String>().map(String::as_str), Some("hello"));
        assert!(entity.payload::<u32>().is_none());

        if let Some(text) = entity.payload_mut::<String>() {
            text.push_str(" world");
        }
        assert_eq!(
            entity.payload::<String>().map(String::as_str),
            Some("hello world")
        );
    }

    #[test]
    fn test_entity_set_payload_changes_type() {
        let mut entity = Entity::new("doc-2", 5u32);
        entity.set_payload(vec![1u8, 2, 3]);
        assert!(entity.payload::<u32>().is_none());
        assert_eq!(entity.payload::<Vec<u8>>().map(Vec::len), Some(3));
    }

    #[test]
    fn test_entity_debug_omits_payload() {
        let mut entity = Entity::new("k", 1u8);
        entity.assign_id(EntityId(3));
        let text = format!("{:?}", entity);
        assert!(text.contains("EntityId(3)"));
        assert!(text.contains("\"k\""));
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(Progress::new("entities", 5, Some(10)).fraction(), Some(0.5));
        assert_eq!(Progress::new("entities", 0, Some(0)).fraction(), Some(1.0));
        assert_eq!(Progress::new("bytes", 12, None).fraction(), None);
        assert_eq!(Progress::new("entities", 20, Some(10)).fraction(), Some(1.0));
    }
}
