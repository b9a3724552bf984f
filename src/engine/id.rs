//! Identity types for the engine.
//!
//! `EntityId` is a per-run dispatch sequence number assigned by the feeder.
//! `StageId` is a direct index into the run's stage table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dispatch sequence number of an entity within one run.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Placeholder carried by entities that have not been dispatched yet.
    pub const UNASSIGNED: EntityId = EntityId(u64::MAX);

    #[inline]
    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }

    #[inline]
    pub fn next(self) -> EntityId {
        EntityId(self.0 + 1)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UNASSIGNED {
            write!(f, "EntityId(UNASSIGNED)")
        } else {
            write!(f, "EntityId({})", self.0)
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Index into the run's stage table, in configured order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageId(pub u32);

impl StageId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StageId({})", self.0)
    }
}
