//! Entity source abstraction.
//!
//! The engine owns one source per run and calls it from the feeder thread
//! only; checkpointing and progress queries take the same lock.

use crate::checkpoint::SynchPoint;
use crate::engine::error::StageFault;
use crate::types::{Entity, Progress};

/// Parameters handed to [`EntitySource::initialize`].
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    /// Opaque position the source should start from, when configured.
    pub starting_entity_id: Option<String>,
    /// Whether a checkpoint will be restored right after initialization.
    pub resuming: bool,
}

/// Produces the entities of a collection.
pub trait EntitySource: Send {
    fn initialize(&mut self, _ctx: &SourceContext) -> Result<(), StageFault> {
        Ok(())
    }

    fn has_next(&mut self) -> bool;

    fn get_next(&mut self) -> Result<Entity, StageFault>;

    fn progress(&self) -> Vec<Progress> {
        Vec::new()
    }

    /// Current resume position, or `None` when the source cannot be resumed.
    fn synch_point(&self) -> Option<SynchPoint> {
        None
    }

    /// Move to a previously captured resume position.
    fn restore(&mut self, point: &SynchPoint) -> Result<(), StageFault> {
        Err(StageFault::recoverable(format!(
            "source cannot restore synch point of type '{}'",
            point.type_name()
        )))
    }

    /// Identifies which collection a checkpoint belongs to. Checkpoints
    /// written with a different key are refused.
    fn compatibility_key(&self) -> String {
        String::new()
    }

    fn close(&mut self) {}
}
