//! Processing stage abstraction.
//!
//! A stage is described once ([`StageDescriptor`]: settings, factory,
//! optional selection filter) and instantiated once per worker thread, so
//! implementations only need to be `Send`. The restart supervisor replaces a
//! worker's instance by calling the factory again.

use crate::config::StageSettings;
use crate::engine::error::StageFault;
use crate::types::{Entity, Progress};
use std::fmt;
use std::sync::Arc;

/// Context passed to [`ProcessingStage::initialize`].
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Configured stage name.
    pub stage_name: String,
    /// Index of the worker thread that owns this instance.
    pub worker_index: usize,
    /// Number of times this stage has been restarted in the current run.
    pub restart_count: u32,
    /// The stage's configured settings.
    pub settings: StageSettings,
}

/// A pluggable processing step applied to every matching entity in order.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessingStage: Send {
    /// Called once per instance before any entity is routed to it.
    fn initialize(&mut self, _ctx: &StageContext) -> Result<(), StageFault> {
        Ok(())
    }

    /// Process one entity in place.
    fn process_entity(&mut self, entity: &mut Entity) -> Result<(), StageFault>;

    /// Called every `batch_size` entities processed by this stage.
    fn batch_process_complete(&mut self) -> Result<(), StageFault> {
        Ok(())
    }

    /// Called at the normal end of a run.
    fn collection_process_complete(&mut self) -> Result<(), StageFault> {
        Ok(())
    }

    fn progress(&self) -> Vec<Progress> {
        Vec::new()
    }

    /// Release resources. Called when the instance is retired.
    fn close(&mut self) {}
}

/// Creates a fresh stage instance.
pub type StageFactory = Arc<dyn Fn() -> Box<dyn ProcessingStage> + Send + Sync>;

/// Decides whether an entity is routed to a stage.
pub type SelectionFilter = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

/// Everything the engine needs to run one configured stage.
#[derive(Clone)]
pub struct StageDescriptor {
    pub settings: StageSettings,
    pub factory: StageFactory,
    pub filter: Option<SelectionFilter>,
}

impl StageDescriptor {
    pub fn new(settings: StageSettings, factory: StageFactory) -> Self {
        Self {
            settings,
            factory,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: SelectionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Whether `entity` passes this stage's selection filter
    pub fn accepts(&self, entity: &Entity) -> bool {
        self.filter.as_ref().map_or(true, |f| f(entity))
    }

    /// Create and initialize a new instance for `worker_index`.
    pub fn instantiate(
        &self,
        worker_index: usize,
        restart_count: u32,
    ) -> Result<Box<dyn ProcessingStage>, StageFault> {
        let mut stage = (self.factory)();
        let ctx = StageContext {
            stage_name: self.settings.name.clone(),
            worker_index,
            restart_count,
            settings: self.settings.clone(),
        };
        stage.initialize(&ctx)?;
        Ok(stage)
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("settings", &self.settings)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Wrap a closure as a [`StageFactory`].
pub fn stage_factory<F, S>(make: F) -> StageFactory
where
    F: Fn() -> S + Send + Sync + 'static,
    S: ProcessingStage + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn ProcessingStage>)
}

/// Wrap a predicate as a [`SelectionFilter`].
pub fn selection_filter<F>(predicate: F) -> SelectionFilter
where
    F: Fn(&Entity) -> bool + Send + Sync + 'static,
{
    Arc::new(predicate)
}
