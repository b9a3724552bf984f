//! Fluent construction of a [`CollectionProcessingEngine`].
//!
//! Stage settings normally come from the [`CpeDescription`]; the builder
//! binds each named stage to the code that implements it:
//!
//! ```ignore
//! let engine = EngineBuilder::new(CpeDescription::load("cpe.toml")?)
//!     .source(LineSource::new("input.txt"))
//!     .factory("tokenizer", stage_factory(Tokenizer::default))
//!     .filter("tokenizer", selection_filter(|e| e.key().ends_with(".txt")))
//!     .listener(Arc::new(Reporter::default()))
//!     .build()?;
//! ```

use super::{
    CollectionProcessingEngine, EntitySource, SelectionFilter, StageDescriptor, StageFactory,
    StatusCallbackListener,
};
use crate::checkpoint::{ResumePosition, SynchPointRegistry};
use crate::config::{CpeDescription, StageSettings};
use crate::error::{CpeError, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub struct EngineBuilder {
    description: CpeDescription,
    source: Option<Box<dyn EntitySource>>,
    factories: HashMap<String, StageFactory>,
    filters: HashMap<String, SelectionFilter>,
    registry: SynchPointRegistry,
    listeners: Vec<Arc<dyn StatusCallbackListener>>,
}

impl EngineBuilder {
    pub fn new(description: CpeDescription) -> Self {
        Self {
            description,
            source: None,
            factories: HashMap::new(),
            filters: HashMap::new(),
            registry: SynchPointRegistry::new(),
            listeners: Vec::new(),
        }
    }

    pub fn source(mut self, source: impl EntitySource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn boxed_source(mut self, source: Box<dyn EntitySource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Append a stage to the chain along with its implementation
    pub fn stage(mut self, settings: StageSettings, factory: StageFactory) -> Self {
        self.factories.insert(settings.name.clone(), factory);
        self.description.stages.push(settings);
        self
    }

    /// Bind an implementation to a stage already named in the description
    pub fn factory(mut self, name: impl Into<String>, factory: StageFactory) -> Self {
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn filter(mut self, name: impl Into<String>, filter: SelectionFilter) -> Self {
        self.filters.insert(name.into(), filter);
        self
    }

    /// Accept checkpoints whose synch point is of type `T`
    pub fn allow_synch_point<T: ResumePosition>(mut self) -> Self {
        self.registry = self.registry.allow::<T>();
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StatusCallbackListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(mut self) -> Result<CollectionProcessingEngine> {
        self.description.validate()?;

        let source = self
            .source
            .take()
            .ok_or_else(|| CpeError::Config("no entity source configured".to_string()))?;

        for name in self.factories.keys().chain(self.filters.keys()) {
            if self.description.stage(name).is_none() {
                return Err(CpeError::UnknownStage(name.clone()));
            }
        }

        let mut stages = Vec::with_capacity(self.description.stages.len());
        for settings in &self.description.stages {
            let factory = self.factories.remove(&settings.name).ok_or_else(|| {
                CpeError::Config(format!("stage '{}' has no implementation", settings.name))
            })?;
            let mut descriptor = StageDescriptor::new(settings.clone(), factory);
            if let Some(filter) = self.filters.remove(&settings.name) {
                descriptor = descriptor.with_filter(filter);
            }
            stages.push(descriptor);
        }

        Ok(CollectionProcessingEngine::from_parts(
            self.description,
            stages,
            source,
            self.registry,
            self.listeners,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{stage_factory, ProcessingStage, StageFault};
    use crate::types::Entity;

    struct Empty;

    impl EntitySource for Empty {
        fn has_next(&mut self) -> bool {
            false
        }

        fn get_next(&mut self) -> std::result::Result<Entity, StageFault> {
            Err(StageFault::fatal("empty"))
        }

        fn compatibility_key(&self) -> String {
            "empty".to_string()
        }
    }

    struct Noop;

    impl ProcessingStage for Noop {
        fn process_entity(&mut self, _entity: &mut Entity) -> std::result::Result<(), StageFault> {
            Ok(())
        }
    }

    #[test]
    fn test_build_requires_source() {
        let result = EngineBuilder::new(CpeDescription::default()).build();
        assert!(matches!(result, Err(CpeError::Config(_))));
    }

    #[test]
    fn test_build_requires_implementation_for_every_stage() {
        let mut description = CpeDescription::default();
        description.stages.push(StageSettings::new("a"));
        let result = EngineBuilder::new(description).source(Empty).build();
        assert!(matches!(result, Err(CpeError::Config(_))));
    }

    #[test]
    fn test_build_rejects_unknown_stage_names() {
        let result = EngineBuilder::new(CpeDescription::default())
            .source(Empty)
            .factory("ghost", stage_factory(|| Noop))
            .build();
        assert!(matches!(result, Err(CpeError::UnknownStage(name)) if name == "ghost"));
    }

    #[test]
    fn test_stage_appends_to_description() {
        let engine = EngineBuilder::new(CpeDescription::default())
            .source(Empty)
            .stage(StageSettings::new("a"), stage_factory(|| Noop))
            .stage(StageSettings::new("b"), stage_factory(|| Noop))
            .build()
            .unwrap();
        let names: Vec<_> = engine
            .description()
            .stages
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, ["a", "b"]);
    }
}
