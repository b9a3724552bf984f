//! Test data builders for creating test objects

use cpe_rs::config::{CheckpointSettings, CpeDescription, Deployment};
use cpe_rs::{ErrorAction, RestartAction, StageSettings};
use std::path::Path;
use std::time::Duration;

/// Builder for engine descriptions
pub struct DescriptionBuilder {
    description: CpeDescription,
}

impl DescriptionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            description: CpeDescription {
                name: name.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn threads(mut self, count: usize) -> Self {
        self.description.processing_unit_thread_count = count;
        self
    }

    pub fn single_threaded(mut self) -> Self {
        self.description.deployment = Deployment::SingleThreaded;
        self
    }

    pub fn queues(mut self, input: usize, output: usize) -> Self {
        self.description.input_queue_size = input;
        self.description.output_queue_size = output;
        self
    }

    pub fn num_to_process(mut self, count: u64) -> Self {
        self.description.num_to_process = Some(count);
        self
    }

    pub fn starting_entity_id(mut self, id: &str) -> Self {
        self.description.starting_entity_id = Some(id.to_string());
        self
    }

    pub fn drop_entity_on_fault(mut self) -> Self {
        self.description.drop_entity_on_fault = true;
        self
    }

    pub fn checkpoint_every(mut self, file: &Path, entities: u64) -> Self {
        self.description.checkpoint = Some(CheckpointSettings::new(file).every_entities(entities));
        self
    }

    pub fn checkpoint_settings(mut self, settings: CheckpointSettings) -> Self {
        self.description.checkpoint = Some(settings);
        self
    }

    pub fn stage(mut self, stage: StageSettings) -> Self {
        self.description.stages.push(stage);
        self
    }

    pub fn build(self) -> CpeDescription {
        self.description
    }
}

/// Builder for stage settings
pub struct StageBuilder {
    settings: StageSettings,
}

impl StageBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            settings: StageSettings::new(name),
        }
    }

    pub fn errors(mut self, max: u32, sample: u32, action: ErrorAction) -> Self {
        self.settings = self.settings.with_error_policy(max, sample, action);
        self
    }

    pub fn restarts(mut self, max: u32, action: RestartAction) -> Self {
        self.settings = self.settings.with_restart_policy(max, action);
        self
    }

    pub fn batch_size(mut self, size: u32) -> Self {
        self.settings = self.settings.with_batch_size(size);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings = self.settings.with_timeout(timeout);
        self
    }

    pub fn build(self) -> StageSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_builder() {
        let description = DescriptionBuilder::new("demo")
            .threads(4)
            .queues(2, 3)
            .num_to_process(20)
            .stage(StageBuilder::new("a").errors(5, 15, ErrorAction::Disable).build())
            .build();

        assert_eq!(description.name, "demo");
        assert_eq!(description.processing_unit_thread_count, 4);
        assert_eq!(description.input_queue_size, 2);
        assert_eq!(description.num_to_process, Some(20));
        assert_eq!(description.stages[0].error_policy.action, ErrorAction::Disable);
    }
}
