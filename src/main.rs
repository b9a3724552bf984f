//! CPE-RS demo runner
//!
//! Runs a description file against a synthetic source of numbered
//! entities, binding every described stage to a checksum stage. Useful for
//! trying out queue sizes, thread counts, and policies.
//!
//! ```text
//! cpe-rs <description.toml|json> [entity-count]
//! ```

use anyhow::Context;
use cpe_rs::checkpoint::{ResumePosition, SynchPoint};
use cpe_rs::engine::stage_factory;
use cpe_rs::{
    CpeDescription, EngineBuilder, Entity, EntityProcessStatus, EntitySource, ProcessingStage,
    Progress, StageFault, StatusCallbackListener,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const DEFAULT_COUNT: u64 = 10_000;

#[derive(Serialize, Deserialize)]
struct Position {
    next: u64,
}

impl ResumePosition for Position {
    const TYPE_NAME: &'static str = "cpe-rs.demo.Position";
}

struct SyntheticSource {
    next: u64,
    total: u64,
}

impl EntitySource for SyntheticSource {
    fn has_next(&mut self) -> bool {
        self.next < self.total
    }

    fn get_next(&mut self) -> Result<Entity, StageFault> {
        let n = self.next;
        self.next += 1;
        Ok(Entity::new(format!("synthetic-{}", n), n))
    }

    fn progress(&self) -> Vec<Progress> {
        vec![Progress::new("entities read", self.next, Some(self.total))]
    }

    fn synch_point(&self) -> Option<SynchPoint> {
        SynchPoint::new(&Position { next: self.next }).ok()
    }

    fn restore(&mut self, point: &SynchPoint) -> Result<(), StageFault> {
        let position: Position = point
            .decode()
            .map_err(|e| StageFault::from_error(cpe_rs::FaultKind::StageUnusable, e))?;
        self.next = position.next;
        Ok(())
    }

    fn compatibility_key(&self) -> String {
        format!("synthetic:{}", self.total)
    }
}

#[derive(Default)]
struct Checksum(u64);

impl ProcessingStage for Checksum {
    fn process_entity(&mut self, entity: &mut Entity) -> Result<(), StageFault> {
        let value = entity
            .payload::<u64>()
            .copied()
            .ok_or_else(|| StageFault::recoverable("payload is not a number"))?;
        self.0 = self.0.wrapping_mul(31).wrapping_add(value);
        Ok(())
    }
}

#[derive(Default)]
struct Reporter {
    failed: AtomicU64,
}

impl StatusCallbackListener for Reporter {
    fn entity_process_complete(&self, _entity: Option<&Entity>, status: &EntityProcessStatus) {
        if status.is_failed() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn collection_process_complete(&self) {
        tracing::info!("Collection complete");
    }

    fn aborted(&self) {
        tracing::warn!("Collection aborted");
    }
}

fn main() -> anyhow::Result<()> {
    cpe_rs::logging::init();

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .context("usage: cpe-rs <description.toml|json> [entity-count]")?;
    let count = match args.next() {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid entity count '{}'", raw))?,
        None => DEFAULT_COUNT,
    };

    let description = CpeDescription::load(&path)?;
    tracing::info!("Starting run '{}' over {} entities", description.name, count);

    let names: Vec<String> = description.stages.iter().map(|s| s.name.clone()).collect();
    let reporter = Arc::new(Reporter::default());
    let builder = names.into_iter().fold(
        EngineBuilder::new(description)
            .source(SyntheticSource {
                next: 0,
                total: count,
            })
            .allow_synch_point::<Position>()
            .listener(reporter.clone()),
        |builder, name| builder.factory(name, stage_factory(Checksum::default)),
    );
    let engine = builder.build()?;

    engine.process()?;
    let state = engine.wait();

    let report = engine.performance_report();
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!(
        "state: {}, failed entities: {}, throughput: {:.0}/s",
        state,
        reporter.failed.load(Ordering::Relaxed),
        report.throughput()
    );
    Ok(())
}
