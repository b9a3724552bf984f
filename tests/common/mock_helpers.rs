//! Sources, stages, and listeners for driving the engine in tests

use cpe_rs::engine::{EngineHandle, SourceContext};
use cpe_rs::{
    Entity, EntityProcessStatus, EntitySource, FaultKind, ProcessingStage, ResumePosition,
    StageFault, StatusCallbackListener, SynchPoint,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Resume position of [`CountingSource`]: the next number to produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub next: u64,
}

impl ResumePosition for Cursor {
    const TYPE_NAME: &'static str = "test.Cursor";
}

/// Produces entities `item-0`..`item-{total-1}` carrying their number
pub struct CountingSource {
    next: u64,
    total: u64,
    key: String,
    delay: Option<Duration>,
    fault_at: Option<(u64, FaultKind)>,
    panic_at: Option<u64>,
    pub closed: Arc<AtomicUsize>,
    pub produced: Arc<AtomicUsize>,
}

impl CountingSource {
    pub fn new(total: u64) -> Self {
        Self {
            next: 0,
            total,
            key: "counting".to_string(),
            delay: None,
            fault_at: None,
            panic_at: None,
            closed: Arc::new(AtomicUsize::new(0)),
            produced: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep before producing each entity
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail `get_next` once when number `at` is reached
    pub fn with_fault_at(mut self, at: u64, kind: FaultKind) -> Self {
        self.fault_at = Some((at, kind));
        self
    }

    /// Panic in `get_next` when number `at` is reached
    pub fn with_panic_at(mut self, at: u64) -> Self {
        self.panic_at = Some(at);
        self
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }
}

impl EntitySource for CountingSource {
    fn initialize(&mut self, ctx: &SourceContext) -> Result<(), StageFault> {
        if let Some(start) = &ctx.starting_entity_id {
            let key = start.strip_prefix("item-").unwrap_or(start);
            self.next = key
                .parse()
                .map_err(|_| StageFault::unusable(format!("bad starting id '{}'", start)))?;
        }
        Ok(())
    }

    fn has_next(&mut self) -> bool {
        self.next < self.total
    }

    fn get_next(&mut self) -> Result<Entity, StageFault> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let n = self.next;
        self.next += 1;
        if self.panic_at == Some(n) {
            panic!("reader crashed at item {}", n);
        }
        if let Some((at, kind)) = self.fault_at {
            if at == n {
                return Err(StageFault::new(kind, format!("unreadable item {}", n)));
            }
        }
        self.produced.fetch_add(1, Ordering::SeqCst);
        Ok(Entity::new(format!("item-{}", n), n))
    }

    fn synch_point(&self) -> Option<SynchPoint> {
        SynchPoint::new(&Cursor { next: self.next }).ok()
    }

    fn restore(&mut self, point: &SynchPoint) -> Result<(), StageFault> {
        let cursor: Cursor = point
            .decode()
            .map_err(|e| StageFault::from_error(FaultKind::StageUnusable, e))?;
        self.next = cursor.next;
        Ok(())
    }

    fn compatibility_key(&self) -> String {
        self.key.clone()
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Does nothing to the entity
pub struct PassThrough;

impl ProcessingStage for PassThrough {
    fn process_entity(&mut self, _entity: &mut Entity) -> Result<(), StageFault> {
        Ok(())
    }
}

/// Sleeps on every entity
pub struct SlowStage(pub Duration);

impl ProcessingStage for SlowStage {
    fn process_entity(&mut self, _entity: &mut Entity) -> Result<(), StageFault> {
        std::thread::sleep(self.0);
        Ok(())
    }
}

/// Faults on every `every`-th call, counted across all instances
pub struct FaultInjectingStage {
    every: usize,
    kind: FaultKind,
    calls: Arc<AtomicUsize>,
}

impl FaultInjectingStage {
    pub fn new(every: usize, kind: FaultKind, calls: Arc<AtomicUsize>) -> Self {
        Self { every, kind, calls }
    }
}

impl ProcessingStage for FaultInjectingStage {
    fn process_entity(&mut self, entity: &mut Entity) -> Result<(), StageFault> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call % self.every == 0 {
            return Err(StageFault::new(
                self.kind,
                format!("injected fault on {}", entity.key()),
            ));
        }
        Ok(())
    }
}

/// Fails initialization
pub struct BrokenStage;

impl ProcessingStage for BrokenStage {
    fn initialize(&mut self, _ctx: &cpe_rs::engine::StageContext) -> Result<(), StageFault> {
        Err(StageFault::unusable("missing model file"))
    }

    fn process_entity(&mut self, _entity: &mut Entity) -> Result<(), StageFault> {
        Ok(())
    }
}

/// Reports itself unusable on every call; every replacement instance
/// panics while initializing
pub struct PanicsOnRestart;

impl ProcessingStage for PanicsOnRestart {
    fn initialize(&mut self, ctx: &cpe_rs::engine::StageContext) -> Result<(), StageFault> {
        if ctx.restart_count > 0 {
            panic!("could not reopen connection");
        }
        Ok(())
    }

    fn process_entity(&mut self, _entity: &mut Entity) -> Result<(), StageFault> {
        Err(StageFault::unusable("connection lost"))
    }
}

/// Panics while initializing
pub struct PanicsOnInit;

impl ProcessingStage for PanicsOnInit {
    fn initialize(&mut self, _ctx: &cpe_rs::engine::StageContext) -> Result<(), StageFault> {
        panic!("model loader crashed");
    }

    fn process_entity(&mut self, _entity: &mut Entity) -> Result<(), StageFault> {
        Ok(())
    }
}

/// One callback as seen by [`RecordingListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Initialized,
    Batch,
    Entity {
        key: String,
        delivered: bool,
        failed_stage: Option<String>,
        visited: Vec<String>,
    },
    Paused,
    Resumed,
    Completed,
    Aborted,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Completed | Event::Aborted)
    }
}

/// Records every callback in order
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn terminal_events(&self) -> Vec<Event> {
        self.events().into_iter().filter(Event::is_terminal).collect()
    }

    pub fn entities(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Entity { .. }))
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities().len()
    }

    /// Entities whose status carries a fault
    pub fn failed_count(&self) -> usize {
        self.entities()
            .iter()
            .filter(|e| matches!(e, Event::Entity { failed_stage: Some(_), .. }))
            .count()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

impl StatusCallbackListener for RecordingListener {
    fn initialization_complete(&self) {
        self.push(Event::Initialized);
    }

    fn batch_process_complete(&self) {
        self.push(Event::Batch);
    }

    fn entity_process_complete(&self, entity: Option<&Entity>, status: &EntityProcessStatus) {
        self.push(Event::Entity {
            key: status.entity_key().to_string(),
            delivered: entity.is_some(),
            failed_stage: status.failed_stage().map(str::to_string),
            visited: status.stages_visited().to_vec(),
        });
    }

    fn paused(&self) {
        self.push(Event::Paused);
    }

    fn resumed(&self) {
        self.push(Event::Resumed);
    }

    fn collection_process_complete(&self) {
        self.push(Event::Completed);
    }

    fn aborted(&self) {
        self.push(Event::Aborted);
    }
}

/// Calls `stop()` on the engine from inside a callback
pub struct StoppingListener {
    after: usize,
    seen: AtomicUsize,
    pub handle: OnceLock<EngineHandle>,
}

impl StoppingListener {
    pub fn new(after: usize) -> Arc<Self> {
        Arc::new(Self {
            after,
            seen: AtomicUsize::new(0),
            handle: OnceLock::new(),
        })
    }
}

impl StatusCallbackListener for StoppingListener {
    fn entity_process_complete(&self, _entity: Option<&Entity>, _status: &EntityProcessStatus) {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == self.after {
            if let Some(handle) = self.handle.get() {
                let _ = handle.stop();
            }
        }
    }
}
