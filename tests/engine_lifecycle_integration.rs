//! End-to-end runs exercising process/pause/resume/stop/kill

mod common;

use common::builders::{DescriptionBuilder, StageBuilder};
use common::mock_helpers::{
    BrokenStage, CountingSource, Event, PassThrough, RecordingListener, SlowStage,
    StoppingListener,
};
use cpe_rs::config::CpeDescription;
use cpe_rs::engine::{selection_filter, stage_factory, RunOutcome};
use cpe_rs::{CpeError, EngineBuilder, EngineState, Entity, StatusCallbackListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn pass_through(description: CpeDescription) -> EngineBuilder {
    let names: Vec<String> = description.stages.iter().map(|s| s.name.clone()).collect();
    names.into_iter().fold(EngineBuilder::new(description), |b, name| {
        b.factory(name, stage_factory(|| PassThrough))
    })
}

#[test]
fn test_completed_run_fires_exactly_one_terminal_callback() {
    let listener = RecordingListener::new();
    let description = DescriptionBuilder::new("complete")
        .threads(4)
        .stage(StageBuilder::new("a").build())
        .build();
    let engine = pass_through(description)
        .source(CountingSource::new(200))
        .listener(listener.clone())
        .build()
        .unwrap();

    engine.process().unwrap();
    assert_eq!(common::wait_for_end(&engine), EngineState::Finished);

    assert_eq!(listener.terminal_events(), vec![Event::Completed]);
    assert_eq!(listener.entity_count(), 200);
    assert_eq!(listener.events().first(), Some(&Event::Initialized));
    assert_eq!(listener.events().last(), Some(&Event::Completed));

    let summary = engine.last_summary().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.report.entities_dispatched, 200);
    assert_eq!(summary.report.entities_completed, 200);
    assert_eq!(summary.report.entities_discarded, 0);
}

#[test]
fn test_stages_visited_in_configured_order() {
    let listener = RecordingListener::new();
    let description = DescriptionBuilder::new("order")
        .threads(3)
        .stage(StageBuilder::new("a").build())
        .stage(StageBuilder::new("b").build())
        .stage(StageBuilder::new("c").build())
        .build();
    let engine = pass_through(description)
        .filter(
            "b",
            selection_filter(|e: &Entity| e.payload::<u64>().is_some_and(|n| n % 2 == 0)),
        )
        .source(CountingSource::new(30))
        .listener(listener.clone())
        .build()
        .unwrap();

    engine.process().unwrap();
    common::wait_for_end(&engine);

    for event in listener.entities() {
        let Event::Entity { key, visited, .. } = event else {
            unreachable!()
        };
        let n: u64 = key.trim_start_matches("item-").parse().unwrap();
        if n % 2 == 0 {
            assert_eq!(visited, ["a", "b", "c"], "{}", key);
        } else {
            assert_eq!(visited, ["a", "c"], "{}", key);
        }
    }

    let report = engine.performance_report();
    assert_eq!(report.stage("b").unwrap().processed, 15);
    assert_eq!(report.stage("b").unwrap().filtered, 15);
}

#[test]
fn test_num_to_process_caps_run() {
    let listener = RecordingListener::new();
    let description = DescriptionBuilder::new("capped")
        .num_to_process(20)
        .stage(StageBuilder::new("a").build())
        .build();
    let engine = pass_through(description)
        .source(CountingSource::new(50))
        .listener(listener.clone())
        .build()
        .unwrap();

    engine.process().unwrap();
    assert_eq!(common::wait_for_end(&engine), EngineState::Finished);
    assert_eq!(listener.entity_count(), 20);
    assert_eq!(listener.terminal_events(), vec![Event::Completed]);
}

#[test]
fn test_starting_entity_id_skips_ahead() {
    let listener = RecordingListener::new();
    let description = DescriptionBuilder::new("start")
        .starting_entity_id("item-10")
        .stage(StageBuilder::new("a").build())
        .build();
    let engine = pass_through(description)
        .source(CountingSource::new(15))
        .listener(listener.clone())
        .build()
        .unwrap();

    engine.process().unwrap();
    common::wait_for_end(&engine);

    let keys: Vec<String> = listener
        .entities()
        .into_iter()
        .filter_map(|e| match e {
            Event::Entity { key, .. } => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(keys, ["item-10", "item-11", "item-12", "item-13", "item-14"]);
}

#[test]
fn test_initialization_failure_fires_no_callbacks() {
    let listener = RecordingListener::new();
    let source = CountingSource::new(10);
    let closed = source.closed.clone();
    let description = DescriptionBuilder::new("broken")
        .stage(StageBuilder::new("model").build())
        .build();
    let engine = EngineBuilder::new(description)
        .factory("model", stage_factory(|| BrokenStage))
        .source(source)
        .listener(listener.clone())
        .build()
        .unwrap();

    let err = engine.process().unwrap_err();
    assert!(matches!(err, CpeError::Initialization { .. }), "{}", err);
    assert!(err.to_string().contains("model"));
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(!engine.is_processing());
    assert!(listener.events().is_empty());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_process_while_running_is_rejected() {
    let description = DescriptionBuilder::new("busy")
        .stage(StageBuilder::new("slow").build())
        .build();
    let engine = EngineBuilder::new(description)
        .factory("slow", stage_factory(|| SlowStage(Duration::from_millis(5))))
        .source(CountingSource::new(100))
        .build()
        .unwrap();

    engine.process().unwrap();
    assert!(engine.is_processing());
    assert!(matches!(engine.process(), Err(CpeError::AlreadyRunning(_))));
    engine.kill().unwrap();
    assert_eq!(common::wait_for_end(&engine), EngineState::Aborted);
}

#[test]
fn test_stop_ends_run_as_aborted() {
    let listener = RecordingListener::new();
    let stopper = StoppingListener::new(10);
    let description = DescriptionBuilder::new("stop")
        .threads(2)
        .stage(StageBuilder::new("a").build())
        .build();
    let engine = EngineBuilder::new(description)
        .factory("a", stage_factory(|| SlowStage(Duration::from_millis(1))))
        .source(CountingSource::new(10_000))
        .listener(stopper.clone())
        .listener(listener.clone())
        .build()
        .unwrap();
    stopper.handle.set(engine.handle()).ok();

    engine.process().unwrap();
    assert_eq!(common::wait_for_end(&engine), EngineState::Aborted);

    assert_eq!(listener.terminal_events(), vec![Event::Aborted]);
    assert!(listener.entity_count() >= 10);
    assert!(listener.entity_count() < 10_000);
    let summary = engine.last_summary().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert_eq!(summary.abort_reason.as_deref(), Some("stop requested"));
}

#[test]
fn test_kill_discards_undelivered_entities() {
    let listener = RecordingListener::new();
    let description = DescriptionBuilder::new("kill")
        .threads(2)
        .queues(8, 8)
        .stage(StageBuilder::new("a").build())
        .build();
    let engine = EngineBuilder::new(description)
        .factory("a", stage_factory(|| SlowStage(Duration::from_millis(1))))
        .source(CountingSource::new(10_000))
        .listener(listener.clone())
        .build()
        .unwrap();

    engine.process().unwrap();
    assert!(common::eventually(|| listener.entity_count() >= 20));
    engine.kill().unwrap();
    assert_eq!(common::wait_for_end(&engine), EngineState::Aborted);

    assert_eq!(listener.terminal_events(), vec![Event::Aborted]);
    let report = engine.last_summary().unwrap().report;
    assert!(report.entities_dispatched < 10_000);
    assert_eq!(
        report.entities_completed + report.entities_discarded,
        report.entities_dispatched
    );
    assert_eq!(listener.entity_count() as u64, report.entities_completed);
}

#[test]
fn test_pause_and_resume() {
    let listener = RecordingListener::new();
    let description = DescriptionBuilder::new("pause")
        .stage(StageBuilder::new("a").build())
        .build();
    let engine = pass_through(description)
        .source(CountingSource::new(300).with_delay(Duration::from_millis(2)))
        .listener(listener.clone())
        .build()
        .unwrap();

    engine.process().unwrap();
    assert!(common::eventually(|| listener.entity_count() >= 5));
    engine.pause().unwrap();
    assert_eq!(engine.state(), EngineState::Paused);
    assert!(engine.is_processing());
    assert!(common::eventually(|| listener.count(&Event::Paused) == 1));

    // In-flight entities drain, then nothing more arrives.
    std::thread::sleep(Duration::from_millis(50));
    let frozen = listener.entity_count();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(listener.entity_count(), frozen);
    assert!(matches!(engine.pause(), Err(CpeError::InvalidTransition { .. })));

    engine.resume().unwrap();
    assert_eq!(common::wait_for_end(&engine), EngineState::Finished);
    assert_eq!(listener.entity_count(), 300);
    assert_eq!(listener.count(&Event::Resumed), 1);

    let events = listener.events();
    let paused = events.iter().position(|e| *e == Event::Paused).unwrap();
    let resumed = events.iter().position(|e| *e == Event::Resumed).unwrap();
    assert!(paused < resumed);
}

#[test]
fn test_stop_while_paused() {
    let listener = RecordingListener::new();
    let description = DescriptionBuilder::new("paused-stop")
        .stage(StageBuilder::new("a").build())
        .build();
    let engine = pass_through(description)
        .source(CountingSource::new(1_000).with_delay(Duration::from_millis(1)))
        .listener(listener.clone())
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.pause().unwrap();
    engine.stop().unwrap();
    assert_eq!(common::wait_for_end(&engine), EngineState::Aborted);
    assert_eq!(listener.terminal_events(), vec![Event::Aborted]);
}

#[test]
fn test_bounded_queues_apply_backpressure() {
    struct SlowListener {
        produced: Arc<AtomicUsize>,
        seen: AtomicUsize,
        max_lead: AtomicUsize,
    }

    impl StatusCallbackListener for SlowListener {
        fn entity_process_complete(
            &self,
            _entity: Option<&Entity>,
            _status: &cpe_rs::EntityProcessStatus,
        ) {
            let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            let lead = self.produced.load(Ordering::SeqCst).saturating_sub(seen);
            self.max_lead.fetch_max(lead, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    let source = CountingSource::new(60);
    let listener = Arc::new(SlowListener {
        produced: source.produced.clone(),
        seen: AtomicUsize::new(0),
        max_lead: AtomicUsize::new(0),
    });
    let description = DescriptionBuilder::new("backpressure")
        .queues(1, 1)
        .stage(StageBuilder::new("a").build())
        .build();
    let engine = pass_through(description)
        .source(source)
        .listener(listener.clone())
        .build()
        .unwrap();

    engine.process().unwrap();
    assert_eq!(common::wait_for_end(&engine), EngineState::Finished);

    // Feeder, input queue, worker, output queue, dispatcher: one each.
    assert!(listener.max_lead.load(Ordering::SeqCst) <= 5);
}

#[test]
fn test_engine_can_run_again_after_abort() {
    let listener = RecordingListener::new();
    let description = DescriptionBuilder::new("rerun")
        .stage(StageBuilder::new("a").build())
        .build();
    let engine = pass_through(description)
        .source(CountingSource::new(1_000).with_delay(Duration::from_millis(1)))
        .listener(listener.clone())
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.stop().unwrap();
    assert_eq!(common::wait_for_end(&engine), EngineState::Aborted);

    engine.process().unwrap();
    assert_eq!(common::wait_for_end(&engine), EngineState::Finished);
    assert_eq!(listener.terminal_events(), vec![Event::Aborted, Event::Completed]);
    assert_eq!(listener.count(&Event::Initialized), 2);
}

#[test]
fn test_disable_stage_at_runtime() {
    let description = DescriptionBuilder::new("toggle")
        .stage(StageBuilder::new("a").build())
        .stage(StageBuilder::new("b").build())
        .build();
    let engine = pass_through(description)
        .source(CountingSource::new(100).with_delay(Duration::from_millis(1)))
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.disable_stage("b").unwrap();
    assert!(matches!(engine.disable_stage("zzz"), Err(CpeError::UnknownStage(_))));
    assert_eq!(common::wait_for_end(&engine), EngineState::Finished);

    let report = engine.performance_report();
    let b = report.stage("b").unwrap();
    assert!(b.disabled);
    assert!(b.skipped_disabled > 0);
    assert_eq!(report.stage("a").unwrap().processed, 100);
}

#[test]
fn test_removed_listener_hears_nothing() {
    let kept = RecordingListener::new();
    let removed = RecordingListener::new();
    let description = DescriptionBuilder::new("listeners")
        .stage(StageBuilder::new("a").build())
        .build();
    let engine = pass_through(description)
        .source(CountingSource::new(10))
        .listener(kept.clone())
        .build()
        .unwrap();

    let as_dyn: Arc<dyn StatusCallbackListener> = removed.clone();
    engine.add_status_callback_listener(as_dyn.clone());
    assert!(engine.remove_status_callback_listener(&as_dyn));

    engine.process().unwrap();
    common::wait_for_end(&engine);
    assert_eq!(kept.entity_count(), 10);
    assert!(removed.events().is_empty());
}

#[test]
fn test_listener_batch_callbacks_follow_stage_batch_size() {
    let listener = RecordingListener::new();
    let description = DescriptionBuilder::new("batches")
        .stage(StageBuilder::new("a").batch_size(10).build())
        .build();
    let engine = pass_through(description)
        .source(CountingSource::new(50))
        .listener(listener.clone())
        .build()
        .unwrap();

    engine.process().unwrap();
    common::wait_for_end(&engine);
    assert_eq!(listener.count(&Event::Batch), 5);
}
