//! Tests for automated run sequences against a stand-in run control.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::{settings, FakeControl, RecordingHooks, RecordingSink};
use daq_runcontrol::sequencer::{ResumePoint, SequenceOutcome, SequencePlan, Sequencer, SequencerControl};
use daq_runcontrol::state::RunState;
use daq_runcontrol::RunControlError;

fn plan(steps: usize) -> SequencePlan {
    let steps: Vec<Value> = (1..=steps)
        .map(|i| json!({ "cfgFile": format!("cfg{i}"), "startcomment": format!("step {i}") }))
        .collect();
    SequencePlan::from_value(
        "test",
        &json!({ "runtype": "Physics", "maxRunTime": 60, "maxEvents": 1000, "steps": steps }),
    )
    .expect("valid plan")
}

struct Harness {
    control: Arc<FakeControl>,
    hooks: Arc<RecordingHooks>,
    sink: Arc<RecordingSink>,
    sequencer: Sequencer,
}

fn harness(first_run: u64) -> Harness {
    let control = Arc::new(FakeControl::new(first_run));
    let hooks = Arc::new(RecordingHooks::default());
    let sink = Arc::new(RecordingSink::default());
    let sequencer = Sequencer::new(control.clone(), hooks.clone(), sink.clone(), &settings());
    Harness {
        control,
        hooks,
        sink,
        sequencer,
    }
}

#[tokio::test(start_paused = true)]
async fn test_resume_runs_remaining_steps_with_given_sequence_number() {
    let h = harness(500);

    let summary = h
        .sequencer
        .run(&plan(5), ResumePoint::new(42, 3))
        .await
        .unwrap();

    assert_eq!(summary.sequence_number, 42);
    assert_eq!(summary.runs, vec![500, 501, 502]);
    assert_eq!(summary.outcome, SequenceOutcome::Completed);

    let starts = h.control.starts.lock();
    let positions: Vec<_> = starts.iter().filter_map(|r| r.sequence).collect();
    assert_eq!(positions.iter().map(|p| p.step).collect::<Vec<_>>(), vec![3, 4, 5]);
    assert!(positions.iter().all(|p| p.number == Some(42)));
    assert_eq!(starts[0].comment.as_deref(), Some("step 3"));
    assert_eq!(starts[0].run_type.as_deref(), Some("Physics"));

    let initialised: Vec<_> = h
        .control
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("initialise"))
        .collect();
    assert_eq!(initialised, vec!["initialise:cfg3", "initialise:cfg4", "initialise:cfg5"]);
    assert!(h.sink.contains("Starting a sequence run (test, sequence 42) with 3 steps"));
    assert!(h.sink.contains("Sequence run completed"));
}

#[tokio::test]
async fn test_refused_unless_system_is_down() {
    let h = harness(1);
    h.control.set_state(RunState::Ready);

    let err = h.sequencer.run(&plan(2), ResumePoint::start()).await.unwrap_err();

    assert!(matches!(err, RunControlError::SequenceRejected(_)));
    assert!(h.control.calls().is_empty());
    assert!(h.sink.messages().is_empty());
}

#[tokio::test]
async fn test_later_step_requires_sequence_number() {
    let h = harness(1);

    let err = h
        .sequencer
        .run(&plan(3), ResumePoint::new(0, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, RunControlError::SequenceRejected(_)));

    let err = h
        .sequencer
        .run(&plan(3), ResumePoint::new(7, 4))
        .await
        .unwrap_err();
    assert!(matches!(err, RunControlError::SequenceRejected(_)));
    assert!(h.control.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sequence_number_taken_from_first_run() {
    let h = harness(700);

    let summary = h.sequencer.run(&plan(2), ResumePoint::start()).await.unwrap();

    assert_eq!(summary.sequence_number, 700);
    assert_eq!(summary.runs, vec![700, 701]);
    let starts = h.control.starts.lock();
    assert_eq!(starts[0].sequence.and_then(|p| p.number), None);
    assert_eq!(starts[1].sequence.and_then(|p| p.number), Some(700));
    assert_eq!(h.control.run_state(), RunState::Down);
}

#[tokio::test(start_paused = true)]
async fn test_failed_shutdown_is_retried_once() {
    let h = harness(10);
    h.control.shutdown_results.lock().push_back(false);

    let summary = h.sequencer.run(&plan(1), ResumePoint::start()).await.unwrap();

    assert_eq!(summary.outcome, SequenceOutcome::Completed);
    assert_eq!(
        h.control.calls(),
        vec!["initialise:cfg1", "start:10", "stop", "shutdown", "shutdown"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_failing_twice_fails_the_sequence() {
    let h = harness(10);
    h.control
        .shutdown_results
        .lock()
        .extend([false, false]);

    let err = h.sequencer.run(&plan(2), ResumePoint::start()).await.unwrap_err();

    let RunControlError::SequenceFailed { sequence, step, reason } = err else {
        panic!("expected a sequence failure, got {err:?}");
    };
    assert_eq!((sequence, step), (10, 1));
    assert!(reason.contains("failed to shut down"), "{reason}");
}

#[tokio::test(start_paused = true)]
async fn test_failed_step_reports_resume_point_and_finalizes() {
    let h = harness(900);
    *h.control.fail_start_of_step.lock() = Some(2);
    let mut plan = plan(3);
    plan.finalize_command = Some("cleanup".to_string());

    let err = h.sequencer.run(&plan, ResumePoint::start()).await.unwrap_err();

    assert!(err.to_string().ends_with("(resume with -S 900 -s 2)"), "{err}");
    let RunControlError::SequenceFailed { reason, .. } = &err else {
        panic!("expected a sequence failure, got {err:?}");
    };
    assert!(reason.contains("failed to start run"));
    assert_eq!(*h.hooks.commands.lock(), vec!["cleanup".to_string()]);
    assert!(h.sink.contains("Sequence run failed"));

    let status = h.sequencer.status().borrow().clone();
    assert!(!status.running);
    assert_eq!(status.step, 2);
}

#[tokio::test(start_paused = true)]
async fn test_run_leaving_run_state_fails_the_step() {
    let h = harness(1);
    h.control.set_events(0);
    let control = Arc::clone(&h.control);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        control.set_state(RunState::Paused);
    });

    let err = h.sequencer.run(&plan(1), ResumePoint::start()).await.unwrap_err();

    let RunControlError::SequenceFailed { reason, .. } = err else {
        panic!("expected a sequence failure, got {err:?}");
    };
    assert!(reason.contains("PAUSED"), "{reason}");
    assert!(!h.control.calls().contains(&"stop".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_run_ends_at_time_limit() {
    let h = harness(1);
    h.control.set_events(0);

    let started = tokio::time::Instant::now();
    h.sequencer.run(&plan(1), ResumePoint::start()).await.unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(60), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(70), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_stop_request_ends_run_and_cancels_remaining_steps() {
    let h = harness(300);
    h.control.set_events(0);
    let mut plan = plan(3);
    for step in &mut plan.steps {
        step.max_run_duration = Duration::from_secs(3600);
    }
    let stop = h.sequencer.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        stop.store(true, Ordering::SeqCst);
    });

    let summary = h.sequencer.run(&plan, ResumePoint::start()).await.unwrap();

    assert_eq!(summary.runs, vec![300]);
    assert_eq!(
        summary.outcome,
        SequenceOutcome::Cancelled {
            resume: ResumePoint::new(300, 2)
        }
    );
    assert_eq!(h.control.run_state(), RunState::Down);
    assert!(h.sink.contains("Sequence run stopped before step 2"));
}

#[tokio::test(start_paused = true)]
async fn test_hooks_run_in_order() {
    let h = harness(1);
    let mut plan = plan(2);
    plan.init_command = Some("init".to_string());
    plan.finalize_command = Some("finalize".to_string());
    for (i, step) in plan.steps.iter_mut().enumerate() {
        step.pre_command = Some(format!("pre{}", i + 1));
        step.post_command = Some(format!("post{}", i + 1));
    }

    h.sequencer.run(&plan, ResumePoint::start()).await.unwrap();

    assert_eq!(
        *h.hooks.commands.lock(),
        vec!["init", "pre1", "post1", "pre2", "post2", "finalize"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failing_pre_command_fails_before_initialise() {
    let h = harness(1);
    let mut plan = plan(1);
    plan.steps[0].pre_command = Some("prepare-board".to_string());
    h.hooks.failing.lock().push("prepare-board".to_string());

    let err = h.sequencer.run(&plan, ResumePoint::start()).await.unwrap_err();

    let RunControlError::SequenceFailed { step, reason, .. } = err else {
        panic!("expected a sequence failure, got {err:?}");
    };
    assert_eq!(step, 1);
    assert!(reason.contains("pre-command failed"));
    assert!(h.control.calls().is_empty());
}
