//! Tests for state aggregation, inclusion and fan-out over the control tree.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use common::{rules, RecordingProcess};
use daq_runcontrol::process::mock::SimulatedBinder;
use daq_runcontrol::process::ProcessHandle;
use daq_runcontrol::state::{ComponentState, ModuleHealth};
use daq_runcontrol::tree::{ActionOutcome, Node, Tree};
use daq_runcontrol::RunControlError;

struct Fixture {
    tree: Tree,
    processes: Vec<Arc<RecordingProcess>>,
    journal: Arc<Mutex<Vec<String>>>,
}

/// Root -> [DAQ -> [eb01, fw01], trb00], built by hand around recording processes.
fn fixture(states: [&str; 3]) -> Fixture {
    let rules = rules();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let eb01 = RecordingProcess::new("eb01", states[0], Arc::clone(&journal));
    let fw01 = RecordingProcess::new("fw01", states[1], Arc::clone(&journal));
    let trb00 = RecordingProcess::new("trb00", states[2], Arc::clone(&journal));

    let leaf = |name: &str, node_type: &str, process: &Arc<RecordingProcess>| {
        Arc::new(Node::leaf(
            name,
            Some(node_type.to_string()),
            Arc::clone(process) as Arc<dyn ProcessHandle>,
            Arc::clone(&rules),
        ))
    };
    let daq = Arc::new(Node::category(
        "DAQ",
        None,
        vec![leaf("eb01", "EventBuilder", &eb01), leaf("fw01", "FileWriter", &fw01)],
        Arc::clone(&rules),
    ));
    let root = Arc::new(Node::category(
        "Root",
        None,
        vec![daq, leaf("trb00", "TrackerReceiver", &trb00)],
        Arc::clone(&rules),
    ));

    Fixture {
        tree: Tree::from_root(root).expect("valid tree"),
        processes: vec![eb01, fw01, trb00],
        journal,
    }
}

#[tokio::test]
async fn test_single_leaf_parent_mirrors_leaf() {
    let rules = rules();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let process = RecordingProcess::new("only", "booted", journal);
    let leaf = Arc::new(Node::leaf("only", None, process as Arc<dyn ProcessHandle>, Arc::clone(&rules)));
    let tree = Tree::from_root(Arc::new(Node::category("Root", None, vec![leaf], rules))).unwrap();

    tree.refresh().await;

    let root = tree.root().status();
    assert_eq!(root.state, ComponentState::new("booted"));
    assert!(!root.inconsistent);
}

#[tokio::test]
async fn test_uniform_children_are_consistent() {
    let fixture = fixture(["ready", "ready", "ready"]);
    fixture.tree.refresh().await;

    let root = fixture.tree.root().status();
    assert_eq!(root.state, "ready");
    assert!(!root.inconsistent);
    assert!(fixture.tree.check_consistency().is_ok());
}

#[tokio::test]
async fn test_diverging_children_report_later_state_inconsistent() {
    let fixture = fixture(["booted", "ready", "ready"]);
    fixture.tree.refresh().await;

    let daq = fixture.tree.find("DAQ").unwrap().status();
    assert_eq!(daq.state, "ready");
    assert!(daq.inconsistent);

    let root = fixture.tree.root().status();
    assert_eq!(root.state, "ready");
    assert!(root.inconsistent);

    match fixture.tree.check_consistency() {
        Err(RunControlError::InconsistentTreeState { node, detail }) => {
            assert_eq!(node, "Root");
            assert!(detail.contains("DAQ=ready"), "{detail}");
        }
        other => panic!("expected inconsistency, got {other:?}"),
    }
}

#[tokio::test]
async fn test_refresh_follows_leaf_changes() {
    let fixture = fixture(["ready", "ready", "ready"]);
    fixture.tree.refresh().await;
    for process in &fixture.processes {
        process.set_state("running");
    }
    fixture.tree.refresh().await;

    let root = fixture.tree.root().status();
    assert_eq!(root.state, "running");
    assert!(!root.inconsistent);
}

#[tokio::test]
async fn test_unknown_state_ranks_lowest() {
    let fixture = fixture(["exploded", "booted", "booted"]);
    fixture.tree.refresh().await;

    let daq = fixture.tree.find("DAQ").unwrap().status();
    assert_eq!(daq.state, "booted");
    assert!(daq.inconsistent);
}

#[tokio::test(start_paused = true)]
async fn test_category_auto_excluded_within_one_tick_and_reincluded() {
    let fixture = fixture(["booted", "booted", "booted"]);
    fixture.tree.start_checkers(Duration::from_millis(100));

    fixture.tree.find("eb01").unwrap().exclude();
    fixture.tree.find("fw01").unwrap().exclude();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let daq = fixture.tree.find("DAQ").unwrap();
    assert!(!daq.is_included(), "category with only excluded children is excluded");
    assert!(!daq.is_inconsistent());

    fixture.tree.find("fw01").unwrap().include();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(daq.is_included());

    fixture.tree.stop_checkers().await;
    assert!(!fixture.tree.is_monitored());
}

#[tokio::test]
async fn test_exclude_applies_to_descendants() {
    let fixture = fixture(["ready", "ready", "ready"]);
    let daq = fixture.tree.find("DAQ").unwrap();
    daq.exclude();
    assert!(!fixture.tree.find("eb01").unwrap().is_included());
    assert!(!fixture.tree.find("fw01").unwrap().is_included());
    daq.include();
    assert!(fixture.tree.find("eb01").unwrap().is_included());
}

#[tokio::test]
async fn test_rejected_action_has_no_side_effects() {
    let fixture = fixture(["not_added", "not_added", "not_added"]);
    fixture.tree.refresh().await;

    let rejected = fixture
        .tree
        .root()
        .execute_action("start", &[])
        .await
        .unwrap_err();
    assert_eq!(rejected.node, "Root");
    assert_eq!(rejected.action, "start");
    assert!(fixture.journal.lock().is_empty());
}

#[tokio::test]
async fn test_fan_out_reports_excluded_and_rejected_children() {
    let fixture = fixture(["booted", "booted", "not_added"]);
    fixture.tree.find("fw01").unwrap().exclude();
    fixture.tree.refresh().await;

    // Root is booted through DAQ; trb00 was never added and refuses configure
    let outcome = fixture
        .tree
        .root()
        .execute_action("configure", &[])
        .await
        .expect("root permits configure");

    let rejections = outcome.rejections();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].node, "trb00");
    assert_eq!(*fixture.journal.lock(), vec!["eb01:configure".to_string()]);

    let ActionOutcome::Fanout { results, .. } = outcome else {
        panic!("root fans out");
    };
    let ActionOutcome::Fanout { results: daq, .. } = &results[0] else {
        panic!("DAQ fans out");
    };
    assert!(daq.contains(&ActionOutcome::Excluded { node: "fw01".into() }));
}

#[tokio::test]
async fn test_sibling_order_runs_matching_children_first() {
    let fixture = fixture(["ready", "ready", "ready"]);
    fixture.tree.refresh().await;

    fixture
        .tree
        .root()
        .execute_action("start", &["42".to_string()])
        .await
        .unwrap();

    // "start": ["DAQ", "FileWriter"]: the DAQ branch completes before trb00 starts,
    // and within DAQ the file writer goes before the event builder.
    let journal = fixture.journal.lock().clone();
    assert_eq!(journal, vec!["fw01:start", "eb01:start", "trb00:start"]);
}

#[tokio::test]
async fn test_unreachable_leaf_keeps_previous_state() {
    let binder = SimulatedBinder::new();
    let tree = Tree::build(&common::bundle(), &binder).unwrap();

    let trb00 = binder.process("trb00").unwrap();
    trb00.set_state("booted");
    tree.refresh().await;
    trb00.set_unreachable(true);
    trb00.set_state("ready");
    tree.refresh().await;

    assert_eq!(tree.find("trb00").unwrap().state(), "booted");
}

#[tokio::test]
async fn test_crashed_and_erroring_leaves_are_reported() {
    let binder = SimulatedBinder::new();
    let tree = Tree::build(&common::bundle(), &binder).unwrap();

    binder.process("fw01").unwrap().crash();
    binder.process("trb00").unwrap().set_health(ModuleHealth::Error);
    binder.process("eb01").unwrap().set_health(ModuleHealth::Warning);
    tree.refresh().await;

    assert_eq!(tree.crashed_leaves().into_iter().collect::<Vec<_>>(), vec!["fw01"]);
    let report = tree.error_report();
    assert!(report.errors.contains("trb00"));
    assert!(report.errors.contains("Root"));
    assert!(report.warnings.contains("eb01"));
    assert!(report.warnings.contains("DAQ"));
}

#[test]
fn test_duplicate_names_are_rejected() {
    let rules = rules();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let a = Arc::new(Node::leaf(
        "same",
        None,
        RecordingProcess::new("same", "booted", Arc::clone(&journal)) as Arc<dyn ProcessHandle>,
        Arc::clone(&rules),
    ));
    let b = Arc::new(Node::leaf(
        "same",
        None,
        RecordingProcess::new("same", "booted", journal) as Arc<dyn ProcessHandle>,
        Arc::clone(&rules),
    ));
    let root = Arc::new(Node::category("Root", None, vec![a, b], rules));
    assert!(matches!(Tree::from_root(root), Err(RunControlError::Configuration(_))));
}
