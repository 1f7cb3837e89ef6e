//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use daq_runcontrol::config::bundle::{ConfigBundle, NodeDescription};
use daq_runcontrol::config::fsm::FsmRules;
use daq_runcontrol::config::Settings;
use daq_runcontrol::error::{AppResult, ProcessError, RunControlError};
use daq_runcontrol::health::NotificationSink;
use daq_runcontrol::messages::CommandRequest;
use daq_runcontrol::process::{ProcessHandle, ProcessReply};
use daq_runcontrol::registrar::{NewRunRequest, Registrar, RunEndInfo};
use daq_runcontrol::sequencer::{HookRunner, SequencerControl};
use daq_runcontrol::state::{ComponentState, RunState};

pub const RULES_JSON: &str = r#"{
    "fsm": {
        "not_added": { "add": "booted" },
        "booted": { "configure": "ready", "remove": "not_added" },
        "ready": { "start": "running", "remove": "not_added" },
        "paused": { "resume": "running", "stop": "ready", "remove": "not_added" },
        "running": { "pause": "paused", "stop": "ready", "remove": "not_added" }
    },
    "order": {
        "INITIALISE": [["add", "booted", 10], ["configure", "ready", 10]],
        "START": [["start", "running", 10]],
        "PAUSE": [["pause", "paused", 10]],
        "RESUME": [{ "action": "enableTrigger", "fallback": "resume", "state": "running", "timeout": 10 }],
        "STOP": [["stop", "ready", 10]],
        "SHUTDOWN": [["remove", "not_added", 10]]
    },
    "sibling_order": { "start": ["DAQ", "FileWriter"] }
}"#;

pub fn rules() -> Arc<FsmRules> {
    Arc::new(FsmRules::from_json_str(RULES_JSON).expect("test rules parse"))
}

/// Root -> [DAQ -> [eb01, fw01], trb00]
pub fn tree_description() -> NodeDescription {
    NodeDescription::category(
        "Root",
        vec![
            NodeDescription::category(
                "DAQ",
                vec![
                    NodeDescription::leaf("eb01").with_type("EventBuilder"),
                    NodeDescription::leaf("fw01").with_type("FileWriter"),
                ],
            ),
            NodeDescription::leaf("trb00").with_type("TrackerReceiver"),
        ],
    )
}

pub fn component_config() -> Value {
    json!({
        "configuration": {
            "group": "test",
            "components": [
                { "name": "eb01", "modules": [{ "type": "EventBuilder" }] },
                { "name": "fw01", "modules": [{ "type": "FileWriter" }] },
                { "name": "trb00", "modules": [{ "type": "TrackerReceiver" }], "settings": { "BoardID": 7 } }
            ]
        }
    })
}

pub fn bundle() -> ConfigBundle {
    let rules = FsmRules::from_json_str(RULES_JSON).expect("test rules parse");
    ConfigBundle::from_parts("test", tree_description(), rules, component_config())
}

/// Settings with fast polling and the run registrar enabled.
pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.timing.checker_interval = Duration::from_millis(100);
    settings.timing.step_poll_interval = Duration::from_millis(200);
    settings
}

/// Writes the test deployment as configuration `name` under `root`.
pub fn write_deployment(root: &std::path::Path, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("create config dir");
    std::fs::write(
        dir.join("config-dict.json"),
        r#"{"tree": "tree.json", "fsm_rules": "fsm-rules.json", "config": "config.json"}"#,
    )
    .expect("write index");
    std::fs::write(
        dir.join("tree.json"),
        serde_json::to_string(&tree_description()).expect("serialize tree"),
    )
    .expect("write tree");
    std::fs::write(dir.join("fsm-rules.json"), RULES_JSON).expect("write rules");
    std::fs::write(dir.join("config.json"), component_config().to_string()).expect("write config");
}

// =============================================================================
// Notification sink
// =============================================================================

#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|m| m.contains(needle))
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn post(&self, message: &str) -> AppResult<()> {
        self.messages.lock().push(message.to_string());
        Ok(())
    }
}

// =============================================================================
// Run registrar
// =============================================================================

pub struct FakeRegistrar {
    next: AtomicU64,
    pub fail_new_run: AtomicBool,
    pub fail_run_info: AtomicBool,
    pub new_runs: Mutex<Vec<NewRunRequest>>,
    pub run_ends: Mutex<Vec<(u64, RunEndInfo)>>,
}

impl FakeRegistrar {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
            fail_new_run: AtomicBool::new(false),
            fail_run_info: AtomicBool::new(false),
            new_runs: Mutex::new(Vec::new()),
            run_ends: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Registrar for FakeRegistrar {
    async fn new_run_number(&self, request: &NewRunRequest) -> AppResult<u64> {
        if self.fail_new_run.load(Ordering::SeqCst) {
            return Err(RunControlError::registrar("connection refused"));
        }
        self.new_runs.lock().push(request.clone());
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    async fn add_run_info(&self, run_number: u64, info: &RunEndInfo) -> AppResult<()> {
        if self.fail_run_info.load(Ordering::SeqCst) {
            return Err(RunControlError::registrar("AddRunInfo returned 500"));
        }
        self.run_ends.lock().push((run_number, info.clone()));
        Ok(())
    }
}

// =============================================================================
// Process handle
// =============================================================================

/// Process whose state is set by the test; every action goes to a shared journal.
pub struct RecordingProcess {
    name: String,
    state: Mutex<ComponentState>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl RecordingProcess {
    pub fn new(name: &str, state: &str, journal: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(ComponentState::new(state)),
            journal,
        })
    }

    pub fn set_state(&self, state: &str) {
        *self.state.lock() = ComponentState::new(state);
    }
}

#[async_trait]
impl ProcessHandle for RecordingProcess {
    async fn raw_state(&self) -> Result<ComponentState, ProcessError> {
        Ok(self.state.lock().clone())
    }

    async fn execute(&self, action: &str, _args: &[String]) -> Result<ProcessReply, ProcessError> {
        // Yield so concurrently started siblings interleave in the journal
        tokio::task::yield_now().await;
        self.journal.lock().push(format!("{}:{action}", self.name));
        Ok(ProcessReply::accepted(format!("{action} accepted")))
    }
}

// =============================================================================
// Sequencer collaborators
// =============================================================================

#[derive(Default)]
pub struct RecordingHooks {
    pub commands: Mutex<Vec<String>>,
    pub failing: Mutex<Vec<String>>,
}

#[async_trait]
impl HookRunner for RecordingHooks {
    async fn run(&self, command: &str) -> AppResult<()> {
        self.commands.lock().push(command.to_string());
        if self.failing.lock().iter().any(|c| c == command) {
            return Err(RunControlError::HookFailed {
                command: command.to_string(),
                detail: "exited with exit status: 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Run control stand-in that follows the commands it receives.
pub struct FakeControl {
    state: Mutex<RunState>,
    next_run: AtomicU64,
    events: AtomicU64,
    pub calls: Mutex<Vec<String>>,
    pub starts: Mutex<Vec<CommandRequest>>,
    /// Results of successive SHUTDOWN calls; empty means success.
    pub shutdown_results: Mutex<VecDeque<bool>>,
    pub fail_start_of_step: Mutex<Option<u32>>,
}

impl FakeControl {
    pub fn new(first_run: u64) -> Self {
        Self {
            state: Mutex::new(RunState::Down),
            next_run: AtomicU64::new(first_run),
            events: AtomicU64::new(u64::MAX),
            calls: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
            shutdown_results: Mutex::new(VecDeque::new()),
            fail_start_of_step: Mutex::new(None),
        }
    }

    pub fn set_state(&self, state: RunState) {
        *self.state.lock() = state;
    }

    pub fn set_events(&self, events: u64) {
        self.events.store(events, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SequencerControl for FakeControl {
    fn run_state(&self) -> RunState {
        *self.state.lock()
    }

    async fn initialise(&self, config: &str, _identity: &str) -> AppResult<()> {
        self.calls.lock().push(format!("initialise:{config}"));
        self.set_state(RunState::Ready);
        Ok(())
    }

    async fn start(&self, request: CommandRequest) -> AppResult<u64> {
        let step = request.sequence.map(|p| p.step);
        self.starts.lock().push(request);
        if step.is_some() && *self.fail_start_of_step.lock() == step {
            return Err(RunControlError::registrar("connection refused"));
        }
        let run = self.next_run.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(format!("start:{run}"));
        self.set_state(RunState::Run);
        Ok(run)
    }

    async fn stop(&self, _request: CommandRequest) -> AppResult<()> {
        self.calls.lock().push("stop".to_string());
        self.set_state(RunState::Ready);
        Ok(())
    }

    async fn shutdown(&self, _identity: &str) -> AppResult<()> {
        self.calls.lock().push("shutdown".to_string());
        let ok = self.shutdown_results.lock().pop_front().unwrap_or(true);
        if !ok {
            return Err(RunControlError::Configuration("shutdown timed out".to_string()));
        }
        self.set_state(RunState::Down);
        Ok(())
    }

    async fn event_count(&self, _counter: &str) -> AppResult<u64> {
        Ok(self.events.load(Ordering::SeqCst))
    }
}
