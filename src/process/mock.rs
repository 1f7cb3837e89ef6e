//! Simulated Component Processes
//!
//! Provides simulated process supervisors for tests and the demo binary, so a full
//! control tree can be exercised without any DAQ software running.
//! All timing uses `tokio::time`, so tests may run with a paused clock.
//!
//! # Available Mocks
//!
//! - `SimulatedProcess` - one component following the FSM rules with a transition delay
//! - `SimulatedBinder` - binds every leaf of a tree to a `SimulatedProcess`
//!
//! # Behaviour
//!
//! - An accepted action moves the process to the state the rules declare for it
//!   after a delay (default 50ms, configurable per action)
//! - A newer action supersedes a pending transition
//! - Stalled actions are accepted but never complete
//! - Crashes and health changes are injected explicitly

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::config::bundle::NodeDescription;
use crate::config::fsm::FsmRules;
use crate::error::{AppResult, ProcessError};
use crate::process::{ProcessBinder, ProcessHandle, ProcessReply};
use crate::state::{ComponentState, ModuleHealth};

const DEFAULT_DELAY: Duration = Duration::from_millis(50);

// =============================================================================
// SimulatedProcess - one component
// =============================================================================

/// Simulated component process with realistic transition timing
///
/// # Example
///
/// ```rust,ignore
/// let process = SimulatedProcess::new("eb01", rules)
///     .with_action_delay("add", Duration::from_secs(2));
/// process.execute("add", &[]).await?;   // reports "booted" ~2s later
/// ```
pub struct SimulatedProcess {
    name: String,
    rules: Arc<FsmRules>,
    state: Arc<RwLock<ComponentState>>,
    generation: Arc<AtomicU64>,
    default_delay: Duration,
    delays: HashMap<String, Duration>,
    stalled: HashSet<String>,
    crashed: AtomicBool,
    unreachable: AtomicBool,
    health: RwLock<ModuleHealth>,
    log_dir: String,
    history: Mutex<Vec<String>>,
}

impl SimulatedProcess {
    /// Create a process in the rules' baseline state
    pub fn new(name: impl Into<String>, rules: Arc<FsmRules>) -> Self {
        let baseline = rules.baseline().clone();
        Self {
            name: name.into(),
            rules,
            state: Arc::new(RwLock::new(baseline)),
            generation: Arc::new(AtomicU64::new(0)),
            default_delay: DEFAULT_DELAY,
            delays: HashMap::new(),
            stalled: HashSet::new(),
            crashed: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            health: RwLock::new(ModuleHealth::Ok),
            log_dir: "/var/log/daq".to_string(),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Delay applied to actions without a specific delay
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Delay for one action
    pub fn with_action_delay(mut self, action: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(action.into(), delay);
        self
    }

    /// Accept `action` but never complete it
    pub fn with_stalled_action(mut self, action: impl Into<String>) -> Self {
        self.stalled.insert(action.into());
        self
    }

    /// Directory reported as the log location on `add`
    pub fn with_log_dir(mut self, dir: impl Into<String>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Component name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Force the reported state
    pub fn set_state(&self, state: impl Into<ComponentState>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.write() = state.into();
    }

    /// Mark the process as crashed
    pub fn crash(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    /// Clear the crashed flag
    pub fn recover(&self) {
        self.crashed.store(false, Ordering::SeqCst);
    }

    /// Set the health status register
    pub fn set_health(&self, health: ModuleHealth) {
        *self.health.write() = health;
    }

    /// Make the supervisor unreachable (or reachable again)
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Actions received so far, in order
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    fn resolve_target(&self, current: &ComponentState, action: &str) -> Option<ComponentState> {
        // Forced actions arrive in states that do not declare them; fall back to
        // the first state that does.
        self.rules
            .target(current, action)
            .or_else(|| {
                self.rules
                    .states()
                    .iter()
                    .find_map(|s| self.rules.target(s, action))
            })
            .cloned()
    }
}

#[async_trait]
impl ProcessHandle for SimulatedProcess {
    async fn raw_state(&self) -> Result<ComponentState, ProcessError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ProcessError::Unreachable(self.name.clone()));
        }
        Ok(self.state.read().clone())
    }

    async fn execute(&self, action: &str, _args: &[String]) -> Result<ProcessReply, ProcessError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ProcessError::Unreachable(self.name.clone()));
        }
        self.history.lock().push(action.to_string());

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.state.read().clone();
        let detail = if action == "add" {
            format!("{}/{}.log", self.log_dir, self.name)
        } else {
            format!("{action} accepted")
        };

        if self.stalled.contains(action) {
            debug!(process = %self.name, action, "Simulated action stalled");
            return Ok(ProcessReply::accepted(detail));
        }
        let Some(target) = self.resolve_target(&current, action) else {
            return Ok(ProcessReply::accepted(detail));
        };

        let delay = self.delays.get(action).copied().unwrap_or(self.default_delay);
        let state = Arc::clone(&self.state);
        let latest = Arc::clone(&self.generation);
        let name = self.name.clone();
        trace!(process = %name, action, %target, ?delay, "Simulated transition scheduled");
        tokio::spawn(async move {
            sleep(delay).await;
            // A newer action supersedes this transition
            if latest.load(Ordering::SeqCst) == generation {
                *state.write() = target.clone();
                trace!(process = %name, %target, "Simulated transition complete");
            }
        });

        Ok(ProcessReply::accepted(detail))
    }

    async fn health(&self) -> ModuleHealth {
        *self.health.read()
    }

    async fn crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// SimulatedBinder - binds leaves to simulated processes
// =============================================================================

/// Binds every leaf to a [`SimulatedProcess`]
///
/// Processes outlive tree rebuilds: binding the same leaf name again returns the
/// existing process, as a real supervisor keeps its components across a reload.
pub struct SimulatedBinder {
    default_delay: Duration,
    delays: HashMap<String, Duration>,
    stalled: Vec<(Option<String>, String)>,
    processes: Mutex<HashMap<String, Arc<SimulatedProcess>>>,
}

impl SimulatedBinder {
    /// Create a binder with the default 50ms transition delay
    pub fn new() -> Self {
        Self {
            default_delay: DEFAULT_DELAY,
            delays: HashMap::new(),
            stalled: Vec::new(),
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Delay for actions without a specific delay
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Delay for one action on every process
    pub fn with_action_delay(mut self, action: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(action.into(), delay);
        self
    }

    /// Stall `action` on every process
    pub fn with_stalled_action(mut self, action: impl Into<String>) -> Self {
        self.stalled.push((None, action.into()));
        self
    }

    /// Stall `action` on the process bound to `node` only
    pub fn with_stalled_node_action(
        mut self,
        node: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.stalled.push((Some(node.into()), action.into()));
        self
    }

    /// Process bound to leaf `name`, if any
    pub fn process(&self, name: &str) -> Option<Arc<SimulatedProcess>> {
        self.processes.lock().get(name).cloned()
    }

    fn create(&self, node: &NodeDescription, component: Option<&Value>, rules: &Arc<FsmRules>) -> SimulatedProcess {
        let mut process = SimulatedProcess::new(node.name.clone(), Arc::clone(rules))
            .with_default_delay(self.default_delay);
        for (action, delay) in &self.delays {
            process = process.with_action_delay(action.clone(), *delay);
        }
        for (target, action) in &self.stalled {
            if target.as_deref().map_or(true, |t| t == node.name) {
                process = process.with_stalled_action(action.clone());
            }
        }
        if let Some(dir) = component
            .and_then(|c| c.get("log_dir"))
            .and_then(Value::as_str)
        {
            process = process.with_log_dir(dir);
        }
        process
    }
}

impl Default for SimulatedBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessBinder for SimulatedBinder {
    fn bind(
        &self,
        node: &NodeDescription,
        component: Option<&Value>,
        rules: &Arc<FsmRules>,
    ) -> AppResult<Arc<dyn ProcessHandle>> {
        let mut processes = self.processes.lock();
        let process = processes
            .entry(node.name.clone())
            .or_insert_with(|| Arc::new(self.create(node, component, rules)));
        Ok(Arc::clone(process) as Arc<dyn ProcessHandle>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Arc<FsmRules> {
        Arc::new(
            FsmRules::from_json_str(
                r#"{ "fsm": {
                    "not_added": { "add": "booted" },
                    "booted": { "configure": "ready", "remove": "not_added" },
                    "ready": { "start": "running" },
                    "running": { "stop": "ready" }
                } }"#,
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transition_completes_after_delay() {
        let process = SimulatedProcess::new("eb01", rules())
            .with_action_delay("add", Duration::from_secs(2));

        let reply = process.execute("add", &[]).await.unwrap();
        assert!(reply.ok);
        assert_eq!(reply.detail, "/var/log/daq/eb01.log");
        assert_eq!(process.raw_state().await.unwrap(), "not_added");

        sleep(Duration::from_millis(1900)).await;
        assert_eq!(process.raw_state().await.unwrap(), "not_added");
        sleep(Duration::from_millis(200)).await;
        assert_eq!(process.raw_state().await.unwrap(), "booted");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_action_never_completes() {
        let process = SimulatedProcess::new("fw01", rules()).with_stalled_action("add");
        process.execute("add", &[]).await.unwrap();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(process.raw_state().await.unwrap(), "not_added");
        assert_eq!(process.history(), vec!["add".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_action_uses_declared_target() {
        let process = SimulatedProcess::new("fw01", rules());
        process.set_state("running");
        // remove is only declared from booted
        process.execute("remove", &[]).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(process.raw_state().await.unwrap(), "not_added");
    }

    #[tokio::test]
    async fn unreachable_process_reports_error() {
        let process = SimulatedProcess::new("fw01", rules());
        process.set_unreachable(true);
        assert!(matches!(
            process.raw_state().await,
            Err(ProcessError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn binder_reuses_processes_by_name() {
        let binder = SimulatedBinder::new().with_stalled_node_action("fw01", "start");
        let rules = rules();
        binder.bind(&NodeDescription::leaf("fw01"), None, &rules).unwrap();
        binder.bind(&NodeDescription::leaf("eb01"), None, &rules).unwrap();
        binder.bind(&NodeDescription::leaf("fw01"), None, &rules).unwrap();

        let fw = binder.process("fw01").unwrap();
        fw.crash();
        assert!(fw.crashed().await);
        assert!(fw.stalled.contains("start"));
        assert!(!binder.process("eb01").unwrap().stalled.contains("start"));
    }
}
