//! Operator surface of the run control.
//!
//! [`RunControl`] is what an operator front-end (or the sequencer) talks to. It
//! owns the loaded deployment, forwards composite commands to the
//! [`CommandExecutor`], handles node-level commands and the interlock, and runs the
//! monitor publishing state changes.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::bundle::{list_configurations, ConfigBundle};
use crate::context::OrchestratorContext;
use crate::error::{AppResult, RunControlError};
use crate::executor::{CommandExecutor, Deployment};
use crate::interlock::InterlockRecord;
use crate::messages::{CommandReport, CommandRequest, LogLevel, RootCommand, StateEvent};
use crate::monitor::{DeploymentSlot, Monitor, MonitorHandle};
use crate::process::ProcessBinder;
use crate::run_info::RunInfo;
use crate::sequencer::SequencerControl;
use crate::state::RunState;
use crate::tree::{ActionOutcome, ErrorReport, TreeSnapshot};

/// Full picture of the system, as shown to a newly connected operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    /// Published run state.
    pub run_state: RunState,
    /// Loaded configuration name.
    pub config: Option<String>,
    /// Current or last run.
    pub run_info: RunInfo,
    /// Live interlock, if held.
    pub interlock: Option<InterlockRecord>,
    /// A composite command is in flight.
    pub in_transition: bool,
    /// Status of every node.
    pub nodes: TreeSnapshot,
    /// Leaves whose process died.
    pub crashed: BTreeSet<String>,
    /// Nodes in warning or error.
    pub errors: ErrorReport,
}

/// Run control of one deployment at a time.
pub struct RunControl {
    ctx: Arc<OrchestratorContext>,
    executor: CommandExecutor,
    binder: Arc<dyn ProcessBinder>,
    deployment: DeploymentSlot,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl RunControl {
    /// Creates a run control with no configuration loaded.
    pub fn new(ctx: Arc<OrchestratorContext>, binder: Arc<dyn ProcessBinder>) -> Self {
        Self {
            executor: CommandExecutor::new(Arc::clone(&ctx)),
            ctx,
            binder,
            deployment: Arc::new(RwLock::new(None)),
            monitor: Mutex::new(None),
        }
    }

    /// Shared orchestrator context.
    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    /// The loaded deployment, if any.
    pub fn deployment(&self) -> Option<Arc<Deployment>> {
        self.deployment.read().clone()
    }

    fn current(&self) -> AppResult<Arc<Deployment>> {
        self.deployment().ok_or(RunControlError::NoConfiguration)
    }

    /// Configurations available under the configured root.
    pub fn list_configurations(&self) -> AppResult<Vec<String>> {
        list_configurations(&self.ctx.settings().application.config_root)
    }

    /// Loads configuration `name`, replacing the current tree.
    ///
    /// Refused unless the run state is DOWN or while a command is in flight.
    pub async fn load_configuration(&self, name: &str) -> AppResult<()> {
        let _guard = self.ctx.begin_transition()?;
        self.ensure_down()?;
        self.swap_configuration(name).await?;
        Ok(())
    }

    fn ensure_down(&self) -> AppResult<()> {
        match self.ctx.run_state() {
            RunState::Down => Ok(()),
            other => Err(RunControlError::ConfigSwitchRefused(other)),
        }
    }

    /// Builds the new tree first so a broken configuration leaves the old one in
    /// place, then stops the old checkers before starting the new ones.
    async fn swap_configuration(&self, name: &str) -> AppResult<Arc<Deployment>> {
        let settings = self.ctx.settings();
        let bundle = ConfigBundle::load(&settings.application.config_root, name)?;
        let deployment = Arc::new(Deployment::build(bundle, self.binder.as_ref())?);

        let previous = self.deployment.write().take();
        if let Some(previous) = previous {
            previous.tree.stop_checkers().await;
        }
        deployment.tree.start_checkers(settings.timing.checker_interval);
        *self.deployment.write() = Some(Arc::clone(&deployment));

        self.ctx.set_config_name(name);
        self.ctx.log(
            LogLevel::Info,
            format!("Loaded configuration '{name}' ({} nodes)", deployment.tree.nodes().len()),
        );
        Ok(deployment)
    }

    /// INITIALISE, loading `config` first if it is not the current configuration.
    pub async fn initialise(&self, config: Option<&str>, request: &CommandRequest) -> AppResult<CommandReport> {
        self.ctx.interlock().authorize(&request.identity)?;
        let guard = self.ctx.begin_transition()?;
        let current = self.deployment();
        let deployment = match (config, current) {
            (Some(name), Some(current)) if current.name() == name => current,
            (Some(name), _) => {
                self.ensure_down()?;
                self.swap_configuration(name).await?
            }
            (None, Some(current)) => current,
            (None, None) => return Err(RunControlError::NoConfiguration),
        };
        self.executor
            .execute_guarded(&guard, &deployment, RootCommand::Initialise, request)
            .await
    }

    /// Runs any composite command on the loaded deployment.
    pub async fn command(&self, command: RootCommand, request: &CommandRequest) -> AppResult<CommandReport> {
        if command == RootCommand::Initialise {
            return self.initialise(None, request).await;
        }
        let deployment = self.current()?;
        self.executor.execute(&deployment, command, request).await
    }

    /// START; `request` carries run type, start comment and sequence position.
    pub async fn start(&self, request: &CommandRequest) -> AppResult<CommandReport> {
        self.command(RootCommand::Start, request).await
    }

    /// PAUSE the ongoing run.
    pub async fn pause(&self, request: &CommandRequest) -> AppResult<CommandReport> {
        self.command(RootCommand::Pause, request).await
    }

    /// RESUME a paused run.
    pub async fn resume(&self, request: &CommandRequest) -> AppResult<CommandReport> {
        self.command(RootCommand::Resume, request).await
    }

    /// STOP; `request` carries run type and end comment.
    pub async fn stop(&self, request: &CommandRequest) -> AppResult<CommandReport> {
        self.command(RootCommand::Stop, request).await
    }

    /// SHUTDOWN, forcing every component down if the graceful path fails.
    pub async fn shutdown(&self, request: &CommandRequest) -> AppResult<CommandReport> {
        self.command(RootCommand::Shutdown, request).await
    }

    /// Emergency clear.
    pub async fn ecr(&self, request: &CommandRequest) -> AppResult<CommandReport> {
        self.command(RootCommand::Ecr, request).await
    }

    /// Applies `action` to a single node: `include`, `exclude` or any primitive
    /// action the node's state permits.
    pub async fn node_command(&self, identity: &str, node: &str, action: &str) -> AppResult<ActionOutcome> {
        self.ctx.interlock().authorize(identity)?;
        if self.ctx.in_transition() {
            return Err(RunControlError::TransitionInProgress);
        }
        let deployment = self.current()?;
        let target = deployment.tree.find(node)?;

        let outcome = match action {
            "include" => {
                target.include();
                ActionOutcome::Done {
                    node: node.to_string(),
                    detail: "included".to_string(),
                }
            }
            "exclude" => {
                target.exclude();
                ActionOutcome::Done {
                    node: node.to_string(),
                    detail: "excluded".to_string(),
                }
            }
            _ => target.execute_action(action, &[]).await?,
        };
        self.ctx
            .log(LogLevel::Info, format!("{action} on {node} requested by {identity}"));
        Ok(outcome)
    }

    /// Takes (or refreshes) the interlock for `identity`.
    pub fn lock(&self, identity: &str) -> AppResult<InterlockRecord> {
        let interlock = self.ctx.interlock();
        interlock.acquire(identity, interlock.ttl())
    }

    /// Releases the interlock held by `identity`.
    pub fn unlock(&self, identity: &str) -> AppResult<()> {
        self.ctx.interlock().release(identity)
    }

    /// Current full state.
    pub fn snapshot(&self) -> SystemSnapshot {
        let deployment = self.deployment();
        SystemSnapshot {
            run_state: self.ctx.run_state(),
            config: self.ctx.config_name(),
            run_info: self.ctx.run_info(),
            interlock: self.ctx.interlock().current(),
            in_transition: self.ctx.in_transition(),
            nodes: deployment
                .as_ref()
                .map(|d| d.tree.snapshot())
                .unwrap_or_default(),
            crashed: deployment
                .as_ref()
                .map(|d| d.tree.crashed_leaves())
                .unwrap_or_default(),
            errors: deployment
                .as_ref()
                .map(|d| d.tree.error_report())
                .unwrap_or_default(),
        }
    }

    /// Subscribes to state events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.ctx.subscribe()
    }

    /// Starts the monitor loop; a no-op if it already runs.
    pub fn start_monitor(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            let interval = self.ctx.settings().timing.monitor_interval;
            let handle = Monitor::new(Arc::clone(&self.ctx)).spawn(Arc::clone(&self.deployment), interval);
            *monitor = Some(handle);
        }
    }

    /// Stops the monitor and the checkers of the loaded tree.
    pub async fn close(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        if let Some(deployment) = self.deployment() {
            deployment.tree.stop_checkers().await;
        }
    }
}

#[async_trait]
impl SequencerControl for RunControl {
    fn run_state(&self) -> RunState {
        self.ctx.run_state()
    }

    async fn initialise(&self, config: &str, identity: &str) -> AppResult<()> {
        RunControl::initialise(self, Some(config), &CommandRequest::new(identity))
            .await
            .map(|_| ())
    }

    async fn start(&self, request: CommandRequest) -> AppResult<u64> {
        let report = RunControl::start(self, &request).await?;
        report
            .run_number
            .ok_or_else(|| RunControlError::registrar("START completed without a run number"))
    }

    async fn stop(&self, request: CommandRequest) -> AppResult<()> {
        RunControl::stop(self, &request).await.map(|_| ())
    }

    async fn shutdown(&self, identity: &str) -> AppResult<()> {
        RunControl::shutdown(self, &CommandRequest::new(identity))
            .await
            .map(|_| ())
    }

    async fn event_count(&self, counter: &str) -> AppResult<u64> {
        let counts = self.ctx.statistics().event_counts().await?;
        Ok(counts.get(counter).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::process::mock::SimulatedBinder;

    #[tracing_test::traced_test]
    #[test]
    fn lock_and_unlock_are_logged_once() {
        let control = RunControl::new(
            OrchestratorContext::new(Settings::default()),
            Arc::new(SimulatedBinder::new()),
        );

        control.lock("alice").unwrap();
        control.unlock("alice").unwrap();

        logs_assert(|lines: &[&str]| {
            let taken = lines.iter().filter(|l| l.contains("Interlock taken")).count();
            let released = lines.iter().filter(|l| l.contains("Interlock released")).count();
            match (taken, released) {
                (1, 1) => Ok(()),
                counts => Err(format!("expected one line each, got {counts:?}")),
            }
        });
    }
}
