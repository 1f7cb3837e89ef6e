//! Composite command execution.
//!
//! A composite command (INITIALISE, START, ...) is an ordered list of steps taken
//! from the FSM rules. Each step issues one primitive action on the root and then
//! waits, bounded by the step timeout, until the root reports the expected state
//! consistently. A root that rejects the action is still waited on, so a root
//! already in the expected state moves on to the next step. The first step that
//! times out aborts the command.
//!
//! # Guarantees
//!
//! - At most one composite command runs at a time (transition flag)
//! - Commands from anyone but the interlock holder are rejected
//! - The transition flag is cleared on every exit path
//! - A SHUTDOWN that cannot complete gracefully force-removes every component and
//!   reports DOWN, so the tree always returns to baseline
//! - START registers the run before any component is touched; a registrar failure
//!   leaves the system unchanged
//! - The end of a run is reported once, by the STOP or SHUTDOWN that ends it

use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::bundle::ConfigBundle;
use crate::config::fsm::StepSpec;
use crate::context::{OrchestratorContext, TransitionGuard};
use crate::error::{ActionRejected, AppResult, RunControlError, TransitionTimeout};
use crate::messages::{CommandReport, CommandRequest, LogLevel, RootCommand};
use crate::process::ProcessBinder;
use crate::registrar::{NewRunRequest, RunEndInfo, RunStats, LOCAL_RUN_NUMBER};
use crate::run_info::{truncate_comment, EventCounts, RunInfo};
use crate::state::RunState;
use crate::tree::{ActionOutcome, Node, Tree};

/// Run type used when a START request does not name one.
pub const DEFAULT_RUN_TYPE: &str = "Test";

/// End comment reported for runs ended by SHUTDOWN.
pub const SHUTDOWN_END_COMMENT: &str = "Run was shut down";

/// A loaded configuration together with its control tree.
#[derive(Debug)]
pub struct Deployment {
    /// Parsed configuration documents.
    pub bundle: ConfigBundle,
    /// Control tree built from the bundle.
    pub tree: Tree,
}

impl Deployment {
    /// Builds the control tree of `bundle`.
    pub fn build(bundle: ConfigBundle, binder: &dyn ProcessBinder) -> AppResult<Self> {
        let tree = Tree::build(&bundle, binder)?;
        Ok(Self { bundle, tree })
    }

    /// Configuration name.
    pub fn name(&self) -> &str {
        &self.bundle.name
    }
}

/// Drives composite commands over a deployment.
pub struct CommandExecutor {
    ctx: Arc<OrchestratorContext>,
}

impl CommandExecutor {
    /// Creates an executor over the shared context.
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self { ctx }
    }

    /// Executes `command` on behalf of `request.identity`.
    ///
    /// Returns exactly one verdict: the report on success, the first error
    /// otherwise.
    pub async fn execute(
        &self,
        deployment: &Deployment,
        command: RootCommand,
        request: &CommandRequest,
    ) -> AppResult<CommandReport> {
        self.ctx.interlock().authorize(&request.identity)?;
        let guard = self.ctx.begin_transition()?;
        self.execute_guarded(&guard, deployment, command, request).await
    }

    /// Executes `command` inside a transition the caller already started.
    pub(crate) async fn execute_guarded(
        &self,
        _guard: &TransitionGuard<'_>,
        deployment: &Deployment,
        command: RootCommand,
        request: &CommandRequest,
    ) -> AppResult<CommandReport> {
        let started = Instant::now();
        let steps = deployment.bundle.rules.steps(command)?.to_vec();
        self.ctx.log(
            LogLevel::Info,
            format!("{command} requested by {}", request.identity),
        );

        let mut report = CommandReport {
            command,
            log_locations: Vec::new(),
            run_number: self.ctx.run_info().run_number,
            forced_shutdown: false,
            warnings: Vec::new(),
            elapsed: std::time::Duration::ZERO,
        };

        let mut args = Vec::new();
        match command {
            RootCommand::Start => {
                let run_number = self.register_run(deployment, request).await?;
                report.run_number = Some(run_number);
                args.push(run_number.to_string());
            }
            RootCommand::Stop if self.ctx.run_info().run_ongoing => {
                self.report_run_end(request, false, &mut report).await;
            }
            RootCommand::Shutdown if self.ctx.run_info().run_ongoing => {
                self.report_run_end(request, true, &mut report).await;
            }
            _ => {}
        }

        let result = match self
            .run_steps(deployment, command, &steps, &args, &mut report)
            .await
        {
            Err(e) if command == RootCommand::Shutdown => {
                self.force_shutdown(deployment, &e).await;
                report.forced_shutdown = true;
                report.warnings.push(e.to_string());
                Ok(())
            }
            other => other,
        };
        report.elapsed = started.elapsed();

        match result {
            Ok(()) => {
                if !report.forced_shutdown {
                    self.sync_run_state(deployment);
                }
                if matches!(command, RootCommand::Stop | RootCommand::Shutdown) {
                    self.ctx.end_run();
                }
                self.ctx.log(
                    LogLevel::Info,
                    format!("{command} completed in {:.1}s", report.elapsed.as_secs_f64()),
                );
                self.announce(command, &report).await;
                Ok(report)
            }
            Err(e) => {
                self.sync_run_state(deployment);
                self.ctx.log(LogLevel::Error, format!("{command} failed: {e}"));
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        deployment: &Deployment,
        command: RootCommand,
        steps: &[StepSpec],
        args: &[String],
        report: &mut CommandReport,
    ) -> AppResult<()> {
        let root = deployment.tree.root();
        for (index, step) in steps.iter().enumerate() {
            match issue(root, step, args).await {
                Ok(outcome) => {
                    for rejected in outcome.rejections() {
                        debug!(%rejected, "Skipped by fan-out");
                    }
                    for node in outcome.failures() {
                        self.ctx
                            .log(LogLevel::Warning, format!("{node} failed to {}", step.action));
                    }
                    if step.action == "add" {
                        report.log_locations.extend(outcome.log_locations());
                    }
                }
                Err(rejected) => {
                    self.ctx
                        .log(LogLevel::Warning, format!("Action not allowed: {rejected}"));
                    report.warnings.push(rejected.to_string());
                }
            }
            self.wait_for(&deployment.tree, command, index + 1, step).await?;
        }
        Ok(())
    }

    /// Polls the root until it reports `step.expected` consistently or the step
    /// timeout elapses.
    async fn wait_for(
        &self,
        tree: &Tree,
        command: RootCommand,
        step_number: usize,
        step: &StepSpec,
    ) -> AppResult<()> {
        let poll = self.ctx.settings().timing.step_poll_interval;
        let deadline = Instant::now() + step.timeout;
        loop {
            if !tree.is_monitored() {
                tree.refresh().await;
            }
            let status = tree.root().status();
            if status.state == step.expected && !status.inconsistent {
                debug!(%command, step = step_number, state = %status.state, "Step complete");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransitionTimeout {
                    command: command.to_string(),
                    step: step_number,
                    action: step.action.clone(),
                    expected: step.expected.clone(),
                    actual: status.state,
                    inconsistent: status.inconsistent,
                    timeout: step.timeout,
                }
                .into());
            }
            sleep(poll.min(deadline - now)).await;
        }
    }

    async fn register_run(&self, deployment: &Deployment, request: &CommandRequest) -> AppResult<u64> {
        let settings = self.ctx.settings();
        let run_type = request
            .run_type
            .clone()
            .unwrap_or_else(|| DEFAULT_RUN_TYPE.to_string());
        let comment = truncate_comment(request.comment.as_deref().unwrap_or_default());

        let run_number = if settings.application.local_only {
            LOCAL_RUN_NUMBER
        } else {
            let position = request.sequence.unwrap_or_default();
            let new_run = NewRunRequest {
                version: settings.registrar.version.clone(),
                run_type: run_type.clone(),
                username: request.identity.clone(),
                start_comment: comment.clone(),
                seq_number: position.number,
                seq_step: position.step,
                seq_substep: position.substep,
                detectors: deployment.bundle.detector_list(),
                config_name: deployment.name().to_string(),
                configuration: deployment.bundle.configuration.clone(),
            };
            match self.ctx.registrar().new_run_number(&new_run).await {
                Ok(number) => number,
                Err(e) => {
                    self.ctx
                        .log(LogLevel::Error, format!("Failed to get a run number: {e}"));
                    return Err(e);
                }
            }
        };

        self.ctx.set_run_info(RunInfo {
            run_number: Some(run_number),
            run_ongoing: true,
            run_type,
            run_comment: comment,
            start_time: Some(self.ctx.clock().now()),
        });
        Ok(run_number)
    }

    /// Sends the end-of-run report. Failures become report warnings: a run must stay
    /// stoppable while the registrar is down.
    async fn report_run_end(&self, request: &CommandRequest, forced: bool, report: &mut CommandReport) {
        let info = self.ctx.run_info();
        let Some(run_number) = info.run_number else {
            return;
        };
        if self.ctx.settings().application.local_only {
            return;
        }

        let event_counts = match self.ctx.statistics().event_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "Could not read event counts for the end-of-run report");
                EventCounts::new()
            }
        };
        let end = RunEndInfo {
            end_comment: if forced {
                SHUTDOWN_END_COMMENT.to_string()
            } else {
                request.comment.clone().unwrap_or_default()
            },
            run_type: request.run_type.clone().unwrap_or(info.run_type),
            run_info: RunStats { event_counts },
        };

        if let Err(e) = self.ctx.registrar().add_run_info(run_number, &end).await {
            let message = format!("Failed to register the end of run {run_number}: {e}");
            self.ctx.log(LogLevel::Error, message.clone());
            self.ctx.notify(&message).await;
            report.warnings.push(message);
        }
    }

    async fn force_shutdown(&self, deployment: &Deployment, cause: &RunControlError) {
        self.ctx.log(
            LogLevel::Warning,
            format!("Graceful shutdown failed ({cause}), forcing remove"),
        );
        let outcome = deployment.tree.root().force_action("remove").await;
        for node in outcome.failures() {
            warn!(node = %node, "Forced remove failed");
        }
        self.ctx.set_run_state(RunState::Down);
    }

    /// Publishes the run state of the root's settled state.
    fn sync_run_state(&self, deployment: &Deployment) {
        let root = deployment.tree.root().status();
        self.ctx
            .set_run_state(deployment.bundle.rules.settled_run_state(&root.state));
    }

    async fn announce(&self, command: RootCommand, report: &CommandReport) {
        if !self.ctx.settings().notifications.announce_runs {
            return;
        }
        let Some(run_number) = report.run_number else {
            return;
        };
        let message = match command {
            RootCommand::Start => {
                let info = self.ctx.run_info();
                format!("Run {run_number} was started\nOperator: {}", info.run_comment)
            }
            RootCommand::Stop => format!("Run {run_number} was stopped"),
            RootCommand::Shutdown if report.forced_shutdown => {
                format!("Run {run_number}: system was force shut down")
            }
            _ => return,
        };
        self.ctx.notify(&message).await;
    }
}

/// Issues the step's action on the root, falling back to the step's alternative
/// action if the root rejects the first one.
async fn issue(root: &Node, step: &StepSpec, args: &[String]) -> Result<ActionOutcome, ActionRejected> {
    match (root.execute_action(&step.action, args).await, &step.fallback) {
        (Err(_), Some(fallback)) => {
            debug!(action = %step.action, %fallback, "Root rejected action, trying fallback");
            root.execute_action(fallback, args).await
        }
        (result, _) => result,
    }
}
