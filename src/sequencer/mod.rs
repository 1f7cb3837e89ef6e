//! Automated run sequences.
//!
//! The sequencer takes a series of runs without an operator: for every step it
//! initialises the step's configuration, starts a run, waits until the run has
//! collected enough events or lasted long enough, then stops and shuts down the
//! detector. A failed sequence reports the resume point, so it can be restarted
//! at the failed step with the same sequence number.

pub mod config;
pub mod hooks;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{AppResult, RunControlError};
use crate::error_recovery::{retry_async, RetryPolicy};
use crate::health::sink::{deliver, NotificationSink};
use crate::messages::{CommandRequest, SequencePosition};
use crate::state::RunState;

pub use config::{SequencePlan, SequenceStep};
pub use hooks::{HookRunner, ShellHooks};

/// The run-control operations a sequence needs.
#[async_trait]
pub trait SequencerControl: Send + Sync {
    /// Current operator-level run state.
    fn run_state(&self) -> RunState;

    /// Loads `config` and runs INITIALISE.
    async fn initialise(&self, config: &str, identity: &str) -> AppResult<()>;

    /// Runs START and returns the new run number.
    async fn start(&self, request: CommandRequest) -> AppResult<u64>;

    /// Runs STOP.
    async fn stop(&self, request: CommandRequest) -> AppResult<()>;

    /// Runs SHUTDOWN.
    async fn shutdown(&self, identity: &str) -> AppResult<()>;

    /// Current value of an event counter.
    async fn event_count(&self, counter: &str) -> AppResult<u64>;
}

/// Where a sequence starts: sequence number 0 assigns a new one from the first run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResumePoint {
    /// Sequence to continue, or 0.
    pub sequence_number: u64,
    /// 1-based step.
    pub step: usize,
}

impl ResumePoint {
    /// A new sequence from its first step.
    pub fn start() -> Self {
        Self {
            sequence_number: 0,
            step: 1,
        }
    }

    /// Resumes `sequence_number` at `step`.
    pub fn new(sequence_number: u64, step: usize) -> Self {
        Self { sequence_number, step }
    }
}

impl Default for ResumePoint {
    fn default() -> Self {
        Self::start()
    }
}

/// Progress published while a sequence runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SequencerStatus {
    /// A sequence is in progress.
    pub running: bool,
    /// Name of the running plan.
    pub plan: Option<String>,
    /// Step being executed, 1-based.
    pub step: usize,
    /// Number of steps in the plan.
    pub total: usize,
    /// Sequence number, once assigned.
    pub sequence_number: u64,
}

/// How a sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequenceOutcome {
    /// Every step ran.
    Completed,
    /// Stopped on request before `resume.step`.
    Cancelled { resume: ResumePoint },
}

/// Result of a sequence that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceSummary {
    /// Plan name.
    pub plan: String,
    /// Sequence number the runs were registered under.
    pub sequence_number: u64,
    /// Run numbers taken, in step order.
    pub runs: Vec<u64>,
    /// How the sequence ended.
    pub outcome: SequenceOutcome,
}

/// Drives sequences through a [`SequencerControl`].
pub struct Sequencer {
    control: Arc<dyn SequencerControl>,
    hooks: Arc<dyn HookRunner>,
    sink: Arc<dyn NotificationSink>,
    identity: String,
    physics_counter: String,
    poll_interval: Duration,
    shutdown_policy: RetryPolicy,
    stop_flag: Arc<AtomicBool>,
    status: watch::Sender<SequencerStatus>,
}

impl Sequencer {
    /// Creates a sequencer over `control`.
    pub fn new(
        control: Arc<dyn SequencerControl>,
        hooks: Arc<dyn HookRunner>,
        sink: Arc<dyn NotificationSink>,
        settings: &Settings,
    ) -> Self {
        let (status, _) = watch::channel(SequencerStatus::default());
        Self {
            control,
            hooks,
            sink,
            identity: settings.sequencer.identity.clone(),
            physics_counter: settings.statistics.physics_counter.clone(),
            poll_interval: settings.sequencer.poll_interval,
            shutdown_policy: RetryPolicy {
                max_attempts: settings.sequencer.shutdown_attempts,
                backoff_delay: settings.sequencer.shutdown_retry_delay,
            },
            stop_flag: Arc::new(AtomicBool::new(false)),
            status,
        }
    }

    /// Flag that ends the current run early and stops the sequence before the next
    /// step.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// Ends the current run early and stops before the next step.
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Subscribes to progress updates.
    pub fn status(&self) -> watch::Receiver<SequencerStatus> {
        self.status.subscribe()
    }

    /// Runs `plan` from `resume`.
    ///
    /// Refused without running anything unless the run state is DOWN, and when a
    /// later step is requested without a sequence number. A failing step aborts the
    /// sequence with [`RunControlError::SequenceFailed`] carrying the resume point.
    pub async fn run(&self, plan: &SequencePlan, resume: ResumePoint) -> AppResult<SequenceSummary> {
        if resume.step == 0 || resume.step > plan.len() {
            return Err(RunControlError::SequenceRejected(format!(
                "step {} is outside 1..={}",
                resume.step,
                plan.len()
            )));
        }
        if resume.step > 1 && resume.sequence_number == 0 {
            return Err(RunControlError::SequenceRejected(
                "resuming at a later step requires a sequence number".to_string(),
            ));
        }
        let run_state = self.control.run_state();
        if run_state != RunState::Down {
            return Err(RunControlError::SequenceRejected(format!(
                "system is not shut down ({run_state}), will not start a sequence"
            )));
        }

        self.stop_flag.store(false, Ordering::SeqCst);
        let mut sequence_number = resume.sequence_number;
        let remaining = plan.len() - resume.step + 1;
        let label = if sequence_number == 0 {
            plan.name.clone()
        } else {
            format!("{}, sequence {sequence_number}", plan.name)
        };
        self.notify(&format!("Starting a sequence run ({label}) with {remaining} steps"))
            .await;

        if let Some(command) = &plan.init_command {
            if let Err(e) = self.hooks.run(command).await {
                return Err(self
                    .fail(plan, sequence_number, resume.step, format!("init command failed: {e}"))
                    .await);
            }
        }

        let mut runs = Vec::new();
        let mut outcome = SequenceOutcome::Completed;
        for (index, step) in plan.steps.iter().enumerate().skip(resume.step - 1) {
            let number = index + 1;
            if self.stop_flag.load(Ordering::SeqCst) {
                outcome = SequenceOutcome::Cancelled {
                    resume: ResumePoint::new(sequence_number, number),
                };
                break;
            }
            self.publish(plan, number, sequence_number, true);
            info!(step = number, config = %step.config_name, "Running sequence step");

            match self.run_step(step, number, &mut sequence_number).await {
                Ok(run_number) => runs.push(run_number),
                Err(reason) => return Err(self.fail(plan, sequence_number, number, reason).await),
            }
        }

        self.finalize(plan).await;
        self.publish(plan, 0, sequence_number, false);
        let message = match outcome {
            SequenceOutcome::Completed => "Sequence run completed".to_string(),
            SequenceOutcome::Cancelled { resume } => {
                format!("Sequence run stopped before step {}", resume.step)
            }
        };
        self.notify(&message).await;

        Ok(SequenceSummary {
            plan: plan.name.clone(),
            sequence_number,
            runs,
            outcome,
        })
    }

    /// One full run. Errors are rendered as the failure reason.
    async fn run_step(&self, step: &SequenceStep, number: usize, sequence_number: &mut u64) -> Result<u64, String> {
        let run_state = self.control.run_state();
        if run_state != RunState::Down {
            return Err(format!("system is not shut down ({run_state}), will not start run"));
        }

        if let Some(command) = &step.pre_command {
            self.hooks
                .run(command)
                .await
                .map_err(|e| format!("pre-command failed: {e}"))?;
        }

        self.control
            .initialise(&step.config_name, &self.identity)
            .await
            .map_err(|e| format!("failed to initialise '{}': {e}", step.config_name))?;

        let position = SequencePosition {
            number: (*sequence_number != 0).then_some(*sequence_number),
            step: u32::try_from(number).unwrap_or(u32::MAX),
            substep: 0,
        };
        let start = CommandRequest::new(&self.identity)
            .with_run_type(&step.run_type)
            .with_comment(&step.start_comment)
            .with_sequence(position);
        let run_number = self
            .control
            .start(start)
            .await
            .map_err(|e| format!("failed to start run: {e}"))?;
        if *sequence_number == 0 {
            *sequence_number = run_number;
            info!(sequence_number = run_number, "Sequence number assigned");
        }

        self.wait_for_end(step).await?;

        let stop = CommandRequest::new(&self.identity)
            .with_run_type(&step.run_type)
            .with_comment(&step.end_comment);
        self.control
            .stop(stop)
            .await
            .map_err(|e| format!("failed to stop run {run_number}: {e}"))?;

        let control = &self.control;
        let identity = self.identity.as_str();
        retry_async(&self.shutdown_policy, "shutdown", move || control.shutdown(identity))
            .await
            .map_err(|e| format!("failed to shut down: {e}"))?;

        if let Some(command) = &step.post_command {
            self.hooks
                .run(command)
                .await
                .map_err(|e| format!("post-command failed: {e}"))?;
        }
        Ok(run_number)
    }

    /// Waits until the run reached its event or time limit, or a stop was
    /// requested. Leaving RUN on its own is a failure.
    async fn wait_for_end(&self, step: &SequenceStep) -> Result<(), String> {
        let started = Instant::now();
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                info!("Stop requested, ending run");
                return Ok(());
            }
            let run_state = self.control.run_state();
            if run_state != RunState::Run {
                return Err(format!("run state changed to {run_state} during the run"));
            }
            let events = match self.control.event_count(&self.physics_counter).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "Could not read event count");
                    0
                }
            };
            if events >= step.max_events {
                info!(events, "Event limit reached");
                return Ok(());
            }
            if started.elapsed() >= step.max_run_duration {
                info!(elapsed = ?started.elapsed(), "Run time limit reached");
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn fail(&self, plan: &SequencePlan, sequence: u64, step: usize, reason: String) -> RunControlError {
        let error = RunControlError::SequenceFailed {
            sequence,
            step,
            reason,
        };
        warn!(%error, "Sequence failed");
        self.finalize(plan).await;
        self.publish(plan, step, sequence, false);
        self.notify(&format!("Sequence run failed: {error}")).await;
        error
    }

    async fn finalize(&self, plan: &SequencePlan) {
        if let Some(command) = &plan.finalize_command {
            if let Err(e) = self.hooks.run(command).await {
                warn!(error = %e, "Finalize command failed");
            }
        }
    }

    fn publish(&self, plan: &SequencePlan, step: usize, sequence_number: u64, running: bool) {
        self.status.send_replace(SequencerStatus {
            running,
            plan: Some(plan.name.clone()),
            step,
            total: plan.len(),
            sequence_number,
        });
    }

    async fn notify(&self, message: &str) {
        info!("{message}");
        deliver(self.sink.as_ref(), message).await;
    }
}
