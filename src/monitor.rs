//! Control loop publishing state deltas.
//!
//! The monitor runs independently of command flow. Every tick it expires a stale
//! interlock, diffs the tree snapshot against the last published one, derives the
//! run state, feeds the crash and error notifiers and broadcasts whatever changed
//! as [`StateEvent`]s.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::context::OrchestratorContext;
use crate::executor::Deployment;
use crate::health::notifier::CrashNotifier;
use crate::messages::{LogLevel, StateEvent};
use crate::state::{ModuleHealth, RunState};
use crate::tree::{ErrorReport, NodeStatus, TreeSnapshot};

/// The currently loaded deployment, swapped whole on a configuration switch.
pub type DeploymentSlot = Arc<RwLock<Option<Arc<Deployment>>>>;

/// Message raised when the interlock expires.
pub const INTERLOCK_TIMEOUT_MESSAGE: &str = "Interlock has been released because of TIMEOUT";

/// Delta publisher and notifier driver.
pub struct Monitor {
    ctx: Arc<OrchestratorContext>,
    crash_notifier: CrashNotifier,
    error_notifier: CrashNotifier,
    last_config: Option<String>,
    last_nodes: TreeSnapshot,
    last_root: Option<(NodeStatus, bool)>,
    last_holder: Option<String>,
    last_crashed: BTreeSet<String>,
    last_errors: ErrorReport,
}

impl Monitor {
    /// Creates a monitor with notifiers built from the settings.
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        let notifications = &ctx.settings().notifications;
        let crash_notifier = CrashNotifier::new(
            notifications.crash_template.clone(),
            notifications.reminder_interval,
            Arc::clone(ctx.clock()),
        )
        .with_ok_alerts(notifications.ok_alerts);
        let error_notifier = CrashNotifier::new(
            notifications.error_template.clone(),
            notifications.reminder_interval,
            Arc::clone(ctx.clock()),
        )
        .with_ok_alerts(notifications.ok_alerts);

        Self {
            ctx,
            crash_notifier,
            error_notifier,
            last_config: None,
            last_nodes: TreeSnapshot::new(),
            last_root: None,
            last_holder: None,
            last_crashed: BTreeSet::new(),
            last_errors: ErrorReport::default(),
        }
    }

    /// Runs one monitoring pass over `deployment`.
    pub async fn tick(&mut self, deployment: Option<&Deployment>) {
        self.check_interlock();

        let Some(deployment) = deployment else {
            return;
        };
        if self.last_config.as_deref() != Some(deployment.name()) {
            debug!(config = deployment.name(), "Monitoring new deployment");
            self.last_config = Some(deployment.name().to_string());
            self.last_nodes.clear();
            self.last_root = None;
        }

        self.publish_nodes(deployment);
        self.publish_run_state(deployment);
        self.check_crashes(deployment).await;
        self.check_errors(deployment).await;
    }

    fn check_interlock(&mut self) {
        let interlock = self.ctx.interlock();
        if let Some(expired) = interlock.expire() {
            self.ctx.log(LogLevel::Warning, INTERLOCK_TIMEOUT_MESSAGE);
            self.ctx.emit(StateEvent::InterlockExpired {
                holder: expired.holder,
            });
        }
        let holder = interlock.holder();
        if holder != self.last_holder {
            self.ctx.emit(StateEvent::InterlockChanged(holder.clone()));
            self.last_holder = holder;
        }
    }

    fn publish_nodes(&mut self, deployment: &Deployment) {
        let snapshot = deployment.tree.snapshot();
        let delta: TreeSnapshot = snapshot
            .iter()
            .filter(|(name, status)| self.last_nodes.get(*name) != Some(*status))
            .map(|(name, status)| (name.clone(), status.clone()))
            .collect();
        if !delta.is_empty() {
            self.ctx.emit(StateEvent::NodesChanged(delta));
        }
        self.last_nodes = snapshot;
    }

    /// Re-derives the run state when the root status or the transition flag moved.
    fn publish_run_state(&mut self, deployment: &Deployment) {
        let root = deployment.tree.root().status();
        let in_transition = self.ctx.in_transition();
        let key = (root.clone(), in_transition);
        if self.last_root.as_ref() == Some(&key) {
            return;
        }
        self.last_root = Some(key);

        let rules = &deployment.bundle.rules;
        let run_state = match rules.run_state(&root.state) {
            _ if in_transition && root.inconsistent => RunState::InTransition,
            Some(run_state) => run_state,
            None if in_transition => RunState::InTransition,
            None => rules.settled_run_state(&root.state),
        };
        self.ctx.set_run_state(run_state);
    }

    async fn check_crashes(&mut self, deployment: &Deployment) {
        let crashed = deployment.tree.crashed_leaves();
        if crashed != self.last_crashed {
            self.ctx.emit(StateEvent::CrashedChanged(crashed.clone()));
            self.last_crashed = crashed.clone();
        }
        if matches!(self.ctx.run_state(), RunState::Run | RunState::Ready) {
            self.crash_notifier
                .check_and_notify(&crashed, self.ctx.sink().as_ref())
                .await;
        }
    }

    async fn check_errors(&mut self, deployment: &Deployment) {
        let report = deployment.tree.error_report();
        if report != self.last_errors {
            self.ctx.emit(StateEvent::ErrorsChanged(report.clone()));
            self.last_errors = report;
        }
        if self.ctx.run_state() == RunState::Run {
            let in_error: BTreeSet<String> = deployment
                .tree
                .nodes()
                .iter()
                .filter(|n| n.is_leaf() && n.status().health == ModuleHealth::Error)
                .map(|n| n.name().to_string())
                .collect();
            self.error_notifier
                .check_and_notify(&in_error, self.ctx.sink().as_ref())
                .await;
        }
    }

    /// Spawns the monitor loop over whatever deployment `slot` holds.
    pub fn spawn(self, slot: DeploymentSlot, interval: Duration) -> MonitorHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run_monitor(self, slot, interval, rx));
        MonitorHandle { shutdown, task }
    }
}

/// A running monitor task.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals the loop to stop and waits for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Monitor task ended abnormally");
        }
    }
}

async fn run_monitor(
    mut monitor: Monitor,
    slot: DeploymentSlot,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let deployment = slot.read().clone();
                monitor.tick(deployment.as_deref()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Monitor stopped");
}
