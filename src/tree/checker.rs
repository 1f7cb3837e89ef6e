//! Periodic state checking.
//!
//! Every node runs its own checker task, recomputing its state once per tick:
//! leaves ask their process, categories aggregate their children with
//! [`aggregate`]. Changes therefore propagate up one level per tick. The tasks
//! stop through a shared `watch` channel and are joined on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::fsm::FsmRules;
use crate::state::ComponentState;
use crate::tree::node::Node;

/// Aggregates child states into `(state, inconsistent)`.
///
/// States rank by their position in the rules' state list; unknown states rank
/// below every known state. All equal to the highest (or the lowest) state gives a
/// consistent result, anything else is the highest state flagged inconsistent.
/// Returns `None` for an empty input.
pub fn aggregate(states: &[ComponentState], rules: &FsmRules) -> Option<(ComponentState, bool)> {
    let max = states.iter().max_by_key(|s| rules.rank(s))?;
    let min = states.iter().min_by_key(|s| rules.rank(s))?;

    if states.iter().all(|s| s == max) {
        Some((max.clone(), false))
    } else if states.iter().all(|s| s == min) {
        Some((min.clone(), false))
    } else {
        Some((max.clone(), true))
    }
}

/// Running checker tasks of one tree.
pub struct StateCheckers {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StateCheckers {
    /// Spawns one checker task per node.
    pub fn spawn(nodes: &[Arc<Node>], interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        let tasks = nodes
            .iter()
            .map(|node| tokio::spawn(run_checker(Arc::clone(node), interval, shutdown.subscribe())))
            .collect();
        debug!(count = nodes.len(), ?interval, "State checkers started");
        Self { shutdown, tasks }
    }

    /// Number of running tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if no tasks were spawned.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signals every task to stop and waits for all of them.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "State checker task ended abnormally");
            }
        }
        debug!("State checkers stopped");
    }
}

async fn run_checker(node: Arc<Node>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => node.check_state().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
