//! Nodes of the control tree.
//!
//! A node is either a leaf bound to one component process or a category
//! aggregating its children. Mutable per-node fields (state, consistency,
//! inclusion, health) sit behind one lock; the FSM rules are shared and never
//! mutated. Locks are always taken parent before child.

use std::fmt;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::fsm::FsmRules;
use crate::error::ActionRejected;
use crate::process::ProcessHandle;
use crate::state::{ComponentState, ModuleHealth};
use crate::tree::checker::aggregate;

/// Snapshot of a node's mutable fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    /// Current (aggregated) state.
    pub state: ComponentState,
    /// Included children disagree.
    pub inconsistent: bool,
    /// Whether the node takes part in actions and aggregation.
    pub included: bool,
    /// Health of a leaf; categories stay `Ok`.
    pub health: ModuleHealth,
    /// A leaf's process died.
    pub crashed: bool,
}

impl NodeStatus {
    fn initial(state: ComponentState) -> Self {
        Self {
            state,
            inconsistent: false,
            included: true,
            health: ModuleHealth::Ok,
            crashed: false,
        }
    }
}

/// Leaf or category.
pub enum NodeKind {
    /// Controls one component process.
    Leaf(Arc<dyn ProcessHandle>),
    /// Aggregates owned children, in order.
    Category(Vec<Arc<Node>>),
}

/// Result of a primitive action on a node and, for categories, on its subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ActionOutcome {
    /// A leaf's supervisor accepted the action.
    Done { node: String, detail: String },
    /// A leaf's supervisor refused the action or could not be reached.
    Failed { node: String, detail: String },
    /// The node is excluded and was skipped.
    Excluded { node: String },
    /// The node's rules do not permit the action in its current state.
    Rejected(ActionRejected),
    /// A category's per-child results.
    Fanout {
        node: String,
        results: Vec<ActionOutcome>,
    },
}

impl ActionOutcome {
    /// Name of the node this outcome belongs to.
    pub fn node(&self) -> &str {
        match self {
            Self::Done { node, .. }
            | Self::Failed { node, .. }
            | Self::Excluded { node }
            | Self::Fanout { node, .. } => node,
            Self::Rejected(rejected) => &rejected.node,
        }
    }

    /// Details of every accepted leaf action, depth first. For `add` these are the
    /// per-component log locations.
    pub fn log_locations(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect(&mut |outcome| {
            if let Self::Done { detail, .. } = outcome {
                out.push(detail.clone());
            }
        });
        out
    }

    /// Every per-node rejection in the subtree.
    pub fn rejections(&self) -> Vec<ActionRejected> {
        let mut out = Vec::new();
        self.collect(&mut |outcome| {
            if let Self::Rejected(rejected) = outcome {
                out.push(rejected.clone());
            }
        });
        out
    }

    /// Names of leaves whose supervisor refused the action.
    pub fn failures(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect(&mut |outcome| {
            if let Self::Failed { node, .. } = outcome {
                out.push(node.clone());
            }
        });
        out
    }

    fn collect(&self, visit: &mut dyn FnMut(&ActionOutcome)) {
        match self {
            Self::Fanout { results, .. } => {
                for result in results {
                    result.collect(visit);
                }
            }
            other => visit(other),
        }
    }
}

/// A node of the control tree.
pub struct Node {
    name: String,
    node_type: Option<String>,
    kind: NodeKind,
    rules: Arc<FsmRules>,
    status: RwLock<NodeStatus>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("type", &self.node_type)
            .field("leaf", &self.is_leaf())
            .field("status", &*self.status.read())
            .finish()
    }
}

impl Node {
    /// Creates a leaf in the rules' baseline state.
    pub fn leaf(
        name: impl Into<String>,
        node_type: Option<String>,
        handle: Arc<dyn ProcessHandle>,
        rules: Arc<FsmRules>,
    ) -> Self {
        Self::with_kind(name.into(), node_type, NodeKind::Leaf(handle), rules)
    }

    /// Creates a category owning `children`.
    pub fn category(
        name: impl Into<String>,
        node_type: Option<String>,
        children: Vec<Arc<Node>>,
        rules: Arc<FsmRules>,
    ) -> Self {
        Self::with_kind(name.into(), node_type, NodeKind::Category(children), rules)
    }

    fn with_kind(name: String, node_type: Option<String>, kind: NodeKind, rules: Arc<FsmRules>) -> Self {
        let status = NodeStatus::initial(rules.baseline().clone());
        Self {
            name,
            node_type,
            kind,
            rules,
            status: RwLock::new(status),
        }
    }

    /// Unique node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type tag from the tree file, matched by sibling ordering rules.
    pub fn node_type(&self) -> Option<&str> {
        self.node_type.as_deref()
    }

    /// Whether the node controls a process.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    /// Children in order; empty for leaves.
    pub fn children(&self) -> &[Arc<Node>] {
        match &self.kind {
            NodeKind::Category(children) => children,
            NodeKind::Leaf(_) => &[],
        }
    }

    /// FSM rules of the node.
    pub fn rules(&self) -> &Arc<FsmRules> {
        &self.rules
    }

    /// Snapshot of the node's mutable fields.
    pub fn status(&self) -> NodeStatus {
        self.status.read().clone()
    }

    /// Current (aggregated) state.
    pub fn state(&self) -> ComponentState {
        self.status.read().state.clone()
    }

    /// Whether included children disagree.
    pub fn is_inconsistent(&self) -> bool {
        self.status.read().inconsistent
    }

    /// Whether the node takes part in actions and aggregation.
    pub fn is_included(&self) -> bool {
        self.status.read().included
    }

    /// Includes the node and all its descendants.
    pub fn include(&self) {
        self.set_included_recursive(true);
    }

    /// Excludes the node and all its descendants.
    pub fn exclude(&self) {
        self.set_included_recursive(false);
    }

    fn set_included_recursive(&self, included: bool) {
        // Children first, so a checker tick in between never sees an included
        // parent over excluded children.
        for child in self.children() {
            child.set_included_recursive(included);
        }
        self.status.write().included = included;
    }

    /// Whether a sibling-ordering key names this node.
    pub(crate) fn matches(&self, key: &str) -> bool {
        self.name == key || self.node_type.as_deref() == Some(key)
    }

    /// Recomputes this node's state once.
    ///
    /// A leaf queries its process; a category aggregates its children's cached
    /// states. Never fails: an unreachable process keeps its previous state.
    pub async fn check_state(&self) {
        match &self.kind {
            NodeKind::Leaf(handle) => self.refresh_leaf(handle.as_ref()).await,
            NodeKind::Category(children) => self.aggregate_children(children),
        }
    }

    async fn refresh_leaf(&self, handle: &dyn ProcessHandle) {
        match handle.raw_state().await {
            Ok(state) => {
                let health = handle.health().await;
                let crashed = handle.crashed().await;
                let mut status = self.status.write();
                status.state = state;
                status.inconsistent = false;
                status.health = health;
                status.crashed = crashed;
            }
            Err(e) => warn!(node = %self.name, error = %e, "State query failed, keeping last state"),
        }
    }

    fn aggregate_children(&self, children: &[Arc<Node>]) {
        if children.is_empty() {
            return;
        }
        let mut status = self.status.write();
        let mut states: Vec<ComponentState> = children
            .iter()
            .filter(|c| c.is_included())
            .map(|c| c.state())
            .collect();

        if states.is_empty() {
            if status.included {
                debug!(node = %self.name, "All children excluded, excluding node");
            }
            status.included = false;
            states = children.iter().map(|c| c.state()).collect();
        } else if !status.included {
            debug!(node = %self.name, "Child included again, including node");
            status.included = true;
        }

        if let Some((state, inconsistent)) = aggregate(&states, &self.rules) {
            status.state = state;
            status.inconsistent = inconsistent;
        }
    }

    /// Issues a primitive action on this node.
    ///
    /// Rejected without side effects if the node's current state does not permit
    /// the action. Excluded nodes report `Excluded`. Categories fan out to their
    /// children; sibling ordering rules serialize matching children, everything
    /// else runs concurrently.
    pub fn execute_action<'a>(
        &'a self,
        action: &'a str,
        args: &'a [String],
    ) -> BoxFuture<'a, Result<ActionOutcome, ActionRejected>> {
        self.dispatch(action, args, false)
    }

    /// Issues `action` on every included node of the subtree without checking the
    /// FSM rules. Only used to return the tree to baseline when a graceful
    /// shutdown failed.
    pub fn force_action<'a>(&'a self, action: &'a str) -> BoxFuture<'a, ActionOutcome> {
        Box::pin(async move {
            match self.dispatch(action, &[], true).await {
                Ok(outcome) => outcome,
                Err(rejected) => ActionOutcome::Rejected(rejected),
            }
        })
    }

    fn dispatch<'a>(
        &'a self,
        action: &'a str,
        args: &'a [String],
        forced: bool,
    ) -> BoxFuture<'a, Result<ActionOutcome, ActionRejected>> {
        Box::pin(async move {
            let status = self.status();
            if !status.included {
                return Ok(ActionOutcome::Excluded {
                    node: self.name.clone(),
                });
            }
            if !forced && !self.rules.allows(&status.state, action) {
                return Err(ActionRejected {
                    node: self.name.clone(),
                    state: status.state,
                    action: action.to_string(),
                });
            }

            match &self.kind {
                NodeKind::Leaf(handle) => {
                    let outcome = match handle.execute(action, args).await {
                        Ok(reply) if reply.ok => ActionOutcome::Done {
                            node: self.name.clone(),
                            detail: reply.detail,
                        },
                        Ok(reply) => ActionOutcome::Failed {
                            node: self.name.clone(),
                            detail: reply.detail,
                        },
                        Err(e) => ActionOutcome::Failed {
                            node: self.name.clone(),
                            detail: e.to_string(),
                        },
                    };
                    Ok(outcome)
                }
                NodeKind::Category(children) => Ok(ActionOutcome::Fanout {
                    node: self.name.clone(),
                    results: self.fan_out(children, action, args, forced).await,
                }),
            }
        })
    }

    async fn fan_out(
        &self,
        children: &[Arc<Node>],
        action: &str,
        args: &[String],
        forced: bool,
    ) -> Vec<ActionOutcome> {
        let Some(order) = self.rules.sibling_order(action) else {
            return join_all(children.iter().map(|c| run_child(c, action, args, forced))).await;
        };

        let mut results = Vec::with_capacity(children.len());
        let mut pending: Vec<&Arc<Node>> = children.iter().collect();
        for key in order {
            let (matched, rest): (Vec<&Arc<Node>>, Vec<&Arc<Node>>) =
                pending.into_iter().partition(|c| c.matches(key));
            pending = rest;
            for child in matched {
                results.push(run_child(child, action, args, forced).await);
            }
        }
        results.extend(join_all(pending.into_iter().map(|c| run_child(c, action, args, forced))).await);
        results
    }
}

async fn run_child(child: &Node, action: &str, args: &[String], forced: bool) -> ActionOutcome {
    match child.dispatch(action, args, forced).await {
        Ok(outcome) => outcome,
        Err(rejected) => {
            debug!(node = %rejected.node, action, state = %rejected.state, "Child rejected action");
            ActionOutcome::Rejected(rejected)
        }
    }
}
