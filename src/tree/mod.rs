//! Hierarchical control tree.
//!
//! A [`Tree`] owns the root [`Node`], a name index over every node and the state
//! checker tasks keeping the cached states fresh. The whole tree is built when a
//! configuration is loaded and replaced whole on a configuration switch.

pub mod checker;
pub mod node;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::config::bundle::{ConfigBundle, NodeDescription};
use crate::config::fsm::FsmRules;
use crate::error::{AppResult, RunControlError};
use crate::process::ProcessBinder;
use crate::state::ModuleHealth;

pub use checker::{aggregate, StateCheckers};
pub use node::{ActionOutcome, Node, NodeKind, NodeStatus};

/// Name → status of every node.
pub type TreeSnapshot = BTreeMap<String, NodeStatus>;

/// Leaves reporting warnings or errors, together with their parents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// Nodes in warning state.
    pub warnings: BTreeSet<String>,
    /// Nodes in error state.
    pub errors: BTreeSet<String>,
}

impl ErrorReport {
    /// True if nothing reports a problem.
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.errors.is_empty()
    }
}

/// The control tree of one loaded configuration.
pub struct Tree {
    root: Arc<Node>,
    rules: Arc<FsmRules>,
    nodes: Vec<Arc<Node>>,
    index: HashMap<String, Arc<Node>>,
    parents: HashMap<String, String>,
    checkers: Mutex<Option<StateCheckers>>,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root.name())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl Tree {
    /// Builds the tree of `bundle`, binding every leaf through `binder`.
    pub fn build(bundle: &ConfigBundle, binder: &dyn ProcessBinder) -> AppResult<Self> {
        let root = build_node(&bundle.tree, bundle, binder)?;
        Self::from_root(root)
    }

    /// Wraps an already-built root node.
    ///
    /// Fails if two nodes share a name.
    pub fn from_root(root: Arc<Node>) -> AppResult<Self> {
        let rules = Arc::clone(root.rules());
        let mut nodes = Vec::new();
        let mut index = HashMap::new();
        let mut parents = HashMap::new();

        let mut stack = vec![(Arc::clone(&root), None::<String>)];
        while let Some((node, parent)) = stack.pop() {
            if index.insert(node.name().to_string(), Arc::clone(&node)).is_some() {
                return Err(RunControlError::Configuration(format!(
                    "Duplicate node name '{}' in control tree",
                    node.name()
                )));
            }
            if let Some(parent) = parent {
                parents.insert(node.name().to_string(), parent);
            }
            for child in node.children().iter().rev() {
                stack.push((Arc::clone(child), Some(node.name().to_string())));
            }
            nodes.push(node);
        }

        Ok(Self {
            root,
            rules,
            nodes,
            index,
            parents,
            checkers: Mutex::new(None),
        })
    }

    /// Top node of the tree.
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// FSM rules shared by every node.
    pub fn rules(&self) -> &Arc<FsmRules> {
        &self.rules
    }

    /// Every node, parents before children.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Looks up a node by name.
    pub fn find(&self, name: &str) -> AppResult<Arc<Node>> {
        self.index
            .get(name)
            .cloned()
            .ok_or_else(|| RunControlError::NodeNotFound(name.to_string()))
    }

    /// Name of the parent of `name`, `None` for the root or unknown names.
    pub fn parent_of(&self, name: &str) -> Option<&str> {
        self.parents.get(name).map(String::as_str)
    }

    /// Status of every node.
    pub fn snapshot(&self) -> TreeSnapshot {
        self.nodes
            .iter()
            .map(|n| (n.name().to_string(), n.status()))
            .collect()
    }

    /// Recomputes every node once, children before parents.
    pub async fn refresh(&self) {
        for node in self.nodes.iter().rev() {
            node.check_state().await;
        }
    }

    /// Leaves whose process crashed.
    pub fn crashed_leaves(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf() && n.status().crashed)
            .map(|n| n.name().to_string())
            .collect()
    }

    /// Leaves reporting warnings or errors. The parent of each such leaf is listed
    /// too, so operators can spot the affected branch.
    pub fn error_report(&self) -> ErrorReport {
        let mut report = ErrorReport::default();
        for node in self.nodes.iter().filter(|n| n.is_leaf()) {
            let bucket = match node.status().health {
                ModuleHealth::Ok => continue,
                ModuleHealth::Warning => &mut report.warnings,
                ModuleHealth::Error => &mut report.errors,
            };
            if let Some(parent) = self.parent_of(node.name()) {
                bucket.insert(parent.to_string());
            }
            bucket.insert(node.name().to_string());
        }
        report
    }

    /// Fails with the first inconsistent node, parents first.
    pub fn check_consistency(&self) -> AppResult<()> {
        match self.nodes.iter().find(|n| n.is_included() && n.is_inconsistent()) {
            Some(node) => {
                let states: Vec<String> = node
                    .children()
                    .iter()
                    .filter(|c| c.is_included())
                    .map(|c| format!("{}={}", c.name(), c.state()))
                    .collect();
                Err(RunControlError::InconsistentTreeState {
                    node: node.name().to_string(),
                    detail: states.join(", "),
                })
            }
            None => Ok(()),
        }
    }

    /// Starts the checker tasks; a no-op if they already run.
    pub fn start_checkers(&self, interval: Duration) {
        let mut checkers = self.checkers.lock();
        if checkers.is_none() {
            *checkers = Some(StateCheckers::spawn(&self.nodes, interval));
            info!(root = %self.root.name(), nodes = self.nodes.len(), "Control tree is being monitored");
        }
    }

    /// Stops and joins the checker tasks.
    pub async fn stop_checkers(&self) {
        let checkers = self.checkers.lock().take();
        if let Some(checkers) = checkers {
            checkers.stop().await;
        }
    }

    /// Whether the checker tasks are running.
    pub fn is_monitored(&self) -> bool {
        self.checkers.lock().is_some()
    }
}

fn build_node(
    description: &NodeDescription,
    bundle: &ConfigBundle,
    binder: &dyn ProcessBinder,
) -> AppResult<Arc<Node>> {
    let rules = Arc::clone(&bundle.rules);
    let node = if description.children.is_empty() {
        let handle = binder.bind(description, bundle.component(&description.name), &rules)?;
        Node::leaf(description.name.clone(), description.node_type.clone(), handle, rules)
    } else {
        let children = description
            .children
            .iter()
            .map(|child| build_node(child, bundle, binder))
            .collect::<AppResult<Vec<_>>>()?;
        Node::category(description.name.clone(), description.node_type.clone(), children, rules)
    };
    Ok(Arc::new(node))
}
