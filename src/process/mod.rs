//! Process supervisor seam.
//!
//! Each leaf of the control tree controls exactly one component process through a
//! [`ProcessHandle`]. The real supervisor lives outside this crate; deployments bind
//! handles to leaves with a [`ProcessBinder`] when a configuration is loaded.

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::bundle::NodeDescription;
use crate::config::fsm::FsmRules;
use crate::error::{AppResult, ProcessError};
use crate::state::{ComponentState, ModuleHealth};

/// Reply of the supervisor to a primitive action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReply {
    /// The supervisor accepted the action.
    pub ok: bool,
    /// Supervisor message; the log location for `add`.
    pub detail: String,
}

impl ProcessReply {
    /// Accepted action.
    pub fn accepted(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    /// Refused action.
    pub fn refused(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Control channel to one component process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// State the component currently reports.
    async fn raw_state(&self) -> Result<ComponentState, ProcessError>;

    /// Issues a primitive action. Completion is observed through `raw_state`.
    async fn execute(&self, action: &str, args: &[String]) -> Result<ProcessReply, ProcessError>;

    /// Health status register of the component.
    async fn health(&self) -> ModuleHealth {
        ModuleHealth::Ok
    }

    /// Whether the process died while it should have been alive.
    async fn crashed(&self) -> bool {
        false
    }
}

/// Creates the process handle of every leaf when a tree is built.
pub trait ProcessBinder: Send + Sync {
    /// Binds `node` to a process; `component` is its entry in the component configuration.
    fn bind(
        &self,
        node: &NodeDescription,
        component: Option<&Value>,
        rules: &Arc<FsmRules>,
    ) -> AppResult<Arc<dyn ProcessHandle>>;
}
