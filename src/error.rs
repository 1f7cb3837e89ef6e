//! Custom error types for the run-control engine.
//!
//! This module defines the primary error type, `RunControlError`, shared by every
//! layer of the engine. Using the `thiserror` crate, it gives one consistent way to
//! surface failures, from configuration problems to a component that never reached
//! its expected state.
//!
//! ## Error Hierarchy
//!
//! - **`ActionRejected`**: a primitive action was not permitted for a node's current
//!   state. Local and non-fatal; inside a fan-out it is reported per child.
//! - **`TransitionTimeout`**: a composite command step did not converge to its
//!   expected root state in time. Fatal for that command.
//! - **`LockConflict`**: a command came from an identity other than the interlock
//!   holder.
//! - **`ExternalService`**: the run registrar (or another remote collaborator) failed.
//!   Run start aborts cleanly with the system state unchanged.
//! - **`InconsistentTreeState`**: reported while sibling states diverge. Never raised by
//!   the state checker itself.
//!
//! The remaining variants cover configuration loading and validation, I/O, lookup and
//! sequencing failures. By using `#[from]`, most underlying errors convert with `?`.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::state::{ComponentState, RunState};

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, RunControlError>;

/// An action that a node's FSM rules do not permit in its current state.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("Action '{action}' not allowed on node '{node}' in state '{state}'")]
pub struct ActionRejected {
    /// Node that refused the action.
    pub node: String,
    /// State the node was in when the action arrived.
    pub state: ComponentState,
    /// Requested primitive action.
    pub action: String,
}

/// A composite command step whose wait for the expected root state ran out.
#[derive(Error, Debug, Clone, PartialEq)]
pub struct TransitionTimeout {
    /// Composite command being executed (e.g. `INITIALISE`).
    pub command: String,
    /// 1-based step index within the command's step list.
    pub step: usize,
    /// Primitive action issued by the step.
    pub action: String,
    /// State the root was expected to reach.
    pub expected: ComponentState,
    /// Root state observed when the wait gave up.
    pub actual: ComponentState,
    /// Whether the root was inconsistent when the wait gave up.
    pub inconsistent: bool,
    /// Step timeout that elapsed.
    pub timeout: Duration,
}

impl fmt::Display for TransitionTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} step {} ('{}') timed out after {:?}: expected '{}', root is '{}'",
            self.command, self.step, self.action, self.timeout, self.expected, self.actual
        )?;
        if self.inconsistent {
            write!(f, " (inconsistent)")?;
        }
        Ok(())
    }
}

/// Failures reported by a component's process supervisor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("Process supervisor unreachable: {0}")]
    Unreachable(String),

    #[error("Process command failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
/// Errors raised by the run-control engine.
pub enum RunControlError {
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Failed to parse '{path}': {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Node '{0}' not found")]
    NodeNotFound(String),

    #[error("No configuration loaded")]
    NoConfiguration,

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Command '{0}' has no step list in the FSM rules")]
    CommandNotConfigured(String),

    #[error(transparent)]
    ActionRejected(#[from] ActionRejected),

    #[error(transparent)]
    TransitionTimeout(#[from] TransitionTimeout),

    #[error("Another composite command is already in progress")]
    TransitionInProgress,

    #[error("Interlock is held by '{holder}'")]
    LockConflict { holder: String },

    #[error("'{identity}' does not hold the interlock")]
    NotLockHolder {
        identity: String,
        holder: Option<String>,
    },

    #[error("{service} error: {detail}")]
    ExternalService {
        service: &'static str,
        detail: String,
    },

    #[error("Node '{node}' is inconsistent: {detail}")]
    InconsistentTreeState { node: String, detail: String },

    #[error("Cannot switch configuration while the run state is {0}")]
    ConfigSwitchRefused(RunState),

    #[error("Process error on '{node}': {source}")]
    Process {
        node: String,
        #[source]
        source: ProcessError,
    },

    #[error("Hook '{command}' failed: {detail}")]
    HookFailed { command: String, detail: String },

    #[error("Sequence rejected: {0}")]
    SequenceRejected(String),

    #[error("Sequence {sequence} failed at step {step}: {reason} (resume with -S {sequence} -s {step})")]
    SequenceFailed {
        sequence: u64,
        step: usize,
        reason: String,
    },
}

impl RunControlError {
    /// Builds an `ExternalService` error for the run registrar.
    pub fn registrar(detail: impl Into<String>) -> Self {
        Self::ExternalService {
            service: "Run registrar",
            detail: detail.into(),
        }
    }

    /// Wraps a JSON parse failure with the file it came from.
    pub fn json(path: impl AsRef<std::path::Path>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}
