//! Message types exchanged between the operator surface, the executor and subscribers
//!
//! Commands flow in as [`RootCommand`] plus a [`CommandRequest`]; every invocation
//! produces exactly one verdict, `Ok(CommandReport)` or an error. State changes flow
//! out as [`StateEvent`]s on a broadcast channel, carrying only what changed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::RunControlError;
use crate::run_info::RunInfo;
use crate::state::RunState;
use crate::tree::{ErrorReport, NodeStatus};

/// Composite commands applied to the root of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RootCommand {
    /// Bring every component from baseline to configured.
    Initialise,
    /// Begin a run.
    Start,
    /// End the current run.
    Stop,
    /// Hold triggers without ending the run.
    Pause,
    /// Re-enable triggers.
    Resume,
    /// Return every component to baseline.
    Shutdown,
    /// Emergency clear while paused.
    Ecr,
}

impl RootCommand {
    /// All composite commands.
    pub const ALL: [RootCommand; 7] = [
        Self::Initialise,
        Self::Start,
        Self::Stop,
        Self::Pause,
        Self::Resume,
        Self::Shutdown,
        Self::Ecr,
    ];

    /// Key of the command in the FSM rules' `order` table.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialise => "INITIALISE",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Shutdown => "SHUTDOWN",
            Self::Ecr => "ECR",
        }
    }
}

impl fmt::Display for RootCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RootCommand {
    type Err = RunControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "INITIALISE" | "INITIALIZE" => Ok(Self::Initialise),
            "START" => Ok(Self::Start),
            "STOP" => Ok(Self::Stop),
            "PAUSE" => Ok(Self::Pause),
            "RESUME" => Ok(Self::Resume),
            "SHUTDOWN" => Ok(Self::Shutdown),
            "ECR" => Ok(Self::Ecr),
            _ => Err(RunControlError::UnknownCommand(s.to_string())),
        }
    }
}

/// Position of a run inside an automated sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequencePosition {
    /// Sequence number; `None` until the first run of a new sequence assigns it.
    pub number: Option<u64>,
    /// 1-based step number.
    pub step: u32,
    /// Sub-step, 0 unless a step is split.
    pub substep: u32,
}

/// Who issued a composite command and with what run metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRequest {
    /// Identity checked against the interlock.
    pub identity: String,
    /// Run type, used by START and STOP.
    pub run_type: Option<String>,
    /// Start comment for START, end comment for STOP.
    pub comment: Option<String>,
    /// Sequence position for START.
    pub sequence: Option<SequencePosition>,
}

impl CommandRequest {
    /// A request carrying only the caller's identity.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    /// Sets the run type.
    pub fn with_run_type(mut self, run_type: impl Into<String>) -> Self {
        self.run_type = Some(run_type.into());
        self
    }

    /// Sets the start or end comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Sets the sequence position.
    pub fn with_sequence(mut self, position: SequencePosition) -> Self {
        self.sequence = Some(position);
        self
    }
}

/// Successful outcome of a composite command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReport {
    /// Command that was executed.
    pub command: RootCommand,
    /// Per-component log locations returned by `add` steps.
    pub log_locations: Vec<String>,
    /// Run number the command applied to, if any.
    pub run_number: Option<u64>,
    /// The graceful SHUTDOWN failed and components were force-removed.
    pub forced_shutdown: bool,
    /// Non-fatal problems (e.g. end-of-run report not delivered).
    pub warnings: Vec<String>,
    /// Wall time spent in the command.
    pub elapsed: Duration,
}

/// Severity of a log line published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// State change pushed to subscribers by the control loop and the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StateEvent {
    /// Nodes whose status changed since the last publication.
    NodesChanged(BTreeMap<String, NodeStatus>),
    /// The operator-level run state changed.
    RunStateChanged(RunState),
    /// A different configuration was loaded.
    ConfigChanged(String),
    /// The interlock holder changed (`None` when released).
    InterlockChanged(Option<String>),
    /// The interlock expired without being released.
    InterlockExpired { holder: String },
    /// Set of crashed leaves changed.
    CrashedChanged(BTreeSet<String>),
    /// Leaves in warning or error state changed.
    ErrorsChanged(ErrorReport),
    /// Run number, type, comment or start time changed.
    RunInfoChanged(RunInfo),
    /// Operator-facing log line.
    Log { level: LogLevel, message: String },
}
