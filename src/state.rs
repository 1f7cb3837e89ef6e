//! State vocabulary shared by the tree, executor and operator surface.
//!
//! Component states are plain names: their ordering is data, defined once per
//! deployment by the FSM rules (see [`crate::config::fsm::FsmRules`]). The run
//! state is the operator-level view derived from the root node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a component lifecycle state (e.g. `not_added`, `ready`, `running`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentState(String);

impl ComponentState {
    /// Creates a state from its configured name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the state name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentState {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ComponentState {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl PartialEq<str> for ComponentState {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ComponentState {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Operator-level run state published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    #[serde(rename = "DOWN")]
    Down,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "RUN")]
    Run,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "IN TRANSITION")]
    InTransition,
}

impl RunState {
    /// Returns the published name of the run state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Down => "DOWN",
            Self::Ready => "READY",
            Self::Run => "RUN",
            Self::Paused => "PAUSED",
            Self::InTransition => "IN TRANSITION",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health reported by a leaf's process supervisor alongside its state.
///
/// Numeric codes follow the supervisor's status register: 0 ok, 1 warning, 2 error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleHealth {
    #[default]
    Ok,
    Warning,
    Error,
}

impl ModuleHealth {
    /// Maps a supervisor status code to a health value.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Warning,
            _ => Self::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_serializes_to_published_names() {
        let json = serde_json::to_string(&RunState::InTransition).unwrap();
        assert_eq!(json, "\"IN TRANSITION\"");
        let parsed: RunState = serde_json::from_str("\"READY\"").unwrap();
        assert_eq!(parsed, RunState::Ready);
    }

    #[test]
    fn health_codes() {
        assert_eq!(ModuleHealth::from_code(0), ModuleHealth::Ok);
        assert_eq!(ModuleHealth::from_code(1), ModuleHealth::Warning);
        assert_eq!(ModuleHealth::from_code(2), ModuleHealth::Error);
    }
}
