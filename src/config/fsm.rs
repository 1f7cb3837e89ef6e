//! FSM rules: state ordering, permitted actions and composite command steps.
//!
//! The rules document is shared by every node of a tree. Its shape:
//!
//! ```json
//! {
//!   "fsm": {
//!     "not_added": { "add": "booted" },
//!     "booted":    { "configure": "ready", "remove": "not_added" },
//!     "ready":     ["start", "unconfigure"]
//!   },
//!   "order": {
//!     "INITIALISE": [["add", "booted", 10], ["configure", "ready", 10]],
//!     "RESUME": [{ "action": "enableTrigger", "fallback": "resume", "state": "running", "timeout": 10 }]
//!   },
//!   "sibling_order": { "start": ["FileWriter", "EventBuilder"] },
//!   "run_states": { "ready": "READY" }
//! }
//! ```
//!
//! State order is the order of the keys of `fsm`: later states rank higher. Each
//! state lists its permitted actions either as a plain list or as a map from action
//! to the state the action leads to.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppResult, RunControlError};
use crate::messages::RootCommand;
use crate::state::{ComponentState, RunState};

/// One step of a composite command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct StepSpec {
    /// Primitive action issued on the root.
    pub action: String,
    /// Action issued instead when the root rejects `action`.
    pub fallback: Option<String>,
    /// Root state that completes the step.
    pub expected: ComponentState,
    /// Upper bound on the wait for `expected`.
    pub timeout: Duration,
}

impl StepSpec {
    /// Creates a step without a fallback action.
    pub fn new(action: impl Into<String>, expected: impl Into<ComponentState>, timeout: Duration) -> Self {
        Self {
            action: action.into(),
            fallback: None,
            expected: expected.into(),
            timeout,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStep {
    Tuple(String, String, f64),
    Detailed {
        action: String,
        #[serde(default)]
        fallback: Option<String>,
        state: String,
        timeout: f64,
    },
}

impl TryFrom<RawStep> for StepSpec {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let (action, fallback, state, timeout) = match raw {
            RawStep::Tuple(action, state, timeout) => (action, None, state, timeout),
            RawStep::Detailed {
                action,
                fallback,
                state,
                timeout,
            } => (action, fallback, state, timeout),
        };
        let timeout = Duration::try_from_secs_f64(timeout)
            .map_err(|e| format!("invalid timeout {timeout} for step '{action}': {e}"))?;
        Ok(Self {
            action,
            fallback,
            expected: ComponentState::new(state),
            timeout,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawActions {
    List(Vec<String>),
    Targets(serde_json::Map<String, Value>),
}

#[derive(Deserialize)]
struct RawRules {
    fsm: serde_json::Map<String, Value>,
    #[serde(default)]
    order: HashMap<String, Vec<StepSpec>>,
    #[serde(default)]
    sibling_order: HashMap<String, Vec<String>>,
    #[serde(default)]
    run_states: Option<HashMap<String, RunState>>,
}

/// A permitted action and, when declared, the state it leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRule {
    /// Action name.
    pub action: String,
    /// Resulting state, if the rules declare one.
    pub target: Option<ComponentState>,
}

/// Parsed FSM rules shared by every node of a tree.
#[derive(Debug, Clone)]
pub struct FsmRules {
    states: Vec<ComponentState>,
    actions: HashMap<ComponentState, Vec<ActionRule>>,
    order: HashMap<String, Vec<StepSpec>>,
    sibling_order: HashMap<String, Vec<String>>,
    run_states: HashMap<ComponentState, RunState>,
}

impl FsmRules {
    /// Parses a rules document from a JSON string.
    pub fn from_json_str(json: &str) -> AppResult<Self> {
        let raw: RawRules =
            serde_json::from_str(json).map_err(|e| RunControlError::json("fsm rules", e))?;
        Self::from_raw(raw)
    }

    /// Loads a rules document from disk.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let raw: RawRules = serde_json::from_str(&text).map_err(|e| RunControlError::json(path, e))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawRules) -> AppResult<Self> {
        if raw.fsm.is_empty() {
            return Err(RunControlError::Configuration(
                "FSM rules define no states".to_string(),
            ));
        }

        let mut states = Vec::with_capacity(raw.fsm.len());
        let mut actions = HashMap::with_capacity(raw.fsm.len());
        for (name, value) in raw.fsm {
            let parsed: RawActions = serde_json::from_value(value)
                .map_err(|e| RunControlError::json(format!("fsm.{name}"), e))?;
            let rules = match parsed {
                RawActions::List(list) => list
                    .into_iter()
                    .map(|action| ActionRule {
                        action,
                        target: None,
                    })
                    .collect(),
                RawActions::Targets(map) => map
                    .into_iter()
                    .map(|(action, target)| ActionRule {
                        action,
                        target: target.as_str().map(ComponentState::from),
                    })
                    .collect(),
            };
            let state = ComponentState::new(name);
            actions.insert(state.clone(), rules);
            states.push(state);
        }

        let run_states = match raw.run_states {
            Some(map) => map
                .into_iter()
                .map(|(state, run)| (ComponentState::new(state), run))
                .collect(),
            None => default_run_states(),
        };

        let rules = Self {
            states,
            actions,
            order: raw.order,
            sibling_order: raw.sibling_order,
            run_states,
        };
        rules.validate()?;
        Ok(rules)
    }

    fn validate(&self) -> AppResult<()> {
        for (command, steps) in &self.order {
            for step in steps {
                if self.rank(&step.expected).is_none() {
                    return Err(RunControlError::Configuration(format!(
                        "Step '{}' of {} expects unknown state '{}'",
                        step.action, command, step.expected
                    )));
                }
            }
        }
        for (state, rules) in &self.actions {
            for rule in rules {
                if let Some(target) = &rule.target {
                    if self.rank(target).is_none() {
                        return Err(RunControlError::Configuration(format!(
                            "Action '{}' from '{}' leads to unknown state '{}'",
                            rule.action, state, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// States in configured order, lowest first.
    pub fn states(&self) -> &[ComponentState] {
        &self.states
    }

    /// Lowest state, which every node starts in.
    pub fn baseline(&self) -> &ComponentState {
        // from_raw rejects empty state lists
        &self.states[0]
    }

    /// Position of `state` in the configured order.
    pub fn rank(&self, state: &ComponentState) -> Option<usize> {
        self.states.iter().position(|s| s == state)
    }

    /// Whether `action` is permitted while in `state`.
    pub fn allows(&self, state: &ComponentState, action: &str) -> bool {
        self.actions
            .get(state)
            .is_some_and(|rules| rules.iter().any(|r| r.action == action))
    }

    /// Declared result of `action` from `state`.
    pub fn target(&self, state: &ComponentState, action: &str) -> Option<&ComponentState> {
        self.actions
            .get(state)?
            .iter()
            .find(|r| r.action == action)?
            .target
            .as_ref()
    }

    /// Step list of a composite command.
    pub fn steps(&self, command: RootCommand) -> AppResult<&[StepSpec]> {
        self.order
            .get(command.as_str())
            .map(Vec::as_slice)
            .ok_or_else(|| RunControlError::CommandNotConfigured(command.to_string()))
    }

    /// Node types or names that must receive `action` one at a time, in order.
    pub fn sibling_order(&self, action: &str) -> Option<&[String]> {
        self.sibling_order.get(action).map(Vec::as_slice)
    }

    /// Run state published while the root sits in `state`.
    pub fn run_state(&self, state: &ComponentState) -> Option<RunState> {
        self.run_states.get(state).copied()
    }

    /// Run state of a root that has settled in `state` outside any command.
    ///
    /// Unmapped states take the mapping of the nearest lower-ranked mapped state;
    /// unknown states read as DOWN.
    pub fn settled_run_state(&self, state: &ComponentState) -> RunState {
        if let Some(run_state) = self.run_state(state) {
            return run_state;
        }
        let rank = self.rank(state).unwrap_or(0);
        self.states[..rank]
            .iter()
            .rev()
            .find_map(|s| self.run_state(s))
            .unwrap_or(RunState::Down)
    }
}

fn default_run_states() -> HashMap<ComponentState, RunState> {
    [
        ("not_added", RunState::Down),
        ("ready", RunState::Ready),
        ("running", RunState::Run),
        ("paused", RunState::Paused),
    ]
    .into_iter()
    .map(|(state, run)| (ComponentState::new(state), run))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"{
        "fsm": {
            "not_added": { "add": "booted" },
            "booted": { "configure": "ready", "remove": "not_added" },
            "ready": ["start", "unconfigure"],
            "running": { "stop": "ready" }
        },
        "order": {
            "INITIALISE": [["add", "booted", 10], ["configure", "ready", 2.5]],
            "RESUME": [{ "action": "enableTrigger", "fallback": "resume", "state": "running", "timeout": 10 }]
        },
        "sibling_order": { "start": ["EventBuilder"] }
    }"#;

    #[test]
    fn state_order_follows_document_order() {
        let rules = FsmRules::from_json_str(RULES).unwrap();
        let names: Vec<&str> = rules.states().iter().map(ComponentState::as_str).collect();
        assert_eq!(names, ["not_added", "booted", "ready", "running"]);
        assert_eq!(rules.baseline(), &ComponentState::new("not_added"));
        assert!(rules.rank(&"running".into()) > rules.rank(&"ready".into()));
        assert_eq!(rules.rank(&"paused".into()), None);
    }

    #[test]
    fn permitted_actions_and_targets() {
        let rules = FsmRules::from_json_str(RULES).unwrap();
        assert!(rules.allows(&"booted".into(), "configure"));
        assert!(!rules.allows(&"booted".into(), "start"));
        assert!(rules.allows(&"ready".into(), "start"));
        assert_eq!(
            rules.target(&"not_added".into(), "add"),
            Some(&ComponentState::new("booted"))
        );
        assert_eq!(rules.target(&"ready".into(), "start"), None);
    }

    #[test]
    fn composite_steps_parse_both_forms() {
        let rules = FsmRules::from_json_str(RULES).unwrap();
        let init = rules.steps(RootCommand::Initialise).unwrap();
        assert_eq!(init.len(), 2);
        assert_eq!(init[1], StepSpec::new("configure", "ready", Duration::from_millis(2500)));

        let resume = rules.steps(RootCommand::Resume).unwrap();
        assert_eq!(resume[0].fallback.as_deref(), Some("resume"));

        assert!(matches!(
            rules.steps(RootCommand::Ecr),
            Err(RunControlError::CommandNotConfigured(_))
        ));
    }

    #[test]
    fn default_run_state_mapping() {
        let rules = FsmRules::from_json_str(RULES).unwrap();
        assert_eq!(rules.run_state(&"ready".into()), Some(RunState::Ready));
        assert_eq!(rules.run_state(&"booted".into()), None);
    }

    #[test]
    fn settled_run_state_falls_back_to_lower_mapping() {
        let rules = FsmRules::from_json_str(RULES).unwrap();
        assert_eq!(rules.settled_run_state(&"booted".into()), RunState::Down);
        assert_eq!(rules.settled_run_state(&"running".into()), RunState::Run);
        assert_eq!(rules.settled_run_state(&"bogus".into()), RunState::Down);
    }

    #[test]
    fn unknown_expected_state_is_rejected() {
        let json = r#"{ "fsm": { "a": ["go"] }, "order": { "START": [["go", "b", 1]] } }"#;
        let err = FsmRules::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("unknown state 'b'"));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let json = r#"{ "fsm": { "a": ["go"] }, "order": { "START": [["go", "a", -1]] } }"#;
        assert!(FsmRules::from_json_str(json).is_err());
    }
}
