//! Sequence files.
//!
//! A sequence file is a JSON object listing the runs to take, either explicitly:
//!
//! ```json
//! {
//!   "runtype": "Physics", "maxRunTime": 3600, "maxEvents": 1000000,
//!   "steps": [ { "cfgFile": "combined", "startcomment": "high threshold" } ]
//! }
//! ```
//!
//! or generated from a template, where every variable is a list or a
//! `"start,stop[,step]"` range and step fields use `{var}` placeholders:
//!
//! ```json
//! {
//!   "defaults": { "runtype": "Calibration", "maxRunTime": 600, "maxEvents": 5000 },
//!   "template": {
//!     "vars": { "threshold": "10,40,10", "cfg": ["tlb-a", "tlb-b", "tlb-c"] },
//!     "step": { "cfgFile": "{cfg}", "startcomment": "threshold {threshold}" }
//!   }
//! }
//! ```
//!
//! Missing step fields come from the `defaults` object, then from top-level keys.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{AppResult, RunControlError};

type Fields = Map<String, Value>;

/// One run of a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceStep {
    /// Configuration to initialise.
    pub config_name: String,
    /// Run type sent with START.
    pub run_type: String,
    /// Start comment sent with START.
    pub start_comment: String,
    /// End comment sent with STOP.
    pub end_comment: String,
    /// Run length after which the run is stopped.
    pub max_run_duration: Duration,
    /// Physics events after which the run is stopped.
    pub max_events: u64,
    /// Shell command run before initialising.
    pub pre_command: Option<String>,
    /// Shell command run after shutting down.
    pub post_command: Option<String>,
}

/// A parsed sequence file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePlan {
    /// Plan name, the file stem when loaded from disk.
    pub name: String,
    /// Runs, in order.
    pub steps: Vec<SequenceStep>,
    /// Run once before the first step.
    pub init_command: Option<String>,
    /// Run once when the sequence ends, successfully or not.
    pub finalize_command: Option<String>,
}

impl SequencePlan {
    /// Loads a sequence file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let document: Value = serde_json::from_str(&text).map_err(|e| RunControlError::json(path, e))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sequence".to_string());
        Self::from_value(name, &document)
    }

    /// Parses a sequence document.
    pub fn from_json_str(name: impl Into<String>, text: &str) -> AppResult<Self> {
        let document: Value = serde_json::from_str(text)
            .map_err(|e| RunControlError::SequenceRejected(format!("invalid sequence JSON: {e}")))?;
        Self::from_value(name, &document)
    }

    /// Parses a sequence document.
    pub fn from_value(name: impl Into<String>, document: &Value) -> AppResult<Self> {
        let root = document
            .as_object()
            .ok_or_else(|| rejected("a sequence file must be a JSON object"))?;

        let mut defaults = Fields::new();
        for field in STEP_FIELDS {
            if let Some(value) = root.get(field) {
                defaults.insert(field.to_string(), value.clone());
            }
        }
        if let Some(extra) = root.get("defaults") {
            let extra = extra
                .as_object()
                .ok_or_else(|| rejected("'defaults' must be an object"))?;
            defaults.extend(extra.clone());
        }

        let raw_steps = match (root.get("steps"), root.get("template")) {
            (Some(steps), None) => steps
                .as_array()
                .ok_or_else(|| rejected("'steps' must be an array"))?
                .iter()
                .map(|step| step.as_object().cloned().ok_or_else(|| rejected("every step must be an object")))
                .collect::<AppResult<Vec<_>>>()?,
            (None, Some(template)) => expand_template(template)?,
            (Some(_), Some(_)) => return Err(rejected("use either 'steps' or 'template', not both")),
            (None, None) => return Err(rejected("no 'steps' or 'template' given")),
        };
        if raw_steps.is_empty() {
            return Err(rejected("the sequence has no steps"));
        }

        let steps = raw_steps
            .iter()
            .enumerate()
            .map(|(index, raw)| parse_step(index + 1, raw, &defaults))
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            name: name.into(),
            steps,
            init_command: command(root.get("initCommand"), "initCommand")?,
            finalize_command: command(root.get("finalizeCommand"), "finalizeCommand")?,
        })
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

const STEP_FIELDS: [&str; 8] = [
    "cfgFile",
    "runtype",
    "startcomment",
    "endcomment",
    "maxRunTime",
    "maxEvents",
    "preCommand",
    "postCommand",
];

fn rejected(detail: impl Into<String>) -> RunControlError {
    RunControlError::SequenceRejected(detail.into())
}

fn parse_step(number: usize, raw: &Fields, defaults: &Fields) -> AppResult<SequenceStep> {
    let field = |name: &str| raw.get(name).or_else(|| defaults.get(name));

    let text = |name: &str, required: bool| -> AppResult<String> {
        match field(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            None | Some(Value::Null) if !required => Ok(String::new()),
            None | Some(Value::Null) => Err(rejected(format!("step {number}: no value for '{name}'"))),
            Some(other) => Err(rejected(format!("step {number}: '{name}' must be a string, got {other}"))),
        }
    };

    let count = |name: &str| -> AppResult<u64> {
        let invalid = || rejected(format!("step {number}: '{name}' must be a non-negative number"));
        match field(name) {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .ok_or_else(invalid),
            Some(Value::String(s)) => s.trim().parse::<u64>().map_err(|_| invalid()),
            None | Some(Value::Null) => Err(rejected(format!("step {number}: no value for '{name}'"))),
            Some(_) => Err(invalid()),
        }
    };

    Ok(SequenceStep {
        config_name: text("cfgFile", true)?,
        run_type: text("runtype", true)?,
        start_comment: text("startcomment", false)?,
        end_comment: text("endcomment", false)?,
        max_run_duration: Duration::from_secs(count("maxRunTime")?),
        max_events: count("maxEvents")?,
        pre_command: command(field("preCommand"), "preCommand")?,
        post_command: command(field("postCommand"), "postCommand")?,
    })
}

/// An empty or missing command means none.
fn command(value: Option<&Value>, name: &str) -> AppResult<Option<String>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(rejected(format!("'{name}' must be a string, got {other}"))),
    }
}

fn expand_template(template: &Value) -> AppResult<Vec<Fields>> {
    let template = template
        .as_object()
        .ok_or_else(|| rejected("'template' must be an object"))?;
    let vars = template
        .get("vars")
        .and_then(Value::as_object)
        .ok_or_else(|| rejected("'template.vars' must be an object"))?;
    let step = template
        .get("step")
        .and_then(Value::as_object)
        .ok_or_else(|| rejected("'template.step' must be an object"))?;

    let columns = vars
        .iter()
        .map(|(name, value)| Ok((name.clone(), expand_var(name, value)?)))
        .collect::<AppResult<Vec<(String, Vec<String>)>>>()?;
    let len = columns.first().map_or(0, |(_, values)| values.len());
    if let Some((name, values)) = columns.iter().find(|(_, values)| values.len() != len) {
        return Err(rejected(format!(
            "template variable '{name}' has {} values, expected {len}",
            values.len()
        )));
    }

    (0..len)
        .map(|row| {
            let values: HashMap<String, String> = columns
                .iter()
                .map(|(name, column)| (name.clone(), column[row].clone()))
                .collect();
            let mut fields = Fields::new();
            for (name, value) in step {
                let value = match value {
                    Value::String(s) => Value::String(
                        strfmt::strfmt(s, &values)
                            .map_err(|e| rejected(format!("template field '{name}': {e}")))?,
                    ),
                    other => other.clone(),
                };
                fields.insert(name.clone(), value);
            }
            Ok(fields)
        })
        .collect()
}

/// Values of one template variable: a list, or a `"start,stop[,step]"` range with
/// `stop` excluded.
fn expand_var(name: &str, value: &Value) -> AppResult<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(rejected(format!("template variable '{name}': unsupported value {other}"))),
            })
            .collect(),
        Value::String(range) => {
            let bounds = range
                .split(',')
                .map(|part| part.trim().parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| rejected(format!("template variable '{name}': invalid range '{range}'")))?;
            let (start, stop, step) = match bounds.as_slice() {
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] if *step != 0 => (*start, *stop, *step),
                _ => return Err(rejected(format!("template variable '{name}': invalid range '{range}'"))),
            };
            let mut values = Vec::new();
            let mut current = start;
            while (step > 0 && current < stop) || (step < 0 && current > stop) {
                values.push(current.to_string());
                current += step;
            }
            Ok(values)
        }
        other => Err(rejected(format!("template variable '{name}' must be a list or range, got {other}"))),
    }
}
