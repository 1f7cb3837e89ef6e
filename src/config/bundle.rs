//! Deployment configuration bundles.
//!
//! Every deployment configuration lives in its own directory under the configured
//! root, with an index file naming the three documents it consists of:
//!
//! ```text
//! <config_root>/<name>/config-dict.json   {"tree": "tree.json", "fsm_rules": "fsm-rules.json", "config": "config.json"}
//! <config_root>/<name>/tree.json          {"name": "Root", "children": [...]}
//! <config_root>/<name>/fsm-rules.json     see config::fsm
//! <config_root>/<name>/config.json        {"group": "...", "components": [...]}
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::fsm::FsmRules;
use crate::error::{AppResult, RunControlError};

/// Name of the index file inside a configuration directory.
pub const INDEX_FILE: &str = "config-dict.json";

#[derive(Debug, Deserialize)]
struct ConfigIndex {
    tree: PathBuf,
    fsm_rules: PathBuf,
    config: PathBuf,
}

/// Declarative description of one node of the control tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescription {
    /// Unique node name.
    pub name: String,
    /// Component type, matched by sibling ordering rules.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    /// Children; a node without children is a leaf.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDescription>,
}

impl NodeDescription {
    /// A leaf description.
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type: None,
            children: Vec::new(),
        }
    }

    /// A category description.
    pub fn category(name: impl Into<String>, children: Vec<NodeDescription>) -> Self {
        Self {
            name: name.into(),
            node_type: None,
            children,
        }
    }

    /// Sets the component type.
    pub fn with_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }
}

/// A loaded deployment configuration.
#[derive(Debug, Clone)]
pub struct ConfigBundle {
    /// Directory name of the configuration.
    pub name: String,
    /// Control tree description.
    pub tree: NodeDescription,
    /// FSM rules shared by every node.
    pub rules: Arc<FsmRules>,
    /// Component configuration, unwrapped from an optional `configuration` key.
    pub configuration: Value,
}

impl ConfigBundle {
    /// Assembles a bundle from already-parsed parts.
    pub fn from_parts(
        name: impl Into<String>,
        tree: NodeDescription,
        rules: FsmRules,
        configuration: Value,
    ) -> Self {
        let configuration = match configuration {
            Value::Object(mut map) if map.contains_key("configuration") => {
                map.remove("configuration").unwrap_or(Value::Null)
            }
            other => other,
        };
        Self {
            name: name.into(),
            tree,
            rules: Arc::new(rules),
            configuration,
        }
    }

    /// Loads configuration `name` from `root`.
    pub fn load(root: impl AsRef<Path>, name: &str) -> AppResult<Self> {
        let dir = root.as_ref().join(name);
        let index: ConfigIndex = read_json(&dir.join(INDEX_FILE))?;
        debug!(config = name, dir = %dir.display(), "Loading configuration bundle");

        let tree: NodeDescription = read_json(&dir.join(&index.tree))?;
        let rules = FsmRules::load(dir.join(&index.fsm_rules))?;
        let configuration: Value = read_json(&dir.join(&index.config))?;

        let bundle = Self::from_parts(name, tree, rules, configuration);
        bundle.validate()?;
        Ok(bundle)
    }

    fn validate(&self) -> AppResult<()> {
        if !self.configuration.is_object() && !self.configuration.is_null() {
            return Err(RunControlError::Configuration(format!(
                "Component configuration of '{}' must be a JSON object",
                self.name
            )));
        }
        Ok(())
    }

    /// Configuration group name.
    pub fn group(&self) -> &str {
        self.configuration
            .get("group")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Component entries.
    pub fn components(&self) -> &[Value] {
        self.configuration
            .get("components")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Component entry named `name`.
    pub fn component(&self, name: &str) -> Option<&Value> {
        self.components()
            .iter()
            .find(|c| c.get("name").and_then(Value::as_str) == Some(name))
    }

    /// Detector identifiers of the readout components, reported with each new run.
    pub fn detector_list(&self) -> Vec<String> {
        let mut detectors = Vec::new();
        for component in self.components() {
            let module_type = component
                .pointer("/modules/0/type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match module_type {
                "TriggerReceiver" => detectors.push("TLB".to_string()),
                "DigitizerReceiver" => detectors.push("DIG00".to_string()),
                "TrackerReceiver" => {
                    if let Some(board) = component
                        .pointer("/settings/BoardID")
                        .and_then(Value::as_u64)
                    {
                        detectors.push(format!("TRB{board:02}"));
                    }
                }
                _ => {}
            }
        }
        detectors
    }
}

/// Names of the configurations available under `root`, sorted.
pub fn list_configurations(root: impl AsRef<Path>) -> AppResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root.as_ref())? {
        let entry = entry?;
        if entry.path().join(INDEX_FILE).is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> AppResult<T> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| RunControlError::json(path, e))
}
