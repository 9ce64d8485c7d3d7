use mesh_core::{DeviceValue, Operator};
use mesh_registry::ActionKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One trigger condition: a device/capability read compared against a
/// threshold with `operator` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub device_id: String,
    pub capability: String,
    pub operator: Operator,
    pub threshold: DeviceValue,
}

/// One command to issue when a rule fires (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub device_id: String,
    pub capability: String,
    pub action_kind: ActionKind,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// An automation rule (spec §3, §4.12). All referenced devices/capabilities
/// are checked to exist at rule-add time by [`crate::engine::validate_rule`];
/// `evaluate` itself trusts the registry snapshot at call time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub name: String,
    pub enabled: bool,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    pub cooldown_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<f64>,
}

impl Rule {
    pub fn devices_referenced(&self) -> impl Iterator<Item = &str> {
        self.conditions
            .iter()
            .map(|c| c.device_id.as_str())
            .chain(self.actions.iter().map(|a| a.device_id.as_str()))
    }
}
