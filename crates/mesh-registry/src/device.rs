use std::collections::BTreeMap;

use mesh_core::DeviceValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::{DataType, DeviceCapability};

/// One enrolled device's registry entry (spec §3, §4.10).
///
/// Invariants: every key of `state` names a known capability; for `enum`
/// capabilities the value is one of `enum_values`; for numeric
/// capabilities with a `value_range`, the value lies within it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub node_id: String,
    pub device_type: String,
    pub display_name: String,
    pub capabilities: Vec<DeviceCapability>,
    #[serde(default)]
    pub state: BTreeMap<String, DeviceValue>,
    #[serde(default)]
    pub online: bool,
    pub last_seen: f64,
    pub registered_at: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DeviceInfo {
    pub fn new(node_id: impl Into<String>, device_type: impl Into<String>, display_name: impl Into<String>, now: f64) -> Self {
        Self {
            node_id: node_id.into(),
            device_type: device_type.into(),
            display_name: display_name.into(),
            capabilities: Vec::new(),
            state: BTreeMap::new(),
            online: false,
            last_seen: now,
            registered_at: now,
            metadata: Map::new(),
        }
    }

    pub fn capability(&self, name: &str) -> Option<&DeviceCapability> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    /// Validates `value` against `capability`'s declared type and range.
    /// Returns `Err` with a human-readable reason on violation.
    pub fn validate_value(capability: &DeviceCapability, value: &DeviceValue) -> Result<(), String> {
        match (capability.data_type, value) {
            (DataType::Bool, DeviceValue::Bool(_)) => {}
            (DataType::Int, DeviceValue::Int(_)) => {}
            (DataType::Float, DeviceValue::Float(_) | DeviceValue::Int(_)) => {}
            (DataType::String, DeviceValue::String(_)) => {}
            (DataType::Enum, DeviceValue::String(s)) => {
                let allowed = capability.enum_values.as_deref().unwrap_or(&[]);
                if !allowed.iter().any(|v| v == s) {
                    return Err(format!("value {s:?} is not in enum_values for {}", capability.name));
                }
            }
            (expected, actual) => {
                return Err(format!(
                    "capability {} expects {expected:?}, got {}",
                    capability.name,
                    actual.type_name()
                ));
            }
        }
        if let Some((min, max)) = capability.value_range {
            let numeric = match value {
                DeviceValue::Int(n) => Some(*n as f64),
                DeviceValue::Float(f) => Some(*f),
                _ => None,
            };
            if let Some(n) = numeric {
                if n < min || n > max {
                    return Err(format!("value {n} out of range [{min}, {max}] for {}", capability.name));
                }
            }
        }
        Ok(())
    }

    /// Sets `state[capability]` after validating it against the device's
    /// capability contract. Returns `Some(previous_value)` if the key's
    /// value actually changed (where `previous_value` is `None` on a
    /// first-ever write), or `None` if the new value equals the old one.
    pub fn set_state(&mut self, capability: &str, value: DeviceValue) -> Result<Option<Option<DeviceValue>>, String> {
        let cap = self
            .capability(capability)
            .ok_or_else(|| format!("unknown capability {capability}"))?
            .clone();
        Self::validate_value(&cap, &value)?;
        let old = self.state.get(capability).cloned();
        let changed = old.as_ref() != Some(&value);
        self.state.insert(capability.to_string(), value);
        Ok(if changed { Some(old) } else { None })
    }
}
