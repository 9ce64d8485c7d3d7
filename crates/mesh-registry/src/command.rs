use mesh_core::{DeviceValue, Envelope, MessageType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::{CapabilityKind, DataType};
use crate::registry::DeviceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Set,
    Get,
    Toggle,
    Execute,
}

/// One request to act on or read a device (spec §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub device: String,
    pub action_kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// The reply to a [`Command`] (spec §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub device: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<DeviceValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Severity of a [`validate`] finding: `Error` blocks execution, `Warning`
/// (currently only "device offline") is surfaced but left to the caller
/// to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
}

/// Runs every check from spec §4.11 and returns all findings; an empty
/// vec of `Error`-severity issues means the command may execute.
pub fn validate(command: &Command, registry: &DeviceRegistry) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let Some(device) = registry.get(&command.device) else {
        issues.push(ValidationIssue { severity: Severity::Error, message: format!("unknown device {}", command.device) });
        return issues;
    };

    if !device.online {
        issues.push(ValidationIssue { severity: Severity::Warning, message: format!("device {} is offline", command.device) });
    }

    if matches!(command.action_kind, ActionKind::Set | ActionKind::Get | ActionKind::Toggle) {
        let Some(capability_name) = command.capability.as_deref() else {
            issues.push(ValidationIssue { severity: Severity::Error, message: "capability is required".to_string() });
            return issues;
        };
        let Some(capability) = device.capability(capability_name) else {
            issues.push(ValidationIssue {
                severity: Severity::Error,
                message: format!("device {} has no capability {capability_name}", command.device),
            });
            return issues;
        };

        match command.action_kind {
            ActionKind::Set if capability.kind == CapabilityKind::Sensor => {
                issues.push(ValidationIssue { severity: Severity::Error, message: "set is forbidden on sensor capabilities".to_string() });
            }
            ActionKind::Toggle if capability.data_type != DataType::Bool => {
                issues.push(ValidationIssue { severity: Severity::Error, message: "toggle is only valid on bool capabilities".to_string() });
            }
            ActionKind::Set => {
                if let Some(raw_value) = command.params.get("value") {
                    match serde_json::from_value::<DeviceValue>(raw_value.clone()) {
                        Ok(value) => {
                            if let Err(reason) = crate::device::DeviceInfo::validate_value(capability, &value) {
                                issues.push(ValidationIssue { severity: Severity::Error, message: reason });
                            }
                        }
                        Err(_) => {
                            issues.push(ValidationIssue { severity: Severity::Error, message: "value is not a recognized device value".to_string() });
                        }
                    }
                } else {
                    issues.push(ValidationIssue { severity: Severity::Error, message: "set requires a value parameter".to_string() });
                }
            }
            _ => {}
        }
    }

    issues
}

pub fn has_blocking_error(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(|i| i.severity == Severity::Error)
}

/// Emits a `COMMAND` envelope whose payload encodes every `Command` field.
pub fn to_envelope(command: &Command, source_id: &str, ts: f64) -> Envelope {
    let mut env = Envelope::new(MessageType::Command, source_id, &command.device, ts);
    env.payload = serde_json::to_value(command)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    env
}

/// Inverse of [`to_envelope`]; `None` if `env` is not a `COMMAND` or its
/// payload does not decode as a `Command`.
pub fn from_envelope(env: &Envelope) -> Option<Command> {
    if env.kind != MessageType::Command {
        return None;
    }
    serde_json::from_value(Value::Object(env.payload.clone())).ok()
}

/// Emits a `RESPONSE` envelope addressed back to whoever issued the
/// `COMMAND`, so the hub can reply on the same connection it was asked on.
pub fn response_to_envelope(response: &Response, source_id: &str, target: &str, ts: f64) -> Envelope {
    let mut env = Envelope::new(MessageType::Response, source_id, target, ts);
    env.payload = serde_json::to_value(response)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::DeviceCapability;
    use crate::device::DeviceInfo;

    fn registry_with_bool_device() -> DeviceRegistry {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DeviceRegistry::load(dir.path().join("registry.json"));
        let mut device = DeviceInfo::new("esp32-relay", "switch", "Relay", 0.0);
        device.capabilities.push(DeviceCapability::new("power", CapabilityKind::Actuator, DataType::Bool));
        device.online = true;
        registry.register(device).unwrap();
        registry
    }

    #[test]
    fn set_on_sensor_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DeviceRegistry::load(dir.path().join("registry.json"));
        let mut device = DeviceInfo::new("esp32-kitchen", "sensor", "Kitchen", 0.0);
        device.capabilities.push(DeviceCapability::new("temperature", CapabilityKind::Sensor, DataType::Float));
        device.online = true;
        registry.register(device).unwrap();

        let mut params = Map::new();
        params.insert("value".to_string(), Value::from(25.0));
        let command = Command {
            device: "esp32-kitchen".to_string(),
            action_kind: ActionKind::Set,
            capability: Some("temperature".to_string()),
            params,
        };
        let issues = validate(&command, &registry);
        assert!(has_blocking_error(&issues));
    }

    #[test]
    fn toggle_requires_bool_capability() {
        let registry = registry_with_bool_device();
        let command = Command {
            device: "esp32-relay".to_string(),
            action_kind: ActionKind::Toggle,
            capability: Some("power".to_string()),
            params: Map::new(),
        };
        assert!(!has_blocking_error(&validate(&command, &registry)));
    }

    #[test]
    fn unknown_device_is_a_blocking_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::load(dir.path().join("registry.json"));
        let command = Command { device: "ghost".to_string(), action_kind: ActionKind::Get, capability: None, params: Map::new() };
        assert!(has_blocking_error(&validate(&command, &registry)));
    }

    #[test]
    fn offline_device_is_a_warning_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DeviceRegistry::load(dir.path().join("registry.json"));
        let mut device = DeviceInfo::new("esp32-relay", "switch", "Relay", 0.0);
        device.capabilities.push(DeviceCapability::new("power", CapabilityKind::Actuator, DataType::Bool));
        registry.register(device).unwrap();

        let command = Command { device: "esp32-relay".to_string(), action_kind: ActionKind::Get, capability: Some("power".to_string()), params: Map::new() };
        let issues = validate(&command, &registry);
        assert!(!has_blocking_error(&issues));
        assert!(issues.iter().any(|i| i.severity == Severity::Warning));
    }

    #[test]
    fn envelope_round_trip() {
        let command = Command {
            device: "esp32-relay".to_string(),
            action_kind: ActionKind::Toggle,
            capability: Some("power".to_string()),
            params: Map::new(),
        };
        let env = to_envelope(&command, "hub", 10.0);
        let decoded = from_envelope(&env).unwrap();
        assert_eq!(decoded.device, "esp32-relay");
        assert_eq!(decoded.action_kind, ActionKind::Toggle);
    }

    #[test]
    fn response_to_envelope_addresses_the_command_issuer() {
        let response = Response { device: "esp32-relay".to_string(), status: ResponseStatus::Ok, capability: Some("power".to_string()), value: None, error: None };
        let env = response_to_envelope(&response, "hub", "operator-console", 10.0);
        assert_eq!(env.kind, MessageType::Response);
        assert_eq!(env.source, "hub");
        assert_eq!(env.target, "operator-console");
        assert_eq!(env.payload.get("device").and_then(Value::as_str), Some("esp32-relay"));
    }

    #[test]
    fn from_envelope_rejects_non_command_types() {
        let env = Envelope::new(MessageType::Ping, "hub", "esp32-relay", 0.0);
        assert!(from_envelope(&env).is_none());
    }
}
