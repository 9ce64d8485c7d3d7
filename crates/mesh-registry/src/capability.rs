use serde::{Deserialize, Serialize};

/// Data type a capability's value must conform to (spec §3: DeviceCapability).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int,
    Float,
    String,
    Enum,
}

/// What role a capability plays on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Sensor,
    Actuator,
    Property,
}

/// One named, typed state slot a device exposes (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCapability {
    pub name: String,
    pub kind: CapabilityKind,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_range: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl DeviceCapability {
    pub fn new(name: impl Into<String>, kind: CapabilityKind, data_type: DataType) -> Self {
        Self { name: name.into(), kind, data_type, unit: None, value_range: None, enum_values: None }
    }
}
