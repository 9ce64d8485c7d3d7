use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use mesh_core::{save_json_atomic, DeviceValue, MeshError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::device::DeviceInfo;

/// Registry lifecycle/state events fired to [`DeviceRegistry::on_event`]
/// callbacks (spec §4.10).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered(String),
    Updated(String),
    Removed(String),
    StateChanged { node_id: String, capability: String, old: Option<DeviceValue>, new: DeviceValue },
    Online(String),
    Offline(String),
}

type EventCallback = Box<dyn Fn(&RegistryEvent) + Send + Sync>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    devices: BTreeMap<String, DeviceInfo>,
}

/// In-memory `node_id -> DeviceInfo` map with JSON persistence at
/// `registry_path` (spec §4.10).
pub struct DeviceRegistry {
    path: PathBuf,
    devices: BTreeMap<String, DeviceInfo>,
    callbacks: Vec<EventCallback>,
}

impl DeviceRegistry {
    /// Loads `path` if present and parseable. A missing file starts
    /// empty; a corrupt file is logged and also starts empty rather than
    /// failing the hub's boot.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let devices = if path.exists() {
            match mesh_core::load_json::<RegistryFile>(&path) {
                Ok(file) => file.devices,
                Err(err) => {
                    warn!(error = %err, "registry: corrupt file, starting empty");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        Self { path, devices, callbacks: Vec::new() }
    }

    pub fn on_event(&mut self, callback: impl Fn(&RegistryEvent) + Send + Sync + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    fn fire(&self, event: RegistryEvent) {
        for callback in &self.callbacks {
            callback(&event);
        }
    }

    fn persist(&self) -> Result<(), MeshError> {
        let file = RegistryFile { devices: self.devices.clone() };
        save_json_atomic(&self.path, &file)
    }

    /// Inserts or replaces `info`. Fires `Registered` for a new node id,
    /// `Updated` for a replacement; persists either way.
    pub fn register(&mut self, info: DeviceInfo) -> Result<(), MeshError> {
        let node_id = info.node_id.clone();
        let is_new = !self.devices.contains_key(&node_id);
        self.devices.insert(node_id.clone(), info);
        self.persist()?;
        self.fire(if is_new { RegistryEvent::Registered(node_id) } else { RegistryEvent::Updated(node_id) });
        Ok(())
    }

    pub fn remove(&mut self, node_id: &str) -> Result<(), MeshError> {
        if self.devices.remove(node_id).is_some() {
            self.persist()?;
            self.fire(RegistryEvent::Removed(node_id.to_string()));
        }
        Ok(())
    }

    /// Applies `partial_state` key by key, validating each against the
    /// device's capability contract. Fires `StateChanged` only for keys
    /// whose value actually changed, and `Updated` if anything changed.
    /// Persists unconditionally; callers on a hot path may choose to
    /// debounce by batching calls, but correctness never depends on it.
    pub fn update_state(&mut self, node_id: &str, partial_state: &Map<String, Value>) -> Result<(), MeshError> {
        let Some(device) = self.devices.get_mut(node_id) else {
            debug!(node_id, "registry: update_state for unknown device");
            return Ok(());
        };
        let mut any_changed = false;
        let mut changes = Vec::new();
        for (capability, raw_value) in partial_state {
            let value: DeviceValue = match serde_json::from_value(raw_value.clone()) {
                Ok(v) => v,
                Err(_) => {
                    debug!(node_id, capability, "registry: unparseable state value, skipping key");
                    continue;
                }
            };
            match device.set_state(capability, value.clone()) {
                Ok(Some(old)) => {
                    any_changed = true;
                    changes.push((capability.clone(), old, value));
                }
                Ok(None) => {}
                Err(reason) => {
                    debug!(node_id, capability, reason, "registry: rejected state update");
                }
            }
        }
        if any_changed {
            self.persist()?;
            for (capability, old, new) in changes {
                self.fire(RegistryEvent::StateChanged { node_id: node_id.to_string(), capability, old, new });
            }
            self.fire(RegistryEvent::Updated(node_id.to_string()));
        }
        Ok(())
    }

    /// Updates `online`/`last_seen`; fires `Online`/`Offline` only on an
    /// actual transition.
    pub fn mark_online(&mut self, node_id: &str, online: bool, now: f64) -> Result<(), MeshError> {
        let Some(device) = self.devices.get_mut(node_id) else {
            return Ok(());
        };
        let was_online = device.online;
        device.online = online;
        device.last_seen = now;
        self.persist()?;
        if was_online != online {
            self.fire(if online { RegistryEvent::Online(node_id.to_string()) } else { RegistryEvent::Offline(node_id.to_string()) });
        }
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<&DeviceInfo> {
        self.devices.get(node_id)
    }

    pub fn by_type(&self, device_type: &str) -> Vec<&DeviceInfo> {
        self.devices.values().filter(|d| d.device_type == device_type).collect()
    }

    pub fn by_capability(&self, capability_name: &str) -> Vec<&DeviceInfo> {
        self.devices.values().filter(|d| d.capability(capability_name).is_some()).collect()
    }

    pub fn list_online(&self) -> Vec<&DeviceInfo> {
        self.devices.values().filter(|d| d.online).collect()
    }

    pub fn all(&self) -> Vec<&DeviceInfo> {
        self.devices.values().collect()
    }

    /// Human-oriented Markdown summary, suitable for a chat sink.
    pub fn summary_text(&self) -> String {
        let mut out = String::from("# Devices\n");
        for device in self.devices.values() {
            let status = if device.online { "online" } else { "offline" };
            out.push_str(&format!("- **{}** ({}) — {status}\n", device.display_name, device.node_id));
            for (capability, value) in &device.state {
                out.push_str(&format!("  - {capability}: {value:?}\n"));
            }
        }
        out
    }

    /// Stable machine-oriented structure for external agent consumption.
    pub fn dict_for_external(&self) -> Value {
        let devices: Map<String, Value> = self
            .devices
            .iter()
            .map(|(node_id, device)| {
                (
                    node_id.clone(),
                    serde_json::json!({
                        "device_type": device.device_type,
                        "display_name": device.display_name,
                        "online": device.online,
                        "state": device.state,
                    }),
                )
            })
            .collect();
        Value::Object(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityKind, DataType, DeviceCapability};
    use std::sync::{Arc, Mutex};

    fn sensor() -> DeviceInfo {
        let mut dev = DeviceInfo::new("esp32-kitchen", "sensor", "Kitchen Sensor", 0.0);
        dev.capabilities.push(DeviceCapability::new("temperature", CapabilityKind::Sensor, DataType::Float));
        dev
    }

    #[test]
    fn register_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_registry.json");
        let mut registry = DeviceRegistry::load(&path);
        registry.register(sensor()).unwrap();

        let reloaded = DeviceRegistry::load(&path);
        assert!(reloaded.get("esp32-kitchen").is_some());
    }

    #[test]
    fn corrupt_file_starts_empty_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_registry.json");
        std::fs::write(&path, b"not json").unwrap();
        let registry = DeviceRegistry::load(&path);
        assert!(registry.get("esp32-kitchen").is_none());
    }

    #[test]
    fn update_state_fires_state_changed_only_for_changed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DeviceRegistry::load(dir.path().join("device_registry.json"));
        registry.register(sensor()).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        registry.on_event(move |event| events_clone.lock().unwrap().push(format!("{event:?}")));

        let mut partial = Map::new();
        partial.insert("temperature".to_string(), Value::from(21.5));
        registry.update_state("esp32-kitchen", &partial).unwrap();
        registry.update_state("esp32-kitchen", &partial).unwrap();

        let fired = events.lock().unwrap();
        let state_changed_count = fired.iter().filter(|e| e.contains("StateChanged")).count();
        assert_eq!(state_changed_count, 1);
    }

    #[test]
    fn mark_online_fires_only_on_transition() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DeviceRegistry::load(dir.path().join("device_registry.json"));
        registry.register(sensor()).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        registry.on_event(move |event| events_clone.lock().unwrap().push(format!("{event:?}")));

        registry.mark_online("esp32-kitchen", true, 1.0).unwrap();
        registry.mark_online("esp32-kitchen", true, 2.0).unwrap();
        registry.mark_online("esp32-kitchen", false, 3.0).unwrap();

        let fired = events.lock().unwrap();
        assert_eq!(fired.iter().filter(|e| e.contains("Online")).count(), 1);
        assert_eq!(fired.iter().filter(|e| e.contains("Offline")).count(), 1);
    }

    #[test]
    fn by_capability_and_list_online_filter_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = DeviceRegistry::load(dir.path().join("device_registry.json"));
        registry.register(sensor()).unwrap();
        registry.mark_online("esp32-kitchen", true, 1.0).unwrap();

        assert_eq!(registry.by_capability("temperature").len(), 1);
        assert_eq!(registry.by_capability("humidity").len(), 0);
        assert_eq!(registry.list_online().len(), 1);
    }
}
