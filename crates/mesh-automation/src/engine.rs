use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use mesh_core::{save_json_atomic, MeshError};
use mesh_registry::{Command, DeviceRegistry};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::rule::Rule;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: BTreeMap<String, Rule>,
}

/// Stores [`Rule`]s and evaluates them against a [`DeviceRegistry`]
/// snapshot (spec §4.12). Maintains a `device_id -> rule_id` index so
/// evaluation triggered by one device's state change only visits rules
/// that reference it.
pub struct AutomationEngine {
    path: PathBuf,
    rules: BTreeMap<String, Rule>,
    index: HashMap<String, HashSet<String>>,
}

impl AutomationEngine {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let rules = if path.exists() {
            match mesh_core::load_json::<RuleFile>(&path) {
                Ok(file) => file.rules,
                Err(err) => {
                    warn!(error = %err, "automation: corrupt rules file, starting empty");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        let mut engine = Self { path, rules: BTreeMap::new(), index: HashMap::new() };
        for rule in rules.into_values() {
            engine.insert_indexed(rule);
        }
        engine
    }

    fn insert_indexed(&mut self, rule: Rule) {
        for device_id in rule.devices_referenced() {
            self.index.entry(device_id.to_string()).or_default().insert(rule.rule_id.clone());
        }
        self.rules.insert(rule.rule_id.clone(), rule);
    }

    fn remove_indexed(&mut self, rule_id: &str) {
        if let Some(rule) = self.rules.remove(rule_id) {
            for device_id in rule.devices_referenced() {
                if let Some(set) = self.index.get_mut(device_id) {
                    set.remove(rule_id);
                }
            }
        }
    }

    fn persist(&self) -> Result<(), MeshError> {
        save_json_atomic(&self.path, &RuleFile { rules: self.rules.clone() })
    }

    /// Every device/capability a rule references must exist in `registry`
    /// at add time.
    pub fn validate_rule(rule: &Rule, registry: &DeviceRegistry) -> Vec<String> {
        let mut errors = Vec::new();
        for condition in &rule.conditions {
            match registry.get(&condition.device_id) {
                Some(device) if device.capability(&condition.capability).is_some() => {}
                Some(_) => errors.push(format!("device {} has no capability {}", condition.device_id, condition.capability)),
                None => errors.push(format!("unknown device {}", condition.device_id)),
            }
        }
        for action in &rule.actions {
            match registry.get(&action.device_id) {
                Some(device) if device.capability(&action.capability).is_some() => {}
                Some(_) => errors.push(format!("device {} has no capability {}", action.device_id, action.capability)),
                None => errors.push(format!("unknown device {}", action.device_id)),
            }
        }
        if rule.conditions.is_empty() {
            errors.push("rule must have at least one condition".to_string());
        }
        if rule.actions.is_empty() {
            errors.push("rule must have at least one action".to_string());
        }
        errors
    }

    /// Validates `rule` against `registry`; on success, inserts it,
    /// updates the index, and persists. Returns validation errors and
    /// leaves the engine unchanged on failure.
    pub fn add_rule(&mut self, rule: Rule, registry: &DeviceRegistry) -> Result<(), Vec<String>> {
        let errors = Self::validate_rule(&rule, registry);
        if !errors.is_empty() {
            return Err(errors);
        }
        self.insert_indexed(rule);
        self.persist().map_err(|err| vec![err.to_string()])?;
        Ok(())
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> Result<(), MeshError> {
        self.remove_indexed(rule_id);
        self.persist()
    }

    pub fn enable(&mut self, rule_id: &str, enabled: bool) -> Result<(), MeshError> {
        if let Some(rule) = self.rules.get_mut(rule_id) {
            rule.enabled = enabled;
        }
        self.persist()
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<&Rule> {
        self.rules.get(rule_id)
    }

    pub fn list_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    /// Replaces a rule wholesale by `rule_id`, re-validating and
    /// re-indexing it. Fails (leaving the old rule in place) if the
    /// replacement does not validate against `registry`.
    pub fn update_rule(&mut self, rule: Rule, registry: &DeviceRegistry) -> Result<(), Vec<String>> {
        let errors = Self::validate_rule(&rule, registry);
        if !errors.is_empty() {
            return Err(errors);
        }
        self.remove_indexed(&rule.rule_id);
        self.insert_indexed(rule);
        self.persist().map_err(|err| vec![err.to_string()])?;
        Ok(())
    }

    /// A synchronous, pure function of `(rules, registry snapshot, now)`
    /// (spec §4.12): evaluates every rule indexed under
    /// `trigger_device_id` and returns the commands any firing rule
    /// produces. Mutates `last_triggered` on firing rules as a
    /// side-effect, since cooldown state is part of the engine.
    pub fn evaluate(&mut self, trigger_device_id: &str, registry: &DeviceRegistry, now: f64) -> Vec<Command> {
        let Some(rule_ids) = self.index.get(trigger_device_id).cloned() else {
            return Vec::new();
        };
        let mut commands = Vec::new();
        for rule_id in rule_ids {
            let Some(rule) = self.rules.get(&rule_id) else { continue };
            if !rule.enabled {
                continue;
            }
            if let Some(last) = rule.last_triggered {
                if now - last < rule.cooldown_seconds {
                    continue;
                }
            }
            if !conditions_hold(rule, registry) {
                continue;
            }
            for action in &rule.actions {
                commands.push(Command {
                    device: action.device_id.clone(),
                    action_kind: action.action_kind,
                    capability: Some(action.capability.clone()),
                    params: action.params.clone(),
                });
            }
            if let Some(rule) = self.rules.get_mut(&rule_id) {
                rule.last_triggered = Some(now);
            }
        }
        commands
    }
}

fn conditions_hold(rule: &Rule, registry: &DeviceRegistry) -> bool {
    rule.conditions.iter().all(|condition| {
        let Some(device) = registry.get(&condition.device_id) else { return false };
        let Some(current) = device.state.get(&condition.capability) else { return false };
        current.compare(condition.operator, &condition.threshold)
    })
}
