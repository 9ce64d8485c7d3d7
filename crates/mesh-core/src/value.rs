use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operator used by automation rule conditions (spec §3, C12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A dynamically-typed capability/state/command value (spec §9).
///
/// Comparisons are strict and fail closed on type mismatch: comparing a
/// `String` to a `Float`, for instance, never succeeds — it is simply not
/// `true`, regardless of operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl DeviceValue {
    /// Numeric view used for range checks and numeric comparisons. `Bool`
    /// is intentionally excluded: checked before numeric coercion in the
    /// validator since some runtimes treat booleans as integer subtypes
    /// (spec §4.11 note 6).
    fn as_f64(&self) -> Option<f64> {
        match self {
            DeviceValue::Int(i) => Some(*i as f64),
            DeviceValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn partial_cmp_strict(&self, other: &DeviceValue) -> Option<Ordering> {
        match (self, other) {
            (DeviceValue::Bool(a), DeviceValue::Bool(b)) => a.partial_cmp(b),
            (DeviceValue::String(a), DeviceValue::String(b)) => a.partial_cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Evaluates `self <op> other`; type mismatches return `false` (spec §8:
    /// "type mismatches ... rule does not fire silently").
    pub fn compare(&self, op: Operator, other: &DeviceValue) -> bool {
        if op == Operator::Eq {
            return self == other;
        }
        if op == Operator::Ne {
            return self != other;
        }
        match self.partial_cmp_strict(other) {
            Some(ordering) => match op {
                Operator::Gt => ordering == Ordering::Greater,
                Operator::Ge => ordering != Ordering::Less,
                Operator::Lt => ordering == Ordering::Less,
                Operator::Le => ordering != Ordering::Greater,
                Operator::Eq | Operator::Ne => unreachable!(),
            },
            None => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceValue::Bool(_) => "bool",
            DeviceValue::Int(_) => "int",
            DeviceValue::Float(_) => "float",
            DeviceValue::String(_) => "string",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictness_boundary_gt_ge() {
        let a = DeviceValue::Float(30.0);
        let b = DeviceValue::Float(30.0);
        assert!(!a.compare(Operator::Gt, &b));
        assert!(a.compare(Operator::Ge, &b));
    }

    #[test]
    fn type_mismatch_never_fires() {
        let a = DeviceValue::String("on".to_string());
        let b = DeviceValue::Float(1.0);
        assert!(!a.compare(Operator::Gt, &b));
        assert!(!a.compare(Operator::Lt, &b));
        assert!(!a.compare(Operator::Eq, &b));
    }

    #[test]
    fn bool_compares_as_bool_not_int() {
        let a = DeviceValue::Bool(true);
        let b = DeviceValue::Int(1);
        assert!(!a.compare(Operator::Eq, &b));
    }

    #[test]
    fn untagged_json_round_trips_by_shape() {
        let v: DeviceValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, DeviceValue::Bool(true));
        let v: DeviceValue = serde_json::from_str("42").unwrap();
        assert_eq!(v, DeviceValue::Int(42));
        let v: DeviceValue = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, DeviceValue::Float(3.5));
        let v: DeviceValue = serde_json::from_str("\"on\"").unwrap();
        assert_eq!(v, DeviceValue::String("on".to_string()));
    }
}
