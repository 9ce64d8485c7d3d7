//! Automation rule storage and evaluation (spec §4.12).

pub mod engine;
pub mod rule;

pub use engine::AutomationEngine;
pub use rule::{Action, Condition, Rule};
