//! Device registry, capability model, and command validation (spec §4.10-4.11).

pub mod capability;
pub mod command;
pub mod device;
pub mod registry;

pub use capability::{CapabilityKind, DataType, DeviceCapability};
pub use command::{
    from_envelope, has_blocking_error, response_to_envelope, to_envelope, validate, ActionKind, Command, Response, ResponseStatus, Severity,
    ValidationIssue,
};
pub use device::DeviceInfo;
pub use registry::{DeviceRegistry, RegistryEvent};
