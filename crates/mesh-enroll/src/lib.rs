//! PIN-gated device enrollment: PIN lifecycle, proof verification, and
//! sealed PSK delivery (spec §4.9).

pub mod pin;
pub mod service;

pub use pin::PendingEnrollment;
pub use service::{compute_pin_proof, EnrollResult, EnrollmentService};
