use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mesh_core::Envelope;

pub type DispatchFuture = Pin<Box<dyn Future<Output = Option<Envelope>> + Send>>;

/// Installed by the caller at construction time so the per-connection
/// accept loop can hand a verified (and, where applicable, decrypted)
/// envelope back up to the orchestrator without `mesh-transport` depending
/// on it directly — the "opaque handle" pattern used throughout the hub to
/// break what would otherwise be cyclic crate references (spec §9). A
/// `Some` return is written back on the same connection before it closes,
/// so request/response exchanges (enrollment, ping, command) never need a
/// discovery-routed dial back to the sender.
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) -> DispatchFuture + Send + Sync>;

/// Reports whether an enrollment PIN is currently active, consulted for the
/// unauthenticated-`ENROLL_REQUEST` bypass (spec §4.4).
pub type PinActiveCheck = Arc<dyn Fn() -> bool + Send + Sync>;
