use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tracing::{debug, warn};

use crate::session::{OtaSession, OtaState};
use crate::store::FirmwareStore;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_OFFER_TIMEOUT: f64 = 60.0;
pub const DEFAULT_CHUNK_ACK_TIMEOUT: f64 = 30.0;
pub const DEFAULT_VERIFY_TIMEOUT: f64 = 60.0;
pub const TERMINAL_SESSION_TTL: f64 = 300.0;

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("unknown firmware {0}")]
    UnknownFirmware(String),
    #[error("a non-terminal session already exists for {0}")]
    SessionInProgress(String),
    #[error("io error: {0}")]
    Io(#[from] mesh_core::MeshError),
}

/// Outbound wire action the caller (the hub's dispatcher) must translate
/// into a framed envelope and send.
#[derive(Debug, Clone, PartialEq)]
pub enum OtaAction {
    Offer { node_id: String, firmware_id: String, version: String, size: u64, sha256: String, chunk_size: usize },
    Chunk { node_id: String, seq: u64, data_base64: String, total: u64 },
    Complete { node_id: String },
    Abort { node_id: String, reason: String },
}

/// Owns at most one non-terminal [`OtaSession`] per node, driving the
/// OTA state machine described in spec §4.13.
pub struct OtaManager {
    sessions: HashMap<String, OtaSession>,
}

impl Default for OtaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OtaManager {
    pub fn new() -> Self {
        Self { sessions: HashMap::new() }
    }

    pub fn session(&self, node_id: &str) -> Option<&OtaSession> {
        self.sessions.get(node_id)
    }

    /// Offers `firmware_id` to `node_id`. Fails if a non-terminal session
    /// already exists for this node or the firmware is unknown.
    pub fn start(&mut self, node_id: &str, firmware_id: &str, store: &FirmwareStore, now: f64) -> Result<OtaAction, OtaError> {
        if let Some(existing) = self.sessions.get(node_id) {
            if !existing.state.is_terminal() {
                return Err(OtaError::SessionInProgress(node_id.to_string()));
            }
        }
        let manifest = store.manifest(firmware_id).ok_or_else(|| OtaError::UnknownFirmware(firmware_id.to_string()))?;
        let total_chunks = manifest.size.div_ceil(DEFAULT_CHUNK_SIZE as u64).max(1);
        let session = OtaSession::new(node_id, firmware_id, total_chunks, DEFAULT_CHUNK_SIZE, &manifest.sha256, now);
        self.sessions.insert(node_id.to_string(), session);
        Ok(OtaAction::Offer {
            node_id: node_id.to_string(),
            firmware_id: firmware_id.to_string(),
            version: manifest.version.clone(),
            size: manifest.size,
            sha256: manifest.sha256.clone(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    fn active_session_for(&mut self, node_id: &str, firmware_id: &str) -> Option<&mut OtaSession> {
        let session = self.sessions.get_mut(node_id)?;
        if session.firmware_id != firmware_id {
            debug!(node_id, firmware_id, "ota: firmware_id mismatch, ignoring message");
            return None;
        }
        Some(session)
    }

    /// Device accepted the offer: transitions to TRANSFERRING and emits
    /// the first chunk.
    pub fn handle_accept(&mut self, node_id: &str, firmware_id: &str, store: &FirmwareStore, now: f64) -> Option<OtaAction> {
        {
            let session = self.active_session_for(node_id, firmware_id)?;
            if session.state != OtaState::Offered {
                debug!(node_id, state = ?session.state, "ota: OTA_ACCEPT out of state, ignoring");
                return None;
            }
            session.state = OtaState::Transferring;
            session.updated_at = now;
        }
        self.send_chunk(node_id, firmware_id, store)
    }

    fn send_chunk(&mut self, node_id: &str, firmware_id: &str, store: &FirmwareStore) -> Option<OtaAction> {
        let session = self.sessions.get(node_id)?;
        let seq = session.next_seq;
        let offset = seq * session.chunk_size as u64;
        let data = store.read_chunk(firmware_id, offset, session.chunk_size).ok()?;
        if data.is_empty() {
            return None;
        }
        let total = session.total_chunks;
        if let Some(session) = self.sessions.get_mut(node_id) {
            session.next_seq += 1;
        }
        Some(OtaAction::Chunk { node_id: node_id.to_string(), seq, data_base64: BASE64.encode(&data), total })
    }

    /// Device acknowledged chunk `seq`. Advances `acked_seq` only on the
    /// expected sequence number and sends the next chunk if more remain.
    pub fn handle_chunk_ack(&mut self, node_id: &str, firmware_id: &str, seq: u64, store: &FirmwareStore, now: f64) -> Option<OtaAction> {
        {
            let session = self.active_session_for(node_id, firmware_id)?;
            if session.state != OtaState::Transferring || seq + 1 != session.next_seq {
                debug!(node_id, seq, "ota: unexpected chunk ack, ignoring");
                return None;
            }
            session.acked_seq = Some(seq);
            session.updated_at = now;
            if session.next_seq >= session.total_chunks {
                return None;
            }
        }
        self.send_chunk(node_id, firmware_id, store)
    }

    /// Device reports the transfer complete with its own computed hash.
    /// Compares against the session's expected hash and returns the
    /// terminal action.
    pub fn handle_verify(&mut self, node_id: &str, firmware_id: &str, reported_sha256: &str, now: f64) -> Option<OtaAction> {
        let session = self.active_session_for(node_id, firmware_id)?;
        if session.state != OtaState::Transferring {
            debug!(node_id, state = ?session.state, "ota: OTA_VERIFY out of state, ignoring");
            return None;
        }
        session.state = OtaState::Verifying;
        session.updated_at = now;
        if reported_sha256.eq_ignore_ascii_case(&session.sha256) {
            session.state = OtaState::Complete;
            Some(OtaAction::Complete { node_id: node_id.to_string() })
        } else {
            session.fail("hash_mismatch", now);
            Some(OtaAction::Abort { node_id: node_id.to_string(), reason: "hash_mismatch".to_string() })
        }
    }

    pub fn handle_reject(&mut self, node_id: &str, firmware_id: &str, reason: &str, now: f64) {
        if let Some(session) = self.active_session_for(node_id, firmware_id) {
            session.state = OtaState::Rejected;
            session.reason = Some(reason.to_string());
            session.updated_at = now;
        }
    }

    pub fn handle_device_abort(&mut self, node_id: &str, firmware_id: &str, reason: &str, now: f64) {
        if let Some(session) = self.active_session_for(node_id, firmware_id) {
            session.fail(reason.to_string(), now);
        }
    }

    /// Hub-initiated abort, valid from any non-terminal state.
    pub fn abort(&mut self, node_id: &str, reason: &str, now: f64) -> Option<OtaAction> {
        let session = self.sessions.get_mut(node_id)?;
        if session.state.is_terminal() {
            return None;
        }
        session.fail(reason.to_string(), now);
        Some(OtaAction::Abort { node_id: node_id.to_string(), reason: reason.to_string() })
    }

    /// Enforces OFFERED/ACK-gap/VERIFY timeouts; returns the abort
    /// actions for any session that timed out.
    pub fn check_timeouts(&mut self, now: f64, offer_timeout: f64, chunk_ack_timeout: f64, verify_timeout: f64) -> Vec<OtaAction> {
        let mut actions = Vec::new();
        for session in self.sessions.values_mut() {
            if session.state.is_terminal() {
                continue;
            }
            let elapsed = now - session.updated_at;
            let timed_out = match session.state {
                OtaState::Offered => elapsed > offer_timeout,
                OtaState::Transferring => elapsed > chunk_ack_timeout,
                OtaState::Verifying => elapsed > verify_timeout,
                OtaState::Complete | OtaState::Failed | OtaState::Rejected => false,
            };
            if timed_out {
                warn!(node_id = %session.node_id, state = ?session.state, "ota: session timed out");
                session.fail("timeout", now);
                actions.push(OtaAction::Abort { node_id: session.node_id.clone(), reason: "timeout".to_string() });
            }
        }
        actions
    }

    /// Drops terminal sessions older than [`TERMINAL_SESSION_TTL`].
    pub fn garbage_collect(&mut self, now: f64) {
        self.sessions.retain(|_, session| !(session.state.is_terminal() && now - session.updated_at > TERMINAL_SESSION_TTL));
    }
}
