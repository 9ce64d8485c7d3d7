use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtaState {
    Offered,
    Transferring,
    Verifying,
    Complete,
    Failed,
    Rejected,
}

impl OtaState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OtaState::Complete | OtaState::Failed | OtaState::Rejected)
    }
}

/// One in-flight or completed firmware transfer to a device (spec §3,
/// §4.13). At most one non-terminal session exists per `node_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaSession {
    pub node_id: String,
    pub firmware_id: String,
    pub state: OtaState,
    pub next_seq: u64,
    pub acked_seq: Option<u64>,
    pub total_chunks: u64,
    pub chunk_size: usize,
    pub sha256: String,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OtaSession {
    pub fn new(node_id: impl Into<String>, firmware_id: impl Into<String>, total_chunks: u64, chunk_size: usize, sha256: impl Into<String>, now: f64) -> Self {
        Self {
            node_id: node_id.into(),
            firmware_id: firmware_id.into(),
            state: OtaState::Offered,
            next_seq: 0,
            acked_seq: None,
            total_chunks,
            chunk_size,
            sha256: sha256.into(),
            created_at: now,
            updated_at: now,
            reason: None,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: f64) {
        self.state = OtaState::Failed;
        self.reason = Some(reason.into());
        self.updated_at = now;
    }
}
