use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed enumeration of wire message types (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Chat,
    Command,
    Response,
    Ping,
    Pong,
    StateReport,
    EnrollRequest,
    EnrollResponse,
    OtaOffer,
    OtaAccept,
    OtaReject,
    OtaChunk,
    OtaChunkAck,
    OtaVerify,
    OtaComplete,
    OtaAbort,
    FederationHello,
    FederationSync,
    FederationCommand,
    FederationResponse,
    FederationState,
    FederationPing,
    FederationPong,
}

impl MessageType {
    /// Message types that may travel without AEAD encryption even when
    /// encryption is enabled (everything other than CHAT/COMMAND/RESPONSE
    /// to a known non-broadcast peer, per spec §4.5).
    pub fn is_encryptable(self) -> bool {
        matches!(self, MessageType::Chat | MessageType::Command | MessageType::Response)
    }
}

/// The broadcast target sentinel (spec §3: `target="*"`).
pub const BROADCAST_TARGET: &str = "*";

/// One atomic message on the wire (spec §3).
///
/// Invariant: at most one of `(payload non-empty)` and
/// `(encrypted_payload present)` holds for any message this crate emits.
/// `hmac` and `nonce` are either both present or both absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    pub ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageType, source: impl Into<String>, target: impl Into<String>, ts: f64) -> Self {
        Self {
            kind,
            source: source.into(),
            target: target.into(),
            payload: Map::new(),
            encrypted_payload: None,
            iv: None,
            ts,
            nonce: None,
            hmac: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target == BROADCAST_TARGET
    }

    pub fn is_signed(&self) -> bool {
        self.nonce.is_some() && self.hmac.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted_payload.is_some()
    }
}
