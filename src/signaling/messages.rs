//! Wire-Format für Signal-Payloads
//!
//! Jede Payload trägt eine Versionsnummer, damit das Format später
//! erweitert werden kann ohne alte Clients stillschweigend zu brechen.
//! Vor dem Versand wird Form und Größe geprüft; was nicht passt wird
//! abgelehnt statt gesendet.

use crate::call::model::{Signal, SignalKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Aktuelle Payload-Version
pub const PAYLOAD_VERSION: u32 = 1;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    #[error("Payload exceeds {limit} bytes (got {size})")]
    Oversized { size: usize, limit: usize },

    #[error("Unsupported payload version {0}")]
    UnsupportedVersion(u32),

    #[error("Payload does not match signal kind {kind:?}: {reason}")]
    Malformed { kind: SignalKind, reason: String },

    #[error("Failed to encode payload: {0}")]
    Encode(String),
}

// ============================================================================
// SIGNAL PAYLOAD
// ============================================================================

/// Kind-spezifischer Inhalt eines Signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalBody {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
    },
}

/// Versionierte Hülle um den Payload-Inhalt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub v: u32,
    #[serde(flatten)]
    pub body: SignalBody,
}

impl SignalPayload {
    pub fn offer(sdp: String) -> Self {
        Self {
            v: PAYLOAD_VERSION,
            body: SignalBody::Offer { sdp },
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            v: PAYLOAD_VERSION,
            body: SignalBody::Answer { sdp },
        }
    }

    pub fn ice_candidate(
        candidate: String,
        sdp_mline_index: Option<u16>,
        sdp_mid: Option<String>,
    ) -> Self {
        Self {
            v: PAYLOAD_VERSION,
            body: SignalBody::IceCandidate {
                candidate,
                sdp_mline_index,
                sdp_mid,
            },
        }
    }

    /// Die Signal-Art zu der diese Payload gehört
    pub fn kind(&self) -> SignalKind {
        match self.body {
            SignalBody::Offer { .. } => SignalKind::Offer,
            SignalBody::Answer { .. } => SignalKind::Answer,
            SignalBody::IceCandidate { .. } => SignalKind::IceCandidate,
        }
    }

    /// Prüft Form und Größe und serialisiert für den Versand
    pub fn encode(&self, max_bytes: usize) -> Result<Value, ValidationError> {
        self.check_shape()?;

        let value =
            serde_json::to_value(self).map_err(|e| ValidationError::Encode(e.to_string()))?;

        let size = value.to_string().len();
        if size > max_bytes {
            return Err(ValidationError::Oversized {
                size,
                limit: max_bytes,
            });
        }

        Ok(value)
    }

    /// Parst eine empfangene Payload und prüft Version und Signal-Art
    pub fn decode(kind: SignalKind, value: &Value) -> Result<Self, ValidationError> {
        let payload: SignalPayload =
            serde_json::from_value(value.clone()).map_err(|e| ValidationError::Malformed {
                kind,
                reason: e.to_string(),
            })?;

        if payload.v != PAYLOAD_VERSION {
            return Err(ValidationError::UnsupportedVersion(payload.v));
        }

        if payload.kind() != kind {
            return Err(ValidationError::Malformed {
                kind,
                reason: format!("payload is a {:?}", payload.kind()),
            });
        }

        Ok(payload)
    }

    fn check_shape(&self) -> Result<(), ValidationError> {
        let (kind, ok) = match &self.body {
            SignalBody::Offer { sdp } => (SignalKind::Offer, !sdp.trim().is_empty()),
            SignalBody::Answer { sdp } => (SignalKind::Answer, !sdp.trim().is_empty()),
            SignalBody::IceCandidate { candidate, .. } => {
                (SignalKind::IceCandidate, !candidate.trim().is_empty())
            }
        };

        if ok {
            Ok(())
        } else {
            Err(ValidationError::Malformed {
                kind,
                reason: "empty body".to_string(),
            })
        }
    }
}

// ============================================================================
// WEBSOCKET FRAMES
// ============================================================================

/// Signal in Transport-Darstellung
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSignal {
    pub id: Uuid,
    #[serde(rename = "callId")]
    pub call_id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub kind: SignalKind,
    pub payload: Value,
    pub seq: i64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl From<Signal> for WireSignal {
    fn from(signal: Signal) -> Self {
        Self {
            id: signal.id,
            call_id: signal.call_id,
            sender: signal.sender,
            receiver: signal.receiver,
            kind: signal.kind,
            payload: signal.payload,
            seq: signal.seq,
            created_at: signal.created_at,
        }
    }
}

impl From<WireSignal> for Signal {
    fn from(wire: WireSignal) -> Self {
        Self {
            id: wire.id,
            call_id: wire.call_id,
            sender: wire.sender,
            receiver: wire.receiver,
            kind: wire.kind,
            payload: wire.payload,
            seq: wire.seq,
            created_at: wire.created_at,
        }
    }
}

/// Client → Gateway Nachrichten
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Anmeldung mit der eigenen (bereits verifizierten) Identität
    Hello { identity: String },
    /// Signal veröffentlichen
    Publish { signal: WireSignal },
    Heartbeat,
}

/// Gateway → Client Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome { identity: String },
    Signal { signal: WireSignal },
    Pong,
    Error { code: i32, message: String },
}

// ============================================================================
// TESTS
// ============================================================================
