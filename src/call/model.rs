//! Datenmodell: Call-Records und Signale
//!
//! Ein `Call` beschreibt eine Sitzung zwischen zwei Identitäten, ein
//! `Signal` einen einzelnen Schritt im Offer/Answer/Candidate-Austausch.
//! Beide werden über den externen Store persistiert; Signale sind
//! append-only und werden von der Engine nie verändert oder gelöscht.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// CALL
// ============================================================================

/// Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Ausgehender Anruf wird aufgebaut
    Calling,
    /// Angenommen, Verbindung wird verhandelt
    Ringing,
    /// Verbindung steht
    Active,
    /// Regulär beendet
    Ended,
    /// Vom Empfänger abgelehnt
    Declined,
    /// Aufbau fehlgeschlagen
    Failed,
}

impl CallStatus {
    /// Terminale Status: der Record ist danach unveränderlich
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Declined | CallStatus::Failed)
    }
}

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Video,
    Audio,
}

/// Ein Anruf zwischen zwei Identitäten
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: Uuid,
    pub room_id: String,
    pub caller: String,
    pub receiver: String,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub end_reason: Option<String>,
}

impl Call {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Ist die gegebene Identität an diesem Anruf beteiligt?
    pub fn involves(&self, identity: &str) -> bool {
        self.caller == identity || self.receiver == identity
    }
}

/// Neuer Anruf ohne ID (für `CallStore::create_call`)
#[derive(Debug, Clone)]
pub struct NewCall {
    pub room_id: String,
    pub caller: String,
    pub receiver: String,
    pub kind: CallKind,
}

/// Teil-Update eines Calls (`None` = Feld bleibt unverändert)
#[derive(Debug, Clone, Default)]
pub struct CallPatch {
    pub status: Option<CallStatus>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub end_reason: Option<String>,
}

// ============================================================================
// SIGNAL
// ============================================================================

/// Art eines Signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// Offer und Answer werden sofort versendet, Kandidaten gesammelt
    pub fn is_priority(self) -> bool {
        !matches!(self, SignalKind::IceCandidate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
        }
    }
}

/// Ein persistiertes Signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub call_id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub kind: SignalKind,
    /// Versionierte, kind-spezifische Payload (siehe `signaling::messages`)
    pub payload: serde_json::Value,
    /// Vom Store vergebene, pro Anruf monotone Sequenznummer
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

/// Neues Signal ohne ID/Sequenz (für `SignalTransport::send`)
#[derive(Debug, Clone)]
pub struct NewSignal {
    pub call_id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub kind: SignalKind,
    pub payload: serde_json::Value,
}

// ============================================================================
// METRICS
// ============================================================================

/// Flüchtige Verbindungs-Metriken eines aktiven Anrufs.
///
/// Nur im Speicher; geht der Prozess verloren, gehen sie mit.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConnectionMetrics {
    pub connect_latency_ms: Option<u64>,
    pub ice_gathering_ms: Option<u64>,
    pub bandwidth_bps: u64,
    pub packet_loss: f64,
    pub jitter_ms: f64,
}
