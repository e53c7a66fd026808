//! Event-Typen der Engine
//!
//! Alle Zustandsübergänge werden als getypte Events über einen
//! Broadcast-Kanal publiziert. Die Engine kennt ihre Abonnenten nicht;
//! UI, Analytics und Fehler-Reporting hören unabhängig voneinander mit.

use crate::call::model::{Call, SignalKind};
use crate::rtc::link::LinkState;
use crate::rtc::media::MediaKind;
use crate::rtc::quality::QualityTier;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// ERROR EVENTS
// ============================================================================

/// Kategorie eines Fehler-Events, damit die UI zwischen Berechtigungs-,
/// Netzwerk- und Limit-Problemen unterscheiden kann
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Media,
    Permission,
    RateLimit,
    Validation,
    Signaling,
    Connection,
    Reconnect,
    Store,
}

/// Ein aufgetretener Fehler als Event
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub call_id: Option<Uuid>,
    pub category: ErrorCategory,
    pub message: String,
}

// ============================================================================
// ENGINE EVENTS
// ============================================================================

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Ein Call-Record wurde angelegt
    CallCreated(Call),
    /// Ein Call-Record hat sich geändert (Statuswechsel inklusive)
    CallUpdated(Call),
    /// Eingehender Anruf für die eigene Identität
    IncomingCall(Call),
    /// Signal für einen lokalen Anruf empfangen
    SignalReceived {
        call_id: Uuid,
        kind: SignalKind,
        sender: String,
    },
    /// Zustandswechsel der Transport-Verbindung
    ConnectionState { call_id: Uuid, state: LinkState },
    /// Remote-Track eingetroffen
    RemoteTrack { call_id: Uuid, kind: MediaKind },
    /// Qualitätsstufe wurde angepasst
    QualityChanged { call_id: Uuid, tier: QualityTier },
    /// Fehler (setup-fatal oder terminal nach erschöpften Retries)
    Error(ErrorEvent),
}

// ============================================================================
// EVENT BUS
// ============================================================================

/// Broadcast-Hülle um den Event-Kanal
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn emit_error(
        &self,
        call_id: Option<Uuid>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) {
        self.emit(EngineEvent::Error(ErrorEvent {
            call_id,
            category,
            message: message.into(),
        }));
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}
