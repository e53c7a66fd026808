//! Transport-Verbindung als Trait-Naht
//!
//! `PeerLink` abstrahiert die eigentliche Peer-Verbindung: die Engine
//! redet nur über dieses Trait mit dem Transport, Tests fahren eine
//! simulierte Verbindung, die Produktion webrtc-rs. Zustandswechsel,
//! lokale Kandidaten und Remote-Tracks kommen als Events über einen
//! Broadcast-Kanal statt über direkte Kopplung.

use crate::rtc::media::{LocalMedia, MediaKind};
use crate::signaling::messages::SignalPayload;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler im Offer/Answer/Candidate-Austausch, mit Namen der Operation
#[derive(Error, Debug, Clone)]
#[error("Signaling operation '{operation}' failed: {reason}")]
pub struct SignalingError {
    pub operation: &'static str,
    pub reason: String,
}

impl SignalingError {
    pub(crate) fn new(operation: &'static str, reason: impl ToString) -> Self {
        Self {
            operation,
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// LINK STATE & EVENTS
// ============================================================================

/// Zustand der Transport-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Terminale Zustände: die Verbindung wird aus dem Pool entfernt
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

/// Events einer Peer-Verbindung
#[derive(Debug, Clone)]
pub enum LinkEvent {
    StateChanged(LinkState),
    /// Lokal entdeckter ICE-Kandidat, versandfertig als Payload
    LocalCandidate(SignalPayload),
    GatheringComplete,
    RemoteTrack { kind: MediaKind },
}

// ============================================================================
// STATS
// ============================================================================

/// Roh-Statistik der Verbindung (kumulativ seit Aufbau)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: i64,
    pub jitter_secs: f64,
}

// ============================================================================
// LINK TRAIT
// ============================================================================

/// Eine Peer-Verbindung für genau einen Anruf
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn id(&self) -> Uuid;
    fn state(&self) -> LinkState;
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;

    /// Hängt lokale Tracks an die Verbindung
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), SignalingError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self, ice_restart: bool) -> Result<SignalPayload, SignalingError>;

    /// Wendet das Remote-Offer an und erstellt das Answer
    async fn create_answer(&self, offer: &SignalPayload) -> Result<SignalPayload, SignalingError>;

    /// Wendet das Remote-Answer an
    async fn apply_answer(&self, answer: &SignalPayload) -> Result<(), SignalingError>;

    /// Fügt einen Remote-Kandidaten hinzu
    async fn apply_remote_candidate(
        &self,
        candidate: &SignalPayload,
    ) -> Result<(), SignalingError>;

    async fn stats(&self) -> Result<TransportStats, SignalingError>;

    /// Obergrenze für die ausgehende Video-Bitrate
    fn set_video_bitrate(&self, bps: u32);

    async fn close(&self);
}

/// Baut Peer-Verbindungen
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(&self, call_id: Uuid) -> Result<std::sync::Arc<dyn PeerLink>, SignalingError>;
}
