//! Visavis - P2P Video Call Engine
//!
//! Eine Engine für 1:1 Audio/Video-Anrufe mit:
//! - Offer/Answer/ICE-Signaling über einen externen Kanal
//! - WebRTC-Transport mit Verbindungs-Pool
//! - Adaptiver Video-Qualität nach Netzlage
//! - Automatischer Wiederverbindung mit Backoff
//!
//! Persistenz, Berechtigungen und Analytics sind externe Mitspieler und
//! werden als Traits injiziert (`platform`); UI und Codecs liegen bei
//! der einbettenden Anwendung.

pub mod call;
pub mod config;
pub mod platform;
pub mod rtc;
pub mod signaling;

pub use call::{
    Call, CallEngine, CallEngineError, CallKind, CallStatus, EngineDeps, EngineEvent,
    ErrorCategory, Signal, SignalKind,
};
pub use config::EngineConfig;
pub use rtc::{LinkState, MediaStreamState, QualityTier};

/// Initialisiert das Logging (einmal pro Prozess aufrufen)
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("visavis=debug".parse().unwrap())
                .add_directive("webrtc=warn".parse().unwrap()),
        )
        .init();
}
