//! RTC-Schicht: Verbindung, Medien, Qualität und Wiederverbindung
//!
//! Dieses Modul verwaltet:
//! - Peer-Verbindungen samt Pool (`connection`, `webrtc`)
//! - Medien-Aufnahme und Stream-Zustand (`media`, `capture`)
//! - Qualitätsregelung des ausgehenden Videos (`quality`)
//! - Wiederverbindung mit Backoff (`resilience`)

pub mod capture;
pub mod connection;
pub mod link;
pub mod media;
pub mod quality;
pub mod resilience;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod sim;

pub use self::capture::{AppVideoSource, CpalMediaDevices, MicrophoneCapture};
pub use self::connection::{ConnectionManager, ConnectionPool};
pub use self::link::{LinkEvent, LinkState, PeerConnector, PeerLink, SignalingError, TransportStats};
pub use self::media::{
    AudioTrack, LocalMedia, MediaAcquisitionError, MediaConstraints, MediaDevices, MediaKind,
    MediaStreamState, StreamDescriptor, VideoConstraints, VideoFrame, VideoTrack,
};
pub use self::quality::{select_tier, QualityTier};
pub use self::resilience::RetryState;
pub use self::webrtc::WebRtcConnector;
