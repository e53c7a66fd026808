//! Medien-Constraints und Stream-Zustand
//!
//! `MediaDevices` ist die Naht zur Plattform: Kamera/Mikrofon anfordern
//! schlägt mit `MediaAcquisitionError` fehl und wird nie automatisch
//! wiederholt; der Fehler gehört dem Benutzer gezeigt.

use crate::call::model::CallKind;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaAcquisitionError {
    #[error("No microphone available")]
    NoMicrophone,

    #[error("No camera available")]
    NoCamera,

    #[error("Media access denied: {0}")]
    AccessDenied(String),

    #[error("Failed to start capture: {0}")]
    CaptureFailed(String),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Art eines Medien-Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Auflösung und Bildrate des Video-Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// Angeforderte Medien eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Start-Constraints für die Anruf-Art (Video beginnt bei 720p)
    pub fn for_kind(kind: CallKind) -> Self {
        Self {
            audio: true,
            video: match kind {
                CallKind::Video => Some(VideoConstraints {
                    width: 1280,
                    height: 720,
                    frame_rate: 30,
                }),
                CallKind::Audio => None,
            },
        }
    }
}

// ============================================================================
// TRACKS
// ============================================================================

/// Ein einzelnes Video-Frame (bereits kodiert, von der Anwendung geliefert)
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// Lokaler Audio-Track (Mikrofon)
pub trait AudioTrack: Send + Sync {
    fn set_muted(&self, muted: bool);
    fn is_muted(&self) -> bool;
    /// Eingangspegel 0.0 bis 1.0 für Visualisierung
    fn level(&self) -> f32;
}

/// Lokaler Video-Track
pub trait VideoTrack: Send + Sync {
    fn constraints(&self) -> VideoConstraints;
    /// Wendet neue Auflösung/Bildrate an (Qualitätsstufen-Wechsel)
    fn apply_constraints(&self, constraints: VideoConstraints);
    /// Obergrenze für den ausgehenden Encoder
    fn set_max_bitrate(&self, bps: u32);
    fn max_bitrate(&self) -> u32;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Frames für die Transport-Anbindung
    fn subscribe_frames(&self) -> broadcast::Receiver<VideoFrame>;
}

/// Lokale Medien eines Anrufs
#[derive(Clone, Default)]
pub struct LocalMedia {
    pub audio: Option<Arc<dyn AudioTrack>>,
    pub video: Option<Arc<dyn VideoTrack>>,
}

impl LocalMedia {
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            has_audio: self.audio.is_some(),
            has_video: self.video.is_some(),
            video: self.video.as_ref().map(|v| v.constraints()),
        }
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("has_audio", &self.audio.is_some())
            .field("has_video", &self.video.is_some())
            .finish()
    }
}

// ============================================================================
// STREAM STATE
// ============================================================================

/// Beschreibung eines Streams für UI und Analytics
#[derive(Debug, Clone, Serialize)]
pub struct StreamDescriptor {
    pub has_audio: bool,
    pub has_video: bool,
    pub video: Option<VideoConstraints>,
}

/// Lokaler/Remote Stream-Zustand eines Anrufs
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaStreamState {
    pub local: Option<StreamDescriptor>,
    pub remote: Option<StreamDescriptor>,
    pub camera_enabled: bool,
    pub microphone_enabled: bool,
}

// ============================================================================
// DEVICES TRAIT
// ============================================================================

/// Zugriff auf lokale Aufnahme-Geräte
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMedia, MediaAcquisitionError>;
}
