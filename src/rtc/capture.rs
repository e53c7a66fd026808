//! Geräte-Zugriff: Mikrofon-Capture und Video-Quelle
//!
//! Verwendet cpal für Cross-Platform Audio-Input. Video-Frames liefert
//! die einbettende Anwendung bereits kodiert über `AppVideoSource`;
//! einen portablen Kamera-Backend gibt es in diesem Stack nicht.

use crate::rtc::media::{
    AudioTrack, LocalMedia, MediaAcquisitionError, MediaConstraints, MediaDevices, VideoConstraints,
    VideoFrame, VideoTrack,
};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::{Mutex, RwLock};
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für den Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

/// Mikrofon-Aufnahme über cpal
///
/// Note: Stream ist nicht Send, daher wrappen wir in einen Send-fähigen
/// Container und stoppen durch Droppen des Streams.
pub struct MicrophoneCapture {
    stream: Mutex<Option<Stream>>,
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,
    is_muted: Arc<AtomicBool>,
    input_level: Arc<Mutex<f32>>,
}

unsafe impl Send for MicrophoneCapture {}
unsafe impl Sync for MicrophoneCapture {}

impl MicrophoneCapture {
    /// Öffnet das Standard-Eingabegerät und startet die Aufnahme
    pub fn start() -> Result<Self, MediaAcquisitionError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(MediaAcquisitionError::NoMicrophone)?;

        let config = Self::find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let is_muted = Arc::new(AtomicBool::new(false));
        let input_level = Arc::new(Mutex::new(0.0f32));

        let buffer_clone = Arc::clone(&capture_buffer);
        let muted_clone = Arc::clone(&is_muted);
        let level_clone = Arc::clone(&input_level);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Audio Level berechnen (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *level_clone.lock() = rms.min(1.0);

                    if muted_clone.load(Ordering::Relaxed) {
                        return;
                    }

                    let mut buffer = buffer_clone.lock();
                    for sample in data {
                        let _ = buffer.try_push(*sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaAcquisitionError::CaptureFailed(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaAcquisitionError::CaptureFailed(e.to_string()))?;

        Ok(Self {
            stream: Mutex::new(Some(stream)),
            capture_buffer,
            is_muted,
            input_level,
        })
    }

    /// Liest einen Frame von aufgenommenem Audio (für Encoder/Anbindung)
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    /// Stoppt die Aufnahme
    pub fn stop(&self) {
        *self.stream.lock() = None;
        tracing::info!("Audio capture stopped");
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaAcquisitionError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| MediaAcquisitionError::AccessDenied(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Wählt die beste Konfiguration aus einer Liste
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, MediaAcquisitionError> {
        // Priorität: 48kHz > andere, F32 > andere
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(MediaAcquisitionError::CaptureFailed(
            "No suitable audio configuration found".to_string(),
        ))
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AudioTrack for MicrophoneCapture {
    fn set_muted(&self, muted: bool) {
        self.is_muted.store(muted, Ordering::Relaxed);
        tracing::debug!("Audio muted: {}", muted);
    }

    fn is_muted(&self) -> bool {
        self.is_muted.load(Ordering::Relaxed)
    }

    fn level(&self) -> f32 {
        *self.input_level.lock()
    }
}

// ============================================================================
// VIDEO SOURCE
// ============================================================================

/// Video-Quelle, die von der Anwendung mit kodierten Frames gefüttert wird
pub struct AppVideoSource {
    constraints: RwLock<VideoConstraints>,
    enabled: AtomicBool,
    max_bitrate: AtomicU32,
    frames_tx: broadcast::Sender<VideoFrame>,
}

impl AppVideoSource {
    pub fn new(constraints: VideoConstraints) -> Self {
        let (frames_tx, _) = broadcast::channel(64);
        Self {
            constraints: RwLock::new(constraints),
            enabled: AtomicBool::new(true),
            max_bitrate: AtomicU32::new(0),
            frames_tx,
        }
    }

    /// Nimmt ein kodiertes Frame entgegen; bei deaktivierter Kamera
    /// wird es verworfen
    pub fn push_frame(&self, data: Bytes, duration: Duration) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.frames_tx.send(VideoFrame { data, duration });
    }
}

impl VideoTrack for AppVideoSource {
    fn constraints(&self) -> VideoConstraints {
        *self.constraints.read()
    }

    fn apply_constraints(&self, constraints: VideoConstraints) {
        *self.constraints.write() = constraints;
        tracing::debug!(
            "Video constraints: {}x{} @{}fps",
            constraints.width,
            constraints.height,
            constraints.frame_rate
        );
    }

    fn set_max_bitrate(&self, bps: u32) {
        self.max_bitrate.store(bps, Ordering::Relaxed);
    }

    fn max_bitrate(&self) -> u32 {
        self.max_bitrate.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<VideoFrame> {
        self.frames_tx.subscribe()
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

/// Geräte-Backend: Mikrofon über cpal, Video über `AppVideoSource`
pub struct CpalMediaDevices;

#[async_trait]
impl MediaDevices for CpalMediaDevices {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMedia, MediaAcquisitionError> {
        let audio: Option<Arc<dyn AudioTrack>> = if constraints.audio {
            Some(Arc::new(MicrophoneCapture::start()?))
        } else {
            None
        };

        let video: Option<Arc<dyn VideoTrack>> = constraints
            .video
            .map(|c| Arc::new(AppVideoSource::new(c)) as Arc<dyn VideoTrack>);

        Ok(LocalMedia { audio, video })
    }
}

// ============================================================================
// TESTS
// ============================================================================
