//! Produktions-Backend über webrtc-rs
//!
//! Baut die Peer-Verbindung mit Media-Engine, Default-Interceptors und
//! Max-Bundle-Multiplexing und verdrahtet die Callbacks auf
//! `LinkEvent`s. Die Engine sieht davon nur das `PeerLink`-Trait.

use crate::config::EngineConfig;
use crate::rtc::link::{LinkEvent, LinkState, PeerConnector, PeerLink, SignalingError, TransportStats};
use crate::rtc::media::{LocalMedia, MediaKind, VideoTrack};
use crate::signaling::messages::{SignalBody, SignalPayload};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONNECTOR
// ============================================================================

/// Baut webrtc-rs Verbindungen aus der Engine-Konfiguration
pub struct WebRtcConnector {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnector {
    pub fn new(config: &EngineConfig) -> Self {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();

        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(&self, call_id: Uuid) -> Result<Arc<dyn PeerLink>, SignalingError> {
        // Media Engine mit Standard-Codecs konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SignalingError::new("setup_connection", e))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SignalingError::new("setup_connection", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        // Max-Bundle: alle Tracks über eine Transport-Verbindung
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| SignalingError::new("setup_connection", e))?,
        );

        let (events, _) = broadcast::channel(64);
        let link = Arc::new(WebRtcLink {
            id: Uuid::new_v4(),
            call_id,
            pc,
            state: Arc::new(Mutex::new(LinkState::New)),
            events,
            video_bitrate: AtomicU32::new(0),
            forward_tasks: Mutex::new(Vec::new()),
        });

        link.register_handlers();
        tracing::info!("Opened peer connection {} for call {}", link.id, call_id);

        Ok(link)
    }
}

// ============================================================================
// LINK
// ============================================================================

/// Eine webrtc-rs Peer-Verbindung
pub struct WebRtcLink {
    id: Uuid,
    call_id: Uuid,
    pc: Arc<RTCPeerConnection>,
    state: Arc<Mutex<LinkState>>,
    events: broadcast::Sender<LinkEvent>,
    video_bitrate: AtomicU32,
    forward_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcLink {
    /// Registriert die Callback-Handler der Peer Connection
    fn register_handlers(&self) {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);

                let new_state = match s {
                    RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
                    RTCPeerConnectionState::Connected => Some(LinkState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(LinkState::Failed),
                    RTCPeerConnectionState::Closed => Some(LinkState::Closed),
                    _ => None,
                };

                if let Some(new_state) = new_state {
                    *state.lock() = new_state;
                    let _ = events.send(LinkEvent::StateChanged(new_state));
                }

                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let payload = SignalPayload::ice_candidate(
                            json.candidate,
                            json.sdp_mline_index,
                            json.sdp_mid,
                        );
                        let _ = events.send(LinkEvent::LocalCandidate(payload));
                    }
                    Err(e) => {
                        tracing::warn!("Failed to serialize ICE candidate: {}", e);
                    }
                }
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                if state == RTCIceGathererState::Complete {
                    let _ = events.send(LinkEvent::GatheringComplete);
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            tracing::info!("Received remote track: {:?}", track.codec());
            let _ = events.send(LinkEvent::RemoteTrack { kind });
            Box::pin(async move {})
        }));
    }

    fn set_state(&self, new_state: LinkState) {
        *self.state.lock() = new_state;
        let _ = self.events.send(LinkEvent::StateChanged(new_state));
    }

    /// Leitet Frames der Video-Quelle in den ausgehenden Track
    fn spawn_video_forwarder(
        &self,
        video: Arc<dyn VideoTrack>,
        track: Arc<TrackLocalStaticSample>,
    ) {
        let call_id = self.call_id;
        let mut frames = video.subscribe_frames();

        let handle = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        let sample = Sample {
                            data: frame.data,
                            duration: frame.duration,
                            ..Default::default()
                        };
                        if let Err(e) = track.write_sample(&sample).await {
                            tracing::warn!("Failed to write video sample: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!("Video forwarder for call {} lagged ({})", call_id, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.forward_tasks.lock().push(handle);
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> LinkState {
        *self.state.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn attach_media(&self, media: &LocalMedia) -> Result<(), SignalingError> {
        if media.audio.is_some() {
            let audio_track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 1,
                    ..Default::default()
                },
                "audio".to_string(),
                "visavis".to_string(),
            ));

            self.pc
                .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| SignalingError::new("attach_media", e))?;
        }

        if let Some(video) = &media.video {
            let video_track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_string(),
                "visavis".to_string(),
            ));

            self.pc
                .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| SignalingError::new("attach_media", e))?;

            self.spawn_video_forwarder(Arc::clone(video), video_track);
        }

        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SignalPayload, SignalingError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| SignalingError::new("create_offer", e))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| SignalingError::new("create_offer", e))?;

        Ok(SignalPayload::offer(offer.sdp))
    }

    async fn create_answer(&self, offer: &SignalPayload) -> Result<SignalPayload, SignalingError> {
        let SignalBody::Offer { sdp } = &offer.body else {
            return Err(SignalingError::new("create_answer", "payload is not an offer"));
        };

        let offer = RTCSessionDescription::offer(sdp.clone())
            .map_err(|e| SignalingError::new("create_answer", e))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| SignalingError::new("create_answer", e))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SignalingError::new("create_answer", e))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| SignalingError::new("create_answer", e))?;

        Ok(SignalPayload::answer(answer.sdp))
    }

    async fn apply_answer(&self, answer: &SignalPayload) -> Result<(), SignalingError> {
        let SignalBody::Answer { sdp } = &answer.body else {
            return Err(SignalingError::new("apply_answer", "payload is not an answer"));
        };

        let answer = RTCSessionDescription::answer(sdp.clone())
            .map_err(|e| SignalingError::new("apply_answer", e))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| SignalingError::new("apply_answer", e))
    }

    async fn apply_remote_candidate(
        &self,
        candidate: &SignalPayload,
    ) -> Result<(), SignalingError> {
        let SignalBody::IceCandidate {
            candidate,
            sdp_mline_index,
            sdp_mid,
        } = &candidate.body
        else {
            return Err(SignalingError::new(
                "apply_remote_candidate",
                "payload is not a candidate",
            ));
        };

        let init = RTCIceCandidateInit {
            candidate: candidate.clone(),
            sdp_mid: sdp_mid.clone(),
            sdp_mline_index: *sdp_mline_index,
            username_fragment: None,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| SignalingError::new("apply_remote_candidate", e))
    }

    async fn stats(&self) -> Result<TransportStats, SignalingError> {
        let report = self.pc.get_stats().await;

        let mut stats = TransportStats::default();
        for (_id, stat) in report.reports.iter() {
            match stat {
                StatsReportType::CandidatePair(pair) => {
                    // Das nominierte Paar trägt den gesamten Verkehr
                    if pair.nominated {
                        stats.bytes_received = pair.bytes_received;
                        stats.packets_received = pair.packets_received as u64;
                    }
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    // Receiver-Reports der Gegenseite: Verluste und Jitter
                    // unseres ausgehenden Streams
                    stats.packets_lost += remote.packets_lost;
                    if remote.jitter > stats.jitter_secs {
                        stats.jitter_secs = remote.jitter;
                    }
                }
                _ => {}
            }
        }

        Ok(stats)
    }

    fn set_video_bitrate(&self, bps: u32) {
        self.video_bitrate.store(bps, Ordering::Relaxed);
    }

    async fn close(&self) {
        for handle in self.forward_tasks.lock().drain(..) {
            handle.abort();
        }

        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection {}: {}", self.id, e);
        }

        self.set_state(LinkState::Closed);
    }
}

impl std::fmt::Debug for WebRtcLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcLink")
            .field("id", &self.id)
            .field("call_id", &self.call_id)
            .field("state", &self.state())
            .finish()
    }
}
