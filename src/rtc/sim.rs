//! Simulierte Verbindungen für Tests
//!
//! `SimNetwork` verbindet die Links beider Seiten eines Anrufs im
//! Speicher: wendet der Anrufer das Answer an, gehen beide Links auf
//! `Connected`, ein ideales Netz ohne Verlust. Zustände und Statistik
//! lassen sich für Fehler- und Qualitäts-Szenarien von außen setzen.

use crate::rtc::link::{LinkEvent, LinkState, PeerConnector, PeerLink, SignalingError, TransportStats};
use crate::rtc::media::{
    AudioTrack, LocalMedia, MediaAcquisitionError, MediaConstraints, MediaDevices,
};
use crate::rtc::capture::AppVideoSource;
use crate::signaling::messages::{SignalBody, SignalPayload};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// NETWORK
// ============================================================================

pub(crate) struct SimNetwork {
    links: Mutex<HashMap<Uuid, Vec<Arc<SimLink>>>>,
    /// Lässt den nächsten Verbindungsaufbau scheitern
    pub fail_open: AtomicBool,
    /// Zählt alle `open`-Aufrufe, auch fehlgeschlagene
    pub open_attempts: AtomicUsize,
    /// Anzahl Kandidaten die pro Offer/Answer "entdeckt" werden
    pub candidates_per_exchange: AtomicUsize,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(HashMap::new()),
            fail_open: AtomicBool::new(false),
            open_attempts: AtomicUsize::new(0),
            candidates_per_exchange: AtomicUsize::new(2),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<SimConnector> {
        Arc::new(SimConnector {
            network: Arc::clone(self),
        })
    }

    pub fn links_for(&self, call_id: Uuid) -> Vec<Arc<SimLink>> {
        self.links.lock().get(&call_id).cloned().unwrap_or_default()
    }

    fn register(&self, link: Arc<SimLink>) {
        self.links.lock().entry(link.call_id).or_default().push(link);
    }

    /// Ideales Netz: beide Seiten erreichen `Connected`
    fn connect_call(&self, call_id: Uuid) {
        for link in self.links_for(call_id) {
            if !link.state().is_terminal() {
                link.force_state(LinkState::Connected);
            }
        }
    }
}

pub(crate) struct SimConnector {
    network: Arc<SimNetwork>,
}

#[async_trait]
impl PeerConnector for SimConnector {
    async fn open(&self, call_id: Uuid) -> Result<Arc<dyn PeerLink>, SignalingError> {
        self.network.open_attempts.fetch_add(1, Ordering::SeqCst);
        if self.network.fail_open.load(Ordering::SeqCst) {
            return Err(SignalingError::new("setup_connection", "simulated failure"));
        }

        let (events, _) = broadcast::channel(64);
        let link = Arc::new(SimLink {
            id: Uuid::new_v4(),
            call_id,
            state: Mutex::new(LinkState::New),
            events,
            network: Arc::clone(&self.network),
            attach_count: AtomicUsize::new(0),
            applied_candidates: AtomicUsize::new(0),
            fail_candidates: AtomicBool::new(false),
            scripted_stats: Mutex::new(TransportStats::default()),
            video_bitrate: AtomicU32::new(0),
        });

        self.network.register(Arc::clone(&link));
        Ok(link)
    }
}

// ============================================================================
// LINK
// ============================================================================

pub(crate) struct SimLink {
    pub id: Uuid,
    pub call_id: Uuid,
    state: Mutex<LinkState>,
    events: broadcast::Sender<LinkEvent>,
    network: Arc<SimNetwork>,
    pub attach_count: AtomicUsize,
    pub applied_candidates: AtomicUsize,
    pub fail_candidates: AtomicBool,
    scripted_stats: Mutex<TransportStats>,
    pub video_bitrate: AtomicU32,
}

impl SimLink {
    /// Setzt den Zustand von außen (Abbruch-Szenarien)
    pub fn force_state(&self, state: LinkState) {
        *self.state.lock() = state;
        let _ = self.events.send(LinkEvent::StateChanged(state));
    }

    /// Nächste Statistik-Stichprobe für die Qualitätsregelung
    pub fn set_stats(&self, stats: TransportStats) {
        *self.scripted_stats.lock() = stats;
    }

    fn emit_candidates(&self) {
        let count = self.network.candidates_per_exchange.load(Ordering::SeqCst);
        for n in 0..count {
            let payload = SignalPayload::ice_candidate(
                format!("candidate:sim-{}-{}", self.id, n),
                Some(0),
                Some("0".to_string()),
            );
            let _ = self.events.send(LinkEvent::LocalCandidate(payload));
        }
    }
}

#[async_trait]
impl PeerLink for SimLink {
    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> LinkState {
        *self.state.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn attach_media(&self, _media: &LocalMedia) -> Result<(), SignalingError> {
        self.attach_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SignalPayload, SignalingError> {
        let marker = if ice_restart { "restart" } else { "initial" };
        self.emit_candidates();
        Ok(SignalPayload::offer(format!("sim-sdp-{}-{}", marker, self.id)))
    }

    async fn create_answer(&self, offer: &SignalPayload) -> Result<SignalPayload, SignalingError> {
        let SignalBody::Offer { .. } = &offer.body else {
            return Err(SignalingError::new("create_answer", "payload is not an offer"));
        };
        self.emit_candidates();
        Ok(SignalPayload::answer(format!("sim-sdp-answer-{}", self.id)))
    }

    async fn apply_answer(&self, answer: &SignalPayload) -> Result<(), SignalingError> {
        let SignalBody::Answer { .. } = &answer.body else {
            return Err(SignalingError::new("apply_answer", "payload is not an answer"));
        };
        self.network.connect_call(self.call_id);
        Ok(())
    }

    async fn apply_remote_candidate(
        &self,
        candidate: &SignalPayload,
    ) -> Result<(), SignalingError> {
        let SignalBody::IceCandidate { .. } = &candidate.body else {
            return Err(SignalingError::new(
                "apply_remote_candidate",
                "payload is not a candidate",
            ));
        };
        if self.fail_candidates.load(Ordering::SeqCst) {
            return Err(SignalingError::new(
                "apply_remote_candidate",
                "simulated candidate failure",
            ));
        }
        self.applied_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, SignalingError> {
        Ok(*self.scripted_stats.lock())
    }

    fn set_video_bitrate(&self, bps: u32) {
        self.video_bitrate.store(bps, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.force_state(LinkState::Closed);
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

pub(crate) struct SimAudioTrack {
    muted: AtomicBool,
}

impl AudioTrack for SimAudioTrack {
    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn level(&self) -> f32 {
        0.0
    }
}

/// Geräte-Double: zählt Zugriffe und kann den Zugriff verweigern
pub(crate) struct SimMediaDevices {
    pub acquired: AtomicUsize,
    pub deny: AtomicBool,
}

impl SimMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            acquired: AtomicUsize::new(0),
            deny: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MediaDevices for SimMediaDevices {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMedia, MediaAcquisitionError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaAcquisitionError::AccessDenied(
                "simulated denial".to_string(),
            ));
        }

        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia {
            audio: constraints.audio.then(|| {
                Arc::new(SimAudioTrack {
                    muted: AtomicBool::new(false),
                }) as Arc<dyn AudioTrack>
            }),
            video: constraints
                .video
                .map(|c| Arc::new(AppVideoSource::new(c)) as _),
        })
    }
}
