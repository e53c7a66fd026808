//! Call-Lifecycle-Engine
//!
//! Der oberste Orchestrator: besitzt die Call-Records für die Dauer der
//! Sitzung, ruft in alle anderen Komponenten und publiziert jeden
//! Übergang als Event. Zustände: `Calling → Ringing → Active → Ended`,
//! mit `Declined` und `Failed` als alternative Endzustände.
//!
//! Fehler beim Aufbau brechen den Aufbau komplett ab und räumen auf;
//! es bleibt kein halbfertiger Zustand zurück. Fehler im laufenden
//! Gespräch werden geschluckt und geloggt, damit der Anruf lebt.

use crate::call::events::{EngineEvent, ErrorCategory, EventBus};
use crate::call::model::{
    Call, CallKind, CallPatch, CallStatus, ConnectionMetrics, NewCall, Signal, SignalKind,
};
use crate::call::session::{CallRole, CallSession};
use crate::config::EngineConfig;
use crate::platform::{
    AnalyticsSink, CallAuthorizer, CallStore, CallUsageReport, ErrorReport, PermissionError,
    RateLimitError, RateLimiter, StoreError, StoreEvent,
};
use crate::rtc::connection::ConnectionManager;
use crate::rtc::link::{LinkEvent, LinkState, PeerConnector, PeerLink, SignalingError};
use crate::rtc::media::{
    MediaAcquisitionError, MediaConstraints, MediaDevices, MediaKind, MediaStreamState,
    StreamDescriptor,
};
use crate::rtc::quality::{apply_tier, spawn_quality_loop, QualityCtx, QualityTier};
use crate::rtc::resilience::{run_reconnect, ReconnectCtx, ReconnectOutcome};
use crate::signaling::dispatcher::{DispatchError, SignalDispatcher};
use crate::signaling::messages::{SignalPayload, ValidationError};
use crate::signaling::transport::{SignalTransport, TransportError};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("Call already in progress with {receiver} in room {room}")]
    CallInProgress { room: String, receiver: String },

    #[error("Unknown call: {0}")]
    UnknownCall(Uuid),

    #[error("Unexpected call state {0:?}")]
    InvalidCallState(CallStatus),

    #[error("Call has no active {0:?} track")]
    NoTrack(MediaKind),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<DispatchError> for CallEngineError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::Validation(e) => CallEngineError::Validation(e),
            DispatchError::RateLimited(e) => CallEngineError::RateLimited(e),
            DispatchError::Transport(e) => CallEngineError::Transport(e),
        }
    }
}

impl CallEngineError {
    /// Kategorie für Events und Analytics
    pub fn category(&self) -> ErrorCategory {
        match self {
            CallEngineError::Media(_) => ErrorCategory::Media,
            CallEngineError::Permission(_) => ErrorCategory::Permission,
            CallEngineError::RateLimited(_) => ErrorCategory::RateLimit,
            CallEngineError::Signaling(_) => ErrorCategory::Signaling,
            CallEngineError::Store(_) => ErrorCategory::Store,
            CallEngineError::Transport(_) => ErrorCategory::Connection,
            _ => ErrorCategory::Validation,
        }
    }
}

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// Externe Mitspieler der Engine, als Trait-Objekte injiziert
pub struct EngineDeps {
    pub store: Arc<dyn CallStore>,
    pub transport: Arc<dyn SignalTransport>,
    pub authorizer: Arc<dyn CallAuthorizer>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub media: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Die Call-Engine
#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn CallStore>,
    transport: Arc<dyn SignalTransport>,
    authorizer: Arc<dyn CallAuthorizer>,
    analytics: Arc<dyn AnalyticsSink>,
    manager: Arc<ConnectionManager>,
    dispatcher: SignalDispatcher,
    limiter: Arc<RateLimiter>,
    sessions: Mutex<HashMap<Uuid, Arc<CallSession>>>,
    events: EventBus,
}

impl CallEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let dispatcher =
            SignalDispatcher::new(&config, Arc::clone(&deps.transport), Arc::clone(&limiter));
        let manager = Arc::new(ConnectionManager::new(deps.connector, deps.media));

        let inner = Arc::new(EngineInner {
            config,
            store: deps.store,
            transport: deps.transport,
            authorizer: deps.authorizer,
            analytics: deps.analytics,
            manager,
            dispatcher,
            limiter,
            sessions: Mutex::new(HashMap::new()),
            events: EventBus::new(128),
        });

        EngineInner::spawn_signal_router(&inner);
        EngineInner::spawn_store_watcher(&inner);

        Self { inner }
    }

    /// Eigene Identität der Engine
    pub fn identity(&self) -> &str {
        &self.inner.config.identity
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Startet einen ausgehenden Anruf.
    ///
    /// Berechtigung und Rate-Limit werden geprüft bevor irgendetwas
    /// aufgebaut wird; das Offer ist versendet wenn der Aufruf zurückkehrt.
    pub async fn start_call(
        &self,
        room_id: impl Into<String>,
        receiver: impl Into<String>,
        kind: CallKind,
    ) -> Result<Call, CallEngineError> {
        let inner = &self.inner;
        let room_id = room_id.into();
        let receiver = receiver.into();
        let caller = inner.config.identity.clone();

        inner.limiter.check(&caller, "start_call")?;

        if !inner
            .authorizer
            .can_initiate_call(&caller, &room_id, &receiver)
            .await
        {
            return Err(CallEngineError::Permission(PermissionError {
                room: room_id,
                receiver,
            }));
        }

        // Höchstens ein nicht-terminaler Anruf pro (Anrufer, Empfänger, Raum)
        {
            let sessions = inner.sessions.lock();
            for session in sessions.values() {
                let call = session.call.read();
                if call.caller == caller
                    && call.receiver == receiver
                    && call.room_id == room_id
                    && !call.is_terminal()
                {
                    return Err(CallEngineError::CallInProgress {
                        room: room_id.clone(),
                        receiver: receiver.clone(),
                    });
                }
            }
        }

        let call = inner
            .store
            .create_call(NewCall {
                room_id,
                caller,
                receiver,
                kind,
            })
            .await?;
        tracing::info!("Starting call {} to {}", call.id, call.receiver);
        inner.events.emit(EngineEvent::CallCreated(call.clone()));

        let session = EngineInner::register_session(inner, call, CallRole::Caller);

        match EngineInner::setup_outgoing(inner, &session, kind).await {
            Ok(()) => Ok(session.snapshot()),
            Err(e) => {
                EngineInner::abort_setup(inner, &session, &e).await;
                Err(e)
            }
        }
    }

    /// Nimmt einen eingehenden Anruf an oder lehnt ihn ab
    pub async fn answer_call(&self, call_id: Uuid, accept: bool) -> Result<Call, CallEngineError> {
        let inner = &self.inner;
        let session = self.session(call_id)?;

        let status = session.snapshot().status;
        if status != CallStatus::Calling {
            return Err(CallEngineError::InvalidCallState(status));
        }

        if !accept {
            tracing::info!("Declining call {}", call_id);
            session.ending.store(true, Ordering::SeqCst);
            let patch = CallPatch {
                status: Some(CallStatus::Declined),
                ended_at: Some(Utc::now()),
                end_reason: Some("declined".to_string()),
                ..Default::default()
            };
            let updated = inner.store.update_call(call_id, patch).await?;
            session.set_call(updated.clone());
            EngineInner::teardown_session(inner, &session).await;
            inner.events.emit(EngineEvent::CallUpdated(updated.clone()));
            return Ok(updated);
        }

        let patch = CallPatch {
            status: Some(CallStatus::Ringing),
            ..Default::default()
        };
        let updated = inner.store.update_call(call_id, patch).await?;
        session.set_call(updated.clone());
        inner.events.emit(EngineEvent::CallUpdated(updated));

        match EngineInner::setup_incoming(inner, &session).await {
            Ok(()) => Ok(session.snapshot()),
            Err(e) => {
                EngineInner::abort_setup(inner, &session, &e).await;
                Err(e)
            }
        }
    }

    /// Beendet einen Anruf. Idempotent: der zweite Aufruf ist ein No-op.
    pub async fn end_call(
        &self,
        call_id: Uuid,
        reason: Option<String>,
    ) -> Result<(), CallEngineError> {
        let inner = &self.inner;
        let Some(session) = inner.sessions.lock().get(&call_id).cloned() else {
            // Unbekannt oder bereits abgeräumt
            return Ok(());
        };

        if session.is_terminal() || session.ending.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let now = Utc::now();
        let duration = session.duration_until(now);
        let patch = CallPatch {
            status: Some(CallStatus::Ended),
            answered_at: None,
            ended_at: Some(now),
            duration_secs: Some(duration),
            end_reason: reason,
        };

        match inner.store.update_call(call_id, patch).await {
            Ok(updated) => {
                tracing::info!("Call {} ended after {}s", call_id, duration);
                session.set_call(updated.clone());
                inner.events.emit(EngineEvent::CallUpdated(updated.clone()));

                inner
                    .analytics
                    .record_usage(CallUsageReport {
                        call_id,
                        kind: updated.kind,
                        status: updated.status,
                        duration_secs: updated.duration_secs.unwrap_or(duration),
                        reconnect_attempts: session.reconnect_attempts.load(Ordering::SeqCst),
                    })
                    .await;

                EngineInner::teardown_session(inner, &session).await;
                Ok(())
            }
            Err(StoreError::CallTerminal(_)) => {
                // Die Gegenseite war schneller; nur lokal aufräumen
                EngineInner::teardown_session(inner, &session).await;
                Ok(())
            }
            Err(e) => {
                session.ending.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Schaltet die Kamera um; gibt den neuen Zustand zurück
    pub fn toggle_camera(&self, call_id: Uuid) -> Result<bool, CallEngineError> {
        let session = self.session(call_id)?;
        let video = session
            .media
            .lock()
            .clone()
            .and_then(|m| m.video)
            .ok_or(CallEngineError::NoTrack(MediaKind::Video))?;

        let enabled = !video.is_enabled();
        video.set_enabled(enabled);
        session.stream_state.write().camera_enabled = enabled;
        Ok(enabled)
    }

    /// Schaltet das Mikrofon um; gibt den neuen Zustand zurück
    pub fn toggle_microphone(&self, call_id: Uuid) -> Result<bool, CallEngineError> {
        let session = self.session(call_id)?;
        let audio = session
            .media
            .lock()
            .clone()
            .and_then(|m| m.audio)
            .ok_or(CallEngineError::NoTrack(MediaKind::Audio))?;

        let enabled = audio.is_muted();
        audio.set_muted(!enabled);
        session.stream_state.write().microphone_enabled = enabled;
        Ok(enabled)
    }

    /// Setzt die Video-Qualität manuell; `None` gibt die Automatik frei
    pub fn set_manual_video_quality(
        &self,
        call_id: Uuid,
        tier: Option<QualityTier>,
    ) -> Result<(), CallEngineError> {
        let session = self.session(call_id)?;

        match tier {
            Some(tier) => {
                let changed = {
                    let mut quality = session.quality.lock();
                    quality.manual = true;
                    let changed = quality.current != tier;
                    if changed {
                        quality.current = tier;
                    }
                    changed
                };

                if changed {
                    let link = session.current_link();
                    let media = session.media.lock().clone();
                    if let (Some(link), Some(media)) = (link, media) {
                        apply_tier(&link, &media, tier);
                    }
                    self.inner
                        .events
                        .emit(EngineEvent::QualityChanged { call_id, tier });
                }
            }
            None => {
                session.quality.lock().manual = false;
                tracing::debug!("Automatic quality re-enabled for call {}", call_id);
            }
        }

        Ok(())
    }

    /// Aktueller Verbindungszustand des Anrufs
    pub fn connection_state(&self, call_id: Uuid) -> Result<LinkState, CallEngineError> {
        let session = self.session(call_id)?;
        Ok(session
            .current_link()
            .map(|l| l.state())
            .unwrap_or(LinkState::New))
    }

    /// Stream-Zustand für UI/Analytics
    pub fn media_stream_state(&self, call_id: Uuid) -> Result<MediaStreamState, CallEngineError> {
        let session = self.session(call_id)?;
        let state = session.stream_state.read().clone();
        Ok(state)
    }

    /// Aktuelle Verbindungs-Metriken
    pub fn connection_metrics(&self, call_id: Uuid) -> Result<ConnectionMetrics, CallEngineError> {
        let session = self.session(call_id)?;
        let metrics = *session.metrics.read();
        Ok(metrics)
    }

    /// Der lokale Call-Record
    pub fn call(&self, call_id: Uuid) -> Result<Call, CallEngineError> {
        Ok(self.session(call_id)?.snapshot())
    }

    fn session(&self, call_id: Uuid) -> Result<Arc<CallSession>, CallEngineError> {
        self.inner
            .sessions
            .lock()
            .get(&call_id)
            .cloned()
            .ok_or(CallEngineError::UnknownCall(call_id))
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("identity", &self.inner.config.identity)
            .field("active_sessions", &self.inner.sessions.lock().len())
            .finish()
    }
}

// ============================================================================
// ORCHESTRIERUNG
// ============================================================================

impl EngineInner {
    /// Legt die Session an und startet ihren Inbox-Task
    fn register_session(
        inner: &Arc<EngineInner>,
        call: Call,
        role: CallRole,
    ) -> Arc<CallSession> {
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let session = Arc::new(CallSession::new(call, role, inbox_tx));
        session.quality.lock().current = inner.config.initial_quality;
        inner
            .sessions
            .lock()
            .insert(session.id(), Arc::clone(&session));

        // Signale pro Anruf strikt in Ankunftsreihenfolge verarbeiten,
        // ohne andere Anrufe zu blockieren
        let weak = Arc::downgrade(inner);
        let task_session = Arc::clone(&session);
        let mut cancel = session.cancel_rx();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = inbox_rx.recv() => {
                        let Some(signal) = signal else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        EngineInner::handle_signal(&inner, &task_session, signal).await;
                    }
                    _ = cancel.changed() => break,
                }
            }
        });

        session
    }

    async fn setup_outgoing(
        inner: &Arc<EngineInner>,
        session: &Arc<CallSession>,
        kind: CallKind,
    ) -> Result<(), CallEngineError> {
        let call_id = session.id();

        let link = inner.manager.open_link(call_id).await?;
        EngineInner::wire_link(inner, session, Arc::clone(&link));

        let media = inner
            .manager
            .acquire_media(MediaConstraints::for_kind(kind))
            .await?;
        link.attach_media(&media).await?;
        {
            let mut state = session.stream_state.write();
            state.local = Some(media.descriptor());
            state.camera_enabled = media.video.is_some();
            state.microphone_enabled = media.audio.is_some();
        }
        *session.media.lock() = Some(media);

        let offer = link.create_offer(false).await?;
        session.offer_ready.store(true, Ordering::SeqCst);

        let receiver = session.remote_party(&inner.config.identity);
        inner
            .dispatcher
            .dispatch(call_id, inner.config.identity.clone(), receiver, offer)
            .await?;

        Ok(())
    }

    async fn setup_incoming(
        inner: &Arc<EngineInner>,
        session: &Arc<CallSession>,
    ) -> Result<(), CallEngineError> {
        let call = session.snapshot();

        let link = inner.manager.open_link(call.id).await?;
        EngineInner::wire_link(inner, session, Arc::clone(&link));

        let media = inner
            .manager
            .acquire_media(MediaConstraints::for_kind(call.kind))
            .await?;
        link.attach_media(&media).await?;
        {
            let mut state = session.stream_state.write();
            state.local = Some(media.descriptor());
            state.camera_enabled = media.video.is_some();
            state.microphone_enabled = media.audio.is_some();
        }
        *session.media.lock() = Some(media);

        // Das Offer ist bereits unterwegs: Inbox zuerst, dann Store
        let offer_signal = EngineInner::await_offer(inner, session).await?;
        let payload = SignalPayload::decode(SignalKind::Offer, &offer_signal.payload)?;
        let answer = link.create_answer(&payload).await?;
        session.offer_ready.store(true, Ordering::SeqCst);

        inner
            .dispatcher
            .dispatch(
                call.id,
                inner.config.identity.clone(),
                call.caller.clone(),
                answer,
            )
            .await?;

        // Kandidaten die vor dem Annehmen eingetroffen sind nachziehen
        EngineInner::drain_pending_candidates(inner, session, &link).await;
        EngineInner::apply_stored_candidates(inner, session, &link).await;

        Ok(())
    }

    /// Wartet auf das Offer des Anrufers (Inbox, Store-Fallback, Notify)
    async fn await_offer(
        inner: &Arc<EngineInner>,
        session: &Arc<CallSession>,
    ) -> Result<Signal, CallEngineError> {
        let call_id = session.id();
        let deadline = tokio::time::Instant::now() + inner.config.connect_timeout;

        loop {
            if let Some(offer) = session.pending_offer.lock().take() {
                return Ok(offer);
            }

            let signals = inner.store.list_signals(call_id).await?;
            if let Some(offer) = signals.into_iter().find(|s| {
                s.kind == SignalKind::Offer && s.receiver == inner.config.identity
            }) {
                if session.mark_applied(offer.id) {
                    return Ok(offer);
                }
            }

            if tokio::time::timeout_at(deadline, session.offer_notify.notified())
                .await
                .is_err()
            {
                return Err(CallEngineError::Signaling(SignalingError::new(
                    "await_offer",
                    "timed out waiting for offer",
                )));
            }
        }
    }

    /// Verdrahtet eine (neue) Verbindung mit der Session und startet
    /// ihren Event-Watcher
    fn wire_link(inner: &Arc<EngineInner>, session: &Arc<CallSession>, link: Arc<dyn PeerLink>) {
        // Alte Qualitätsregelung gehört zur alten Verbindung
        if let Some(task) = session.quality_task.lock().take() {
            task.abort();
        }
        session.quality_started.store(false, Ordering::SeqCst);

        session.set_link(Arc::clone(&link));

        let mut events = link.subscribe();
        let weak = Arc::downgrade(inner);
        let session = Arc::clone(session);
        let link_id = link.id();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        EngineInner::on_link_event(&inner, &session, link_id, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_link_event(
        inner: &Arc<EngineInner>,
        session: &Arc<CallSession>,
        link_id: Uuid,
        event: LinkEvent,
    ) {
        // Events einer ersetzten Verbindung sind veraltet
        if session.current_link().map(|l| l.id()) != Some(link_id) {
            return;
        }
        let call_id = session.id();

        match event {
            LinkEvent::StateChanged(state) => {
                inner
                    .events
                    .emit(EngineEvent::ConnectionState { call_id, state });

                match state {
                    LinkState::Connected => {
                        EngineInner::handle_connected(inner, session).await;
                    }
                    LinkState::Disconnected | LinkState::Failed => {
                        EngineInner::maybe_reconnect(inner, session);
                    }
                    _ => {}
                }
            }
            LinkEvent::LocalCandidate(payload) => {
                let sender = inner.config.identity.clone();
                let receiver = session.remote_party(&sender);
                if let Err(e) = inner
                    .dispatcher
                    .dispatch(call_id, sender, receiver, payload)
                    .await
                {
                    // Verlust einzelner Kandidaten ist nicht fatal
                    tracing::warn!("Dropping local candidate for call {}: {}", call_id, e);
                }
            }
            LinkEvent::GatheringComplete => {
                let opened = *session.opened_at.lock();
                if let Some(started) = opened {
                    let mut metrics = session.metrics.write();
                    if metrics.ice_gathering_ms.is_none() {
                        metrics.ice_gathering_ms = Some(started.elapsed().as_millis() as u64);
                    }
                }
            }
            LinkEvent::RemoteTrack { kind } => {
                {
                    let mut state = session.stream_state.write();
                    let remote = state.remote.get_or_insert(StreamDescriptor {
                        has_audio: false,
                        has_video: false,
                        video: None,
                    });
                    match kind {
                        MediaKind::Audio => remote.has_audio = true,
                        MediaKind::Video => remote.has_video = true,
                    }
                }
                inner.events.emit(EngineEvent::RemoteTrack { call_id, kind });
            }
        }
    }

    /// Verbindung steht: Anruf wird aktiv, Qualitätsregelung startet
    async fn handle_connected(inner: &Arc<EngineInner>, session: &Arc<CallSession>) {
        session.reconnecting.store(false, Ordering::SeqCst);

        {
            let opened = *session.opened_at.lock();
            if let Some(started) = opened {
                let mut metrics = session.metrics.write();
                if metrics.connect_latency_ms.is_none() {
                    metrics.connect_latency_ms = Some(started.elapsed().as_millis() as u64);
                }
            }
        }

        let status = session.snapshot().status;
        if matches!(status, CallStatus::Calling | CallStatus::Ringing) {
            let patch = CallPatch {
                status: Some(CallStatus::Active),
                answered_at: Some(Utc::now()),
                ..Default::default()
            };
            match inner.store.update_call(session.id(), patch).await {
                Ok(updated) => {
                    session.set_call(updated.clone());
                    inner.events.emit(EngineEvent::CallUpdated(updated));
                }
                Err(StoreError::CallTerminal(_)) => {}
                Err(e) => {
                    tracing::error!(
                        "Failed to persist active status for call {}: {}",
                        session.id(),
                        e
                    );
                    inner.events.emit_error(
                        Some(session.id()),
                        ErrorCategory::Store,
                        e.to_string(),
                    );
                }
            }
        }

        EngineInner::start_quality_loop(inner, session);
    }

    fn start_quality_loop(inner: &Arc<EngineInner>, session: &Arc<CallSession>) {
        if session.quality_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(link) = session.current_link() else { return };
        let media = session.media.lock().clone().unwrap_or_default();

        let call_id = session.id();
        let events = inner.events.clone();
        let ctx = QualityCtx {
            call_id,
            link,
            media,
            metrics: Arc::clone(&session.metrics),
            quality: Arc::clone(&session.quality),
            analytics: Arc::clone(&inner.analytics),
            interval: inner.config.quality_interval,
            cancel: session.cancel_rx(),
            on_change: Box::new(move |tier| {
                events.emit(EngineEvent::QualityChanged { call_id, tier });
            }),
        };

        *session.quality_task.lock() = Some(spawn_quality_loop(ctx));
    }

    /// Stößt die Wiederverbindung an, falls nicht schon eine läuft
    fn maybe_reconnect(inner: &Arc<EngineInner>, session: &Arc<CallSession>) {
        if session.is_terminal() || session.ending.load(Ordering::SeqCst) {
            return;
        }
        if session.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let identity = inner.config.identity.clone();
        let wire_link = {
            let weak = Arc::downgrade(inner);
            let session = Arc::clone(session);
            Box::new(move |link: &Arc<dyn PeerLink>| {
                if let Some(inner) = weak.upgrade() {
                    EngineInner::wire_link(&inner, &session, Arc::clone(link));
                }
            }) as Box<dyn Fn(&Arc<dyn PeerLink>) + Send + Sync>
        };

        let ctx = ReconnectCtx {
            call_id: session.id(),
            is_caller: session.role == CallRole::Caller,
            remote: session.remote_party(&identity),
            identity,
            manager: Arc::clone(&inner.manager),
            dispatcher: inner.dispatcher.clone(),
            media: session.media.lock().clone().unwrap_or_default(),
            retry: inner.config.retry,
            connect_timeout: inner.config.connect_timeout,
            cancel: session.cancel_rx(),
            generation: Arc::clone(&session.generation),
            generation_at_start: session.generation.load(Ordering::SeqCst),
            attempt_counter: Arc::clone(&session.reconnect_attempts),
            wire_link,
        };

        let events = inner.events.clone();
        let analytics = Arc::clone(&inner.analytics);
        let session = Arc::clone(session);

        tokio::spawn(async move {
            match run_reconnect(ctx).await {
                ReconnectOutcome::Recovered => {
                    session.reconnecting.store(false, Ordering::SeqCst);
                }
                ReconnectOutcome::Exhausted => {
                    session.reconnecting.store(false, Ordering::SeqCst);
                    let message =
                        format!("Reconnect budget exhausted for call {}", session.id());
                    // Terminal: die Entscheidung den Anruf zu beenden
                    // liegt beim Aufrufer, nicht hier
                    events.emit_error(Some(session.id()), ErrorCategory::Reconnect, message.clone());
                    analytics
                        .record_error(ErrorReport {
                            call_id: Some(session.id()),
                            category: ErrorCategory::Reconnect,
                            message,
                        })
                        .await;
                }
                ReconnectOutcome::Cancelled => {}
            }
        });
    }

    /// Verarbeitet ein eingehendes Signal (pro Anruf sequenziell)
    async fn handle_signal(inner: &Arc<EngineInner>, session: &Arc<CallSession>, signal: Signal) {
        if session.is_terminal() {
            return;
        }
        if !session.mark_applied(signal.id) {
            tracing::debug!("Skipping duplicate signal {}", signal.id);
            return;
        }

        inner.events.emit(EngineEvent::SignalReceived {
            call_id: signal.call_id,
            kind: signal.kind,
            sender: signal.sender.clone(),
        });

        match signal.kind {
            SignalKind::Offer => {
                if !session.offer_ready.load(Ordering::SeqCst) {
                    // Erstes Offer: wird vom Annehmen-Pfad konsumiert
                    *session.pending_offer.lock() = Some(signal);
                    session.offer_notify.notify_one();
                    return;
                }

                // Frisches Offer der Gegenseite (Wiederverbindung)
                let Some(link) = session.current_link() else { return };
                let result: Result<(), CallEngineError> = async {
                    let payload = SignalPayload::decode(SignalKind::Offer, &signal.payload)?;
                    let answer = link.create_answer(&payload).await?;
                    let receiver = session.remote_party(&inner.config.identity);
                    inner
                        .dispatcher
                        .dispatch(
                            signal.call_id,
                            inner.config.identity.clone(),
                            receiver,
                            answer,
                        )
                        .await?;
                    Ok(())
                }
                .await;

                if let Err(e) = result {
                    tracing::error!(
                        "Failed to answer re-offer for call {}: {}",
                        signal.call_id,
                        e
                    );
                    EngineInner::report_error(inner, signal.call_id, &e).await;
                }
            }
            SignalKind::Answer => {
                if !session.offer_ready.load(Ordering::SeqCst) {
                    // Ein Answer wird nie vor dem eigenen Offer angewandt
                    tracing::warn!("Ignoring answer before offer for call {}", signal.call_id);
                    return;
                }
                let Some(link) = session.current_link() else { return };

                let result: Result<(), CallEngineError> = async {
                    let payload = SignalPayload::decode(SignalKind::Answer, &signal.payload)?;
                    link.apply_answer(&payload).await?;
                    Ok(())
                }
                .await;

                match result {
                    Ok(()) => {
                        EngineInner::drain_pending_candidates(inner, session, &link).await;
                    }
                    Err(e) => {
                        tracing::error!(
                            "Failed to apply answer for call {}: {}",
                            signal.call_id,
                            e
                        );
                        EngineInner::report_error(inner, signal.call_id, &e).await;
                    }
                }
            }
            SignalKind::IceCandidate => {
                let Some(link) = session.current_link() else {
                    session.pending_candidates.lock().push(signal);
                    return;
                };
                match SignalPayload::decode(SignalKind::IceCandidate, &signal.payload) {
                    Ok(payload) => {
                        inner.manager.apply_remote_candidate(&link, &payload).await;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Dropping malformed candidate for call {}: {}",
                            signal.call_id,
                            e
                        );
                    }
                }
            }
        }
    }

    async fn drain_pending_candidates(
        inner: &Arc<EngineInner>,
        session: &Arc<CallSession>,
        link: &Arc<dyn PeerLink>,
    ) {
        let pending: Vec<Signal> = session.pending_candidates.lock().drain(..).collect();
        for signal in pending {
            match SignalPayload::decode(SignalKind::IceCandidate, &signal.payload) {
                Ok(payload) => inner.manager.apply_remote_candidate(link, &payload).await,
                Err(e) => {
                    tracing::warn!(
                        "Dropping malformed candidate for call {}: {}",
                        session.id(),
                        e
                    );
                }
            }
        }
    }

    /// Holt Kandidaten nach, die vor der Session-Registrierung im Store
    /// gelandet sind
    async fn apply_stored_candidates(
        inner: &Arc<EngineInner>,
        session: &Arc<CallSession>,
        link: &Arc<dyn PeerLink>,
    ) {
        let signals = match inner.store.list_signals(session.id()).await {
            Ok(signals) => signals,
            Err(e) => {
                tracing::warn!("Failed to list signals for call {}: {}", session.id(), e);
                return;
            }
        };

        for signal in signals {
            if signal.kind != SignalKind::IceCandidate
                || signal.receiver != inner.config.identity
                || !session.mark_applied(signal.id)
            {
                continue;
            }
            match SignalPayload::decode(SignalKind::IceCandidate, &signal.payload) {
                Ok(payload) => inner.manager.apply_remote_candidate(link, &payload).await,
                Err(e) => {
                    tracing::warn!(
                        "Dropping malformed candidate for call {}: {}",
                        session.id(),
                        e
                    );
                }
            }
        }
    }

    /// Meldet einen Fehler als Event und best-effort an die Analytics-Senke
    async fn report_error(inner: &Arc<EngineInner>, call_id: Uuid, error: &CallEngineError) {
        let category = error.category();
        inner
            .events
            .emit_error(Some(call_id), category, error.to_string());
        inner
            .analytics
            .record_error(ErrorReport {
                call_id: Some(call_id),
                category,
                message: error.to_string(),
            })
            .await;
    }

    /// Aufbau fehlgeschlagen: vollständig aufräumen, Record markieren,
    /// Fehler melden
    async fn abort_setup(
        inner: &Arc<EngineInner>,
        session: &Arc<CallSession>,
        error: &CallEngineError,
    ) {
        let call_id = session.id();
        tracing::error!("Call setup failed for {}: {}", call_id, error);

        session.ending.store(true, Ordering::SeqCst);
        EngineInner::teardown_session(inner, session).await;

        let patch = CallPatch {
            status: Some(CallStatus::Failed),
            ended_at: Some(Utc::now()),
            end_reason: Some(format!("setup failed: {}", error)),
            ..Default::default()
        };
        match inner.store.update_call(call_id, patch).await {
            Ok(updated) => {
                session.set_call(updated.clone());
                inner.events.emit(EngineEvent::CallUpdated(updated));
            }
            Err(e) => {
                tracing::warn!("Failed to mark call {} as failed: {}", call_id, e);
            }
        }

        EngineInner::report_error(inner, call_id, error).await;
    }

    /// Gibt alle Ressourcen einer Session frei und entfernt sie
    async fn teardown_session(inner: &Arc<EngineInner>, session: &Arc<CallSession>) {
        let call_id = session.id();
        session.cancel();
        session.bump_generation();
        inner.dispatcher.discard_call(call_id);
        inner.manager.discard(call_id).await;
        session.link.lock().take();
        session.media.lock().take();
        {
            let mut state = session.stream_state.write();
            state.local = None;
            state.camera_enabled = false;
            state.microphone_enabled = false;
        }
        inner.sessions.lock().remove(&call_id);
    }

    /// Leitet eingehende Signale an die zuständige Session weiter
    fn spawn_signal_router(inner: &Arc<EngineInner>) {
        let mut incoming = inner.transport.incoming();
        let weak = Arc::downgrade(inner);

        tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(signal) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if signal.receiver != inner.config.identity {
                            continue;
                        }
                        let session = inner.sessions.lock().get(&signal.call_id).cloned();
                        match session {
                            Some(session) => {
                                let _ = session.inbox_tx.send(signal);
                            }
                            None => {
                                tracing::debug!("Signal for unknown call {}", signal.call_id);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Signal router lagged, {} signals dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Reagiert auf Store-Änderungen: eingehende Anrufe und
    /// Statuswechsel der Gegenseite
    fn spawn_store_watcher(inner: &Arc<EngineInner>) {
        let mut events = inner.store.subscribe();
        let weak = Arc::downgrade(inner);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        EngineInner::on_store_event(&inner, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Store watcher lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_store_event(inner: &Arc<EngineInner>, event: StoreEvent) {
        match event {
            StoreEvent::CallCreated(call) => {
                if call.receiver != inner.config.identity || call.is_terminal() {
                    return;
                }
                let exists = inner.sessions.lock().contains_key(&call.id);
                if !exists {
                    tracing::info!("Incoming call {} from {}", call.id, call.caller);
                    EngineInner::register_session(inner, call.clone(), CallRole::Receiver);
                    inner.events.emit(EngineEvent::IncomingCall(call));
                }
            }
            StoreEvent::CallUpdated(call) => {
                if !call.involves(&inner.config.identity) {
                    return;
                }
                let session = inner.sessions.lock().get(&call.id).cloned();
                let Some(session) = session else { return };

                let local = session.snapshot();
                if local.status == call.status && local.ended_at == call.ended_at {
                    // Lokale Änderung, bereits verarbeitet
                    return;
                }

                session.set_call(call.clone());
                inner.events.emit(EngineEvent::CallUpdated(call.clone()));

                if call.is_terminal() && !session.ending.swap(true, Ordering::SeqCst) {
                    // Die Gegenseite hat beendet oder abgelehnt
                    tracing::info!("Call {} ended remotely ({:?})", call.id, call.status);
                    EngineInner::teardown_session(inner, &session).await;
                }
            }
            StoreEvent::SignalAppended(_) => {}
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MemoryStore, NullAnalytics, OpenAuthorizer};
    use crate::rtc::link::TransportStats;
    use crate::rtc::sim::{SimLink, SimMediaDevices, SimNetwork};
    use crate::signaling::transport::StoreTransport;
    use async_trait::async_trait;
    use std::time::Duration;

    struct TestPeer {
        engine: CallEngine,
        devices: Arc<SimMediaDevices>,
    }

    fn peer_with_auth(
        identity: &str,
        store: &Arc<MemoryStore>,
        network: &Arc<SimNetwork>,
        authorizer: Arc<dyn CallAuthorizer>,
    ) -> TestPeer {
        let devices = SimMediaDevices::new();
        let deps = EngineDeps {
            store: store.clone(),
            transport: StoreTransport::new(store.clone(), identity),
            authorizer,
            analytics: Arc::new(NullAnalytics),
            media: devices.clone(),
            connector: network.connector(),
        };
        TestPeer {
            engine: CallEngine::new(EngineConfig::new(identity), deps),
            devices,
        }
    }

    fn peer(identity: &str, store: &Arc<MemoryStore>, network: &Arc<SimNetwork>) -> TestPeer {
        peer_with_auth(identity, store, network, Arc::new(OpenAuthorizer))
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<EngineEvent>,
        pred: impl Fn(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                match rx.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for engine event")
    }

    /// Baut einen aktiven Anruf zwischen beiden Seiten auf
    async fn establish(
        a: &TestPeer,
        b: &TestPeer,
        a_rx: &mut broadcast::Receiver<EngineEvent>,
        b_rx: &mut broadcast::Receiver<EngineEvent>,
    ) -> Call {
        let call = a
            .engine
            .start_call("room-1", "bob", CallKind::Video)
            .await
            .unwrap();

        wait_for(b_rx, |e| matches!(e, EngineEvent::IncomingCall(_))).await;
        let answered = b.engine.answer_call(call.id, true).await.unwrap();
        assert!(matches!(
            answered.status,
            CallStatus::Ringing | CallStatus::Active
        ));

        wait_for(a_rx, |e| {
            matches!(
                e,
                EngineEvent::ConnectionState {
                    state: LinkState::Connected,
                    ..
                }
            )
        })
        .await;
        wait_for(b_rx, |e| {
            matches!(
                e,
                EngineEvent::ConnectionState {
                    state: LinkState::Connected,
                    ..
                }
            )
        })
        .await;
        wait_for(a_rx, |e| {
            matches!(e, EngineEvent::CallUpdated(c) if c.status == CallStatus::Active)
        })
        .await;

        call
    }

    fn caller_link(network: &Arc<SimNetwork>, call_id: Uuid) -> Arc<SimLink> {
        // Der Anrufer öffnet seine Verbindung zuerst
        network.links_for(call_id)[0].clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_call_dispatches_offer_before_returning() {
        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer("alice", &store, &network);

        let call = a
            .engine
            .start_call("room-1", "bob", CallKind::Video)
            .await
            .unwrap();
        assert_eq!(call.status, CallStatus::Calling);

        let signals = store.list_signals(call.id).await.unwrap();
        assert!(signals
            .iter()
            .any(|s| s.kind == SignalKind::Offer && s.receiver == "bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_to_same_tuple_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer("alice", &store, &network);

        a.engine
            .start_call("room-1", "bob", CallKind::Video)
            .await
            .unwrap();
        let err = a
            .engine
            .start_call("room-1", "bob", CallKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, CallEngineError::CallInProgress { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_permission_blocks_call() {
        struct DenyAll;

        #[async_trait]
        impl CallAuthorizer for DenyAll {
            async fn can_initiate_call(&self, _: &str, _: &str, _: &str) -> bool {
                false
            }
        }

        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer_with_auth("alice", &store, &network, Arc::new(DenyAll));

        let err = a
            .engine
            .start_call("room-1", "bob", CallKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, CallEngineError::Permission(_)));
        // Vor der Berechtigungsprüfung wird nichts aufgebaut
        assert_eq!(a.devices.acquired.load(Ordering::SeqCst), 0);
        assert_eq!(network.open_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_denial_fails_call_and_cleans_up() {
        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer("alice", &store, &network);
        a.devices.deny.store(true, Ordering::SeqCst);

        let mut rx = a.engine.subscribe();
        let err = a
            .engine
            .start_call("room-1", "bob", CallKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, CallEngineError::Media(_)));

        let EngineEvent::CallCreated(created) =
            wait_for(&mut rx, |e| matches!(e, EngineEvent::CallCreated(_))).await
        else {
            unreachable!()
        };

        // Record ist als fehlgeschlagen markiert, kein halbfertiger Zustand
        assert_eq!(
            store.get_call(created.id).unwrap().status,
            CallStatus::Failed
        );
        assert!(a.engine.call(created.id).is_err());
        wait_for(&mut rx, |e| {
            matches!(e, EngineEvent::Error(err) if err.category == ErrorCategory::Media)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_decline_scenario() {
        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer("alice", &store, &network);
        let b = peer("bob", &store, &network);
        let mut a_rx = a.engine.subscribe();
        let mut b_rx = b.engine.subscribe();

        let call = a
            .engine
            .start_call("room-1", "bob", CallKind::Video)
            .await
            .unwrap();

        wait_for(&mut b_rx, |e| matches!(e, EngineEvent::IncomingCall(_))).await;
        let declined = b.engine.answer_call(call.id, false).await.unwrap();
        assert_eq!(declined.status, CallStatus::Declined);

        // Der Abgelehnte hat nie Medien angefordert
        assert_eq!(b.devices.acquired.load(Ordering::SeqCst), 0);

        // Der Anrufer sieht die Ablehnung und räumt auf
        wait_for(&mut a_rx, |e| {
            matches!(e, EngineEvent::CallUpdated(c) if c.status == CallStatus::Declined)
        })
        .await;
        for _ in 0..100 {
            if a.engine.call(call.id).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.engine.call(call.id).is_err());

        // Keine Wiederverbindungs-Versuche: nur der initiale Aufbau des Anrufers
        assert_eq!(network.open_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_roundtrip_reaches_active() {
        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer("alice", &store, &network);
        let b = peer("bob", &store, &network);
        let mut a_rx = a.engine.subscribe();
        let mut b_rx = b.engine.subscribe();

        let call = establish(&a, &b, &mut a_rx, &mut b_rx).await;

        let stored = store.get_call(call.id).unwrap();
        assert_eq!(stored.status, CallStatus::Active);
        assert!(stored.answered_at.is_some());

        // Kandidaten beider Seiten sind über den Batch-Pfad angekommen
        tokio::time::sleep(Duration::from_millis(300)).await;
        let applied: usize = network
            .links_for(call.id)
            .iter()
            .map(|l| l.applied_candidates.load(Ordering::SeqCst))
            .sum();
        assert!(applied > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer("alice", &store, &network);

        let call = a
            .engine
            .start_call("room-1", "bob", CallKind::Video)
            .await
            .unwrap();

        a.engine
            .end_call(call.id, Some("done".to_string()))
            .await
            .unwrap();
        a.engine
            .end_call(call.id, Some("done again".to_string()))
            .await
            .unwrap();

        // Genau ein persistiertes Ended-Update
        assert_eq!(store.update_count(call.id), 1);
        let stored = store.get_call(call.id).unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert_eq!(stored.end_reason.as_deref(), Some("done"));
        assert!(stored.duration_secs.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers_within_budget() {
        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer("alice", &store, &network);
        let b = peer("bob", &store, &network);
        let mut a_rx = a.engine.subscribe();
        let mut b_rx = b.engine.subscribe();

        let call = establish(&a, &b, &mut a_rx, &mut b_rx).await;

        caller_link(&network, call.id).force_state(LinkState::Disconnected);
        wait_for(&mut a_rx, |e| {
            matches!(
                e,
                EngineEvent::ConnectionState {
                    state: LinkState::Disconnected,
                    ..
                }
            )
        })
        .await;

        // Backoff läuft, ICE-Restart über die noch offene Verbindung
        wait_for(&mut a_rx, |e| {
            matches!(
                e,
                EngineEvent::ConnectionState {
                    state: LinkState::Connected,
                    ..
                }
            )
        })
        .await;

        // Der Anruf blieb durchgehend aktiv
        assert_eq!(store.get_call(call.id).unwrap().status, CallStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_emits_terminal_error() {
        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer("alice", &store, &network);
        let b = peer("bob", &store, &network);
        let mut a_rx = a.engine.subscribe();
        let mut b_rx = b.engine.subscribe();

        let call = establish(&a, &b, &mut a_rx, &mut b_rx).await;
        let opens_before = network.open_attempts.load(Ordering::SeqCst);

        network.fail_open.store(true, Ordering::SeqCst);
        caller_link(&network, call.id).force_state(LinkState::Failed);

        wait_for(&mut a_rx, |e| {
            matches!(e, EngineEvent::Error(err) if err.category == ErrorCategory::Reconnect)
        })
        .await;

        // Höchstens 3 Versuche, danach terminal
        assert_eq!(
            network.open_attempts.load(Ordering::SeqCst),
            opens_before + 3
        );
        // Der Call-Record wird nicht automatisch beendet
        assert_eq!(store.get_call(call.id).unwrap().status, CallStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_adapts_and_respects_manual_override() {
        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer("alice", &store, &network);
        let b = peer("bob", &store, &network);
        let mut a_rx = a.engine.subscribe();
        let mut b_rx = b.engine.subscribe();

        let call = establish(&a, &b, &mut a_rx, &mut b_rx).await;
        let link = caller_link(&network, call.id);

        // Erst die Basis-Stichprobe verstreichen lassen, dann Deltas liefern
        tokio::time::sleep(Duration::from_secs(7)).await;

        // Viel Bandbreite, kein Verlust → Ultra
        link.set_stats(TransportStats {
            bytes_received: 2_500_000,
            packets_received: 1_000,
            packets_lost: 0,
            jitter_secs: 0.01,
        });
        wait_for(&mut a_rx, |e| {
            matches!(
                e,
                EngineEvent::QualityChanged {
                    tier: QualityTier::Ultra,
                    ..
                }
            )
        })
        .await;
        assert!(a.engine.connection_metrics(call.id).unwrap().bandwidth_bps > 3_000_000);

        // Starker Verlust → Low
        link.set_stats(TransportStats {
            bytes_received: 2_600_000,
            packets_received: 1_900,
            packets_lost: 100,
            jitter_secs: 0.05,
        });
        wait_for(&mut a_rx, |e| {
            matches!(
                e,
                EngineEvent::QualityChanged {
                    tier: QualityTier::Low,
                    ..
                }
            )
        })
        .await;

        // Manuelles Override friert die Stufe ein
        a.engine
            .set_manual_video_quality(call.id, Some(QualityTier::Medium))
            .unwrap();
        wait_for(&mut a_rx, |e| {
            matches!(
                e,
                EngineEvent::QualityChanged {
                    tier: QualityTier::Medium,
                    ..
                }
            )
        })
        .await;

        link.set_stats(TransportStats {
            bytes_received: 5_100_000,
            packets_received: 3_000,
            packets_lost: 100,
            jitter_secs: 0.01,
        });
        tokio::time::sleep(Duration::from_secs(12)).await;
        while let Ok(event) = a_rx.try_recv() {
            assert!(
                !matches!(event, EngineEvent::QualityChanged { .. }),
                "quality changed despite manual override"
            );
        }

        // Automatik wieder freigeben → passt sich erneut an
        a.engine.set_manual_video_quality(call.id, None).unwrap();
        link.set_stats(TransportStats {
            bytes_received: 7_600_000,
            packets_received: 4_000,
            packets_lost: 100,
            jitter_secs: 0.01,
        });
        wait_for(&mut a_rx, |e| {
            matches!(
                e,
                EngineEvent::QualityChanged {
                    tier: QualityTier::Ultra,
                    ..
                }
            )
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_camera_and_microphone() {
        let store = Arc::new(MemoryStore::new());
        let network = SimNetwork::new();
        let a = peer("alice", &store, &network);

        let call = a
            .engine
            .start_call("room-1", "bob", CallKind::Video)
            .await
            .unwrap();

        let state = a.engine.media_stream_state(call.id).unwrap();
        assert!(state.camera_enabled);
        assert!(state.microphone_enabled);

        assert!(!a.engine.toggle_camera(call.id).unwrap());
        assert!(!a.engine.media_stream_state(call.id).unwrap().camera_enabled);
        assert!(a.engine.toggle_camera(call.id).unwrap());

        assert!(!a.engine.toggle_microphone(call.id).unwrap());
        assert!(
            !a.engine
                .media_stream_state(call.id)
                .unwrap()
                .microphone_enabled
        );
        assert!(a.engine.toggle_microphone(call.id).unwrap());
    }
}
