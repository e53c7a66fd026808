//! Session-Zustand eines einzelnen Anrufs
//!
//! Jede veränderliche Ressource (Verbindung, Medien, Metriken,
//! Retry-Zähler) hängt an genau einer Session und damit an genau einer
//! Call-ID, nichts davon wird zwischen Anrufen geteilt. Die Session
//! selbst ist passiv; die Orchestrierung macht die Engine.

use crate::call::model::{Call, ConnectionMetrics, Signal};
use crate::rtc::link::PeerLink;
use crate::rtc::media::{LocalMedia, MediaStreamState};
use crate::rtc::quality::QualityState;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Rolle dieser Seite im Anruf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallRole {
    Caller,
    Receiver,
}

/// Zustand eines aktiven Anrufs
pub(crate) struct CallSession {
    pub call: RwLock<Call>,
    pub role: CallRole,
    pub link: Mutex<Option<Arc<dyn PeerLink>>>,
    pub media: Mutex<Option<LocalMedia>>,
    pub stream_state: RwLock<MediaStreamState>,
    pub metrics: Arc<RwLock<ConnectionMetrics>>,
    pub quality: Arc<Mutex<QualityState>>,

    /// IDs bereits verarbeiteter Signale (at-least-once Transport)
    pub applied_signals: Mutex<HashSet<Uuid>>,
    /// Offer das vor dem Annehmen eingetroffen ist
    pub pending_offer: Mutex<Option<Signal>>,
    pub offer_notify: Notify,
    /// Kandidaten die vor der Verbindung eingetroffen sind
    pub pending_candidates: Mutex<Vec<Signal>>,
    /// Ein Answer wird nie vor dem lokal erstellten Offer angewandt
    pub offer_ready: AtomicBool,

    /// Generationszähler für veraltete Reconnect-Ergebnisse
    pub generation: Arc<AtomicU64>,
    cancel_tx: watch::Sender<bool>,
    pub quality_task: Mutex<Option<JoinHandle<()>>>,
    pub quality_started: AtomicBool,
    pub reconnecting: AtomicBool,
    pub reconnect_attempts: Arc<AtomicU32>,
    /// Idempotenz-Riegel für `end_call`
    pub ending: AtomicBool,

    pub inbox_tx: mpsc::UnboundedSender<Signal>,
    pub opened_at: Mutex<Option<Instant>>,
}

impl CallSession {
    pub fn new(call: Call, role: CallRole, inbox_tx: mpsc::UnboundedSender<Signal>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            call: RwLock::new(call),
            role,
            link: Mutex::new(None),
            media: Mutex::new(None),
            stream_state: RwLock::new(MediaStreamState::default()),
            metrics: Arc::new(RwLock::new(ConnectionMetrics::default())),
            quality: Arc::new(Mutex::new(QualityState::default())),
            applied_signals: Mutex::new(HashSet::new()),
            pending_offer: Mutex::new(None),
            offer_notify: Notify::new(),
            pending_candidates: Mutex::new(Vec::new()),
            offer_ready: AtomicBool::new(false),
            generation: Arc::new(AtomicU64::new(0)),
            cancel_tx,
            quality_task: Mutex::new(None),
            quality_started: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
            ending: AtomicBool::new(false),
            inbox_tx,
            opened_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.call.read().id
    }

    pub fn snapshot(&self) -> Call {
        self.call.read().clone()
    }

    pub fn set_call(&self, call: Call) {
        *self.call.write() = call;
    }

    pub fn is_terminal(&self) -> bool {
        self.call.read().is_terminal()
    }

    /// Die Gegenseite dieses Anrufs
    pub fn remote_party(&self, identity: &str) -> String {
        let call = self.call.read();
        if call.caller == identity {
            call.receiver.clone()
        } else {
            call.caller.clone()
        }
    }

    /// Merkt sich ein Signal; `false` wenn es schon verarbeitet wurde
    pub fn mark_applied(&self, signal_id: Uuid) -> bool {
        self.applied_signals.lock().insert(signal_id)
    }

    pub fn cancel_rx(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Bricht Retry-Timer und laufende Tasks dieser Session ab
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
        if let Some(task) = self.quality_task.lock().take() {
            task.abort();
        }
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Gesprächsdauer ab Annahme (oder ab Start, falls nie angenommen)
    pub fn duration_until(&self, now: DateTime<Utc>) -> i64 {
        let call = self.call.read();
        let from = call.answered_at.unwrap_or(call.started_at);
        (now - from).num_seconds().max(0)
    }

    /// Aktueller Link, falls vorhanden
    pub fn current_link(&self) -> Option<Arc<dyn PeerLink>> {
        self.link.lock().clone()
    }

    pub fn set_link(&self, link: Arc<dyn PeerLink>) {
        *self.link.lock() = Some(link);
        *self.opened_at.lock() = Some(Instant::now());
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let call = self.snapshot();
        f.debug_struct("CallSession")
            .field("call_id", &call.id)
            .field("status", &call.status)
            .field("role", &self.role)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::model::{CallKind, CallStatus};
    use chrono::Duration as ChronoDuration;

    fn session(answered: bool) -> CallSession {
        let started = Utc::now();
        let call = Call {
            id: Uuid::new_v4(),
            room_id: "room".to_string(),
            caller: "alice".to_string(),
            receiver: "bob".to_string(),
            kind: CallKind::Video,
            status: CallStatus::Active,
            started_at: started,
            answered_at: answered.then(|| started + ChronoDuration::seconds(5)),
            ended_at: None,
            duration_secs: None,
            end_reason: None,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        CallSession::new(call, CallRole::Caller, tx)
    }

    #[test]
    fn test_duration_counts_from_answer() {
        let s = session(true);
        let answered_at = s.snapshot().answered_at.unwrap();
        assert_eq!(s.duration_until(answered_at + ChronoDuration::seconds(60)), 60);
    }

    #[test]
    fn test_duration_falls_back_to_start() {
        let s = session(false);
        let started_at = s.snapshot().started_at;
        assert_eq!(s.duration_until(started_at + ChronoDuration::seconds(7)), 7);
    }

    #[test]
    fn test_duplicate_signals_are_detected() {
        let s = session(true);
        let id = Uuid::new_v4();
        assert!(s.mark_applied(id));
        assert!(!s.mark_applied(id));
    }
}
