//! Externe Persistenz: Call-Records und Signal-Log
//!
//! Der Store ist ein externer Mitspieler (Datenbank plus
//! Änderungs-Benachrichtigung). Die Engine liest und schreibt über das
//! `CallStore`-Trait; `MemoryStore` ist das eingebaute Backend für Tests
//! und Offline-Betrieb.

use crate::call::model::{Call, CallPatch, CallStatus, NewCall, NewSignal, Signal};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Call not found: {0}")]
    CallNotFound(Uuid),

    #[error("Call {0} is terminal and immutable")]
    CallTerminal(Uuid),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

// ============================================================================
// CHANGE NOTIFICATIONS
// ============================================================================

/// Änderungs-Benachrichtigung aus dem Store.
///
/// Zustellung ist at-least-once; Empfänger filtern nach Adressat und
/// müssen Duplikate tolerieren.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    CallCreated(Call),
    CallUpdated(Call),
    SignalAppended(Signal),
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Persistenz und Pub/Sub für Calls und Signale
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Legt einen neuen Call im Status `Calling` an
    async fn create_call(&self, new_call: NewCall) -> Result<Call, StoreError>;

    /// Wendet ein Teil-Update an; terminale Calls sind unveränderlich
    async fn update_call(&self, id: Uuid, patch: CallPatch) -> Result<Call, StoreError>;

    /// Hängt ein Signal an das Log des Anrufs an (append-only)
    async fn append_signal(&self, new_signal: NewSignal) -> Result<Signal, StoreError>;

    /// Alle Signale eines Anrufs in Sequenz-Reihenfolge
    async fn list_signals(&self, call_id: Uuid) -> Result<Vec<Signal>, StoreError>;

    /// Abonniert Änderungs-Benachrichtigungen
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// In-Memory Store für Tests und Offline-Betrieb
pub struct MemoryStore {
    calls: RwLock<HashMap<Uuid, Call>>,
    signals: RwLock<HashMap<Uuid, Vec<Signal>>>,
    update_counts: RwLock<HashMap<Uuid, u32>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            calls: RwLock::new(HashMap::new()),
            signals: RwLock::new(HashMap::new()),
            update_counts: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Holt einen Call-Record (Hilfsfunktion, nicht Teil des Traits)
    pub fn get_call(&self, id: Uuid) -> Option<Call> {
        self.calls.read().get(&id).cloned()
    }

    /// Anzahl der `update_call`-Aufrufe für einen Call
    pub fn update_count(&self, id: Uuid) -> u32 {
        self.update_counts.read().get(&id).copied().unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn create_call(&self, new_call: NewCall) -> Result<Call, StoreError> {
        let call = Call {
            id: Uuid::new_v4(),
            room_id: new_call.room_id,
            caller: new_call.caller,
            receiver: new_call.receiver,
            kind: new_call.kind,
            status: CallStatus::Calling,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            duration_secs: None,
            end_reason: None,
        };

        self.calls.write().insert(call.id, call.clone());
        let _ = self.events.send(StoreEvent::CallCreated(call.clone()));
        Ok(call)
    }

    async fn update_call(&self, id: Uuid, patch: CallPatch) -> Result<Call, StoreError> {
        let updated = {
            let mut calls = self.calls.write();
            let call = calls.get_mut(&id).ok_or(StoreError::CallNotFound(id))?;
            if call.is_terminal() {
                return Err(StoreError::CallTerminal(id));
            }

            if let Some(status) = patch.status {
                call.status = status;
            }
            if let Some(answered_at) = patch.answered_at {
                call.answered_at = Some(answered_at);
            }
            if let Some(ended_at) = patch.ended_at {
                call.ended_at = Some(ended_at);
            }
            if let Some(duration_secs) = patch.duration_secs {
                call.duration_secs = Some(duration_secs);
            }
            if let Some(end_reason) = patch.end_reason {
                call.end_reason = Some(end_reason);
            }
            call.clone()
        };

        *self.update_counts.write().entry(id).or_insert(0) += 1;
        let _ = self.events.send(StoreEvent::CallUpdated(updated.clone()));
        Ok(updated)
    }

    async fn append_signal(&self, new_signal: NewSignal) -> Result<Signal, StoreError> {
        let signal = {
            let mut signals = self.signals.write();
            let log = signals.entry(new_signal.call_id).or_default();
            let signal = Signal {
                id: Uuid::new_v4(),
                call_id: new_signal.call_id,
                sender: new_signal.sender,
                receiver: new_signal.receiver,
                kind: new_signal.kind,
                payload: new_signal.payload,
                seq: log.len() as i64 + 1,
                created_at: Utc::now(),
            };
            log.push(signal.clone());
            signal
        };

        let _ = self.events.send(StoreEvent::SignalAppended(signal.clone()));
        Ok(signal)
    }

    async fn list_signals(&self, call_id: Uuid) -> Result<Vec<Signal>, StoreError> {
        Ok(self.signals.read().get(&call_id).cloned().unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// TESTS
// ============================================================================
