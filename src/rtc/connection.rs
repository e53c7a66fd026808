//! Peer Connection Manager
//!
//! Besitzt die Verbindungen und lokalen Medien aller aktiven Anrufe.
//! Der Pool ist nach Call-ID adressiert; nur der Manager und die
//! Wiederverbindung fassen ihn an. Eine gepoolte Verbindung, die einen
//! terminalen Zustand erreicht, wird automatisch entfernt.

use crate::rtc::link::{LinkEvent, PeerConnector, PeerLink, SignalingError};
use crate::rtc::media::{LocalMedia, MediaAcquisitionError, MediaConstraints, MediaDevices};
use crate::signaling::messages::SignalPayload;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// CONNECTION POOL
// ============================================================================

/// Verbindungs-Pool, nach Call-ID adressiert
#[derive(Default)]
pub struct ConnectionPool {
    entries: Mutex<HashMap<Uuid, Arc<dyn PeerLink>>>,
}

impl ConnectionPool {
    pub fn get(&self, call_id: Uuid) -> Option<Arc<dyn PeerLink>> {
        self.entries.lock().get(&call_id).cloned()
    }

    fn insert(&self, call_id: Uuid, link: Arc<dyn PeerLink>) {
        self.entries.lock().insert(call_id, link);
    }

    fn remove(&self, call_id: Uuid) -> Option<Arc<dyn PeerLink>> {
        self.entries.lock().remove(&call_id)
    }

    /// Entfernt den Eintrag nur wenn er noch zur gegebenen Verbindung gehört
    fn evict_if(&self, call_id: Uuid, link_id: Uuid) {
        let mut entries = self.entries.lock();
        if entries.get(&call_id).map(|l| l.id()) == Some(link_id) {
            entries.remove(&call_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

/// Verwaltet Verbindungen und lokale Medien
pub struct ConnectionManager {
    connector: Arc<dyn PeerConnector>,
    devices: Arc<dyn MediaDevices>,
    pool: Arc<ConnectionPool>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn PeerConnector>, devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            connector,
            devices,
            pool: Arc::new(ConnectionPool::default()),
        }
    }

    /// Baut eine neue Verbindung, legt sie in den Pool und überwacht
    /// sie auf terminale Zustände
    pub async fn open_link(&self, call_id: Uuid) -> Result<Arc<dyn PeerLink>, SignalingError> {
        let link = self.connector.open(call_id).await?;
        self.pool.insert(call_id, Arc::clone(&link));
        self.spawn_eviction_watcher(call_id, &link);
        Ok(link)
    }

    /// Die gepoolte Verbindung des Anrufs, falls vorhanden
    pub fn pooled(&self, call_id: Uuid) -> Option<Arc<dyn PeerLink>> {
        self.pool.get(call_id)
    }

    /// Schließt die Verbindung des Anrufs und entfernt sie aus dem Pool
    pub async fn discard(&self, call_id: Uuid) {
        if let Some(link) = self.pool.remove(call_id) {
            link.close().await;
        }
    }

    /// Fordert Kamera/Mikrofon an; wird bei Fehlern nie automatisch wiederholt
    pub async fn acquire_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMedia, MediaAcquisitionError> {
        self.devices.acquire(constraints).await
    }

    /// Wendet einen Remote-Kandidaten an; ein einzelner schlechter
    /// Kandidat darf den Anruf nicht abbrechen
    pub async fn apply_remote_candidate(&self, link: &Arc<dyn PeerLink>, payload: &SignalPayload) {
        if let Err(e) = link.apply_remote_candidate(payload).await {
            tracing::warn!("Ignoring ICE candidate failure: {}", e);
        }
    }

    fn spawn_eviction_watcher(&self, call_id: Uuid, link: &Arc<dyn PeerLink>) {
        let link_id = link.id();
        let mut events = link.subscribe();
        let pool = Arc::clone(&self.pool);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::StateChanged(state)) if state.is_terminal() => {
                        tracing::debug!(
                            "Evicting connection {} for call {} ({:?})",
                            link_id,
                            call_id,
                            state
                        );
                        pool.evict_if(call_id, link_id);
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
