//! Signal-Transport: Zustellung über den externen Kanal
//!
//! Der Transport stellt Signale zuverlässig, aber at-least-once zu.
//! Empfänger müssen Duplikate tolerieren; pro Anruf ist die Reihenfolge
//! monoton nach Erstellzeit/Sequenz. `StoreTransport` ist das
//! Standard-Backend über den Call-Store und dessen Pub/Sub-Kanal.

use crate::call::model::{NewSignal, Signal};
use crate::platform::{CallStore, StoreError, StoreEvent};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Transport connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Failed to deliver signal: {0}")]
    DeliveryFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Zustellkanal für Signale
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Sendet ein Signal an den Empfänger; liefert den persistierten Record
    async fn send(&self, signal: NewSignal) -> Result<Signal, TransportError>;

    /// Sendet einen Kandidaten-Batch in Reihenfolge.
    ///
    /// Ein Batch entspricht einem Flush des Dispatchers und damit einem
    /// Round-Trip; Backends können ihn als Ganzes übertragen.
    async fn send_batch(&self, signals: Vec<NewSignal>) -> Result<Vec<Signal>, TransportError> {
        let mut sent = Vec::with_capacity(signals.len());
        for signal in signals {
            sent.push(self.send(signal).await?);
        }
        Ok(sent)
    }

    /// Eingehende Signale, die an die eigene Identität adressiert sind
    fn incoming(&self) -> broadcast::Receiver<Signal>;
}

// ============================================================================
// STORE TRANSPORT
// ============================================================================

/// Transport über den Call-Store: Senden ist `append_signal`, Empfangen
/// filtert die Änderungs-Benachrichtigungen nach Adressat.
pub struct StoreTransport {
    store: Arc<dyn CallStore>,
    incoming_tx: broadcast::Sender<Signal>,
}

impl StoreTransport {
    pub fn new(store: Arc<dyn CallStore>, identity: impl Into<String>) -> Arc<Self> {
        let (incoming_tx, _) = broadcast::channel(256);
        let transport = Arc::new(Self {
            store,
            incoming_tx,
        });

        let identity = identity.into();
        let mut events = transport.store.subscribe();
        let forward_tx = transport.incoming_tx.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::SignalAppended(signal)) => {
                        if signal.receiver == identity {
                            let _ = forward_tx.send(signal);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Store transport lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        transport
    }
}

#[async_trait]
impl SignalTransport for StoreTransport {
    async fn send(&self, signal: NewSignal) -> Result<Signal, TransportError> {
        Ok(self.store.append_signal(signal).await?)
    }

    fn incoming(&self) -> broadcast::Receiver<Signal> {
        self.incoming_tx.subscribe()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::model::{CallKind, NewCall, SignalKind};
    use crate::platform::MemoryStore;

    #[tokio::test]
    async fn test_store_transport_routes_by_receiver() {
        let store = Arc::new(MemoryStore::new());
        let call = store
            .create_call(NewCall {
                room_id: "room".to_string(),
                caller: "alice".to_string(),
                receiver: "bob".to_string(),
                kind: CallKind::Audio,
            })
            .await
            .unwrap();

        let for_bob = StoreTransport::new(store.clone(), "bob");
        let for_alice = StoreTransport::new(store.clone(), "alice");
        let mut bob_rx = for_bob.incoming();
        let mut alice_rx = for_alice.incoming();

        for_bob
            .send(NewSignal {
                call_id: call.id,
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
                kind: SignalKind::Offer,
                payload: serde_json::json!({ "v": 1, "type": "offer", "sdp": "x" }),
            })
            .await
            .unwrap();

        let received = bob_rx.recv().await.unwrap();
        assert_eq!(received.kind, SignalKind::Offer);
        assert_eq!(received.receiver, "bob");

        // Alice ist nicht Adressat und bekommt nichts
        assert!(alice_rx.try_recv().is_err());
    }
}
