//! Signal-Dispatcher
//!
//! Entkoppelt "ein Signal muss raus" vom eigentlichen Netzwerk-Schreiben.
//! Offer und Answer gehen sofort raus; ICE-Kandidaten werden pro Anruf
//! gesammelt und als Batch gesendet sobald die Batch-Größe erreicht ist
//! oder die Wartezeit abläuft. Ein Flush leert den Puffer atomar, damit
//! kein Signal doppelt gesendet wird.

use crate::call::model::{NewSignal, SignalKind};
use crate::config::EngineConfig;
use crate::platform::{RateLimitError, RateLimiter};
use crate::signaling::messages::{SignalPayload, ValidationError};
use crate::signaling::transport::{SignalTransport, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// CANDIDATE BATCH
// ============================================================================

/// Gesammelte Kandidaten eines Anrufs.
///
/// `epoch` zählt Flushes; ein geplanter Timer flusht nur wenn seit seiner
/// Planung kein anderer Flush dazwischenkam.
#[derive(Default)]
struct CandidateBatch {
    pending: Vec<NewSignal>,
    epoch: u64,
    flush_scheduled: bool,
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Dispatcher für ausgehende Signale
#[derive(Clone)]
pub struct SignalDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    transport: Arc<dyn SignalTransport>,
    limiter: Arc<RateLimiter>,
    batch_size: usize,
    batch_delay: Duration,
    max_payload_bytes: usize,
    batches: Mutex<HashMap<Uuid, CandidateBatch>>,
}

impl SignalDispatcher {
    pub fn new(
        config: &EngineConfig,
        transport: Arc<dyn SignalTransport>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                transport,
                limiter,
                batch_size: config.signal_batch_size,
                batch_delay: config.signal_batch_delay,
                max_payload_bytes: config.max_payload_bytes,
                batches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validiert und versendet ein Signal.
    ///
    /// Offer/Answer gehen sofort raus, Kandidaten landen im Batch.
    pub async fn dispatch(
        &self,
        call_id: Uuid,
        sender: String,
        receiver: String,
        payload: SignalPayload,
    ) -> Result<(), DispatchError> {
        let kind = payload.kind();
        let encoded = payload.encode(self.inner.max_payload_bytes)?;

        self.inner
            .limiter
            .check(&sender, &format!("signal:{}", kind.as_str()))?;

        let signal = NewSignal {
            call_id,
            sender,
            receiver,
            kind,
            payload: encoded,
        };

        if kind.is_priority() {
            self.inner.transport.send(signal).await?;
            tracing::debug!("Dispatched {} for call {}", kind.as_str(), call_id);
            return Ok(());
        }

        self.enqueue_candidate(signal).await;
        Ok(())
    }

    /// Nimmt einen Kandidaten in den Batch auf und flusht bei Bedarf
    async fn enqueue_candidate(&self, signal: NewSignal) {
        let call_id = signal.call_id;

        let due = {
            let mut batches = self.inner.batches.lock();
            let batch = batches.entry(call_id).or_default();
            batch.pending.push(signal);

            if batch.pending.len() >= self.inner.batch_size {
                // Batch voll: sofort flushen, der laufende Timer läuft leer
                Some(None)
            } else if !batch.flush_scheduled {
                batch.flush_scheduled = true;
                Some(Some(batch.epoch))
            } else {
                None
            }
        };

        match due {
            Some(None) => self.inner.flush(call_id).await,
            Some(Some(epoch)) => {
                let inner = Arc::clone(&self.inner);
                let delay = self.inner.batch_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.flush_if_epoch(call_id, epoch).await;
                });
            }
            None => {}
        }
    }

    /// Verwirft gesammelte Kandidaten eines Anrufs ohne sie zu senden
    pub fn discard_call(&self, call_id: Uuid) {
        self.inner.batches.lock().remove(&call_id);
    }
}

impl DispatcherInner {
    /// Entnimmt den Batch atomar und sendet ihn in Reihenfolge
    async fn flush(&self, call_id: Uuid) {
        let pending = {
            let mut batches = self.batches.lock();
            let Some(batch) = batches.get_mut(&call_id) else {
                return;
            };
            if batch.pending.is_empty() {
                return;
            }
            batch.epoch += 1;
            batch.flush_scheduled = false;
            std::mem::take(&mut batch.pending)
        };

        let count = pending.len();
        // Kandidaten-Verlust ist nicht fatal: loggen und weiter
        if let Err(e) = self.transport.send_batch(pending).await {
            tracing::warn!(
                "Failed to flush {} candidates for call {}: {}",
                count,
                call_id,
                e
            );
        } else {
            tracing::debug!("Flushed {} candidates for call {}", count, call_id);
        }
    }

    async fn flush_if_epoch(&self, call_id: Uuid, epoch: u64) {
        {
            let batches = self.batches.lock();
            let Some(batch) = batches.get(&call_id) else {
                return;
            };
            if batch.epoch != epoch {
                // Zwischenzeitlich geflusht (Batch-Größe erreicht)
                return;
            }
        }
        self.flush(call_id).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::model::Signal;
    use crate::config::RateLimitConfig;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::broadcast;

    /// Transport-Double das Sendungen und Batch-Grenzen aufzeichnet
    struct RecordingTransport {
        sends: Mutex<Vec<Vec<NewSignal>>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sends: Mutex::new(Vec::new()),
            })
        }

        fn batches(&self) -> Vec<Vec<NewSignal>> {
            self.sends.lock().clone()
        }
    }

    #[async_trait]
    impl SignalTransport for RecordingTransport {
        async fn send(&self, signal: NewSignal) -> Result<Signal, TransportError> {
            let recorded = Signal {
                id: Uuid::new_v4(),
                call_id: signal.call_id,
                sender: signal.sender.clone(),
                receiver: signal.receiver.clone(),
                kind: signal.kind,
                payload: signal.payload.clone(),
                seq: 0,
                created_at: Utc::now(),
            };
            self.sends.lock().push(vec![signal]);
            Ok(recorded)
        }

        async fn send_batch(
            &self,
            signals: Vec<NewSignal>,
        ) -> Result<Vec<Signal>, TransportError> {
            self.sends.lock().push(signals.clone());
            Ok(Vec::new())
        }

        fn incoming(&self) -> broadcast::Receiver<Signal> {
            broadcast::channel(1).1
        }
    }

    fn dispatcher(transport: Arc<RecordingTransport>) -> SignalDispatcher {
        let config = EngineConfig::new("alice");
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        SignalDispatcher::new(&config, transport, limiter)
    }

    fn candidate(n: usize) -> SignalPayload {
        SignalPayload::ice_candidate(format!("candidate:{}", n), Some(0), None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifteen_candidates_flush_as_ten_then_five() {
        let transport = RecordingTransport::new();
        let dispatcher = dispatcher(transport.clone());
        let call_id = Uuid::new_v4();

        for n in 0..15 {
            dispatcher
                .dispatch(call_id, "alice".into(), "bob".into(), candidate(n))
                .await
                .unwrap();
        }

        // Wartezeit verstreichen lassen, damit der Rest-Batch flusht
        tokio::time::sleep(Duration::from_millis(200)).await;

        let batches = transport.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[1].len(), 5);

        // Reihenfolge der Einreichung bleibt erhalten
        let order: Vec<String> = batches
            .iter()
            .flatten()
            .map(|s| s.payload["candidate"].as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..15).map(|n| format!("candidate:{}", n)).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_signal_bypasses_batch() {
        let transport = RecordingTransport::new();
        let dispatcher = dispatcher(transport.clone());
        let call_id = Uuid::new_v4();

        for n in 0..3 {
            dispatcher
                .dispatch(call_id, "alice".into(), "bob".into(), candidate(n))
                .await
                .unwrap();
        }
        dispatcher
            .dispatch(
                call_id,
                "alice".into(),
                "bob".into(),
                SignalPayload::offer("v=0".into()),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let batches = transport.batches();
        assert_eq!(batches.len(), 2);
        // Das Offer ging sofort und einzeln raus, vor dem Kandidaten-Flush
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].kind, SignalKind::Offer);
        assert_eq!(batches[1].len(), 3);
        assert!(batches[1].iter().all(|s| s.kind == SignalKind::IceCandidate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_keyed_per_call() {
        let transport = RecordingTransport::new();
        let dispatcher = dispatcher(transport.clone());
        let call_a = Uuid::new_v4();
        let call_b = Uuid::new_v4();

        dispatcher
            .dispatch(call_a, "alice".into(), "bob".into(), candidate(0))
            .await
            .unwrap();
        dispatcher
            .dispatch(call_b, "alice".into(), "carol".into(), candidate(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let batches = transport.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[1].len(), 1);
        assert_ne!(batches[0][0].call_id, batches[1][0].call_id);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected_before_send() {
        let transport = RecordingTransport::new();
        let dispatcher = dispatcher(transport.clone());

        let err = dispatcher
            .dispatch(
                Uuid::new_v4(),
                "alice".into(),
                "bob".into(),
                SignalPayload::offer("   ".into()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Validation(_)));
        assert!(transport.batches().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_pushes_back() {
        let transport = RecordingTransport::new();
        let mut config = EngineConfig::new("alice");
        config.rate_limit = RateLimitConfig {
            max_ops: 2,
            window: Duration::from_secs(10),
        };
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let dispatcher = SignalDispatcher::new(&config, transport.clone(), limiter);
        let call_id = Uuid::new_v4();

        for _ in 0..2 {
            dispatcher
                .dispatch(
                    call_id,
                    "alice".into(),
                    "bob".into(),
                    SignalPayload::offer("v=0".into()),
                )
                .await
                .unwrap();
        }

        let err = dispatcher
            .dispatch(
                call_id,
                "alice".into(),
                "bob".into(),
                SignalPayload::offer("v=0".into()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RateLimited(_)));
    }
}
