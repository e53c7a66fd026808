//! Wiederverbindung nach Verbindungsabbruch
//!
//! Wird angestoßen wenn die Verbindung `Failed` oder `Disconnected`
//! meldet. Begrenzte Versuche mit exponentiell wachsender, gedeckelter
//! Wartezeit; der Retry-Zustand ist ein unveränderlicher Wert, der durch
//! die Schleife gereicht wird. Abbruch per Cancel-Kanal und
//! Generationszähler: ein verspätet fertiger Versuch für einen
//! inzwischen beendeten Anruf wird verworfen statt angewandt.

use crate::config::RetryConfig;
use crate::rtc::connection::ConnectionManager;
use crate::rtc::link::{LinkEvent, LinkState, PeerLink, SignalingError};
use crate::rtc::media::LocalMedia;
use crate::signaling::dispatcher::SignalDispatcher;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

// ============================================================================
// RETRY STATE
// ============================================================================

/// Unveränderlicher Zustand eines Wiederverbindungs-Versuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    /// Wartezeit vor diesem Versuch
    pub next_delay: Duration,
}

impl RetryState {
    pub fn first(config: &RetryConfig) -> Self {
        Self {
            attempt: 1,
            max_attempts: config.max_attempts,
            next_delay: Self::delay_for(1, config),
        }
    }

    /// Der Folgeversuch, oder `None` wenn das Budget erschöpft ist
    pub fn next(&self, config: &RetryConfig) -> Option<Self> {
        let attempt = self.attempt + 1;
        (attempt <= self.max_attempts).then(|| Self {
            attempt,
            max_attempts: self.max_attempts,
            next_delay: Self::delay_for(attempt, config),
        })
    }

    /// `min(base × 2^(attempt-1), max)`
    fn delay_for(attempt: u32, config: &RetryConfig) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        (config.base_delay * factor).min(config.max_delay)
    }
}

// ============================================================================
// RECONNECT LOOP
// ============================================================================

/// Ergebnis der Wiederverbindungs-Schleife
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectOutcome {
    /// Verbindung steht wieder, der Anruf bleibt aktiv
    Recovered,
    /// Alle Versuche verbraucht; Ressourcen sind abgeräumt, der
    /// Call-Record bleibt unberührt, das entscheidet die Engine
    Exhausted,
    /// Anruf wurde währenddessen beendet
    Cancelled,
}

pub(crate) struct ReconnectCtx {
    pub call_id: Uuid,
    /// Nur die ursprüngliche Anrufer-Seite erstellt ein frisches Offer,
    /// die Gegenseite wartet passiv darauf
    pub is_caller: bool,
    pub identity: String,
    pub remote: String,
    pub manager: Arc<ConnectionManager>,
    pub dispatcher: SignalDispatcher,
    pub media: LocalMedia,
    pub retry: RetryConfig,
    pub connect_timeout: Duration,
    pub cancel: watch::Receiver<bool>,
    pub generation: Arc<AtomicU64>,
    pub generation_at_start: u64,
    /// Zählt unternommene Versuche für den Nutzungs-Report
    pub attempt_counter: Arc<AtomicU32>,
    /// Hängt eine neu gebaute Verbindung wieder in die Session ein
    pub wire_link: Box<dyn Fn(&Arc<dyn PeerLink>) + Send + Sync>,
}

/// Führt die Wiederverbindungs-Schleife aus
pub(crate) async fn run_reconnect(ctx: ReconnectCtx) -> ReconnectOutcome {
    let mut cancel = ctx.cancel.clone();
    let mut state = RetryState::first(&ctx.retry);

    loop {
        tracing::info!(
            "Reconnect attempt {}/{} for call {} in {:?}",
            state.attempt,
            state.max_attempts,
            ctx.call_id,
            state.next_delay
        );

        tokio::select! {
            _ = tokio::time::sleep(state.next_delay) => {}
            _ = cancel.changed() => return ReconnectOutcome::Cancelled,
        }

        if ctx.generation.load(Ordering::SeqCst) != ctx.generation_at_start {
            return ReconnectOutcome::Cancelled;
        }

        ctx.attempt_counter.fetch_add(1, Ordering::SeqCst);

        let result = tokio::select! {
            result = attempt_reconnect(&ctx) => result,
            _ = cancel.changed() => return ReconnectOutcome::Cancelled,
        };

        // Ein verspätet fertiger Versuch für einen beendeten Anruf wird
        // verworfen, nicht angewandt
        if ctx.generation.load(Ordering::SeqCst) != ctx.generation_at_start {
            return ReconnectOutcome::Cancelled;
        }

        match result {
            Ok(()) => {
                tracing::info!("Call {} reconnected on attempt {}", ctx.call_id, state.attempt);
                return ReconnectOutcome::Recovered;
            }
            Err(e) => {
                tracing::warn!(
                    "Reconnect attempt {} for call {} failed: {}",
                    state.attempt,
                    ctx.call_id,
                    e
                );
                match state.next(&ctx.retry) {
                    Some(next) => state = next,
                    None => {
                        ctx.manager.discard(ctx.call_id).await;
                        return ReconnectOutcome::Exhausted;
                    }
                }
            }
        }
    }
}

/// Ein einzelner Versuch: Verbindung wiederverwenden oder neu bauen,
/// Medien anhängen, als Anrufer ein frisches Offer senden und auf
/// `Connected` warten
async fn attempt_reconnect(ctx: &ReconnectCtx) -> Result<(), SignalingError> {
    let (link, reused) = match ctx.manager.pooled(ctx.call_id) {
        // Noch offene Verbindung: per ICE-Restart weiterverwenden
        Some(link) if link.state() == LinkState::Disconnected => (link, true),
        _ => {
            ctx.manager.discard(ctx.call_id).await;
            let link = ctx.manager.open_link(ctx.call_id).await?;
            link.attach_media(&ctx.media).await?;
            (ctx.wire_link)(&link);
            (link, false)
        }
    };

    let mut events = link.subscribe();

    if ctx.is_caller {
        let offer = link.create_offer(reused).await?;
        ctx.dispatcher
            .dispatch(
                ctx.call_id,
                ctx.identity.clone(),
                ctx.remote.clone(),
                offer,
            )
            .await
            .map_err(|e| SignalingError::new("reconnect", e))?;
    }

    if link.state() == LinkState::Connected {
        return Ok(());
    }

    let wait_connected = async {
        loop {
            match events.recv().await {
                Ok(LinkEvent::StateChanged(LinkState::Connected)) => return Ok(()),
                Ok(LinkEvent::StateChanged(LinkState::Failed)) => {
                    return Err(SignalingError::new("reconnect", "connection failed"))
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if link.state() == LinkState::Connected {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SignalingError::new("reconnect", "connection closed"))
                }
            }
        }
    };

    tokio::time::timeout(ctx.connect_timeout, wait_connected)
        .await
        .map_err(|_| SignalingError::new("reconnect", "timed out waiting for connection"))?
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_double_up_to_budget() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        };

        let first = RetryState::first(&config);
        assert_eq!(first.attempt, 1);
        assert_eq!(first.next_delay, Duration::from_millis(1000));

        let second = first.next(&config).unwrap();
        assert_eq!(second.next_delay, Duration::from_millis(2000));

        let third = second.next(&config).unwrap();
        assert_eq!(third.next_delay, Duration::from_millis(4000));

        // Budget erschöpft
        assert!(third.next(&config).is_none());
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let config = RetryConfig {
            max_attempts: 6,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        };

        let mut state = RetryState::first(&config);
        let mut delays = vec![state.next_delay];
        while let Some(next) = state.next(&config) {
            delays.push(next.next_delay);
            state = next;
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
                Duration::from_millis(10_000),
                Duration::from_millis(10_000),
            ]
        );
    }
}
