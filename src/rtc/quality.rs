//! Qualitätsregelung
//!
//! Tastet die Verbindungs-Statistik in festem Intervall ab und passt die
//! ausgehende Video-Qualität an. Die Stufenwahl ist eine reine Funktion
//! von Paketverlust und Bandbreite; die restriktivste Bedingung gewinnt.
//! Manuelles Override schaltet die Automatik ab bis sie wieder
//! freigegeben wird.

use crate::call::model::ConnectionMetrics;
use crate::platform::{AnalyticsSink, CallQualityReport};
use crate::rtc::link::{LinkState, PeerLink, TransportStats};
use crate::rtc::media::{LocalMedia, VideoConstraints};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// QUALITY TIERS
// ============================================================================

/// Diskrete Qualitätsstufen für ausgehendes Video
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityTier {
    pub fn video_constraints(self) -> VideoConstraints {
        match self {
            QualityTier::Low => VideoConstraints {
                width: 320,
                height: 240,
                frame_rate: 15,
            },
            QualityTier::Medium => VideoConstraints {
                width: 640,
                height: 480,
                frame_rate: 24,
            },
            QualityTier::High => VideoConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
            },
            QualityTier::Ultra => VideoConstraints {
                width: 1920,
                height: 1080,
                frame_rate: 30,
            },
        }
    }

    /// Obergrenze für den ausgehenden Encoder
    pub fn max_bitrate_bps(self) -> u32 {
        match self {
            QualityTier::Low => 150_000,
            QualityTier::Medium => 500_000,
            QualityTier::High => 1_200_000,
            QualityTier::Ultra => 2_500_000,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
            QualityTier::Ultra => "ultra",
        }
    }
}

/// Stufenwahl aus Paketverlust und Bandbreite.
///
/// `None` heißt: aktuelle Stufe beibehalten.
pub fn select_tier(packet_loss: f64, bandwidth_bps: u64) -> Option<QualityTier> {
    if packet_loss > 0.05 || bandwidth_bps < 300_000 {
        Some(QualityTier::Low)
    } else if packet_loss > 0.02 || bandwidth_bps < 800_000 {
        Some(QualityTier::Medium)
    } else if bandwidth_bps > 3_000_000 {
        Some(QualityTier::Ultra)
    } else if bandwidth_bps > 1_500_000 {
        Some(QualityTier::High)
    } else {
        None
    }
}

// ============================================================================
// QUALITY STATE
// ============================================================================

/// Geteilter Regelungs-Zustand eines Anrufs
#[derive(Debug, Clone, Copy)]
pub struct QualityState {
    pub current: QualityTier,
    /// Manuelles Override deaktiviert die Automatik
    pub manual: bool,
}

impl Default for QualityState {
    fn default() -> Self {
        Self {
            current: QualityTier::High,
            manual: false,
        }
    }
}

/// Wendet eine Stufe auf Medien und Verbindung an
pub(crate) fn apply_tier(link: &Arc<dyn PeerLink>, media: &LocalMedia, tier: QualityTier) {
    if let Some(video) = &media.video {
        video.apply_constraints(tier.video_constraints());
        video.set_max_bitrate(tier.max_bitrate_bps());
    }
    link.set_video_bitrate(tier.max_bitrate_bps());
    tracing::info!("Video quality set to {}", tier.label());
}

// ============================================================================
// QUALITY CONTROLLER
// ============================================================================

pub(crate) struct QualityCtx {
    pub call_id: Uuid,
    pub link: Arc<dyn PeerLink>,
    pub media: LocalMedia,
    pub metrics: Arc<RwLock<ConnectionMetrics>>,
    pub quality: Arc<Mutex<QualityState>>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub interval: Duration,
    pub cancel: watch::Receiver<bool>,
    /// Meldet angewandte Stufenwechsel an die Engine (Event-Emission)
    pub on_change: Box<dyn Fn(QualityTier) + Send + Sync>,
}

/// Startet die Abtast-Schleife eines Anrufs
pub(crate) fn spawn_quality_loop(mut ctx: QualityCtx) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut prev: Option<TransportStats> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.cancel.changed() => break,
            }

            let state = ctx.link.state();
            if state.is_terminal() {
                break;
            }
            if state != LinkState::Connected {
                // Während Reconnects keine Deltas über die Lücke rechnen
                prev = None;
                continue;
            }

            // Transiente Statistik-Fehler werden geschluckt
            let stats = match ctx.link.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::debug!("Stat collection failed for call {}: {}", ctx.call_id, e);
                    continue;
                }
            };

            let Some(previous) = prev.replace(stats) else {
                // Erste Stichprobe liefert nur die Basis für Deltas
                continue;
            };

            let sample = derive_sample(&previous, &stats, ctx.interval);

            if sample.has_traffic {
                let mut metrics = ctx.metrics.write();
                metrics.bandwidth_bps = sample.bandwidth_bps;
                metrics.packet_loss = sample.packet_loss;
                metrics.jitter_ms = sample.jitter_ms;
            }

            let (current, manual) = {
                let q = ctx.quality.lock();
                (q.current, q.manual)
            };

            let snapshot = *ctx.metrics.read();
            ctx.analytics
                .record_call_quality(CallQualityReport {
                    call_id: ctx.call_id,
                    metrics: snapshot,
                    tier: current,
                    sampled_at: chrono::Utc::now(),
                })
                .await;

            if manual {
                continue;
            }

            // Ohne Verkehr im Intervall gibt es nichts zu bewerten
            if !sample.has_traffic {
                continue;
            }

            if let Some(target) = select_tier(sample.packet_loss, sample.bandwidth_bps) {
                // Gleiche Stufe erneut anzuwenden ist ein No-op
                if target != current {
                    apply_tier(&ctx.link, &ctx.media, target);
                    ctx.quality.lock().current = target;
                    (ctx.on_change)(target);
                }
            }
        }
    })
}

struct QualitySample {
    bandwidth_bps: u64,
    packet_loss: f64,
    jitter_ms: f64,
    has_traffic: bool,
}

/// Leitet Bandbreite, Verlustquote und Jitter aus zwei Stichproben ab
fn derive_sample(prev: &TransportStats, now: &TransportStats, interval: Duration) -> QualitySample {
    let secs = interval.as_secs_f64().max(0.001);

    let bytes_delta = now.bytes_received.saturating_sub(prev.bytes_received);
    let bandwidth_bps = (bytes_delta as f64 * 8.0 / secs) as u64;

    let received_delta = now.packets_received.saturating_sub(prev.packets_received);
    let lost_delta = (now.packets_lost - prev.packets_lost).max(0) as u64;
    let total = received_delta + lost_delta;
    let packet_loss = if total > 0 {
        lost_delta as f64 / total as f64
    } else {
        0.0
    };

    QualitySample {
        bandwidth_bps,
        packet_loss,
        jitter_ms: now.jitter_secs * 1000.0,
        has_traffic: bytes_delta > 0 || total > 0,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ladder_is_ordered() {
        assert!(QualityTier::Low < QualityTier::Medium);
        assert!(QualityTier::Medium < QualityTier::High);
        assert!(QualityTier::High < QualityTier::Ultra);
    }

    #[test]
    fn test_select_tier_policy() {
        // Starker Verlust schlägt alles
        assert_eq!(select_tier(0.06, 5_000_000), Some(QualityTier::Low));
        // Wenig Bandbreite ebenso
        assert_eq!(select_tier(0.0, 200_000), Some(QualityTier::Low));
        assert_eq!(select_tier(0.03, 5_000_000), Some(QualityTier::Medium));
        assert_eq!(select_tier(0.0, 700_000), Some(QualityTier::Medium));
        assert_eq!(select_tier(0.0, 3_500_000), Some(QualityTier::Ultra));
        assert_eq!(select_tier(0.0, 2_000_000), Some(QualityTier::High));
        // Mittelfeld: Stufe halten
        assert_eq!(select_tier(0.01, 1_000_000), None);
    }

    #[test]
    fn test_select_tier_is_monotonic_in_loss() {
        // Bei fester Bandbreite darf mehr Verlust nie eine höhere Stufe wählen
        for bandwidth in [400_000u64, 1_000_000, 2_000_000, 4_000_000] {
            let mut last = QualityTier::Ultra;
            for loss_pct in 0..=10 {
                let loss = loss_pct as f64 / 100.0;
                if let Some(tier) = select_tier(loss, bandwidth) {
                    assert!(
                        tier <= last,
                        "tier increased at loss={} bandwidth={}",
                        loss,
                        bandwidth
                    );
                    last = tier;
                }
            }
        }
    }

    #[test]
    fn test_derive_sample() {
        let prev = TransportStats {
            bytes_received: 1_000,
            packets_received: 90,
            packets_lost: 0,
            jitter_secs: 0.0,
        };
        let now = TransportStats {
            bytes_received: 626_000,
            packets_received: 180,
            packets_lost: 10,
            jitter_secs: 0.02,
        };

        let sample = derive_sample(&prev, &now, Duration::from_secs(5));
        assert_eq!(sample.bandwidth_bps, 1_000_000);
        assert!((sample.packet_loss - 0.1).abs() < 1e-9);
        assert!((sample.jitter_ms - 20.0).abs() < 1e-9);
    }
}
