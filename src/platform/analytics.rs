//! Analytics-Senke (fire-and-forget)
//!
//! Qualitäts-, Nutzungs- und Fehlerdaten gehen an einen externen
//! Mitspieler. Die Methoden geben bewusst `()` zurück: ein Ausfall der
//! Senke darf den Anruf nie beeinträchtigen, Implementierungen schlucken
//! ihre eigenen Fehler.

use crate::call::events::ErrorCategory;
use crate::call::model::{CallKind, CallStatus, ConnectionMetrics};
use crate::rtc::quality::QualityTier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

// ============================================================================
// REPORTS
// ============================================================================

/// Eine Qualitäts-Stichprobe während eines aktiven Anrufs
#[derive(Debug, Clone, Serialize)]
pub struct CallQualityReport {
    pub call_id: Uuid,
    pub metrics: ConnectionMetrics,
    pub tier: QualityTier,
    pub sampled_at: DateTime<Utc>,
}

/// Abschluss-Daten eines beendeten Anrufs
#[derive(Debug, Clone, Serialize)]
pub struct CallUsageReport {
    pub call_id: Uuid,
    pub kind: CallKind,
    pub status: CallStatus,
    pub duration_secs: i64,
    pub reconnect_attempts: u32,
}

/// Ein gemeldeter Fehler
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub call_id: Option<Uuid>,
    pub category: ErrorCategory,
    pub message: String,
}

// ============================================================================
// SINK TRAIT
// ============================================================================

/// Externe Monitoring-Senke
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record_call_quality(&self, report: CallQualityReport);
    async fn record_usage(&self, report: CallUsageReport);
    async fn record_error(&self, report: ErrorReport);
}

/// Verwirft alles
pub struct NullAnalytics;

#[async_trait]
impl AnalyticsSink for NullAnalytics {
    async fn record_call_quality(&self, _report: CallQualityReport) {}
    async fn record_usage(&self, _report: CallUsageReport) {}
    async fn record_error(&self, _report: ErrorReport) {}
}

/// Schreibt Reports ins Log (Entwicklung)
pub struct LogAnalytics;

#[async_trait]
impl AnalyticsSink for LogAnalytics {
    async fn record_call_quality(&self, report: CallQualityReport) {
        tracing::debug!(
            "Call {} quality: tier={} bandwidth={}bps loss={:.2}% jitter={:.1}ms",
            report.call_id,
            report.tier.label(),
            report.metrics.bandwidth_bps,
            report.metrics.packet_loss * 100.0,
            report.metrics.jitter_ms
        );
    }

    async fn record_usage(&self, report: CallUsageReport) {
        tracing::info!(
            "Call {} finished: status={:?} duration={}s reconnects={}",
            report.call_id,
            report.status,
            report.duration_secs,
            report.reconnect_attempts
        );
    }

    async fn record_error(&self, report: ErrorReport) {
        tracing::warn!(
            "Call error ({:?}, call={:?}): {}",
            report.category,
            report.call_id,
            report.message
        );
    }
}
