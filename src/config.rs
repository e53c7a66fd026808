//! Engine-Konfiguration
//!
//! Bündelt alle Richtwerte an einer Stelle statt sie pro Anruf
//! hartzukodieren: ICE-Server, Signal-Batching, Retry-Verhalten,
//! Rate-Limits und das Abtast-Intervall der Qualitätsregelung.

use crate::rtc::quality::QualityTier;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// ICE SERVER
// ============================================================================

/// Ein STUN/TURN-Server-Eintrag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN-Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            username: String::new(),
            credential: String::new(),
        },
    ]
}

// ============================================================================
// POLICIES
// ============================================================================

/// Begrenzung pro (Identität, Operation) in einem gleitenden Fenster
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_ops: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_ops: 30,
            window: Duration::from_secs(10),
        }
    }
}

/// Wiederverbindungs-Verhalten nach Verbindungsabbruch
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Konfiguration der Call-Engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Eigene, bereits verifizierte Identität (Authentifizierung ist
    /// Sache der Plattform, nicht der Engine)
    pub identity: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Zeitfenster in dem eine (Wieder-)Verbindung `Connected` erreichen muss
    pub connect_timeout: Duration,
    /// ICE-Kandidaten werden bis zu dieser Anzahl gesammelt
    pub signal_batch_size: usize,
    /// ... oder nach dieser Wartezeit gesendet, je nachdem was zuerst eintritt
    pub signal_batch_delay: Duration,
    /// Maximale Größe einer serialisierten Signal-Payload
    pub max_payload_bytes: usize,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    /// Abtast-Intervall der Qualitätsregelung
    pub quality_interval: Duration,
    /// Start-Stufe der Automatik (passend zu den 720p-Start-Constraints)
    pub initial_quality: QualityTier,
}

impl EngineConfig {
    /// Erstellt eine Konfiguration mit Standardwerten für die gegebene Identität
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ice_servers: default_ice_servers(),
            connect_timeout: Duration::from_secs(15),
            signal_batch_size: 10,
            signal_batch_delay: Duration::from_millis(100),
            max_payload_bytes: 64 * 1024,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            quality_interval: Duration::from_secs(5),
            initial_quality: QualityTier::High,
        }
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }
}
