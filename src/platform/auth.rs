//! Autorisierung und Rate-Limits
//!
//! Berechtigungen kommen von einem externen Mitspieler; die Engine prüft
//! nur das Ergebnis. Der `RateLimiter` drosselt Operationen pro
//! (Identität, Operation) in einem gleitenden Fenster; wer das Limit
//! reißt, bekommt den Fehler zurück statt in einer Queue zu landen.

use crate::config::RateLimitConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
#[error("Not permitted to call {receiver} in room {room}")]
pub struct PermissionError {
    pub room: String,
    pub receiver: String,
}

#[derive(Error, Debug, Clone)]
#[error("Rate limit exceeded for '{operation}': {max_ops} ops per {window:?}")]
pub struct RateLimitError {
    pub operation: String,
    pub max_ops: u32,
    pub window: Duration,
}

// ============================================================================
// AUTHORIZER
// ============================================================================

/// Externe Berechtigungsprüfung vor dem Anrufaufbau
#[async_trait]
pub trait CallAuthorizer: Send + Sync {
    async fn can_initiate_call(&self, caller: &str, room: &str, receiver: &str) -> bool;
}

/// Erlaubt alles (Entwicklung und Tests)
pub struct OpenAuthorizer;

#[async_trait]
impl CallAuthorizer for OpenAuthorizer {
    async fn can_initiate_call(&self, _caller: &str, _room: &str, _receiver: &str) -> bool {
        true
    }
}

// ============================================================================
// RATE LIMITER
// ============================================================================

/// Sliding-Window Limiter pro (Identität, Operation)
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(String, String), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Verbucht eine Operation oder lehnt sie ab
    pub fn check(&self, identity: &str, operation: &str) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows
            .entry((identity.to_string(), operation.to_string()))
            .or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) > self.config.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.config.max_ops as usize {
            return Err(RateLimitError {
                operation: operation.to_string(),
                max_ops: self.config.max_ops,
                window: self.config.window,
            });
        }

        window.push_back(now);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_ops: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_ops,
            window: Duration::from_millis(window_ms),
        })
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = limiter(3, 1000);
        for _ in 0..3 {
            limiter.check("alice", "start_call").unwrap();
        }
        assert!(limiter.check("alice", "start_call").is_err());
    }

    #[test]
    fn test_limits_are_keyed_per_identity_and_operation() {
        let limiter = limiter(1, 1000);
        limiter.check("alice", "start_call").unwrap();
        limiter.check("alice", "signal:offer").unwrap();
        limiter.check("bob", "start_call").unwrap();
        assert!(limiter.check("alice", "start_call").is_err());
    }

    #[test]
    fn test_window_expires() {
        let limiter = limiter(1, 30);
        limiter.check("alice", "start_call").unwrap();
        assert!(limiter.check("alice", "start_call").is_err());

        std::thread::sleep(Duration::from_millis(50));
        limiter.check("alice", "start_call").unwrap();
    }
}
