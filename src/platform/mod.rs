//! Externe Mitspieler der Engine
//!
//! Dieses Modul bündelt die Trait-Nahtstellen nach außen:
//! - Persistenz und Änderungs-Benachrichtigung (`CallStore`)
//! - Berechtigungen und Rate-Limits (`CallAuthorizer`, `RateLimiter`)
//! - Monitoring-Senke (`AnalyticsSink`)

mod analytics;
mod auth;
mod store;

pub use analytics::{
    AnalyticsSink, CallQualityReport, CallUsageReport, ErrorReport, LogAnalytics, NullAnalytics,
};
pub use auth::{CallAuthorizer, OpenAuthorizer, PermissionError, RateLimitError, RateLimiter};
pub use store::{CallStore, MemoryStore, StoreError, StoreEvent};
