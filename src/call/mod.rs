//! Call-Lifecycle: Datenmodell, Events, Sessions und die Engine
//!
//! Dieses Modul verwaltet:
//! - Call-Records und Signale (`model`)
//! - Getypte Engine-Events (`events`)
//! - Den Zustand einzelner Anrufe (`session`)
//! - Die Lifecycle-Engine als obersten Orchestrator (`engine`)

mod engine;
pub mod events;
pub mod model;
pub(crate) mod session;

pub use engine::{CallEngine, CallEngineError, EngineDeps};
pub use events::{EngineEvent, ErrorCategory, ErrorEvent, EventBus};
pub use model::{
    Call, CallKind, CallPatch, CallStatus, ConnectionMetrics, NewCall, NewSignal, Signal,
    SignalKind,
};
