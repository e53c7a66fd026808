//! Signaling: Wire-Format, Transport und Dispatcher
//!
//! Dieses Modul verwaltet den Signal-Austausch:
//! - Versionierte Payloads und Validierung (`messages`)
//! - Zustellung über Store oder WebSocket-Gateway (`transport`, `websocket`)
//! - Batching und Priorisierung ausgehender Signale (`dispatcher`)

pub mod dispatcher;
pub mod messages;
pub mod transport;
pub mod websocket;

pub use dispatcher::{DispatchError, SignalDispatcher};
pub use messages::{SignalBody, SignalPayload, ValidationError, PAYLOAD_VERSION};
pub use transport::{SignalTransport, StoreTransport, TransportError};
pub use websocket::WsTransport;
