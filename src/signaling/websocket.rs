//! WebSocket-Bridge zum Realtime-Gateway
//!
//! Alternatives Transport-Backend: hält eine WebSocket-Verbindung zum
//! Gateway der Plattform, mit getrennten Lese-/Schreib-Tasks und einer
//! mpsc-Queue für ausgehende Frames. Signale laufen als getaggte
//! JSON-Frames (siehe `messages`).

use crate::call::model::{NewSignal, Signal};
use crate::signaling::messages::{ClientFrame, ServerFrame, WireSignal};
use crate::signaling::transport::{SignalTransport, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct WsState {
    is_connected: bool,
}

// ============================================================================
// WEBSOCKET TRANSPORT
// ============================================================================

/// WebSocket-Transport für Signale
pub struct WsTransport {
    server_url: String,
    identity: String,
    state: RwLock<WsState>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    incoming_tx: broadcast::Sender<Signal>,
}

impl WsTransport {
    pub fn new(server_url: impl Into<String>, identity: impl Into<String>) -> Self {
        let (incoming_tx, _) = broadcast::channel(256);
        Self {
            server_url: server_url.into(),
            identity: identity.into(),
            state: RwLock::new(WsState::default()),
            tx: Mutex::new(None),
            incoming_tx,
        }
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Gateway und meldet die eigene Identität an
    pub async fn connect(&self) -> Result<(), TransportError> {
        let ws_url = Url::parse(&format!("{}/ws", self.server_url.replace("http", "ws")))
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connecting to signaling gateway: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.lock() = Some(tx.clone());
        self.state.write().is_connected = true;

        // Read-Task: Frames parsen und Signale weiterreichen
        let incoming_tx = self.incoming_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(ServerFrame::Signal { signal }) => {
                                let _ = incoming_tx.send(signal.into());
                            }
                            Ok(ServerFrame::Welcome { identity }) => {
                                tracing::info!("Gateway accepted identity {}", identity);
                            }
                            Ok(ServerFrame::Error { code, message }) => {
                                tracing::error!("Gateway error {}: {}", code, message);
                            }
                            Ok(ServerFrame::Pong) => {}
                            Err(e) => {
                                tracing::warn!("Unparseable gateway frame: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by gateway");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Write-Task: ausgehende Frames aus der Queue senden
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        self.send_frame(&ClientFrame::Hello {
            identity: self.identity.clone(),
        })
        .await
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let text = serde_json::to_string(frame)
            .map_err(|e| TransportError::DeliveryFailed(e.to_string()))?;

        tx.send(text)
            .await
            .map_err(|e| TransportError::DeliveryFailed(e.to_string()))
    }
}

#[async_trait]
impl SignalTransport for WsTransport {
    async fn send(&self, signal: NewSignal) -> Result<Signal, TransportError> {
        // Das Gateway vergibt die verbindliche Sequenz; lokal wird das
        // Signal mit Sendezeitpunkt gestempelt zurückgegeben.
        let signal = Signal {
            id: Uuid::new_v4(),
            call_id: signal.call_id,
            sender: signal.sender,
            receiver: signal.receiver,
            kind: signal.kind,
            payload: signal.payload,
            seq: 0,
            created_at: Utc::now(),
        };

        self.send_frame(&ClientFrame::Publish {
            signal: WireSignal::from(signal.clone()),
        })
        .await?;

        Ok(signal)
    }

    fn incoming(&self) -> broadcast::Receiver<Signal> {
        self.incoming_tx.subscribe()
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("server_url", &self.server_url)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}
