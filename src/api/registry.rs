// =============================================================================
// Downstream client registry
// =============================================================================
//
// Connected clients are held as send handles in one mutex-guarded map. The
// websocket handler owns the receive half and only registers the send half
// here, so the broadcaster can fan out without touching connection state.
// A failed send is terminal for a client: it is removed and closed, never
// retried.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use parking_lot::Mutex;

type WsSink = SplitSink<WebSocket, Message>;

/// Send handle for one connected client.
#[derive(Clone)]
pub struct ClientHandle {
    pub id: u64,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
}

impl ClientHandle {
    /// Send one text frame. The sink mutex only serialises the broadcaster
    /// against the join-snapshot send for the same client.
    pub async fn send_text(&self, text: String) -> Result<(), axum::Error> {
        self.sink.lock().await.send(Message::Text(text)).await
    }

    /// Best-effort close frame; the peer may already be gone.
    pub async fn close(&self) {
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
    }
}

/// The set of connected downstream clients.
pub struct ClientRegistry {
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a freshly accepted connection and return its handle.
    pub fn register(&self, sink: WsSink) -> ClientHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ClientHandle {
            id,
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
        };
        self.clients.lock().insert(id, handle.clone());
        handle
    }

    /// Remove a client. Returns the handle if it was still registered, so
    /// exactly one caller wins when the reader and the broadcaster race to
    /// drop the same client.
    pub fn remove(&self, id: u64) -> Option<ClientHandle> {
        self.clients.lock().remove(&id)
    }

    /// Consistent copy of the current client set for one fan-out round.
    pub fn handles(&self) -> Vec<ClientHandle> {
        self.clients.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
