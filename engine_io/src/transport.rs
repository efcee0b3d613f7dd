use crate::util::ServerError;
use bytes::Bytes;
use engine_io_parser::packet::Packet;
use std::collections::HashMap;
use std::mem;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::sync::{broadcast, Notify};

/// The socket-like contract the engine expects from a host websocket
/// session. One implementor exists per physical connection; the engine
/// reads the query/header snapshot exactly once while handshaking, so both
/// must be captured before the implementor is registered.
pub trait EngineIoWebSocket: Send + Sync + 'static {
    /// `None` until the session has connected.
    fn query(&self) -> Option<HashMap<String, String>>;
    /// `None` until the session has connected.
    fn connection_headers(&self) -> Option<HashMap<String, Vec<String>>>;
    /// Best-effort write; a dead session swallows the frame silently and
    /// the failure surfaces as an `Error` event instead.
    fn write_text(&self, message: &str);
    fn write_binary(&self, message: Bytes);
    /// Closes the underlying session. Calling this with no session bound
    /// is a caller bug and panics.
    fn close(&self);
    fn subscribe(&self) -> broadcast::Receiver<WebSocketEvent>;
}

/// Events a host websocket session pushes into the engine.
#[derive(Display, Debug, Clone)]
pub enum WebSocketEvent {
    Message { data: MessageData },
    Close,
    Error { label: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageData {
    Text(String),
    Binary(Bytes),
}

#[derive(Display, Debug, Clone, Copy, PartialEq, EnumString)]
pub enum TransportKind {
    #[strum(serialize = "websocket")]
    WebSocket,
    #[strum(serialize = "polling")]
    Polling,
}

impl TransportKind {
    pub fn parse(input: &str) -> Result<TransportKind, ServerError> {
        TransportKind::from_str(input).map_err(|_| ServerError::UnknownTransport)
    }
}

/// Outbound buffer for one polling session. Polling is never writable
/// directly; whenever a poll request arrives the whole buffer is drained.
pub struct PollingTransport {
    buffer: Mutex<Vec<Packet<'static>>>,
    drain: Notify,
}

impl PollingTransport {
    pub fn new() -> Self {
        PollingTransport {
            buffer: Mutex::new(Vec::new()),
            drain: Notify::new(),
        }
    }

    pub fn push(&self, packet: Packet<'static>) {
        self.buffer.lock().unwrap().push(packet);
        self.drain.notify_one();
    }

    /// Releases a parked poll request without queueing data.
    pub fn notify(&self) {
        self.drain.notify_one();
    }

    /// Takes the buffered packets, parking for up to `max_wait` when the
    /// buffer is empty. May return an empty Vec on expiry.
    pub async fn wait_for_packets(&self, max_wait: Duration) -> Vec<Packet<'static>> {
        {
            let mut buffer = self.buffer.lock().unwrap();
            if !buffer.is_empty() {
                return mem::take(&mut *buffer);
            }
        }
        let _ = tokio::time::timeout(max_wait, self.drain.notified()).await;
        mem::take(&mut *self.buffer.lock().unwrap())
    }
}

impl Default for PollingTransport {
    fn default() -> Self {
        PollingTransport::new()
    }
}
