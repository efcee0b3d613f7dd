use crate::facade::EngineFacade;
use bytes::Bytes;
use engine_io::transport::{EngineIoWebSocket, MessageData, WebSocketEvent};
use engine_io::util::parse_query_string;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use warp::http::HeaderMap;

const EVENT_BUFFER: usize = 64;

/// Outbound traffic handed to the per-connection writer task.
#[derive(Debug)]
pub enum OutboundFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

/// A live websocket session: the channel into the writer task plus the
/// upgrade-request data the session was accepted with.
pub struct WsSession {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    raw_query: String,
    headers: HeaderMap,
}

impl WsSession {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        raw_query: String,
        headers: HeaderMap,
    ) -> Self {
        WsSession {
            outbound,
            raw_query,
            headers,
        }
    }
}

/// Whether a session is bound doubles as the adapter's state machine:
/// `Disconnected` before connect and after close, `Connected` in between.
enum SessionBinding {
    Disconnected,
    Connected { session: WsSession },
}

/// Adapts one warp websocket session to the socket-like contract the
/// engine expects. Pure translation: no protocol logic lives here.
pub struct WarpEngineIoWebSocket {
    facade: Arc<EngineFacade>,
    binding: RwLock<SessionBinding>,
    query: RwLock<Option<HashMap<String, String>>>,
    headers: RwLock<Option<HashMap<String, Vec<String>>>>,
    events: broadcast::Sender<WebSocketEvent>,
}

impl WarpEngineIoWebSocket {
    pub fn new(facade: Arc<EngineFacade>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        WarpEngineIoWebSocket {
            facade,
            binding: RwLock::new(SessionBinding::Disconnected),
            query: RwLock::new(None),
            headers: RwLock::new(None),
            events,
        }
    }

    /// Binds the session and registers with the engine. The query/header
    /// snapshot is captured first: the engine reads both synchronously
    /// while handshaking, before this call returns.
    pub fn on_ws_connect(self: Arc<Self>, session: WsSession) {
        *self.query.write().unwrap() = Some(parse_query_string(&session.raw_query));
        *self.headers.write().unwrap() = Some(header_multimap(&session.headers));
        *self.binding.write().unwrap() = SessionBinding::Connected { session };

        let ws: Arc<dyn EngineIoWebSocket> = self.clone();
        self.facade.handle_websocket(ws);
    }

    pub fn on_ws_text(&self, message: &str) {
        self.emit(WebSocketEvent::Message {
            data: MessageData::Text(message.to_owned()),
        });
    }

    /// A full-buffer frame is forwarded without copying; a sub-window is
    /// copied out so the emitted payload cannot retain unrelated bytes of
    /// a larger shared buffer.
    pub fn on_ws_binary(&self, payload: Bytes, offset: usize, len: usize) {
        let message = if offset == 0 && len == payload.len() {
            payload
        } else {
            Bytes::copy_from_slice(&payload[offset..offset + len])
        };
        self.emit(WebSocketEvent::Message {
            data: MessageData::Binary(message),
        });
    }

    /// The close notification goes out before the session is unbound, so
    /// the engine observes it while the adapter is still usable.
    pub fn on_ws_close(&self, status_code: u16, reason: &str) {
        tracing::debug!(status_code, reason, "websocket session closed");
        self.emit(WebSocketEvent::Close);
        *self.binding.write().unwrap() = SessionBinding::Disconnected;
    }

    pub fn on_ws_error(&self, cause: &dyn fmt::Display) {
        self.emit(WebSocketEvent::Error {
            label: "write error".to_owned(),
            message: cause.to_string(),
        });
    }

    fn emit(&self, event: WebSocketEvent) {
        // nobody listening is fine: events before registration belong to a
        // session the engine never accepted
        let _ = self.events.send(event);
    }
}

impl EngineIoWebSocket for WarpEngineIoWebSocket {
    fn query(&self) -> Option<HashMap<String, String>> {
        self.query.read().unwrap().clone()
    }

    fn connection_headers(&self) -> Option<HashMap<String, Vec<String>>> {
        self.headers.read().unwrap().clone()
    }

    fn write_text(&self, message: &str) {
        if let SessionBinding::Connected { session } = &*self.binding.read().unwrap() {
            let _ = session.outbound.send(OutboundFrame::Text(message.to_owned()));
        }
    }

    fn write_binary(&self, message: Bytes) {
        if let SessionBinding::Connected { session } = &*self.binding.read().unwrap() {
            let _ = session.outbound.send(OutboundFrame::Binary(message));
        }
    }

    fn close(&self) {
        match &*self.binding.read().unwrap() {
            SessionBinding::Connected { session } => {
                let _ = session.outbound.send(OutboundFrame::Close);
            }
            SessionBinding::Disconnected => {
                panic!("close called with no websocket session bound");
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<WebSocketEvent> {
        self.events.subscribe()
    }
}

/// Collects a header map into the engine's multi-value shape, preserving
/// value order.
pub(crate) fn header_multimap(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_owned())
                .or_insert_with(Vec::new)
                .push(value.to_owned());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-auth", "token".parse().unwrap());
        headers.append("accept-encoding", "gzip".parse().unwrap());
        headers.append("accept-encoding", "br".parse().unwrap());
        headers
    }

    fn connected_adapter(
        raw_query: &str,
    ) -> (Arc<WarpEngineIoWebSocket>, UnboundedReceiver<OutboundFrame>) {
        let facade = Arc::new(EngineFacade::new());
        let adapter = Arc::new(WarpEngineIoWebSocket::new(facade));
        let (sender, receiver) = mpsc::unbounded_channel();
        adapter
            .clone()
            .on_ws_connect(WsSession::new(sender, raw_query.to_owned(), upgrade_headers()));
        (adapter, receiver)
    }

    #[tokio::test]
    async fn query_and_headers_are_captured_at_connect_time() {
        let facade = Arc::new(EngineFacade::new());
        let adapter = Arc::new(WarpEngineIoWebSocket::new(facade));
        assert!(adapter.query().is_none());
        assert!(adapter.connection_headers().is_none());

        let (sender, mut receiver) = mpsc::unbounded_channel();
        adapter
            .clone()
            .on_ws_connect(WsSession::new(sender, "x=42".to_owned(), upgrade_headers()));

        let query = adapter.query().expect("query after connect");
        assert_eq!(query.get("x"), Some(&"42".to_owned()));
        let headers = adapter.connection_headers().expect("headers after connect");
        assert_eq!(
            headers.get("accept-encoding"),
            Some(&vec!["gzip".to_owned(), "br".to_owned()])
        );

        // registering with the engine wrote the open packet through the
        // freshly bound session
        match receiver.recv().await.expect("open packet") {
            OutboundFrame::Text(text) => assert!(text.starts_with('0'), "got {}", text),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_query_keys_keep_the_last_value() {
        let (adapter, _receiver) = connected_adapter("a=1&a=2");
        let query = adapter.query().unwrap();
        assert_eq!(query.get("a"), Some(&"2".to_owned()));
    }

    #[tokio::test]
    async fn sub_window_binary_frames_are_copied_out() {
        let (adapter, _receiver) = connected_adapter("");
        let mut events = adapter.subscribe();

        let source = Bytes::from(vec![0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        adapter.on_ws_binary(source.clone(), 2, 4);

        match events.recv().await.unwrap() {
            WebSocketEvent::Message {
                data: MessageData::Binary(payload),
            } => {
                assert_eq!(&payload[..], &[2, 3, 4, 5]);
                let source_range =
                    source.as_ptr() as usize..source.as_ptr() as usize + source.len();
                assert!(
                    !source_range.contains(&(payload.as_ptr() as usize)),
                    "window copy must not alias the source buffer"
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_buffer_binary_frames_are_forwarded_zero_copy() {
        let (adapter, _receiver) = connected_adapter("");
        let mut events = adapter.subscribe();

        let source = Bytes::from(vec![9u8, 8, 7, 6]);
        adapter.on_ws_binary(source.clone(), 0, source.len());

        match events.recv().await.unwrap() {
            WebSocketEvent::Message {
                data: MessageData::Binary(payload),
            } => {
                assert_eq!(payload.as_ptr(), source.as_ptr());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn writes_after_close_are_silently_dropped() {
        let (adapter, mut receiver) = connected_adapter("");
        match receiver.recv().await.expect("open packet") {
            OutboundFrame::Text(_) => {}
            other => panic!("unexpected frame: {:?}", other),
        }

        adapter.on_ws_close(1000, "done");
        adapter.write_text("too late");
        adapter.write_binary(Bytes::from_static(b"too late"));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    #[should_panic(expected = "no websocket session bound")]
    async fn close_without_a_session_panics() {
        let facade = Arc::new(EngineFacade::new());
        let adapter = WarpEngineIoWebSocket::new(facade);
        adapter.close();
    }

    #[tokio::test]
    #[should_panic(expected = "no websocket session bound")]
    async fn close_after_the_session_ended_panics() {
        let (adapter, _receiver) = connected_adapter("");
        adapter.on_ws_close(1000, "gone");
        adapter.close();
    }

    #[tokio::test]
    async fn errors_carry_the_fixed_label_and_the_cause_message() {
        let (adapter, _receiver) = connected_adapter("");
        let mut events = adapter.subscribe();

        adapter.on_ws_error(&"connection reset");

        match events.recv().await.unwrap() {
            WebSocketEvent::Error { label, message } => {
                assert_eq!(label, "write error");
                assert_eq!(message, "connection reset");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_events_reach_the_engine_before_the_session_unbinds() {
        let (adapter, _receiver) = connected_adapter("");
        let mut events = adapter.subscribe();

        adapter.on_ws_close(1000, "bye");

        match events.recv().await.unwrap() {
            WebSocketEvent::Close => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(adapter.query().is_some(), "snapshot survives the close");
    }
}
