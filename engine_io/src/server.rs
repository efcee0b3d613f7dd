use crate::socket::{subscribe_to_websocket_events, Socket, SocketEvent, TransportHandle};
use crate::transport::{EngineIoWebSocket, MessageData, PollingTransport, TransportKind};
use crate::util::{HttpMethod, RequestContext, SendPacketError, ServerError};
use bytes::Bytes;
use dashmap::DashMap;
use engine_io_parser::packet::Packet;
use engine_io_parser::string::encoder as string_encoder;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

pub const BUFFER_CONST: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineIoServerOptions {
    /// in milliseconds; also bounds how long a poll request may park
    pub ping_interval: u64,
    /// in milliseconds
    pub ping_timeout: u64,
    /// When set, no CORS headers are emitted on polling responses and the
    /// host application is expected to handle CORS itself.
    pub cors_handling_disabled: bool,
    pub buffer_factor: usize,
}

impl Default for EngineIoServerOptions {
    fn default() -> Self {
        EngineIoServerOptions {
            ping_interval: 25000,
            ping_timeout: 5000,
            cors_handling_disabled: false,
            buffer_factor: 2,
        }
    }
}

/// Events the engine fans out to its owner (the socket.io layer).
#[derive(Display, Debug, Clone)]
pub enum ServerEvent {
    Connection {
        connection_id: String,
        context: Arc<RequestContext>,
    },
    Message {
        connection_id: String,
        data: MessageData,
    },
    Close {
        connection_id: String,
    },
    Error {
        connection_id: String,
        message: String,
    },
}

#[derive(Clone)]
struct EventSenders {
    /// Event sender to the external owner
    server: broadcast::Sender<ServerEvent>,
    /// Event sender handed to `Socket` instances
    client: mpsc::UnboundedSender<SocketEvent>,
}

struct ServerState {
    socket_receiver_temp: Option<mpsc::UnboundedReceiver<SocketEvent>>,
}

pub struct EngineIoServer {
    state: RwLock<ServerState>,
    clients: Arc<DashMap<String, Arc<Socket>>>,
    event_senders: EventSenders,
    pub options: EngineIoServerOptions,
}

impl EngineIoServer {
    pub fn new(options: EngineIoServerOptions) -> Self {
        // To listen to events from socket instances
        let (client_event_sender, client_event_receiver) = mpsc::unbounded_channel();
        // To send events to the owner of this server instance
        let (server_event_sender, _) =
            broadcast::channel(options.buffer_factor * BUFFER_CONST);

        EngineIoServer {
            state: RwLock::new(ServerState {
                socket_receiver_temp: Some(client_event_receiver),
            }),
            clients: Arc::new(DashMap::new()),
            event_senders: EventSenders {
                server: server_event_sender,
                client: client_event_sender,
            },
            options,
        }
    }

    /// The first call also starts listening to events from `Socket`
    /// instances, so this must happen within a tokio runtime.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        if let Some(receiver) = self.state.write().unwrap().socket_receiver_temp.take() {
            self.subscribe_to_socket_events(receiver);
        }
        self.event_senders.server.subscribe()
    }

    /// Drives one polling-transport HTTP exchange: a GET without a session
    /// id is a handshake, a GET with one drains buffered packets, a POST
    /// with one carries client packets.
    pub async fn handle_request(
        &self,
        context: RequestContext,
        body: Option<Bytes>,
    ) -> Result<http::Response<Vec<u8>>, ServerError> {
        let context = Arc::new(context);
        self.verify_request(&context)?;
        let sid = context.query.get("sid").cloned();
        match sid {
            None => self.handshake_polling(context).await,
            Some(sid) => {
                let client = self.get_client_or_error(&sid)?;
                match context.http_method {
                    HttpMethod::Get => {
                        let packets = client
                            .poll(Duration::from_millis(self.options.ping_interval))
                            .await?;
                        Ok(self.payload_response(&context, &packets))
                    }
                    HttpMethod::Post => {
                        let body = body.ok_or(ServerError::BadRequest)?;
                        let body =
                            std::str::from_utf8(&body).map_err(|_| ServerError::BadRequest)?;
                        client.receive_payload(body)?;
                        Ok(self.ok_response(&context))
                    }
                }
            }
        }
    }

    /// Takes over a fully-initialized websocket session. The adapter must
    /// have captured its query/header snapshot already: both are read
    /// exactly once, here, before any packet flows.
    pub fn handle_websocket(&self, ws: Arc<dyn EngineIoWebSocket>) {
        let query = ws.query().unwrap_or_default();
        let headers = ws.connection_headers().unwrap_or_default();
        if query.contains_key("sid") {
            // TODO: transport upgrade flow (polling to websocket) needs
            // probe ping/pong handling; until then `upgrades` is never
            // advertised, so only non-conformant clients end up here.
            tracing::warn!("websocket connect carried a session id; closing");
            ws.close();
            return;
        }
        let context = Arc::new(RequestContext {
            query,
            headers,
            http_method: HttpMethod::Get,
        });
        let sid = Self::generate_id();
        let socket = Arc::new(Socket::new(
            sid.clone(),
            TransportHandle::WebSocket(ws.clone()),
            self.event_senders.client.clone(),
        ));
        self.clients.insert(sid.clone(), socket.clone());
        socket.open(&self.options);
        subscribe_to_websocket_events(socket.clone(), ws);
        self.start_watchdog(&socket);
        let _ = self.event_senders.server.send(ServerEvent::Connection {
            connection_id: sid,
            context,
        });
    }

    /// Synchronous outbound path used by the socket.io layer.
    pub fn send_message(
        &self,
        connection_id: &str,
        data: MessageData,
    ) -> Result<(), SendPacketError> {
        match self.clients.get(connection_id) {
            Some(client) => {
                client.send_message(data);
                Ok(())
            }
            None => Err(SendPacketError::UnknownConnectionId),
        }
    }

    pub fn close_socket(&self, connection_id: &str) {
        let client = self.clients.get(connection_id).map(|c| c.value().clone());
        if let Some(client) = client {
            client.close();
        }
    }

    pub fn clients_count(&self) -> usize {
        self.clients.len()
    }

    pub fn get_client_or_error(&self, id: &str) -> Result<Arc<Socket>, ServerError> {
        match self.clients.get(id) {
            Some(client) => Ok(client.value().clone()),
            None => Err(ServerError::UnknownSid),
        }
    }

    /// Note: this generates ids in a different format from the JS engine.io
    /// implementation, whose base64id strings don't guarantee uniqueness.
    pub fn generate_id() -> String {
        Uuid::new_v4().to_hyphenated().to_string()
    }

    fn verify_request(&self, context: &RequestContext) -> Result<(), ServerError> {
        let transport_name = context.query.get("transport").map_or("polling", String::as_str);
        if TransportKind::parse(transport_name)? != TransportKind::Polling {
            return Err(ServerError::BadRequest);
        }
        if let Some(sid) = context.query.get("sid") {
            let client = self.clients.get(sid).ok_or(ServerError::UnknownSid)?;
            if client.transport_kind() != TransportKind::Polling {
                return Err(ServerError::BadRequest);
            }
        } else if context.http_method != HttpMethod::Get {
            return Err(ServerError::BadHandshakeMethod);
        }
        Ok(())
    }

    async fn handshake_polling(
        &self,
        context: Arc<RequestContext>,
    ) -> Result<http::Response<Vec<u8>>, ServerError> {
        let sid = Self::generate_id();
        let socket = Arc::new(Socket::new(
            sid.clone(),
            TransportHandle::Polling(Arc::new(PollingTransport::new())),
            self.event_senders.client.clone(),
        ));
        self.clients.insert(sid.clone(), socket.clone());
        socket.open(&self.options);
        self.start_watchdog(&socket);
        let _ = self.event_senders.server.send(ServerEvent::Connection {
            connection_id: sid,
            context: context.clone(),
        });
        // the open packet is already buffered, so this drain is immediate
        let packets = socket.poll(Duration::from_millis(0)).await?;
        Ok(self.payload_response(&context, &packets))
    }

    fn subscribe_to_socket_events(&self, receiver: mpsc::UnboundedReceiver<SocketEvent>) {
        let server_event_sender = self.event_senders.server.clone();
        let clients = self.clients.clone();

        tokio::spawn(async move {
            let mut receiver = receiver;
            while let Some(event) = receiver.recv().await {
                match event {
                    SocketEvent::Close { socket_id } => {
                        clients.remove(&socket_id);
                        let _ = server_event_sender.send(ServerEvent::Close {
                            connection_id: socket_id,
                        });
                    }
                    SocketEvent::Message { socket_id, data } => {
                        let _ = server_event_sender.send(ServerEvent::Message {
                            connection_id: socket_id,
                            data,
                        });
                    }
                    SocketEvent::Error { socket_id, message } => {
                        let _ = server_event_sender.send(ServerEvent::Error {
                            connection_id: socket_id,
                            message,
                        });
                    }
                }
            }
        });
    }

    /// Closes sessions that stay silent past the ping deadline. The task
    /// holds only a weak reference so a removed session ends it.
    fn start_watchdog(&self, socket: &Arc<Socket>) {
        let weak = Arc::downgrade(socket);
        let deadline = Duration::from_millis(self.options.ping_interval + self.options.ping_timeout);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(deadline);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(socket) => {
                        if socket.ready() == crate::socket::ReadyState::Closed {
                            break;
                        }
                        if socket.idle_for() > deadline {
                            tracing::debug!(socket_id = %socket.id, "ping timeout, closing session");
                            socket.close();
                            break;
                        }
                    }
                    None => break,
                }
            }
        });
    }

    fn payload_response(
        &self,
        context: &RequestContext,
        packets: &[Packet<'static>],
    ) -> http::Response<Vec<u8>> {
        let body = string_encoder::encode_payload(packets);
        self.polling_response(context, "text/plain; charset=UTF-8", body.into_bytes())
    }

    fn ok_response(&self, context: &RequestContext) -> http::Response<Vec<u8>> {
        // text/html instead of text/plain avoids an unwanted download
        // dialog on certain user agents (engine.io GH-43)
        self.polling_response(context, "text/html", b"ok".to_vec())
    }

    fn polling_response(
        &self,
        context: &RequestContext,
        content_type: &str,
        body: Vec<u8>,
    ) -> http::Response<Vec<u8>> {
        let mut builder = http::Response::builder()
            .status(http::StatusCode::OK)
            .header(http::header::CONTENT_TYPE, content_type);
        if !self.options.cors_handling_disabled {
            builder = match context.headers.get("origin").and_then(|values| values.first()) {
                Some(origin) => builder
                    .header("Access-Control-Allow-Credentials", "true")
                    .header("Access-Control-Allow-Origin", origin.as_str()),
                None => builder.header("Access-Control-Allow-Origin", "*"),
            };
        }
        builder.body(body).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn polling_context(method: HttpMethod, extra: &[(&str, &str)]) -> RequestContext {
        let mut query: HashMap<String, String> = HashMap::new();
        query.insert("EIO".to_owned(), "3".to_owned());
        query.insert("transport".to_owned(), "polling".to_owned());
        for (key, value) in extra {
            query.insert((*key).to_owned(), (*value).to_owned());
        }
        RequestContext {
            query,
            headers: HashMap::new(),
            http_method: method,
        }
    }

    #[tokio::test]
    async fn polling_handshake_creates_a_session() {
        let server = EngineIoServer::new(EngineIoServerOptions::default());
        let mut events = server.subscribe();

        let response = server
            .handle_request(polling_context(HttpMethod::Get, &[]), None)
            .await
            .expect("handshake should succeed");

        assert_eq!(response.status(), http::StatusCode::OK);
        let body = String::from_utf8(response.body().clone()).unwrap();
        assert!(body.contains("\"sid\""), "open packet missing: {}", body);
        assert!(body.contains("\"upgrades\":[]"));
        assert_eq!(server.clients_count(), 1);

        match events.recv().await.unwrap() {
            ServerEvent::Connection { connection_id, .. } => {
                assert!(server.get_client_or_error(&connection_id).is_ok());
            }
            other => panic!("expected a connection event, got {}", other),
        }
    }

    #[tokio::test]
    async fn handshake_must_be_a_get() {
        let server = EngineIoServer::new(EngineIoServerOptions::default());
        let result = server
            .handle_request(polling_context(HttpMethod::Post, &[]), Some(Bytes::from_static(b"1:2")))
            .await;
        assert_eq!(result.err(), Some(ServerError::BadHandshakeMethod));
    }

    #[tokio::test]
    async fn unknown_session_ids_are_rejected() {
        let server = EngineIoServer::new(EngineIoServerOptions::default());
        let result = server
            .handle_request(polling_context(HttpMethod::Get, &[("sid", "nope")]), None)
            .await;
        assert_eq!(result.err(), Some(ServerError::UnknownSid));
    }

    #[tokio::test]
    async fn websocket_transport_is_rejected_on_the_http_surface() {
        let server = EngineIoServer::new(EngineIoServerOptions::default());
        let mut context = polling_context(HttpMethod::Get, &[]);
        context
            .query
            .insert("transport".to_owned(), "websocket".to_owned());
        let result = server.handle_request(context, None).await;
        assert_eq!(result.err(), Some(ServerError::BadRequest));
    }

    #[tokio::test]
    async fn posted_pings_are_answered_on_the_next_poll() {
        let server = EngineIoServer::new(EngineIoServerOptions::default());
        let _events = server.subscribe();

        let response = server
            .handle_request(polling_context(HttpMethod::Get, &[]), None)
            .await
            .unwrap();
        let body = String::from_utf8(response.body().clone()).unwrap();
        let start = body.find("0{").expect("open packet");
        let open: serde_json::Value = serde_json::from_str(&body[start + 1..]).unwrap();
        let sid = open["sid"].as_str().unwrap();

        let response = server
            .handle_request(
                polling_context(HttpMethod::Post, &[("sid", sid)]),
                Some(Bytes::from_static(b"1:2")),
            )
            .await
            .unwrap();
        assert_eq!(response.body(), b"ok");

        let response = server
            .handle_request(polling_context(HttpMethod::Get, &[("sid", sid)]), None)
            .await
            .unwrap();
        let body = String::from_utf8(response.body().clone()).unwrap();
        assert!(body.contains("1:3"), "expected a pong packet, got {}", body);
    }
}
