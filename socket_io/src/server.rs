use crate::namespace::Namespace;
use crate::packet::{SocketPacket, SocketPacketType};
use crate::socket::{Handshake, SocketIoSocket};
use dashmap::DashMap;
use engine_io::server::{EngineIoServer, ServerEvent};
use engine_io::transport::MessageData;
use engine_io::util::RequestContext;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// One physical connection's socket.io state: its handshake snapshot and
/// the logical socket per joined namespace.
struct Connection {
    handshake: Handshake,
    sockets: HashMap<String, Arc<SocketIoSocket>>,
}

struct Shared {
    engine: Arc<EngineIoServer>,
    /// A mapping of name => Namespace
    namespaces: DashMap<String, Arc<Namespace>>,
    /// engine connection id => Connection
    connections: DashMap<String, Connection>,
}

/// The Socket.IO layer over one Engine.IO server.
pub struct SocketIoServer {
    shared: Arc<Shared>,
}

impl SocketIoServer {
    /// Must be created within a tokio runtime: subscribing to the engine
    /// starts the connection pump immediately.
    pub fn new(engine: Arc<EngineIoServer>) -> Self {
        let shared = Arc::new(Shared {
            engine,
            namespaces: DashMap::new(),
            connections: DashMap::new(),
        });
        Self::subscribe_to_engine_events(shared.clone());
        SocketIoServer { shared }
    }

    /// Returns the namespace registered under `path`, creating it if
    /// needed. Clients can only connect to namespaces that exist.
    pub fn namespace(&self, path: &str) -> Arc<Namespace> {
        self.shared.get_or_create_namespace(path)
    }

    fn subscribe_to_engine_events(shared: Arc<Shared>) {
        let mut events = shared.engine.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::Connection {
                        connection_id,
                        context,
                    }) => shared.on_connection(connection_id, &context),
                    Ok(ServerEvent::Message {
                        connection_id,
                        data,
                    }) => shared.on_message(&connection_id, data),
                    Ok(ServerEvent::Close { connection_id }) => shared.on_close(&connection_id),
                    Ok(ServerEvent::Error {
                        connection_id,
                        message,
                    }) => {
                        tracing::warn!(%connection_id, %message, "transport error");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "engine event receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Shared {
    fn get_or_create_namespace(&self, path: &str) -> Arc<Namespace> {
        self.namespaces
            .entry(path.to_owned())
            .or_insert_with(|| Arc::new(Namespace::new(path.to_owned())))
            .value()
            .clone()
    }

    fn on_connection(&self, connection_id: String, context: &RequestContext) {
        self.connections.insert(
            connection_id,
            Connection {
                handshake: Handshake::new(context),
                sockets: HashMap::new(),
            },
        );
    }

    fn on_message(&self, connection_id: &str, data: MessageData) {
        let text = match data {
            MessageData::Text(text) => text,
            MessageData::Binary(_) => {
                // TODO: support binary attachments (socket.io packet types 5 and 6)
                tracing::debug!(%connection_id, "dropping binary payload");
                return;
            }
        };
        let packet = match SocketPacket::decode(&text) {
            Ok(packet) => packet,
            Err(error) => {
                tracing::warn!(%connection_id, %error, "failed to decode packet");
                return;
            }
        };
        match packet.packet_type {
            SocketPacketType::Connect => self.on_connect_packet(connection_id, &packet.nsp),
            SocketPacketType::Event => self.on_event_packet(connection_id, packet),
            SocketPacketType::Disconnect => self.on_disconnect_packet(connection_id, &packet.nsp),
            SocketPacketType::Ack | SocketPacketType::ConnectError => {
                tracing::debug!(%connection_id, packet_type = ?packet.packet_type, "ignoring packet");
            }
        }
    }

    fn on_connect_packet(&self, connection_id: &str, nsp: &str) {
        let namespace = match self.namespaces.get(nsp) {
            Some(namespace) => namespace.value().clone(),
            None => {
                let error = SocketPacket::connect_error(nsp, "Invalid namespace");
                let _ = self
                    .engine
                    .send_message(connection_id, MessageData::Text(error.encode()));
                return;
            }
        };
        let socket = {
            let mut connection = match self.connections.get_mut(connection_id) {
                Some(connection) => connection,
                None => return,
            };
            if connection.sockets.contains_key(nsp) {
                // connecting twice to a namespace is a no-op
                return;
            }
            let socket = Arc::new(SocketIoSocket::new(
                self.engine.clone(),
                connection_id,
                nsp,
                connection.handshake.clone(),
            ));
            connection.sockets.insert(nsp.to_owned(), socket.clone());
            socket
        };
        // ack first, so the client observes the connect before any event
        // the handlers emit
        let ack = SocketPacket::connect(nsp);
        let _ = self
            .engine
            .send_message(connection_id, MessageData::Text(ack.encode()));
        namespace.notify_connection(&socket);
    }

    fn on_event_packet(&self, connection_id: &str, packet: SocketPacket) {
        let socket = match self
            .connections
            .get(connection_id)
            .and_then(|connection| connection.sockets.get(&packet.nsp).cloned())
        {
            Some(socket) => socket,
            None => {
                tracing::debug!(%connection_id, nsp = %packet.nsp, "event for an unjoined namespace");
                return;
            }
        };
        let mut args = match packet.data {
            Some(Value::Array(items)) => items,
            _ => {
                tracing::debug!(%connection_id, "event packet without an argument array");
                return;
            }
        };
        if args.is_empty() {
            return;
        }
        let event = match args.remove(0) {
            Value::String(name) => name,
            _ => {
                tracing::debug!(%connection_id, "event name must be a string");
                return;
            }
        };
        socket.dispatch(&event, args);
    }

    fn on_disconnect_packet(&self, connection_id: &str, nsp: &str) {
        let (socket, now_empty) = {
            let mut connection = match self.connections.get_mut(connection_id) {
                Some(connection) => connection,
                None => return,
            };
            let socket = connection.sockets.remove(nsp);
            (socket, connection.sockets.is_empty())
        };
        if let Some(socket) = socket {
            socket.dispatch("disconnect", Vec::new());
        }
        if now_empty {
            // nothing logical left on this physical connection
            self.engine.close_socket(connection_id);
        }
    }

    fn on_close(&self, connection_id: &str) {
        if let Some((_, connection)) = self.connections.remove(connection_id) {
            for (_, socket) in connection.sockets {
                socket.dispatch("disconnect", Vec::new());
            }
        }
    }
}
