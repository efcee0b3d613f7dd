use crate::error::EmitError;
use crate::packet::SocketPacket;
use chrono::{DateTime, Utc};
use engine_io::server::EngineIoServer;
use engine_io::transport::MessageData;
use engine_io::util::RequestContext;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// The request-time data captured when the physical connection handshook,
/// exposed to application handlers for things like auth tokens.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// The headers sent as part of the handshake
    pub headers: HashMap<String, Vec<String>>,
    /// The query object, simplified
    pub query: HashMap<String, String>,
    /// The date of creation
    pub time: DateTime<Utc>,
    /// The date of creation (as unix timestamp)
    pub issued: i64,
}

impl Handshake {
    pub fn new(context: &RequestContext) -> Self {
        let time = Utc::now();
        Handshake {
            headers: context.headers.clone(),
            query: context.query.clone(),
            issued: time.timestamp(),
            time,
        }
    }
}

type EventHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// A logical connection within one namespace, riding on a physical
/// Engine.IO connection.
pub struct SocketIoSocket {
    pub id: String,
    pub nsp: String,
    connection_id: String,
    handshake: Handshake,
    engine: Arc<EngineIoServer>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
}

impl SocketIoSocket {
    pub(crate) fn new(
        engine: Arc<EngineIoServer>,
        connection_id: &str,
        nsp: &str,
        handshake: Handshake,
    ) -> Self {
        // don't reuse the Engine.IO id, it's sensitive information
        SocketIoSocket {
            id: Self::generate_id(),
            nsp: nsp.to_owned(),
            connection_id: connection_id.to_owned(),
            handshake,
            engine,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn generate_id() -> String {
        Uuid::new_v4().to_hyphenated().to_string()
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Registers `handler` for `event`. Handlers fan out: every handler
    /// registered for an event runs for every occurrence.
    pub fn on(&self, event: &str, handler: impl Fn(Vec<Value>) + Send + Sync + 'static) {
        self.handlers
            .write()
            .unwrap()
            .entry(event.to_owned())
            .or_insert_with(Vec::new)
            .push(Arc::new(handler));
    }

    /// Emits `event` with `args` to the client.
    pub fn send(&self, event: &str, args: Vec<Value>) -> Result<(), EmitError> {
        if event.is_empty() {
            return Err(EmitError::EmptyEventName);
        }
        let packet = SocketPacket::event(&self.nsp, event, args);
        self.engine
            .send_message(&self.connection_id, MessageData::Text(packet.encode()))
            .map_err(|_| EmitError::ConnectionClosed)
    }

    pub(crate) fn dispatch(&self, event: &str, args: Vec<Value>) {
        // handlers are invoked outside the lock so they may register more
        let handlers: Vec<EventHandler> = {
            let map = self.handlers.read().unwrap();
            map.get(event).map(|handlers| handlers.to_vec()).unwrap_or_default()
        };
        for handler in handlers {
            handler(args.clone());
        }
    }
}
