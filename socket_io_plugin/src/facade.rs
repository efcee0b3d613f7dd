use bytes::Bytes;
use engine_io::server::{EngineIoServer, EngineIoServerOptions};
use engine_io::transport::EngineIoWebSocket;
use engine_io::util::{RequestContext, ServerError, ServerErrorMessage};
use socket_io::namespace::Namespace;
use socket_io::server::SocketIoServer;
use std::sync::Arc;

/// One Engine.IO engine paired with one Socket.IO server, configured once
/// and shared by every route and every connection of a plugin instance.
pub struct EngineFacade {
    engine_io: Arc<EngineIoServer>,
    socket_io: Arc<SocketIoServer>,
}

impl EngineFacade {
    /// Must be called within a tokio runtime (the socket.io layer starts
    /// its connection pump on construction).
    pub fn new() -> Self {
        let options = EngineIoServerOptions {
            // CORS stays with the warp application (if configured), not
            // with the engine
            cors_handling_disabled: true,
            ..EngineIoServerOptions::default()
        };
        let engine_io = Arc::new(EngineIoServer::new(options));
        let socket_io = Arc::new(SocketIoServer::new(engine_io.clone()));
        EngineFacade {
            engine_io,
            socket_io,
        }
    }

    /// Drives one polling-transport HTTP exchange. GET and POST requests
    /// are handed over verbatim; the engine distinguishes reads from
    /// writes.
    pub async fn handle_request(
        &self,
        context: RequestContext,
        body: Option<Bytes>,
    ) -> http::Response<Vec<u8>> {
        match self.engine_io.handle_request(context, body).await {
            Ok(response) => response,
            Err(error) => error_response(error),
        }
    }

    /// Hands a fully-initialized transport adapter (query and headers
    /// already captured) to the engine.
    pub fn handle_websocket(&self, adapter: Arc<dyn EngineIoWebSocket>) {
        self.engine_io.handle_websocket(adapter);
    }

    /// Used during plugin construction only, never per request.
    pub fn namespace(&self, path: &str) -> Arc<Namespace> {
        self.socket_io.namespace(path)
    }
}

impl Default for EngineFacade {
    fn default() -> Self {
        EngineFacade::new()
    }
}

fn error_response(error: ServerError) -> http::Response<Vec<u8>> {
    let message = ServerErrorMessage::from(error);
    http::Response::builder()
        .status(http::StatusCode::BAD_REQUEST)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&message).unwrap_or_default())
        .unwrap()
}
