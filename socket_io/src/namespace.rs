use crate::socket::SocketIoSocket;
use std::sync::{Arc, RwLock};

type ConnectionHandler = Arc<dyn Fn(Arc<SocketIoSocket>) + Send + Sync>;

/// A named logical channel multiplexed over physical connections.
///
/// Connection handlers fan out: registering on the same namespace twice
/// yields two independent subscribers and both run for every logical
/// connection. That mirrors plain publish/subscribe and is relied upon.
pub struct Namespace {
    pub name: String,
    connection_handlers: RwLock<Vec<ConnectionHandler>>,
}

impl Namespace {
    pub(crate) fn new(name: String) -> Self {
        Namespace {
            name,
            connection_handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn on_connection(&self, handler: impl Fn(Arc<SocketIoSocket>) + Send + Sync + 'static) {
        self.connection_handlers
            .write()
            .unwrap()
            .push(Arc::new(handler));
    }

    pub(crate) fn notify_connection(&self, socket: &Arc<SocketIoSocket>) {
        // handlers run outside the lock so they may register more
        let handlers: Vec<ConnectionHandler> =
            self.connection_handlers.read().unwrap().to_vec();
        for handler in handlers {
            handler(socket.clone());
        }
    }
}
