use crate::facade::EngineFacade;
use socket_io::socket::SocketIoSocket;
use std::sync::Arc;

/// The namespace registration surface handed to the plugin's setup
/// function.
pub struct SocketIoHandler {
    facade: Arc<EngineFacade>,
}

impl SocketIoHandler {
    pub(crate) fn new(facade: Arc<EngineFacade>) -> Self {
        SocketIoHandler { facade }
    }

    /// Runs `handler` for every logical connection on `path`. Registering
    /// the same path twice yields two independent subscribers, and both
    /// run per connection.
    pub fn namespace(
        &self,
        path: &str,
        handler: impl Fn(Arc<SocketIoSocket>) + Send + Sync + 'static,
    ) {
        self.facade.namespace(path).on_connection(handler);
    }
}
