use serde_json::json;
use socket_io_plugin::SocketIoPlugin;

/// Runnable server for manually exercising the plugin with a Socket.IO
/// client tool.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let plugin = SocketIoPlugin::new(|io| {
        io.namespace("/", |socket| {
            tracing::info!(socket_id = %socket.id, "connected");
            let _ = socket.send("message", vec![json!("hello world")]);
        });
        io.namespace("/blah", |socket| {
            let reply_socket = socket.clone();
            socket.on("message", move |args| {
                tracing::info!(?args, "message event");
                let _ = reply_socket.send("message", vec![json!("message event")]);
            });
            let reply_socket = socket.clone();
            socket.on("socketio-client", move |args| {
                tracing::info!(?args, "socketio-client event");
                let _ = reply_socket.send("message", vec![json!("socketio-client event")]);
            });
        });
    });

    tracing::info!(mount_path = plugin.mount_path(), "listening on 127.0.0.1:7000");

    tokio::select! {
        _ = warp::serve(plugin.filter()).run(([127, 0, 0, 1], 7000)) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
}
