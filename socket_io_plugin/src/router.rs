use crate::adapter::{OutboundFrame, WarpEngineIoWebSocket, WsSession};
use crate::facade::EngineFacade;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use warp::http::HeaderMap;
use warp::ws::{Message, WebSocket};

/// Upgrade-request data captured by the filter chain before the handshake
/// completes; warp's websocket half carries no request information.
pub struct UpgradeContext {
    pub raw_query: String,
    pub headers: HeaderMap,
}

/// Runs one accepted upgrade to completion: a fresh adapter bound to the
/// shared engines, a writer task for the sink half, and a read loop that
/// forwards every inbound frame to the adapter in transport order.
pub async fn drive_session(
    websocket: WebSocket,
    upgrade: UpgradeContext,
    facade: Arc<EngineFacade>,
) {
    let (sink, mut stream) = websocket.split();
    let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
    let adapter = Arc::new(WarpEngineIoWebSocket::new(facade));
    tokio::spawn(forward_outbound(outbound_receiver, sink, adapter.clone()));

    adapter.clone().on_ws_connect(WsSession::new(
        outbound_sender,
        upgrade.raw_query,
        upgrade.headers,
    ));

    let mut closed = false;
    while let Some(result) = stream.next().await {
        match result {
            Ok(message) => {
                if let Ok(text) = message.to_str() {
                    adapter.on_ws_text(text);
                } else if message.is_binary() {
                    let payload = Bytes::copy_from_slice(message.as_bytes());
                    let len = payload.len();
                    adapter.on_ws_binary(payload, 0, len);
                } else if message.is_close() {
                    // warp does not surface the peer's close frame, so
                    // report a normal closure
                    adapter.on_ws_close(1000, "");
                    closed = true;
                    break;
                }
                // ws ping/pong frames are ignored; engine.io runs its own
                // heartbeat
            }
            Err(error) => {
                adapter.on_ws_error(&error);
                break;
            }
        }
    }
    if !closed {
        adapter.on_ws_close(1006, "connection ended without a close frame");
    }
}

/// Drains the adapter's outbound channel into the websocket sink. Send
/// failures are reported through the adapter's error event, never to the
/// writer that queued the frame.
async fn forward_outbound(
    mut receiver: mpsc::UnboundedReceiver<OutboundFrame>,
    mut sink: SplitSink<WebSocket, Message>,
    adapter: Arc<WarpEngineIoWebSocket>,
) {
    while let Some(frame) = receiver.recv().await {
        let result = match frame {
            OutboundFrame::Text(text) => sink.send(Message::text(text)).await,
            OutboundFrame::Binary(data) => sink.send(Message::binary(data.to_vec())).await,
            OutboundFrame::Close => {
                let _ = sink.close().await;
                break;
            }
        };
        if let Err(error) = result {
            adapter.on_ws_error(&error);
            break;
        }
    }
}
