use crate::server::EngineIoServerOptions;
use crate::transport::{
    EngineIoWebSocket, MessageData, PollingTransport, TransportKind, WebSocketEvent,
};
use crate::util::{into_owned_packet, ServerError};
use bytes::Bytes;
use engine_io_parser::binary::encoder as binary_encoder;
use engine_io_parser::decoder::{decode_packet, Encoded};
use engine_io_parser::packet::{Packet, PacketData, PacketType};
use engine_io_parser::string::{decoder as string_decoder, encoder as string_encoder};
use std::borrow::Cow;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use strum_macros::Display;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadyState {
    Opening,
    Open,
    Closed,
}

/// Events a session pushes up to the server that owns it.
#[derive(Display, Debug, Clone)]
pub enum SocketEvent {
    Close {
        socket_id: String,
    },
    Message {
        socket_id: String,
        data: MessageData,
    },
    Error {
        socket_id: String,
        message: String,
    },
}

/// A session's transport is fixed at creation; reconnecting clients get a
/// fresh session rather than a transport swap.
pub enum TransportHandle {
    Polling(Arc<PollingTransport>),
    WebSocket(Arc<dyn EngineIoWebSocket>),
}

impl TransportHandle {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportHandle::Polling(_) => TransportKind::Polling,
            TransportHandle::WebSocket(_) => TransportKind::WebSocket,
        }
    }
}

/// One physical Engine.IO session.
pub struct Socket {
    pub id: String,
    transport: TransportHandle,
    ready: RwLock<ReadyState>,
    last_seen: RwLock<Instant>,
    event_sender: mpsc::UnboundedSender<SocketEvent>,
}

impl Socket {
    pub fn new(
        id: String,
        transport: TransportHandle,
        event_sender: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        Socket {
            id,
            transport,
            ready: RwLock::new(ReadyState::Opening),
            last_seen: RwLock::new(Instant::now()),
            event_sender,
        }
    }

    pub fn ready(&self) -> ReadyState {
        *self.ready.read().unwrap()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn touch(&self) {
        *self.last_seen.write().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.read().unwrap().elapsed()
    }

    pub fn open(&self, options: &EngineIoServerOptions) {
        *self.ready.write().unwrap() = ReadyState::Open;
        let open_data = serde_json::json!({
            "sid": self.id,
            "upgrades": [],
            "pingInterval": options.ping_interval,
            "pingTimeout": options.ping_timeout,
        });
        self.send_packet(Packet {
            packet_type: PacketType::Open,
            data: PacketData::Plaintext(Cow::Owned(open_data.to_string())),
        });
    }

    pub fn send_message(&self, data: MessageData) {
        let packet = match data {
            MessageData::Text(text) => Packet {
                packet_type: PacketType::Message,
                data: PacketData::Plaintext(Cow::Owned(text)),
            },
            MessageData::Binary(data) => Packet {
                packet_type: PacketType::Message,
                data: PacketData::Binary(Cow::Owned(data.to_vec())),
            },
        };
        self.send_packet(packet);
    }

    pub(crate) fn send_packet(&self, packet: Packet<'static>) {
        if self.ready() == ReadyState::Closed {
            return;
        }
        match &self.transport {
            TransportHandle::WebSocket(ws) => match &packet.data {
                PacketData::Binary(_) => {
                    ws.write_binary(Bytes::from(binary_encoder::encode_packet(&packet)))
                }
                _ => ws.write_text(&string_encoder::encode_packet(&packet)),
            },
            TransportHandle::Polling(polling) => polling.push(packet),
        }
    }

    pub fn as_polling_or_fail(&self) -> Result<Arc<PollingTransport>, ServerError> {
        match &self.transport {
            TransportHandle::Polling(polling) => Ok(polling.clone()),
            TransportHandle::WebSocket(_) => Err(ServerError::BadRequest),
        }
    }

    /// Drains buffered packets for a poll request, parking for at most
    /// `max_wait`. An expired wait yields a noop packet so the client gets
    /// a well-formed payload.
    pub async fn poll(&self, max_wait: Duration) -> Result<Vec<Packet<'static>>, ServerError> {
        let polling = self.as_polling_or_fail()?;
        self.touch();
        let mut packets = polling.wait_for_packets(max_wait).await;
        if packets.is_empty() {
            // payload encoding drops Empty data, so the noop carries an
            // empty string
            packets.push(Packet {
                packet_type: PacketType::Noop,
                data: PacketData::Plaintext(Cow::Borrowed("")),
            });
        }
        Ok(packets)
    }

    /// Feeds a decoded poll body into the session.
    pub fn receive_payload(&self, body: &str) -> Result<(), ServerError> {
        self.as_polling_or_fail()?;
        let packets = string_decoder::decode_payload(body)?;
        for packet in packets {
            self.on_packet(packet);
        }
        Ok(())
    }

    /// A packet arrived from the transport.
    pub fn on_packet(&self, packet: Packet<'_>) {
        if self.ready() != ReadyState::Open {
            return;
        }
        self.touch();
        match packet.packet_type {
            PacketType::Ping => {
                // pongs echo the ping payload
                let pong = into_owned_packet(Packet {
                    packet_type: PacketType::Pong,
                    data: packet.data,
                });
                self.send_packet(pong);
            }
            PacketType::Message => {
                let data = match packet.data {
                    PacketData::Plaintext(text) => MessageData::Text(text.into_owned()),
                    PacketData::Binary(data) => MessageData::Binary(Bytes::from(data.into_owned())),
                    PacketData::Empty => MessageData::Text(String::new()),
                };
                let _ = self.event_sender.send(SocketEvent::Message {
                    socket_id: self.id.clone(),
                    data,
                });
            }
            PacketType::Close => self.on_close("close packet received"),
            _ => {
                tracing::debug!(socket_id = %self.id, packet_type = ?packet.packet_type, "ignoring packet");
            }
        }
    }

    /// Locally initiated close: tears the transport down first, then runs
    /// the common close path.
    pub fn close(&self) {
        if self.ready() == ReadyState::Closed {
            return;
        }
        if let TransportHandle::WebSocket(ws) = &self.transport {
            ws.close();
        }
        self.on_close("closed by server");
    }

    /// Transport considered closed.
    pub fn on_close(&self, reason: &str) {
        {
            let mut ready = self.ready.write().unwrap();
            if *ready == ReadyState::Closed {
                return;
            }
            *ready = ReadyState::Closed;
        }
        tracing::debug!(socket_id = %self.id, reason, "session closed");
        if let TransportHandle::Polling(polling) = &self.transport {
            // release any parked poll so its request can finish
            polling.notify();
        }
        let _ = self.event_sender.send(SocketEvent::Close {
            socket_id: self.id.clone(),
        });
    }
}

/// Routes events from a host websocket adapter into the session. One task
/// per connection; ends when the session closes.
pub(crate) fn subscribe_to_websocket_events(socket: Arc<Socket>, ws: Arc<dyn EngineIoWebSocket>) {
    let mut receiver = ws.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(WebSocketEvent::Message { data }) => {
                    let decoded = match &data {
                        MessageData::Text(text) => decode_packet(Encoded::Text(text.as_str())),
                        MessageData::Binary(bytes) => decode_packet(Encoded::Binary(&bytes[..])),
                    };
                    match decoded {
                        Ok(packet) => socket.on_packet(packet),
                        Err(error) => {
                            tracing::warn!(socket_id = %socket.id, %error, "failed to parse packet");
                        }
                    }
                }
                Ok(WebSocketEvent::Close) => {
                    socket.on_close("websocket closed");
                    break;
                }
                Ok(WebSocketEvent::Error { label, message }) => {
                    let _ = socket.event_sender.send(SocketEvent::Error {
                        socket_id: socket.id.clone(),
                        message: format!("{}: {}", label, message),
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(socket_id = %socket.id, skipped, "websocket event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    socket.on_close("websocket event channel dropped");
                    break;
                }
            }
        }
    });
}
