use engine_io_parser::packet::{Packet, PacketData, ParsePacketError};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use strum_macros::{Display, EnumString, IntoStaticStr};

/// The parts of an HTTP request the engine cares about. The host framework
/// builds one of these per polling request; for websocket sessions it is
/// assembled from the adapter's connect-time snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub query: HashMap<String, String>,
    /// Multi-value headers, values in arrival order
    pub headers: HashMap<String, Vec<String>>,
    pub http_method: HttpMethod,
}

#[derive(Display, Debug, Copy, Clone, PartialEq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Decode a form-urlencoded query string into a map. Duplicate keys keep
/// the last value.
pub fn parse_query_string(input: &str) -> HashMap<String, String> {
    match serde_urlencoded::from_str::<Vec<(String, String)>>(input) {
        Ok(pairs) => pairs.into_iter().collect(),
        Err(error) => {
            tracing::debug!(%error, "discarding malformed query string");
            HashMap::new()
        }
    }
}

/// Detach a decoded packet from the buffer it was parsed out of.
pub fn into_owned_packet(packet: Packet<'_>) -> Packet<'static> {
    Packet {
        packet_type: packet.packet_type,
        data: match packet.data {
            PacketData::Plaintext(text) => PacketData::Plaintext(Cow::Owned(text.into_owned())),
            PacketData::Binary(data) => PacketData::Binary(Cow::Owned(data.into_owned())),
            PacketData::Empty => PacketData::Empty,
        },
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, EnumString, IntoStaticStr)]
pub enum ServerError {
    #[strum(serialize = "Transport unknown")]
    UnknownTransport = 0,
    #[strum(serialize = "Session ID unknown")]
    UnknownSid = 1,
    #[strum(serialize = "Bad handshake method")]
    BadHandshakeMethod = 2,
    #[strum(serialize = "Bad request")]
    BadRequest = 3,
    #[strum(serialize = "Forbidden")]
    Forbidden = 4,
    #[strum(serialize = "Unknown")]
    Unknown = -1,
}

/// The error body polling clients receive, in the wire format the official
/// clients expect.
#[derive(Debug, Serialize)]
pub struct ServerErrorMessage {
    pub code: i8,
    pub message: String,
}

impl From<ServerError> for ServerErrorMessage {
    fn from(server_error: ServerError) -> Self {
        ServerErrorMessage {
            code: server_error as i8,
            message: server_error.to_string(),
        }
    }
}

impl From<ParsePacketError> for ServerError {
    fn from(_: ParsePacketError) -> Self {
        ServerError::BadRequest
    }
}

#[derive(Display, Debug, Clone, PartialEq)]
pub enum SendPacketError {
    UnknownConnectionId,
}
