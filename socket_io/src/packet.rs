use crate::error::PacketDecodeError;
use serde_json::Value;
use std::convert::TryFrom;

pub const DEFAULT_NAMESPACE: &str = "/";

/// Socket.IO protocol v2 packet types. The binary variants (5 and 6) exist
/// on the wire but are not handled here.
/// TODO: support binary attachments (packet types 5 and 6)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SocketPacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
}

impl TryFrom<u8> for SocketPacketType {
    type Error = PacketDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SocketPacketType::Connect),
            1 => Ok(SocketPacketType::Disconnect),
            2 => Ok(SocketPacketType::Event),
            3 => Ok(SocketPacketType::Ack),
            4 => Ok(SocketPacketType::ConnectError),
            other => Err(PacketDecodeError::UnsupportedPacketType(other)),
        }
    }
}

/// One Socket.IO packet: a type digit, an optional `/nsp,` prefix for
/// non-root namespaces, an optional ack id, and a JSON tail.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub packet_type: SocketPacketType,
    pub nsp: String,
    pub id: Option<u64>,
    pub data: Option<Value>,
}

impl SocketPacket {
    pub fn connect(nsp: &str) -> Self {
        SocketPacket {
            packet_type: SocketPacketType::Connect,
            nsp: nsp.to_owned(),
            id: None,
            data: None,
        }
    }

    pub fn connect_error(nsp: &str, message: &str) -> Self {
        SocketPacket {
            packet_type: SocketPacketType::ConnectError,
            nsp: nsp.to_owned(),
            id: None,
            data: Some(Value::String(message.to_owned())),
        }
    }

    pub fn event(nsp: &str, event: &str, args: Vec<Value>) -> Self {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Value::String(event.to_owned()));
        data.extend(args);
        SocketPacket {
            packet_type: SocketPacketType::Event,
            nsp: nsp.to_owned(),
            id: None,
            data: Some(Value::Array(data)),
        }
    }

    pub fn encode(&self) -> String {
        let mut out = (self.packet_type as u8).to_string();
        if self.nsp != DEFAULT_NAMESPACE {
            out.push_str(&self.nsp);
            out.push(',');
        }
        if let Some(id) = self.id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    pub fn decode(input: &str) -> Result<Self, PacketDecodeError> {
        let mut rest = input;
        let type_value = rest
            .chars()
            .next()
            .and_then(|c| c.to_digit(10))
            .ok_or(PacketDecodeError::MissingPacketType)? as u8;
        let packet_type = SocketPacketType::try_from(type_value)?;
        rest = &rest[1..];

        let nsp = if rest.starts_with('/') {
            let end = rest
                .find(|c| c == ',' || c == '[' || c == '{')
                .unwrap_or_else(|| rest.len());
            let nsp = rest[..end].to_owned();
            rest = &rest[end..];
            if rest.starts_with(',') {
                rest = &rest[1..];
            }
            nsp
        } else {
            DEFAULT_NAMESPACE.to_owned()
        };

        let id_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or_else(|| rest.len());
        let id = if id_end > 0 { rest[..id_end].parse().ok() } else { None };
        rest = &rest[id_end..];

        let data = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(rest)
                    .map_err(|error| PacketDecodeError::MalformedJson(error.to_string()))?,
            )
        };

        Ok(SocketPacket {
            packet_type,
            nsp,
            id,
            data,
        })
    }
}
