use std::{error, fmt};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmitError {
    EmptyEventName,
    ConnectionClosed,
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::EmptyEventName => {
                write!(f, "Event name cannot be empty")
            }
            EmitError::ConnectionClosed => {
                write!(f, "Connection is no longer open")
            }
        }
    }
}

impl error::Error for EmitError {}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketDecodeError {
    MissingPacketType,
    UnsupportedPacketType(u8),
    MalformedJson(String),
}

impl fmt::Display for PacketDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDecodeError::MissingPacketType => {
                write!(f, "Packet has no type digit")
            }
            PacketDecodeError::UnsupportedPacketType(value) => {
                write!(f, "Unsupported packet type {}", value)
            }
            PacketDecodeError::MalformedJson(message) => {
                write!(f, "Malformed packet payload: {}", message)
            }
        }
    }
}

impl error::Error for PacketDecodeError {}
