// Socket.IO v4 / Engine.IO v4 text packet codec
// https://socket.io/docs/v4/socket-io-protocol/
//
// Only the subset needed over a plain WebSocket transport is handled:
// no polling upgrade, no binary attachments.

use serde_json::Value;
use thiserror::Error;

/// Errors raised while decoding a text frame
#[derive(Debug, Error, PartialEq)]
pub enum PacketError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown packet type: {0}")]
    UnknownType(String),

    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("Event packet without a name")]
    MissingEventName,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO handshake (`0{"sid":...,"pingInterval":...}`)
    Open(Value),
    Close,
    Ping(String),
    Pong(String),
    Noop,
    /// Socket.IO namespace connect (`40` / `40{"sid":...}`)
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, data: Value },
    /// Acknowledgement of an event we emitted with an ack id. Not used by the chat protocol.
    Ack,
    ConnectError(Value),
}

impl Packet {
    pub fn event(name: &str, data: Value) -> Self {
        Packet::Event {
            name: name.to_string(),
            data,
        }
    }
}

pub fn encode(packet: &Packet) -> String {
    match packet {
        Packet::Open(handshake) => format!("0{}", handshake),
        Packet::Close => "1".to_string(),
        Packet::Ping(probe) => format!("2{}", probe),
        Packet::Pong(probe) => format!("3{}", probe),
        Packet::Noop => "6".to_string(),
        Packet::Connect(None) => "40".to_string(),
        Packet::Connect(Some(auth)) => format!("40{}", auth),
        Packet::Disconnect => "41".to_string(),
        Packet::Event { name, data } => {
            let args = Value::Array(vec![Value::String(name.clone()), data.clone()]);
            format!("42{}", args)
        }
        Packet::Ack => "43[]".to_string(),
        Packet::ConnectError(err) => format!("44{}", err),
    }
}

pub fn decode(frame: &str) -> Result<Packet, PacketError> {
    let mut chars = frame.chars();
    let engine_type = chars.next().ok_or(PacketError::Empty)?;
    let rest = chars.as_str();

    match engine_type {
        '0' => Ok(Packet::Open(parse_json(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping(rest.to_string())),
        '3' => Ok(Packet::Pong(rest.to_string())),
        '6' => Ok(Packet::Noop),
        '4' => decode_socket_packet(rest),
        other => Err(PacketError::UnknownType(other.to_string())),
    }
}

fn decode_socket_packet(frame: &str) -> Result<Packet, PacketError> {
    let mut chars = frame.chars();
    let socket_type = chars.next().ok_or(PacketError::Empty)?;
    let body = strip_ack_id(strip_namespace(chars.as_str()));

    match socket_type {
        '0' => {
            if body.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(parse_json(body)?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let args = match parse_json(body)? {
                Value::Array(args) => args,
                other => return Err(PacketError::InvalidJson(format!("expected array, got {}", other))),
            };
            let mut args = args.into_iter();
            let name = match args.next() {
                Some(Value::String(name)) => name,
                _ => return Err(PacketError::MissingEventName),
            };
            let data = args.next().unwrap_or(Value::Null);
            Ok(Packet::Event { name, data })
        }
        '3' => Ok(Packet::Ack),
        '4' => Ok(Packet::ConnectError(parse_json(body).unwrap_or(Value::Null))),
        other => Err(PacketError::UnknownType(format!("4{}", other))),
    }
}

// "/chat,42[...]" style namespaces precede the payload
fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(idx) => &body[idx + 1..],
            None => "",
        }
    } else {
        body
    }
}

fn strip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn parse_json(text: &str) -> Result<Value, PacketError> {
    serde_json::from_str(text).map_err(|e| PacketError::InvalidJson(e.to_string()))
}
