//! Message protocol definitions
//!
//! Every line on the wire is `<COMMAND>[ <JSON-PAYLOAD>]`. Incoming lines are
//! split into a command token and a JSON payload and then mapped onto the
//! closed `ClientMessage` enum; outgoing `ServerMessage` values carry their
//! payload through Serde.

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::ParseError;

/// Split a line into its command token and JSON payload
///
/// The token runs up to the first space. Whatever follows that space is the
/// payload; an absent or empty payload is read as `{}`.
pub fn parse_line(line: &str) -> Result<(String, Value), ParseError> {
    let (command, payload) = line.split_once(' ').unwrap_or((line, ""));
    let payload = if payload.is_empty() { "{}" } else { payload };
    let payload = serde_json::from_str(payload)?;
    Ok((command.to_string(), payload))
}

/// Client → Server message
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Claim a username
    Login { username: String },
    /// Send a value to every other logged-in user
    BroadcastReq { message: Value },
    /// Answer to a heartbeat PING
    Pong,
    /// Orderly disconnect
    Bye,
    /// Any command token we do not know
    Unknown(String),
}

impl ClientMessage {
    /// Parse a complete line into a message
    ///
    /// The payload is validated before the command is looked at, so a broken
    /// payload is a parse error even on an unknown command.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let (command, payload) = parse_line(line)?;
        Self::from_parts(command, &payload)
    }

    /// Build a message from an already parsed token and payload
    ///
    /// LOGIN and BROADCAST_REQ read a field from the payload, so a `null`
    /// payload is a parse error for them. The other commands ignore it.
    pub fn from_parts(command: String, payload: &Value) -> Result<Self, ParseError> {
        let message = match command.as_str() {
            "LOGIN" => ClientMessage::Login {
                username: field(&command, payload, "username")?
                    .map(coerce_username)
                    .unwrap_or_default(),
            },
            "BROADCAST_REQ" => ClientMessage::BroadcastReq {
                message: field(&command, payload, "message")?
                    .cloned()
                    .unwrap_or_else(|| Value::from("")),
            },
            "PONG" => ClientMessage::Pong,
            "BYE" => ClientMessage::Bye,
            _ => ClientMessage::Unknown(command),
        };
        Ok(message)
    }
}

/// Look up a payload field, skipping empty values
///
/// Missing fields, `null`, `false`, `0` and `""` all count as absent. A
/// payload that is not an object has no fields.
fn field<'a>(
    command: &str,
    payload: &'a Value,
    key: &str,
) -> Result<Option<&'a Value>, ParseError> {
    if payload.is_null() {
        return Err(ParseError::NullPayload {
            command: command.to_string(),
        });
    }
    Ok(payload.get(key).filter(|value| is_present(value)))
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Username text for a present field
///
/// Numbers and booleans use their JSON text, so `123` claims `"123"`.
/// Arrays and objects read as empty and fail validation.
fn coerce_username(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => String::new(),
    }
}

/// Server → Client message
///
/// Serialized untagged: the variant's fields form the JSON payload and unit
/// variants have no payload at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Greeting sent once on connect
    Welcome { msg: String },
    /// Outcome of a LOGIN
    LoginResp(Status),
    /// Outcome of a BROADCAST_REQ, sent to the sender only
    BroadcastResp(Status),
    /// Message relayed from another user, payload value unchanged
    Broadcast { username: String, message: Value },
    /// A logged-in user disconnected
    Left { username: String },
    /// Heartbeat request
    Ping,
    /// PONG received without an outstanding PING
    PongError { code: ErrorCode },
    /// Forced disconnect notice
    Dscn { reason: DisconnectReason },
    /// Acknowledges BYE before the socket is closed
    ByeResp(Status),
    /// Unrecognized command token
    UnknownCommand,
    /// Payload was not valid JSON
    ParseError,
}

/// Protocol version announced in WELCOME, major.minor only
pub const SERVER_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR")
);

impl ServerMessage {
    /// Greeting carrying the server version
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            msg: format!("Welcome to the server {}", SERVER_VERSION),
        }
    }

    /// Command token written in front of the payload
    pub fn command(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "WELCOME",
            ServerMessage::LoginResp(_) => "LOGIN_RESP",
            ServerMessage::BroadcastResp(_) => "BROADCAST_RESP",
            ServerMessage::Broadcast { .. } => "BROADCAST",
            ServerMessage::Left { .. } => "LEFT",
            ServerMessage::Ping => "PING",
            ServerMessage::PongError { .. } => "PONG_ERROR",
            ServerMessage::Dscn { .. } => "DSCN",
            ServerMessage::ByeResp(_) => "BYE_RESP",
            ServerMessage::UnknownCommand => "UNKNOWN_COMMAND",
            ServerMessage::ParseError => "PARSE_ERROR",
        }
    }

    /// Render the message as a line, without the trailing newline
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let payload = serde_json::to_string(self)?;
        if payload == "null" {
            Ok(self.command().to_string())
        } else {
            Ok(format!("{} {}", self.command(), payload))
        }
    }
}

/// `{"status": "OK"}` or `{"status": "ERROR", "code": ...}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error { code: ErrorCode },
}

/// Numeric error codes sent to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Username already taken
    NameTaken = 5000,
    /// Username does not match the naming rule
    InvalidName = 5001,
    /// Connection is already logged in
    AlreadyLoggedIn = 5002,
    /// Broadcast before login
    NotAuthenticated = 6000,
    /// PONG without a PING
    UnsolicitedPong = 8000,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

/// Reason codes carried by DSCN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No PONG before the deadline
    HeartbeatTimeout = 7000,
    /// Too many characters without a line terminator
    BufferOverflow = 7001,
}

impl DisconnectReason {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl Serialize for DisconnectReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}
