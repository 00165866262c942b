use axum::extract::ws::Utf8Bytes;
use bytes::Bytes;
use thiserror::Error;

/// Close code sent when the server shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent when a client keeps sending unusable frames.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// What a session reads from its connection. Ping and pong frames never
/// reach the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(Utf8Bytes),
    Binary(Bytes),
    Close,
}

/// What a session writes to its connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: &'static str },
}

impl Outbound {
    pub fn text(&self) -> Option<&str> {
        match self {
            Outbound::Text(text) => Some(text),
            Outbound::Close { .. } => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("failed to read from connection: {0}")]
    Receive(String),
    #[error("failed to write to connection: {0}")]
    Send(String),
    #[error("connection closed")]
    Closed,
}
