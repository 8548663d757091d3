//! Error types for the chat relay
//!
//! Defines connection-level errors, framing and parsing failures, and
//! message send errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// These end a single connection; they never terminate the server.
#[derive(Debug, Error)]
pub enum AppError {
    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,
}

/// Errors produced by the line codec
#[derive(Debug, Error)]
pub enum FrameError {
    /// Too many characters received without a line terminator
    #[error("pending buffer exceeded {limit} characters")]
    Overflow { limit: usize },

    /// Underlying socket error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A received line could not be turned into a message
#[derive(Debug, Error)]
pub enum ParseError {
    /// Payload is not valid JSON
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is `null` on a command that reads fields from it
    #[error("{command} payload is null")]
    NullPayload { command: String },
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
