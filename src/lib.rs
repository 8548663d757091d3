//! Line-oriented TCP Chat Relay Library
//!
//! Clients connect over TCP, log in with a unique username, and exchange
//! broadcasts through the server. Every line on the wire is
//! `<COMMAND>[ <JSON-PAYLOAD>]`.
//!
//! # Features
//! - Incremental line framing with a bounded pending buffer
//! - Login with unique, validated usernames
//! - Broadcast fan-out to every other logged-in user
//! - PING/PONG heartbeats with forced disconnect on timeout
//! - LEFT notifications on disconnect
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the central actor owning the session registry
//! - Each connection has a `handler` read task talking to the server and a
//!   write task draining its outbox
//! - No locks needed - all registry access goes through message passing
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//! use chat_relay::{serve, ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:1337").await.unwrap();
//!     let (cmd_tx, cmd_rx) = mpsc::channel(256);
//!
//!     tokio::spawn(ChatServer::new(cmd_rx).run());
//!     serve(listener, cmd_tx, ServerConfig::default()).await;
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod listener;
pub mod message;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use client::Client;
pub use codec::{LineCodec, LineFramer};
pub use config::{Config, ServerConfig};
pub use error::{AppError, FrameError, ParseError, SendError};
pub use handler::handle_connection;
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent, PongOutcome};
pub use listener::serve;
pub use message::{
    parse_line, ClientMessage, DisconnectReason, ErrorCode, ServerMessage, Status, SERVER_VERSION,
};
pub use server::{ChatServer, RegistryStats, ServerCommand};
pub use types::ConnectionId;
