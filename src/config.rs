//! Server configuration
//!
//! Command-line flags with environment variable fallbacks, converted into
//! the runtime `ServerConfig` handed to every connection.

use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::codec::DEFAULT_MAX_PENDING;
use crate::heartbeat::HeartbeatConfig;

/// Line-oriented TCP chat relay
#[derive(Parser, Debug, Clone)]
#[command(name = "chat_relay", version, about = "Line-oriented TCP chat relay")]
pub struct Config {
    /// Bind address
    #[arg(long, env = "CHAT_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "CHAT_PORT", default_value_t = 1337)]
    pub port: u16,

    /// Send PINGs to logged-in clients
    #[arg(
        long,
        env = "CHAT_HEARTBEAT",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub heartbeat: bool,

    /// Milliseconds between two PINGs
    #[arg(long, env = "CHAT_PING_INTERVAL_MS", default_value_t = 10_000)]
    pub ping_interval_ms: u64,

    /// Milliseconds a client has to answer a PING
    #[arg(long, env = "CHAT_PONG_TIMEOUT_MS", default_value_t = 3_000)]
    pub pong_timeout_ms: u64,

    /// Characters buffered without a line terminator before disconnecting
    #[arg(long, env = "CHAT_MAX_PENDING", default_value_t = DEFAULT_MAX_PENDING)]
    pub max_pending: usize,

    /// Enable structured JSON logging
    #[arg(long, env = "CHAT_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// `host:port` to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            heartbeat: HeartbeatConfig {
                enabled: self.heartbeat,
                interval: Duration::from_millis(self.ping_interval_ms),
                timeout: Duration::from_millis(self.pong_timeout_ms),
            },
            max_pending: self.max_pending,
        }
    }
}

/// Settings each connection runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub heartbeat: HeartbeatConfig,
    pub max_pending: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}
