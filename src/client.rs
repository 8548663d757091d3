//! Client struct definition
//!
//! The registry's view of a connection: its id, username once logged in,
//! and the channel used to push messages to its connection task.

use tokio::sync::mpsc;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::ConnectionId;

/// Connected client information
///
/// Holds the registry-side state of one connection. The socket itself is
/// owned by the connection task; this is only a handle for routing.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for this connection
    pub id: ConnectionId,
    /// Username (None before LOGIN)
    pub username: Option<String>,
    /// Server → Client message channel
    pub sender: mpsc::UnboundedSender<ServerMessage>,
}

impl Client {
    /// Create a new client with the given ID and sender channel
    pub fn new(id: ConnectionId, sender: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id,
            username: None,
            sender,
        }
    }

    /// Send a message to this client
    ///
    /// Returns an error if the channel is closed (client disconnected).
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.send(msg).map_err(|_| SendError::ChannelClosed)
    }

    /// Username for log lines, empty while not logged in
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or_default()
    }

    /// Check if this client has logged in
    pub fn has_username(&self) -> bool {
        self.username.is_some()
    }

    /// Set the client's username
    pub fn set_username(&mut self, username: String) {
        self.username = Some(username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = Client::new(ConnectionId::new(), tx);

        assert!(client.username.is_none());
        assert_eq!(client.display_name(), "");
    }

    #[test]
    fn test_client_username() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut client = Client::new(ConnectionId::new(), tx);

        assert!(!client.has_username());

        client.set_username("Alice".to_string());

        assert!(client.has_username());
        assert_eq!(client.display_name(), "Alice");
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client::new(ConnectionId::new(), tx);
        assert!(client.send(ServerMessage::Ping).is_ok());

        drop(rx);
        assert!(matches!(
            client.send(ServerMessage::Ping),
            Err(SendError::ChannelClosed)
        ));
    }
}
