//! ChatServer Actor implementation
//!
//! The session registry: owns every connected client, the username index,
//! and the login-ordered roster used for fan-out. Connection tasks talk to it
//! through `ServerCommand`s over an mpsc channel, so every read and write of
//! the registry happens on this one task and needs no locking.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::client::Client;
use crate::message::{ErrorCode, ServerMessage, Status};
use crate::types::ConnectionId;

/// Shortest accepted username
pub const MIN_USERNAME_LEN: usize = 3;

/// Longest accepted username
pub const MAX_USERNAME_LEN: usize = 14;

/// Commands sent from connection tasks to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// New connection accepted
    Connect {
        client_id: ConnectionId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    },
    /// Connection closed, for whatever reason
    Disconnect { client_id: ConnectionId },
    /// Claim a username
    Login {
        client_id: ConnectionId,
        username: String,
        respond_to: oneshot::Sender<Status>,
    },
    /// Relay a message to every other logged-in client
    Broadcast {
        client_id: ConnectionId,
        message: Value,
        respond_to: oneshot::Sender<Status>,
    },
    /// Report registry sizes
    Stats { respond_to: oneshot::Sender<RegistryStats> },
}

/// Registry sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// All live connections, logged in or not
    pub clients: usize,
    /// Logged-in connections
    pub users: usize,
}

impl std::fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} client(s) / {} user(s)", self.clients, self.users)
    }
}

/// Username rule: 3 to 14 ASCII letters, digits or underscores
pub fn is_valid_username(username: &str) -> bool {
    (MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The main ChatServer actor
///
/// Invariant: a client is in `users` iff its `username` is set, under
/// exactly that name, and in `roster` iff it is in `users`.
pub struct ChatServer {
    /// All connected clients: ConnectionId -> Client
    clients: HashMap<ConnectionId, Client>,
    /// Logged-in clients: username -> ConnectionId
    users: HashMap<String, ConnectionId>,
    /// Logged-in clients in login order; fan-out follows this order
    roster: Vec<ConnectionId>,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
}

impl ChatServer {
    /// Create a new ChatServer with the given command receiver
    pub fn new(receiver: mpsc::Receiver<ServerCommand>) -> Self {
        Self {
            clients: HashMap::new(),
            users: HashMap::new(),
            roster: Vec::new(),
            receiver,
        }
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Connect { client_id, sender } => {
                self.handle_connect(client_id, sender);
            }
            ServerCommand::Disconnect { client_id } => {
                self.handle_disconnect(client_id);
            }
            ServerCommand::Login {
                client_id,
                username,
                respond_to,
            } => {
                if let Some(status) = self.handle_login(client_id, username) {
                    let _ = respond_to.send(status);
                }
            }
            ServerCommand::Broadcast {
                client_id,
                message,
                respond_to,
            } => {
                let status = self.handle_broadcast(client_id, message);
                let _ = respond_to.send(status);
            }
            ServerCommand::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
        }
    }

    fn stats(&self) -> RegistryStats {
        RegistryStats {
            clients: self.clients.len(),
            users: self.users.len(),
        }
    }

    /// Handle new connection
    fn handle_connect(
        &mut self,
        client_id: ConnectionId,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) {
        debug!("Client {} registered", client_id);
        self.clients.insert(client_id, Client::new(client_id, sender));
        debug!("{}", self.stats());
    }

    /// Handle connection teardown
    ///
    /// Safe to call more than once; later calls find nothing to remove.
    /// Only a logged-in user is announced with LEFT. A connection that never
    /// logged in leaves silently instead of sending `LEFT {"username":""}`.
    fn handle_disconnect(&mut self, client_id: ConnectionId) {
        let Some(client) = self.clients.remove(&client_id) else {
            debug!("Client {} already removed", client_id);
            return;
        };

        if let Some(username) = client.username {
            self.users.remove(&username);
            self.roster.retain(|id| *id != client_id);

            for id in &self.roster {
                if let Some(other) = self.clients.get(id) {
                    let left = ServerMessage::Left {
                        username: username.clone(),
                    };
                    if other.send(left).is_err() {
                        debug!("Client {} gone before LEFT could be delivered", id);
                    }
                }
            }

            info!("User '{}' left", username);
        }

        info!("Client {} removed, {}", client_id, self.stats());
    }

    /// Handle LOGIN
    ///
    /// The existence check and the insert happen in the same step. Returns
    /// None for a connection that is not registered.
    fn handle_login(&mut self, client_id: ConnectionId, username: String) -> Option<Status> {
        let client = self.clients.get_mut(&client_id)?;

        let code = if client.has_username() {
            ErrorCode::AlreadyLoggedIn
        } else if !is_valid_username(&username) {
            ErrorCode::InvalidName
        } else if self.users.contains_key(&username) {
            ErrorCode::NameTaken
        } else {
            client.set_username(username.clone());
            self.users.insert(username.clone(), client_id);
            self.roster.push(client_id);
            info!("Client {} logged in as '{}', {}", client_id, username, self.stats());
            return Some(Status::Ok);
        };

        debug!("Client {} login as '{}' rejected: {:?}", client_id, username, code);
        Some(Status::Error { code })
    }

    /// Handle BROADCAST_REQ
    ///
    /// The sender gets the returned status; every other logged-in client
    /// gets a BROADCAST, in login order.
    fn handle_broadcast(&self, client_id: ConnectionId, message: Value) -> Status {
        let Some(username) = self
            .clients
            .get(&client_id)
            .and_then(|c| c.username.clone())
        else {
            return Status::Error {
                code: ErrorCode::NotAuthenticated,
            };
        };

        for id in self.roster.iter().filter(|id| **id != client_id) {
            let Some(recipient) = self.clients.get(id) else {
                continue;
            };
            let relayed = ServerMessage::Broadcast {
                username: username.clone(),
                message: message.clone(),
            };
            if recipient.send(relayed).is_err() {
                debug!("Client {} gone before BROADCAST could be delivered", id);
            }
        }

        Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestClient {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl TestClient {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn start() -> mpsc::Sender<ServerCommand> {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(ChatServer::new(rx).run());
        tx
    }

    async fn connect(server: &mpsc::Sender<ServerCommand>) -> TestClient {
        let id = ConnectionId::new();
        let (sender, rx) = mpsc::unbounded_channel();
        server
            .send(ServerCommand::Connect {
                client_id: id,
                sender,
            })
            .await
            .unwrap();
        TestClient { id, rx }
    }

    async fn login(
        server: &mpsc::Sender<ServerCommand>,
        client: &TestClient,
        name: &str,
    ) -> Status {
        let (respond_to, rx) = oneshot::channel();
        server
            .send(ServerCommand::Login {
                client_id: client.id,
                username: name.to_string(),
                respond_to,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn broadcast(
        server: &mpsc::Sender<ServerCommand>,
        client: &TestClient,
        text: &str,
    ) -> Status {
        let (respond_to, rx) = oneshot::channel();
        server
            .send(ServerCommand::Broadcast {
                client_id: client.id,
                message: Value::from(text),
                respond_to,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn stats(server: &mpsc::Sender<ServerCommand>) -> RegistryStats {
        let (respond_to, rx) = oneshot::channel();
        server.send(ServerCommand::Stats { respond_to }).await.unwrap();
        rx.await.unwrap()
    }

    async fn disconnect(server: &mpsc::Sender<ServerCommand>, client: &TestClient) {
        server
            .send(ServerCommand::Disconnect {
                client_id: client.id,
            })
            .await
            .unwrap();
    }

    fn error(code: ErrorCode) -> Status {
        Status::Error { code }
    }

    #[test]
    fn test_username_rule() {
        assert!(is_valid_username("ok_1"));
        assert!(is_valid_username("ALICE"));
        assert!(is_valid_username("abc"));
        assert!(is_valid_username("abcdefghijklmn"));
        assert!(!is_valid_username("ab"));
        assert!(!is_valid_username("abcdefghijklmno"));
        assert!(!is_valid_username("way_too_long_name_1"));
        assert!(!is_valid_username("bad name"));
        assert!(!is_valid_username("héllo"));
        assert!(!is_valid_username(""));
    }

    #[tokio::test]
    async fn test_username_uniqueness() {
        let server = start();
        let a = connect(&server).await;
        let b = connect(&server).await;

        let (first, second) = tokio::join!(login(&server, &a, "ALICE"), login(&server, &b, "ALICE"));
        let mut results = vec![first, second];
        results.sort_by_key(|s| matches!(s, Status::Error { .. }));
        assert_eq!(results, vec![Status::Ok, error(ErrorCode::NameTaken)]);

        assert_eq!(stats(&server).await, RegistryStats { clients: 2, users: 1 });
    }

    #[tokio::test]
    async fn test_names_are_case_sensitive() {
        let server = start();
        let a = connect(&server).await;
        let b = connect(&server).await;

        assert_eq!(login(&server, &a, "alice").await, Status::Ok);
        assert_eq!(login(&server, &b, "ALICE").await, Status::Ok);
    }

    #[tokio::test]
    async fn test_invalid_names() {
        let server = start();
        let a = connect(&server).await;

        assert_eq!(login(&server, &a, "ab").await, error(ErrorCode::InvalidName));
        assert_eq!(
            login(&server, &a, "way_too_long_name_1").await,
            error(ErrorCode::InvalidName)
        );
        assert_eq!(login(&server, &a, "").await, error(ErrorCode::InvalidName));
        assert_eq!(login(&server, &a, "ok_1").await, Status::Ok);
    }

    #[tokio::test]
    async fn test_double_login_keeps_name() {
        let server = start();
        let mut a = connect(&server).await;
        let mut b = connect(&server).await;

        assert_eq!(login(&server, &a, "ALICE").await, Status::Ok);
        assert_eq!(login(&server, &a, "BOB").await, error(ErrorCode::AlreadyLoggedIn));
        // BOB was never taken
        assert_eq!(login(&server, &b, "BOB").await, Status::Ok);

        assert_eq!(broadcast(&server, &a, "x").await, Status::Ok);
        assert_eq!(
            b.drain(),
            vec![ServerMessage::Broadcast {
                username: "ALICE".to_string(),
                message: Value::from("x")
            }]
        );
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let server = start();
        let mut a = connect(&server).await;
        let mut b = connect(&server).await;
        let mut c = connect(&server).await;
        let mut lurker = connect(&server).await;

        login(&server, &a, "A_1").await;
        login(&server, &b, "B_1").await;
        login(&server, &c, "C_1").await;

        assert_eq!(broadcast(&server, &a, "hi").await, Status::Ok);

        let expected = vec![ServerMessage::Broadcast {
            username: "A_1".to_string(),
            message: Value::from("hi"),
        }];
        assert!(a.drain().is_empty());
        assert_eq!(b.drain(), expected);
        assert_eq!(c.drain(), expected);
        assert!(lurker.drain().is_empty());
    }

    #[tokio::test]
    async fn test_unauthenticated_broadcast() {
        let server = start();
        let anon = connect(&server).await;
        let mut b = connect(&server).await;
        login(&server, &b, "B_1").await;

        assert_eq!(
            broadcast(&server, &anon, "hi").await,
            error(ErrorCode::NotAuthenticated)
        );
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_sends_left_once() {
        let server = start();
        let a = connect(&server).await;
        let mut b = connect(&server).await;
        login(&server, &a, "A_1").await;
        login(&server, &b, "B_1").await;
        let mut late = connect(&server).await;
        login(&server, &late, "LATE").await;

        disconnect(&server, &a).await;
        disconnect(&server, &a).await;

        assert_eq!(stats(&server).await, RegistryStats { clients: 2, users: 2 });
        let left = vec![ServerMessage::Left {
            username: "A_1".to_string(),
        }];
        assert_eq!(b.drain(), left);
        assert_eq!(late.drain(), left);

        // Name is free again
        let again = connect(&server).await;
        assert_eq!(login(&server, &again, "A_1").await, Status::Ok);
    }

    #[tokio::test]
    async fn test_unauthenticated_disconnect_is_silent() {
        let server = start();
        let anon = connect(&server).await;
        let mut b = connect(&server).await;
        login(&server, &b, "B_1").await;

        disconnect(&server, &anon).await;

        assert_eq!(stats(&server).await, RegistryStats { clients: 1, users: 1 });
        assert!(b.drain().is_empty());
    }

    #[test]
    fn test_stats_display() {
        let stats = RegistryStats { clients: 3, users: 1 };
        assert_eq!(stats.to_string(), "3 client(s) / 1 user(s)");
    }
}
