//! TCP connection handler
//!
//! Handles individual client connections: line framing, command parsing,
//! the login state machine, heartbeats, and writing replies and relayed
//! messages back to the socket.
//!
//! A connection runs as two tasks. The read task owns the line reader and
//! the heartbeat and runs one `tokio::select!` loop; it never waits on the
//! socket to accept bytes. Everything bound for the client, its own replies
//! and messages routed by the ChatServer alike, goes through one unbounded
//! outbox drained by a write task. A client that stops reading therefore
//! still hits its heartbeat deadline, and replies go out in request order.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

use crate::codec::LineCodec;
use crate::config::ServerConfig;
use crate::error::{AppError, FrameError};
use crate::heartbeat::{Heartbeat, HeartbeatEvent, PongOutcome};
use crate::message::{ClientMessage, DisconnectReason, ErrorCode, ServerMessage, Status};
use crate::server::ServerCommand;
use crate::types::ConnectionId;

/// How long a closing connection may spend flushing queued output
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether the connection stays open after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Handle a new TCP connection
///
/// Registers with the ChatServer, sends WELCOME, and processes lines until
/// the client leaves, misbehaves fatally, or the socket fails. Teardown runs
/// exactly once on every exit path.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
    config: ServerConfig,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let client_id = ConnectionId::new();
    let span = info_span!("connection", peer = %peer_addr, user = field::Empty);

    serve_connection(stream, client_id, cmd_tx, config)
        .instrument(span)
        .await
}

async fn serve_connection(
    stream: TcpStream,
    client_id: ConnectionId,
    cmd_tx: mpsc::Sender<ServerCommand>,
    config: ServerConfig,
) -> Result<(), AppError> {
    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(read_half, LineCodec::new(config.max_pending));
    let writer = FramedWrite::new(write_half, LineCodec::new(config.max_pending));

    // Channel for everything sent to this client
    let (outbox, outbox_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut write_task = tokio::spawn(write_messages(writer, outbox_rx).in_current_span());

    // WELCOME is queued before the ChatServer can route anything here
    let _ = outbox.send(ServerMessage::welcome());

    if cmd_tx
        .send(ServerCommand::Connect {
            client_id,
            sender: outbox.clone(),
        })
        .await
        .is_err()
    {
        write_task.abort();
        return Err(AppError::ChannelSend);
    }

    info!("Client {} connected", client_id);

    let mut connection = Connection {
        id: client_id,
        username: None,
        heartbeat: Heartbeat::new(config.heartbeat),
        outbox,
        cmd_tx: cmd_tx.clone(),
    };

    let result = connection.run(reader, &mut write_task).await;
    if let Err(e) = &result {
        warn!("Closing connection after error: {}", e);
    }

    // Teardown: timers first, then the registry, then the socket
    connection.heartbeat.stop();
    let _ = cmd_tx.send(ServerCommand::Disconnect { client_id }).await;
    drop(connection);
    close_writer(write_task).await;

    info!("Client {} disconnected", client_id);

    result
}

/// Write task: drain the outbox into the socket, then shut it down
///
/// Ends once every sender is gone or a write fails.
async fn write_messages(
    mut writer: FramedWrite<OwnedWriteHalf, LineCodec>,
    mut outbox: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(msg) = outbox.recv().await {
        debug!("<-- {:?}", msg);
        if let Err(e) = writer.send(msg).await {
            debug!("Socket write failed, ending write task: {}", e);
            return;
        }
    }

    if let Err(e) = writer.close().await {
        debug!("Socket shutdown failed: {}", e);
    }
}

/// Give queued output a bounded time to reach the client
///
/// A client that is not reading would hold the socket open forever, so the
/// write task is aborted once `FLUSH_TIMEOUT` passes. Aborting drops the
/// write half, which closes the socket.
async fn close_writer(mut write_task: JoinHandle<()>) {
    if write_task.is_finished() {
        return;
    }
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut write_task)
        .await
        .is_err()
    {
        warn!("Client not reading, dropping queued output");
        write_task.abort();
    }
}

/// Per-connection state
struct Connection {
    id: ConnectionId,
    /// Set once LOGIN succeeds
    username: Option<String>,
    heartbeat: Heartbeat,
    /// Feeds the write task
    outbox: mpsc::UnboundedSender<ServerMessage>,
    cmd_tx: mpsc::Sender<ServerCommand>,
}

impl Connection {
    async fn run(
        &mut self,
        mut reader: FramedRead<OwnedReadHalf, LineCodec>,
        write_task: &mut JoinHandle<()>,
    ) -> Result<(), AppError> {
        loop {
            let flow = tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(line)) => self.process_line(&line).await?,
                    Some(Err(FrameError::Overflow { limit })) => {
                        warn!("Too many pending characters (limit {})", limit);
                        self.send(ServerMessage::Dscn {
                            reason: DisconnectReason::BufferOverflow,
                        })?;
                        Flow::Close
                    }
                    Some(Err(FrameError::Io(e))) => {
                        warn!("Closing connection due to transmission error: {}", e);
                        Flow::Close
                    }
                    None => {
                        debug!("Client closed connection");
                        Flow::Close
                    }
                },
                _ = &mut *write_task => {
                    debug!("Write task ended");
                    Flow::Close
                }
                event = self.heartbeat.next_event() => self.process_heartbeat(event)?,
            };

            if flow == Flow::Close {
                return Ok(());
            }
        }
    }

    /// Queue one message for the write task
    fn send(&self, msg: ServerMessage) -> Result<(), AppError> {
        self.outbox.send(msg).map_err(|_| AppError::ChannelSend)
    }

    /// Ask the ChatServer something and wait for the answer
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ServerCommand,
    ) -> Result<T, AppError> {
        let (respond_to, response) = oneshot::channel();
        self.cmd_tx
            .send(make(respond_to))
            .await
            .map_err(|_| AppError::ChannelSend)?;
        response.await.map_err(|_| AppError::ChannelSend)
    }

    async fn process_line(&mut self, line: &str) -> Result<Flow, AppError> {
        debug!("--> {}", line);

        let message = match ClientMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                debug!("{}", e);
                self.send(ServerMessage::ParseError)?;
                return Ok(Flow::Continue);
            }
        };

        match message {
            ClientMessage::Login { username } => self.process_login(username).await,
            ClientMessage::BroadcastReq { message } => self.process_broadcast(message).await,
            ClientMessage::Pong => self.process_pong(),
            ClientMessage::Bye => {
                self.send(ServerMessage::ByeResp(Status::Ok))?;
                Ok(Flow::Close)
            }
            ClientMessage::Unknown(command) => {
                debug!("Unknown command '{}'", command);
                self.send(ServerMessage::UnknownCommand)?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn process_login(&mut self, username: String) -> Result<Flow, AppError> {
        let client_id = self.id;
        let requested = username.clone();
        let status = self
            .request(|respond_to| ServerCommand::Login {
                client_id,
                username: requested,
                respond_to,
            })
            .await?;

        if status == Status::Ok {
            Span::current().record("user", username.as_str());
            self.username = Some(username);
            if self.heartbeat.start() {
                info!("Heartbeat initiated");
            }
        }

        self.send(ServerMessage::LoginResp(status))?;
        Ok(Flow::Continue)
    }

    async fn process_broadcast(&mut self, message: Value) -> Result<Flow, AppError> {
        let status = if self.username.is_none() {
            Status::Error {
                code: ErrorCode::NotAuthenticated,
            }
        } else {
            let client_id = self.id;
            self.request(|respond_to| ServerCommand::Broadcast {
                client_id,
                message,
                respond_to,
            })
            .await?
        };

        self.send(ServerMessage::BroadcastResp(status))?;
        Ok(Flow::Continue)
    }

    fn process_pong(&mut self) -> Result<Flow, AppError> {
        match self.heartbeat.on_pong() {
            PongOutcome::Accepted => debug!("Heartbeat success"),
            PongOutcome::Unsolicited => {
                self.send(ServerMessage::PongError {
                    code: ErrorCode::UnsolicitedPong,
                })?;
            }
        }
        Ok(Flow::Continue)
    }

    fn process_heartbeat(&mut self, event: HeartbeatEvent) -> Result<Flow, AppError> {
        match event {
            HeartbeatEvent::SendPing => {
                self.send(ServerMessage::Ping)?;
                Ok(Flow::Continue)
            }
            HeartbeatEvent::TimedOut => {
                warn!("Heartbeat failure");
                self.send(ServerMessage::Dscn {
                    reason: DisconnectReason::HeartbeatTimeout,
                })?;
                Ok(Flow::Close)
            }
        }
    }
}
