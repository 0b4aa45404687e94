//! WebSocket worker client
//!
//! Connects a worker to the coordinator server with:
//! - Automatic reconnection with exponential backoff
//! - Concurrent command execution bounded by a semaphore
//! - Replies correlated to the command that caused them

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::dispatch::{WorkerId, WorkerReply};
use crate::error::{Error, Result};
use crate::protocol::{
    CommandMessage, HelloAckMessage, HelloMessage, Message, MessageEnvelope, OkReply, PeerRole,
    PROTOCOL_VERSION,
};
use crate::transport::{next_envelope, send_envelope, Inbound};
use super::CommandExecutor;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the worker client
#[derive(Debug, Clone)]
pub struct WorkerClientConfig {
    /// WebSocket URL of the coordinator server
    pub url: String,

    /// Worker name announced in the handshake
    pub name: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Time allowed for the server to acknowledge the handshake
    pub handshake_timeout: Duration,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,

    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,

    /// Commands executed at the same time
    pub max_concurrent_commands: usize,

    /// Message queue size
    pub message_queue_size: usize,
}

impl Default for WorkerClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7420".to_string(),
            name: "worker".to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 0, // Infinite
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            max_concurrent_commands: num_cpus::get(),
            message_queue_size: 100,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected, handshake pending
    Connected,
    /// Handshake done, receiving commands
    Registered,
    /// Connection error, will retry
    Reconnecting,
    /// Shutting down
    ShuttingDown,
}

#[derive(Default)]
struct ClientState {
    connection_state: ConnectionState,
    worker_id: Option<WorkerId>,
    reconnect_attempts: u32,
    connected_at: Option<Instant>,
}

// ─────────────────────────────────────────────────────────────────
// Command / Event Channels
// ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum ClientCommand {
    Shutdown,
    GetState(oneshot::Sender<ConnectionState>),
}

/// Events emitted by the worker client
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// WebSocket connected
    Connected,

    /// Handshake acknowledged
    Registered { worker_id: WorkerId },

    /// Connection lost
    Disconnected { reason: String },

    /// Waiting before the next connection attempt
    Reconnecting { attempt: u32 },

    /// A command finished and its reply was queued
    CommandFinished {
        dispatch_id: Option<Uuid>,
        kind: String,
        ok: bool,
    },

    /// Error occurred
    Error { message: String, fatal: bool },
}

// ─────────────────────────────────────────────────────────────────
// Worker Client
// ─────────────────────────────────────────────────────────────────

/// WebSocket client that runs broadcast commands
pub struct WorkerClient {
    config: WorkerClientConfig,
    executor: Arc<CommandExecutor>,
    state: Arc<RwLock<ClientState>>,
    command_tx: Option<mpsc::Sender<ClientCommand>>,
}

impl WorkerClient {
    pub fn new(config: WorkerClientConfig, executor: Arc<CommandExecutor>) -> Self {
        Self {
            config,
            executor,
            state: Arc::new(RwLock::new(ClientState::default())),
            command_tx: None,
        }
    }

    /// Start the connection loop and return the event receiver
    pub fn start(&mut self) -> Result<mpsc::Receiver<WorkerEvent>> {
        let url = Url::parse(&self.config.url)
            .map_err(|e| Error::config_field_invalid("worker.server_url", e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(self.config.message_queue_size);
        let (command_tx, command_rx) = mpsc::channel(8);
        self.command_tx = Some(command_tx);

        let config = self.config.clone();
        let state = self.state.clone();
        let executor = self.executor.clone();

        tokio::spawn(async move {
            run_client_loop(url, config, state, executor, command_rx, event_tx).await;
        });

        Ok(event_rx)
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    /// Connection state as seen by the client loop
    pub async fn query_state(&self) -> Result<ConnectionState> {
        let (tx, rx) = oneshot::channel();
        self.send_command(ClientCommand::GetState(tx)).await?;
        rx.await
            .map_err(|_| Error::connection_lost("worker client loop stopped"))
    }

    /// Id the server assigned to this worker
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.state.read().worker_id.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().connection_state == ConnectionState::Registered
    }

    /// Request graceful shutdown
    pub async fn shutdown(&self) -> Result<()> {
        self.send_command(ClientCommand::Shutdown).await
    }

    async fn send_command(&self, command: ClientCommand) -> Result<()> {
        let tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| Error::Internal("worker client not started".to_string()))?;
        tx.send(command)
            .await
            .map_err(|_| Error::connection_lost("worker client loop stopped"))
    }
}

// ─────────────────────────────────────────────────────────────────
// Client Loop
// ─────────────────────────────────────────────────────────────────

/// Main client loop with reconnection logic
async fn run_client_loop(
    url: Url,
    config: WorkerClientConfig,
    state: Arc<RwLock<ClientState>>,
    executor: Arc<CommandExecutor>,
    mut command_rx: mpsc::Receiver<ClientCommand>,
    event_tx: mpsc::Sender<WorkerEvent>,
) {
    let mut backoff = ExponentialBackoff {
        initial_interval: config.initial_reconnect_delay,
        max_interval: config.max_reconnect_delay,
        max_elapsed_time: None, // Retry forever
        ..Default::default()
    };

    loop {
        if state.read().connection_state == ConnectionState::ShuttingDown {
            break;
        }
        state.write().connection_state = ConnectionState::Connecting;

        info!(url = %url, "Connecting to coordinator server");

        match tokio::time::timeout(config.connect_timeout, connect_async(url.clone())).await {
            Ok(Ok((ws_stream, _response))) => {
                info!("WebSocket connection established");
                backoff.reset();
                {
                    let mut s = state.write();
                    s.connection_state = ConnectionState::Connected;
                    s.connected_at = Some(Instant::now());
                    s.reconnect_attempts = 0;
                }
                let _ = event_tx.send(WorkerEvent::Connected).await;

                let (write, read) = ws_stream.split();
                let result = handle_connection(
                    &config,
                    &state,
                    &executor,
                    &mut command_rx,
                    &event_tx,
                    write,
                    read,
                )
                .await;

                let connected_secs = state
                    .read()
                    .connected_at
                    .map(|t| t.elapsed().as_secs())
                    .unwrap_or(0);
                if let Err(e) = result {
                    warn!(error = %e, connected_secs, "Connection error");
                    let _ = event_tx
                        .send(WorkerEvent::Disconnected {
                            reason: e.to_string(),
                        })
                        .await;
                    if e.is_fatal() {
                        let _ = event_tx
                            .send(WorkerEvent::Error {
                                message: e.to_string(),
                                fatal: true,
                            })
                            .await;
                        break;
                    }
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to connect to coordinator server");
                let _ = event_tx
                    .send(WorkerEvent::Error {
                        message: format!("Connection failed: {}", e),
                        fatal: false,
                    })
                    .await;
            }
            Err(_) => {
                error!(timeout_secs = config.connect_timeout.as_secs(), "Connection attempt timed out");
                let _ = event_tx
                    .send(WorkerEvent::Error {
                        message: "Connection attempt timed out".to_string(),
                        fatal: false,
                    })
                    .await;
            }
        }

        if state.read().connection_state == ConnectionState::ShuttingDown {
            break;
        }

        let attempts = {
            let mut s = state.write();
            s.connection_state = ConnectionState::Reconnecting;
            s.reconnect_attempts += 1;
            s.worker_id = None;
            s.reconnect_attempts
        };

        if config.max_reconnect_attempts > 0 && attempts >= config.max_reconnect_attempts {
            error!(
                attempts = attempts,
                max = config.max_reconnect_attempts,
                "Max reconnection attempts reached"
            );
            let _ = event_tx
                .send(WorkerEvent::Error {
                    message: "Max reconnection attempts reached".to_string(),
                    fatal: true,
                })
                .await;
            break;
        }

        let delay = backoff.next_backoff().unwrap_or(config.max_reconnect_delay);
        let _ = event_tx.send(WorkerEvent::Reconnecting { attempt: attempts }).await;
        info!(delay_ms = delay.as_millis() as u64, attempt = attempts, "Waiting before reconnection");

        // Wait before reconnecting (also check for shutdown commands)
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cmd = command_rx.recv() => match cmd {
                Some(ClientCommand::Shutdown) | None => {
                    state.write().connection_state = ConnectionState::ShuttingDown;
                    break;
                }
                Some(ClientCommand::GetState(tx)) => {
                    let _ = tx.send(state.read().connection_state);
                }
            }
        }
    }

    state.write().connection_state = ConnectionState::ShuttingDown;
    info!("Worker client loop terminated");
}

/// Handle an active WebSocket connection
async fn handle_connection<S, R>(
    config: &WorkerClientConfig,
    state: &Arc<RwLock<ClientState>>,
    executor: &Arc<CommandExecutor>,
    command_rx: &mut mpsc::Receiver<ClientCommand>,
    event_tx: &mpsc::Sender<WorkerEvent>,
    mut write: S,
    mut read: R,
) -> Result<()>
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    send_envelope(
        &mut write,
        &MessageEnvelope::new(Message::Hello(HelloMessage {
            role: PeerRole::Worker,
            name: Some(config.name.clone()),
        })),
    )
    .await?;
    debug!("Sent handshake");

    let ack = wait_for_ack(&mut read, config.handshake_timeout).await?;
    let worker_id = WorkerId::new(ack.session_id);
    {
        let mut s = state.write();
        s.worker_id = Some(worker_id.clone());
        s.connection_state = ConnectionState::Registered;
    }
    info!(worker_id = %worker_id, server_version = %ack.server_version, "Registered with coordinator server");
    let _ = event_tx
        .send(WorkerEvent::Registered {
            worker_id: worker_id.clone(),
        })
        .await;

    let (reply_tx, mut reply_rx) = mpsc::channel::<MessageEnvelope>(config.message_queue_size);
    let permits = Arc::new(Semaphore::new(config.max_concurrent_commands.max(1)));
    let mut running = JoinSet::new();

    let result = loop {
        tokio::select! {
            inbound = next_envelope(&mut read) => {
                let envelope = match inbound {
                    Ok(Inbound::Envelope(envelope)) => envelope,
                    Ok(Inbound::Malformed(e)) => {
                        warn!(error = %e, "Failed to parse message");
                        continue;
                    }
                    Ok(Inbound::Closed) => {
                        info!("Connection closed by server");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                };

                match envelope.payload {
                    Message::Command(cmd) => {
                        running.spawn(run_command(
                            envelope.id,
                            cmd,
                            worker_id.clone(),
                            executor.clone(),
                            permits.clone(),
                            reply_tx.clone(),
                            event_tx.clone(),
                        ));
                    }
                    Message::Error(err) => {
                        error!(code = %err.code, message = %err.message, fatal = err.fatal, "Received error");
                        if err.fatal {
                            break Err(Error::Remote { code: err.code, message: err.message });
                        }
                    }
                    other => {
                        debug!(message_type = other.type_name(), "Unhandled message type");
                    }
                }
            }

            Some(reply) = reply_rx.recv() => {
                if let Err(e) = send_envelope(&mut write, &reply).await {
                    break Err(e);
                }
            }

            Some(_) = running.join_next(), if !running.is_empty() => {}

            cmd = command_rx.recv() => match cmd {
                Some(ClientCommand::Shutdown) | None => {
                    info!("Shutdown requested");
                    state.write().connection_state = ConnectionState::ShuttingDown;
                    let _ = write.send(WsMessage::Close(None)).await;
                    break Ok(());
                }
                Some(ClientCommand::GetState(tx)) => {
                    let _ = tx.send(state.read().connection_state);
                }
            }
        }
    };

    if !running.is_empty() {
        warn!(abandoned = running.len(), "Connection closed with commands still running");
    }
    running.abort_all();
    result
}

/// Execute one command and queue its reply
async fn run_command(
    request_id: Uuid,
    cmd: CommandMessage,
    worker_id: WorkerId,
    executor: Arc<CommandExecutor>,
    permits: Arc<Semaphore>,
    reply_tx: mpsc::Sender<MessageEnvelope>,
    event_tx: mpsc::Sender<WorkerEvent>,
) {
    let Ok(_permit) = permits.acquire_owned().await else {
        return;
    };

    let dispatch_id = cmd.dispatch_id.unwrap_or(request_id);
    let reply = executor.run(&worker_id, dispatch_id, &cmd.command).await;
    let ok = matches!(reply, WorkerReply::Ok);

    let payload = match reply {
        WorkerReply::Ok => Message::OkReply(OkReply {}),
        WorkerReply::Failed(failure) => {
            info!(dispatch_id = %dispatch_id, kind = %cmd.command.kind, reason = %failure, "Command failed");
            Message::ExecutionFailure(failure)
        }
    };

    if reply_tx
        .send(MessageEnvelope::reply(request_id, payload))
        .await
        .is_err()
    {
        debug!(dispatch_id = %dispatch_id, "Connection gone before reply could be sent");
        return;
    }

    let _ = event_tx
        .send(WorkerEvent::CommandFinished {
            dispatch_id: cmd.dispatch_id,
            kind: cmd.command.kind,
            ok,
        })
        .await;
}

/// Wait for the handshake acknowledgment
async fn wait_for_ack<R>(read: &mut R, limit: Duration) -> Result<HelloAckMessage>
where
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    tokio::time::timeout(limit, read_ack(read))
        .await
        .map_err(|_| Error::ConnectionTimeout {
            url: "coordinator".to_string(),
            timeout_secs: limit.as_secs(),
        })?
}

async fn read_ack<R>(read: &mut R) -> Result<HelloAckMessage>
where
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let envelope = match next_envelope(read).await? {
        Inbound::Envelope(envelope) => envelope,
        Inbound::Malformed(e) => return Err(Error::malformed(e.to_string())),
        Inbound::Closed => return Err(Error::connection_lost("connection closed during handshake")),
    };
    PROTOCOL_VERSION.check_peer(&envelope.version)?;

    match envelope.payload {
        Message::HelloAck(ack) => Ok(ack),
        Message::Error(err) => Err(Error::Remote {
            code: err.code,
            message: err.message,
        }),
        other => Err(Error::ProtocolUnexpected {
            message_type: other.type_name().to_string(),
            context: "waiting for HELLO_ACK".to_string(),
        }),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
