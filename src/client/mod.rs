//! Client side of the coordinator protocol
//!
//! A [`ClientSession`] is one connection. Requests are sent one at a time
//! and each call waits for the reply whose `reply_to` matches. Locks held by
//! the session are released by the server when it disconnects.

use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message as WsMessage,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::dispatch::{AggregateResult, CommandPayload};
use crate::error::{Error, Result};
use crate::protocol::{
    CommandMessage, HelloMessage, InitCommandResponse, LockRequest, LockResponse, Message,
    MessageEnvelope, OkReply, PeerRole, RenewLeaseRequest, UnlockRequest, UnlockResponse,
    WorkerCountRequest, PROTOCOL_VERSION,
};
use crate::transport::{next_envelope, send_envelope, Inbound};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings for [`ClientSession::connect_with`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name sent in `HELLO`
    pub name: Option<String>,

    /// Time allowed for TCP connect plus handshake
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// An open client connection to the coordinator
pub struct ClientSession {
    socket: Socket,
    session_id: String,
    server_version: String,
}

impl ClientSession {
    /// Connect with default options
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, ClientOptions::default()).await
    }

    /// Connect and complete the `HELLO` exchange
    pub async fn connect_with(url: &str, options: ClientOptions) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| Error::connection_failed(url, e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::connection_failed(url, "URL scheme must be ws or wss"));
        }

        let limit = options.connect_timeout;
        let handshake = Self::handshake(&parsed, options.name);

        let session = tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| Error::ConnectionTimeout {
                url: url.to_string(),
                timeout_secs: limit.as_secs(),
            })??;

        info!(session_id = %session.session_id, server_version = %session.server_version, "Connected to coordinator");
        Ok(session)
    }

    async fn handshake(url: &Url, name: Option<String>) -> Result<Self> {
        let (socket, _response) = connect_async(url.as_str()).await?;
        let mut session = Self {
            socket,
            session_id: String::new(),
            server_version: String::new(),
        };

        let hello = Message::Hello(HelloMessage {
            role: PeerRole::Client,
            name,
        });
        match session.request(hello).await? {
            Message::HelloAck(ack) => {
                session.session_id = ack.session_id;
                session.server_version = ack.server_version;
                Ok(session)
            }
            other => Err(unexpected(other, "waiting for HELLO_ACK")),
        }
    }

    /// Identity the server uses for this session's locks
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Wait until `key` (or the default lock) is granted
    pub async fn lock(&mut self, key: Option<&str>) -> Result<LockResponse> {
        let request = Message::LockRequest(LockRequest {
            key: key.map(str::to_string),
        });
        match self.request(request).await? {
            Message::LockResponse(granted) => Ok(granted),
            other => Err(unexpected(other, "waiting for LOCK_RESPONSE")),
        }
    }

    /// Take `key` only if it is free right now
    pub async fn try_lock(&mut self, key: Option<&str>) -> Result<Option<LockResponse>> {
        let request = Message::LockIfAvailableRequest(LockRequest {
            key: key.map(str::to_string),
        });
        match self.request(request).await? {
            Message::LockResponse(granted) => Ok(Some(granted)),
            Message::LockNotAvailableNow(_) => Ok(None),
            other => Err(unexpected(other, "waiting for LOCK_RESPONSE")),
        }
    }

    pub async fn unlock(&mut self, key: Option<&str>) -> Result<UnlockResponse> {
        let request = Message::UnlockRequest(UnlockRequest {
            key: key.map(str::to_string),
        });
        match self.request(request).await? {
            Message::UnlockResponse(released) => Ok(released),
            other => Err(unexpected(other, "waiting for UNLOCK_RESPONSE")),
        }
    }

    /// Extend the lease on a held lock
    pub async fn renew(&mut self, key: Option<&str>) -> Result<()> {
        let request = Message::RenewLeaseRequest(RenewLeaseRequest {
            key: key.map(str::to_string),
        });
        match self.request(request).await? {
            Message::OkReply(_) => Ok(()),
            other => Err(unexpected(other, "waiting for OK_REPLY")),
        }
    }

    /// Broadcast a command to every worker and wait for the aggregate
    pub async fn submit(&mut self, command: CommandPayload) -> Result<AggregateResult> {
        let kind = command.kind.clone();
        let request = Message::Command(CommandMessage {
            dispatch_id: None,
            command,
        });
        match self.request(request).await? {
            Message::OkReply(ok) => Ok(AggregateResult::Ok(ok)),
            Message::DispatchFailed(failed) => Ok(AggregateResult::Failed(failed.report)),
            Message::NoWorkerAvailable(_) => Err(Error::NoWorkersAvailable { kind }),
            other => Err(unexpected(other, "waiting for dispatch result")),
        }
    }

    /// Like [`submit`](Self::submit) but fails unless every worker succeeded
    pub async fn submit_ok(&mut self, command: CommandPayload) -> Result<OkReply> {
        let kind = command.kind.clone();
        self.submit(command).await?.into_result(&kind)
    }

    /// Install the server's init command
    ///
    /// Only the first init command a server receives is kept; later ones
    /// come back with `applied: false`. Workers connected now run it like a
    /// regular command, workers connecting later run it before they take
    /// part in any other dispatch.
    pub async fn submit_init(&mut self, command: CommandPayload) -> Result<InitCommandResponse> {
        let kind = command.kind.clone();
        let request = Message::InitCommand(CommandMessage {
            dispatch_id: None,
            command,
        });
        match self.request(request).await? {
            Message::InitCommandResponse(response) => Ok(response),
            Message::DispatchFailed(failed) => {
                AggregateResult::Failed(failed.report).into_result(&kind)?;
                Err(Error::Internal("init dispatch failed without a failing worker".to_string()))
            }
            other => Err(unexpected(other, "waiting for INIT_COMMAND_RESPONSE")),
        }
    }

    /// Number of workers currently taking part in dispatches
    pub async fn worker_count(&mut self) -> Result<usize> {
        match self.request(Message::WorkerCountRequest(WorkerCountRequest {})).await? {
            Message::WorkerCountResponse(response) => Ok(response.workers),
            other => Err(unexpected(other, "waiting for WORKER_COUNT_RESPONSE")),
        }
    }

    /// Close the connection. Held locks are released by the server.
    pub async fn close(mut self) -> Result<()> {
        self.socket.send(WsMessage::Close(None)).await?;
        loop {
            match next_envelope(&mut self.socket).await {
                Ok(Inbound::Closed) | Err(_) => break,
                Ok(_) => {}
            }
        }
        debug!(session_id = %self.session_id, "Client session closed");
        Ok(())
    }

    async fn request(&mut self, payload: Message) -> Result<Message> {
        let envelope = MessageEnvelope::new(payload);
        let request_id = envelope.id;
        send_envelope(&mut self.socket, &envelope).await?;

        loop {
            let reply = match next_envelope(&mut self.socket).await? {
                Inbound::Envelope(reply) => reply,
                Inbound::Malformed(e) => return Err(Error::malformed(e.to_string())),
                Inbound::Closed => return Err(Error::connection_lost("server closed the connection")),
            };
            PROTOCOL_VERSION.check_peer(&reply.version)?;

            if reply.reply_to != Some(request_id) {
                // Unsolicited errors still matter; anything else is stale.
                if let Message::Error(err) = &reply.payload {
                    if err.fatal {
                        return Err(Error::Remote {
                            code: err.code.clone(),
                            message: err.message.clone(),
                        });
                    }
                    warn!(code = %err.code, message = %err.message, "Server error");
                }
                continue;
            }

            return match reply.payload {
                Message::Error(err) => Err(Error::Remote {
                    code: err.code,
                    message: err.message,
                }),
                payload => Ok(payload),
            };
        }
    }
}

fn unexpected(message: Message, context: &str) -> Error {
    Error::ProtocolUnexpected {
        message_type: message.type_name().to_string(),
        context: context.to_string(),
    }
}
