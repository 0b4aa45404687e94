//! Protocol message definitions
//!
//! All message types for the lock and command protocols.
//! Messages are serialized as JSON with a type discriminator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::dispatch::DispatchReport;
use crate::failure::ExecutionFailure;
use super::ProtocolVersion;

// ─────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────

/// Wrapper for all protocol messages with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID
    pub id: Uuid,

    /// Message timestamp
    pub timestamp: DateTime<Utc>,

    /// Protocol version
    pub version: ProtocolVersion,

    /// ID of the request this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,

    /// The actual message payload
    #[serde(flatten)]
    pub payload: Message,
}

impl MessageEnvelope {
    /// Create a new message envelope
    pub fn new(payload: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: ProtocolVersion::default(),
            reply_to: None,
            payload,
        }
    }

    /// Create an envelope answering the request with the given ID
    pub fn reply(request_id: Uuid, payload: Message) -> Self {
        Self {
            reply_to: Some(request_id),
            ..Self::new(payload)
        }
    }

    /// Create envelope with specific version
    pub fn with_version(payload: Message, version: ProtocolVersion) -> Self {
        Self {
            version,
            ..Self::new(payload)
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types (Discriminated Union)
// ─────────────────────────────────────────────────────────────────

/// All protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // ─── Session ────────────────────────────────────────────────
    /// Session handshake (client or worker → server)
    Hello(HelloMessage),

    /// Handshake acknowledgment carrying the session id
    HelloAck(HelloAckMessage),

    // ─── Lock protocol ──────────────────────────────────────────
    /// Blocking lock request
    LockRequest(LockRequest),

    /// Non-blocking lock request
    LockIfAvailableRequest(LockRequest),

    /// Lock granted
    LockResponse(LockResponse),

    /// Lock held by someone else (answer to a non-blocking request)
    LockNotAvailableNow(LockNotAvailableResponse),

    /// Release a held lock
    UnlockRequest(UnlockRequest),

    /// Release confirmed
    UnlockResponse(UnlockResponse),

    /// Extend the holder's lease
    RenewLeaseRequest(RenewLeaseRequest),

    // ─── Command protocol ───────────────────────────────────────
    /// Command to broadcast (client → server) or execute (server → worker)
    Command(CommandMessage),

    /// Generic positive acknowledgement
    OkReply(OkReply),

    /// A worker failed to execute a command
    ExecutionFailure(ExecutionFailure),

    /// Aggregate dispatch failure (server → client)
    DispatchFailed(DispatchFailedMessage),

    /// No worker was connected when the command arrived
    NoWorkerAvailable(NoWorkerAvailableMessage),

    /// Command every worker runs once before any other work
    InitCommand(CommandMessage),

    /// Whether the init command was installed
    InitCommandResponse(InitCommandResponse),

    // ─── Membership ─────────────────────────────────────────────
    /// How many workers are connected
    WorkerCountRequest(WorkerCountRequest),

    WorkerCountResponse(WorkerCountResponse),

    /// Error response
    Error(ErrorMessage),
}

impl Message {
    /// Get the message type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "HELLO",
            Message::HelloAck(_) => "HELLO_ACK",
            Message::LockRequest(_) => "LOCK_REQUEST",
            Message::LockIfAvailableRequest(_) => "LOCK_IF_AVAILABLE_REQUEST",
            Message::LockResponse(_) => "LOCK_RESPONSE",
            Message::LockNotAvailableNow(_) => "LOCK_NOT_AVAILABLE_NOW",
            Message::UnlockRequest(_) => "UNLOCK_REQUEST",
            Message::UnlockResponse(_) => "UNLOCK_RESPONSE",
            Message::RenewLeaseRequest(_) => "RENEW_LEASE_REQUEST",
            Message::Command(_) => "COMMAND",
            Message::OkReply(_) => "OK_REPLY",
            Message::ExecutionFailure(_) => "EXECUTION_FAILURE",
            Message::DispatchFailed(_) => "DISPATCH_FAILED",
            Message::NoWorkerAvailable(_) => "NO_WORKER_AVAILABLE",
            Message::InitCommand(_) => "INIT_COMMAND",
            Message::InitCommandResponse(_) => "INIT_COMMAND_RESPONSE",
            Message::WorkerCountRequest(_) => "WORKER_COUNT_REQUEST",
            Message::WorkerCountResponse(_) => "WORKER_COUNT_RESPONSE",
            Message::Error(_) => "ERROR",
        }
    }

    /// Check if this is a request message (expects a reply)
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::Hello(_)
                | Message::LockRequest(_)
                | Message::LockIfAvailableRequest(_)
                | Message::UnlockRequest(_)
                | Message::RenewLeaseRequest(_)
                | Message::Command(_)
                | Message::InitCommand(_)
                | Message::WorkerCountRequest(_)
        )
    }

    /// Check if this is a response message
    pub fn is_response(&self) -> bool {
        !self.is_request()
    }
}

// ─────────────────────────────────────────────────────────────────
// Session Messages
// ─────────────────────────────────────────────────────────────────

/// Role a peer declares in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Issues lock requests and submits commands
    Client,
    /// Executes broadcast commands
    Worker,
}

/// Session handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    pub role: PeerRole,

    /// Human-readable peer name (used in logs)
    #[serde(default)]
    pub name: Option<String>,
}

/// Handshake acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAckMessage {
    /// Identity the server assigned to this session
    pub session_id: String,

    /// Server software version
    pub server_version: String,
}

// ─────────────────────────────────────────────────────────────────
// Lock Messages
// ─────────────────────────────────────────────────────────────────

/// Request exclusive ownership of a named lock
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockRequest {
    /// Lock key; absent means the default lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Lock granted to the requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResponse {
    pub key: String,

    /// Monotonically increasing grant number
    pub grant_id: u64,
}

/// Lock is currently held by someone else
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockNotAvailableResponse {
    pub key: String,
}

/// Release a previously granted lock
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnlockRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Release confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockResponse {
    pub key: String,

    /// Whether a queued waiter received the lock
    pub handed_off: bool,
}

/// Extend the lease on a held lock
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenewLeaseRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

// ─────────────────────────────────────────────────────────────────
// Command Messages
// ─────────────────────────────────────────────────────────────────

/// Wire form of a command: a registered kind plus its arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub kind: String,

    #[serde(default)]
    pub args: serde_json::Value,
}

impl CommandPayload {
    /// Create a payload with no arguments
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: serde_json::Value::Null,
        }
    }

    /// Create a payload with arguments
    pub fn with_args(kind: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }
}

/// Command submission or forwarded command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Set by the server when forwarding to a worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<Uuid>,

    pub command: CommandPayload,
}

/// Generic positive acknowledgement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkReply {}

/// Aggregate failure of a broadcast command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchFailedMessage {
    /// Summary line
    pub message: String,

    /// Per-worker outcomes
    pub report: DispatchReport,
}

/// The membership snapshot was empty
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoWorkerAvailableMessage {
    pub kind: String,
}

/// Answer to an init command
///
/// Only the first init command a server receives is installed; later ones
/// are acknowledged with `applied: false` and otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitCommandResponse {
    pub applied: bool,

    /// Workers that ran it as part of this request
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkerCountRequest {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCountResponse {
    pub workers: usize,
}

/// Error message from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Related message ID (if this is in response to a specific message)
    #[serde(default)]
    pub related_message_id: Option<Uuid>,

    /// Whether the error is fatal (connection should be closed)
    #[serde(default)]
    pub fatal: bool,
}

impl ErrorMessage {
    /// Build a non-fatal error message from a crate error
    pub fn from_error(err: &crate::Error, related: Option<Uuid>) -> Self {
        Self {
            code: err.code().as_str(),
            message: err.to_string(),
            related_message_id: related,
            fatal: err.is_fatal(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Helpers
// ─────────────────────────────────────────────────────────────────

impl MessageEnvelope {
    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serialize to pretty JSON string
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Deserialize from JSON bytes
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
