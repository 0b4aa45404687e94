//! Error types for pdexec-coord
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::failure::ExecutionFailure;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 303,

    // Protocol errors (4xx)
    ProtocolVersion = 400,
    ProtocolMalformed = 401,
    ProtocolUnexpected = 402,

    // Lock errors (5xx)
    NotHolder = 500,
    LockTimeout = 501,
    AlreadyHolder = 502,
    LockCancelled = 503,

    // Dispatch errors (6xx)
    ExecutionFailed = 600,
    WorkerUnreachable = 601,
    NoWorkersAvailable = 602,
    DispatchFailed = 603,
    DispatchCancelled = 604,
    UnknownCommand = 605,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Parse a string code produced by [`ErrorCode::as_str`]
    pub fn parse(code: &str) -> Option<Self> {
        let n: u16 = code.strip_prefix('E')?.parse().ok()?;
        Self::all().iter().copied().find(|c| *c as u16 == n)
    }

    fn all() -> &'static [ErrorCode] {
        use ErrorCode::*;
        &[
            ConfigNotFound, ConfigParseError, ConfigValidation,
            IoRead, IoWrite, IoPermission, IoNotFound,
            ConnectionFailed, ConnectionTimeout, ConnectionLost,
            ProtocolVersion, ProtocolMalformed, ProtocolUnexpected,
            NotHolder, LockTimeout, AlreadyHolder, LockCancelled,
            ExecutionFailed, WorkerUnreachable, NoWorkersAvailable,
            DispatchFailed, DispatchCancelled, UnknownCommand,
            InternalError,
        ]
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Lock errors
            600..=699 => 60, // Dispatch errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the coordinator, worker and client
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection failed
    #[error("Failed to connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Connection timeout
    #[error("Connection to {url} timed out after {timeout_secs}s")]
    ConnectionTimeout { url: String, timeout_secs: u64 },

    /// Connection lost
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersion { expected: String, actual: String },

    /// Malformed message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// A well-formed message arrived where it is not allowed
    #[error("Unexpected {message_type} message: {context}")]
    ProtocolUnexpected { message_type: String, context: String },

    /// Error reported by the remote peer
    #[error("Remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Lock Errors
    // ─────────────────────────────────────────────────────────────

    /// Release attempted by someone other than the holder
    #[error("Lock '{key}' is not held by {requester}")]
    NotHolder { key: String, requester: String },

    /// Waiter exceeded its wait bound
    #[error("Timed out after {waited:?} waiting for lock '{key}'")]
    LockTimeout { key: String, waited: Duration },

    /// Acquire issued by the current holder
    #[error("Lock '{key}' is already held by {requester}")]
    AlreadyHolder { key: String, requester: String },

    /// Queued acquire dropped by the coordinator (session closed)
    #[error("Wait for lock '{key}' was cancelled")]
    LockCancelled { key: String },

    // ─────────────────────────────────────────────────────────────
    // Dispatch Errors
    // ─────────────────────────────────────────────────────────────

    /// Worker reported a failed command
    #[error(transparent)]
    ExecutionFailed(#[from] ExecutionFailure),

    /// Worker could not be reached while a command was in flight
    #[error("Worker {worker_id} unreachable: {reason}")]
    WorkerUnreachable { worker_id: String, reason: String },

    /// Dispatch requested with an empty membership snapshot
    #[error("No workers available to run command '{kind}'")]
    NoWorkersAvailable { kind: String },

    /// Aggregate failure of a dispatch
    #[error("Command '{kind}' failed on {failed} of {total} workers: {first_reason}")]
    DispatchFailed {
        kind: String,
        failed: usize,
        total: usize,
        first_reason: String,
    },

    /// Dispatch abandoned by its caller
    #[error("Dispatch of command '{kind}' was cancelled")]
    DispatchCancelled { kind: String },

    /// No decoder registered for a command kind
    #[error("Unknown command kind '{kind}'")]
    UnknownCommand { kind: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::WebSocket(_) => ErrorCode::ConnectionFailed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,

            Error::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::ProtocolUnexpected { .. } => ErrorCode::ProtocolUnexpected,
            Error::Remote { code, .. } => {
                ErrorCode::parse(code).unwrap_or(ErrorCode::ProtocolUnexpected)
            }

            Error::NotHolder { .. } => ErrorCode::NotHolder,
            Error::LockTimeout { .. } => ErrorCode::LockTimeout,
            Error::AlreadyHolder { .. } => ErrorCode::AlreadyHolder,
            Error::LockCancelled { .. } => ErrorCode::LockCancelled,

            Error::ExecutionFailed(_) => ErrorCode::ExecutionFailed,
            Error::WorkerUnreachable { .. } => ErrorCode::WorkerUnreachable,
            Error::NoWorkersAvailable { .. } => ErrorCode::NoWorkersAvailable,
            Error::DispatchFailed { .. } => ErrorCode::DispatchFailed,
            Error::DispatchCancelled { .. } => ErrorCode::DispatchCancelled,
            Error::UnknownCommand { .. } => ErrorCode::UnknownCommand,

            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::ConnectionLost { .. }
                | Error::WebSocket(_)
                | Error::LockTimeout { .. }
                | Error::WorkerUnreachable { .. }
                | Error::NoWorkersAvailable { .. }
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (process should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::ProtocolVersion { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'pdexec-coord config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'pdexec-coord config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout { .. } => Some(
                "Check that 'pdexec-coord serve' is running and the server URL is correct."
            ),
            Error::ProtocolVersion { .. } => Some(
                "Client, worker and server must run the same major protocol version."
            ),
            Error::NotHolder { .. } => Some(
                "Only the session that was granted a lock may release it."
            ),
            Error::LockTimeout { .. } => Some(
                "The lock is contended. Raise 'lock.acquire_timeout_ms' or retry later."
            ),
            Error::NoWorkersAvailable { .. } => Some(
                "Start at least one worker with 'pdexec-coord worker' before submitting commands."
            ),
            Error::UnknownCommand { .. } => Some(
                "Workers only run command kinds they have registered (noop, sleep, fail)."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a connection lost error
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Error::ConnectionLost {
            message: message.into(),
        }
    }

    /// Create a malformed-protocol error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    /// Create a worker unreachable error
    pub fn unreachable(worker_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::WorkerUnreachable {
            worker_id: worker_id.into(),
            reason: reason.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
