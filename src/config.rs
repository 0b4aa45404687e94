//! Configuration for the coordinator, workers and clients
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (PDEXEC_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dispatch::DispatcherConfig;
use crate::error::{Error, Result};
use crate::lock::LockCoordinatorConfig;
use crate::server::ServerOptions;
use crate::worker::WorkerClientConfig;

/// Full configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    /// Coordinator listener
    pub server: ServerSettings,

    /// Lock coordinator
    pub lock: LockSettings,

    /// Command broadcast
    pub dispatch: DispatchSettings,

    /// Worker process
    pub worker: WorkerSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// `[server]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the coordinator listens on
    pub listen_addr: String,

    /// Seconds a new connection has to send HELLO
    pub handshake_timeout_secs: u64,

    /// Outbound message queue per session
    pub message_queue_size: usize,
}

/// `[lock]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Longest a queued acquire waits (0 = no limit)
    pub acquire_timeout_ms: u64,

    /// Lease per grant (0 = no lease, held until released or disconnect)
    pub lease_ms: u64,

    /// How often expired leases are reclaimed
    pub reap_interval_ms: u64,
}

/// `[dispatch]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Per-worker reply deadline (0 = wait until reply or disconnect)
    pub participant_timeout_ms: u64,

    /// Remove workers that were unreachable or timed out
    pub evict_unreachable: bool,

    /// Remove workers whose command failed
    pub evict_on_failure: bool,
}

/// `[worker]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Coordinator WebSocket URL
    pub server_url: String,

    /// Name announced to the coordinator (defaults to the hostname)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Commands run at the same time (0 = number of CPUs)
    pub max_concurrent_commands: usize,

    /// Per-command time limit (0 = none)
    pub command_timeout_ms: u64,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// First reconnect delay
    pub reconnect_initial_ms: u64,

    /// Reconnect delay cap
    pub reconnect_max_ms: u64,
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7420".to_string(),
            handshake_timeout_secs: 10,
            message_queue_size: 256,
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 0,
            lease_ms: 30_000,
            reap_interval_ms: 1_000,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            participant_timeout_ms: 60_000,
            evict_unreachable: true,
            evict_on_failure: false,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:7420".to_string(),
            name: None,
            max_concurrent_commands: 0,
            command_timeout_ms: 0,
            max_reconnect_attempts: 0,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 60_000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 7,
            json_format: false,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ServerSettings {
    pub fn to_options(&self) -> ServerOptions {
        ServerOptions {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs.max(1)),
            message_queue_size: self.message_queue_size.max(1),
        }
    }
}

impl LockSettings {
    pub fn to_coordinator_config(&self) -> LockCoordinatorConfig {
        LockCoordinatorConfig {
            acquire_timeout: millis(self.acquire_timeout_ms),
            lease: millis(self.lease_ms),
            reap_interval: Duration::from_millis(self.reap_interval_ms.max(10)),
        }
    }
}

impl DispatchSettings {
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            participant_timeout: millis(self.participant_timeout_ms),
            evict_unreachable: self.evict_unreachable,
            evict_on_failure: self.evict_on_failure,
        }
    }
}

impl WorkerSettings {
    /// Name to announce, falling back to the hostname
    pub fn effective_name(&self) -> String {
        self.name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
            .unwrap_or_else(|| "worker".to_string())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        millis(self.command_timeout_ms)
    }

    pub fn to_client_config(&self) -> WorkerClientConfig {
        let defaults = WorkerClientConfig::default();
        WorkerClientConfig {
            url: self.server_url.clone(),
            name: self.effective_name(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            initial_reconnect_delay: Duration::from_millis(self.reconnect_initial_ms.max(1)),
            max_reconnect_delay: Duration::from_millis(self.reconnect_max_ms.max(1)),
            max_concurrent_commands: match self.max_concurrent_commands {
                0 => defaults.max_concurrent_commands,
                n => n,
            },
            ..defaults
        }
    }
}

impl CoordConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            config = Self::from_file(&path)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Parse one TOML file without env overrides or validation
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse {
            message: format!("{}: {}", path.display(), e.message()),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    pub fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            return if path.exists() {
                Ok(Some(path))
            } else {
                Err(Error::config_not_found(path))
            };
        }

        let search_paths = [
            PathBuf::from("pdexec.toml"),
            dirs::config_dir()
                .map(|p| p.join("pdexec").join("coord.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".pdexec").join("coord.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/pdexec/coord.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Server
        if let Ok(val) = std::env::var("PDEXEC_LISTEN_ADDR") {
            self.server.listen_addr = val;
        }
        env_parse("PDEXEC_HANDSHAKE_TIMEOUT_SECS", &mut self.server.handshake_timeout_secs);

        // Lock
        env_parse("PDEXEC_LOCK_ACQUIRE_TIMEOUT_MS", &mut self.lock.acquire_timeout_ms);
        env_parse("PDEXEC_LOCK_LEASE_MS", &mut self.lock.lease_ms);

        // Dispatch
        env_parse("PDEXEC_PARTICIPANT_TIMEOUT_MS", &mut self.dispatch.participant_timeout_ms);
        env_parse("PDEXEC_EVICT_ON_FAILURE", &mut self.dispatch.evict_on_failure);

        // Worker
        if let Ok(val) = std::env::var("PDEXEC_SERVER_URL") {
            self.worker.server_url = val;
        }
        if let Ok(val) = std::env::var("PDEXEC_WORKER_NAME") {
            self.worker.name = Some(val);
        }
        env_parse("PDEXEC_MAX_CONCURRENT_COMMANDS", &mut self.worker.max_concurrent_commands);
        env_parse("PDEXEC_COMMAND_TIMEOUT_MS", &mut self.worker.command_timeout_ms);

        // Logging
        if let Ok(val) = std::env::var("PDEXEC_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("PDEXEC_LOG_FILE") {
            self.logging.file = Some(val);
        }
        env_parse("PDEXEC_LOG_JSON", &mut self.logging.json_format);
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "server.listen_addr",
                "Listen address cannot be empty",
            ));
        }

        let url = &self.worker.server_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "worker.server_url",
                format!("Server URL must start with ws:// or wss:// (got '{}')", url),
            ));
        }

        if self.dispatch.participant_timeout_ms == 0 && !self.dispatch.evict_unreachable {
            return Err(Error::config_field_invalid(
                "dispatch.participant_timeout_ms",
                "A zero participant timeout requires evict_unreachable = true",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => debug!(var = name, value = %val, "Ignoring unparsable environment override"),
        }
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location written by `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pdexec")
        .join("coord.toml")
}

/// Write a commented default configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::ConfigValidation {
            message: format!(
                "Configuration file already exists: {}. Use --force to overwrite.",
                config_path.display()
            ),
            field: None,
        });
    }

    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# pdexec coordinator configuration

[server]
# Address the coordinator listens on
listen_addr = "127.0.0.1:7420"

# Seconds a new connection has to say HELLO
handshake_timeout_secs = 10

# Outbound message queue per connection
message_queue_size = 256

[lock]
# Longest a blocking LOCK_REQUEST waits in the queue (0 = no limit)
acquire_timeout_ms = 0

# Lease per grant; an expired lock is reclaimed (0 = no lease)
lease_ms = 30000

# How often expired leases are reclaimed
reap_interval_ms = 1000

[dispatch]
# How long to wait for each worker's reply (0 = until reply or disconnect)
participant_timeout_ms = 60000

# Remove workers that were unreachable or timed out
evict_unreachable = true

# Remove workers whose command failed
evict_on_failure = false

[worker]
# Coordinator URL the worker connects to
server_url = "ws://127.0.0.1:7420"

# Name announced to the coordinator (defaults to the hostname)
# name = "worker-1"

# Commands run at the same time (0 = number of CPUs)
max_concurrent_commands = 0

# Per-command time limit (0 = none)
command_timeout_ms = 0

# Reconnection (0 attempts = retry forever)
max_reconnect_attempts = 0
reconnect_initial_ms = 1000
reconnect_max_ms = 60000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (rotated daily)
# file = "~/.pdexec/logs/coord.log"

# Number of rotated log files to keep
max_files = 7

# JSON formatted output
json_format = false
"#
    .to_string()
}
