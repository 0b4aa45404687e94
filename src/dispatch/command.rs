//! Command capability and registry
//!
//! The dispatcher forwards a [`CommandPayload`] without looking inside it.
//! Workers turn the payload back into something runnable through a
//! [`CommandRegistry`]; adding a command kind means registering a type,
//! never touching the dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::CommandPayload;
use super::WorkerId;

/// What a command sees while it runs
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub worker_id: WorkerId,
    pub dispatch_id: Uuid,
}

/// Something a worker can execute
#[async_trait]
pub trait ExecCommand: Send + Sync {
    fn kind(&self) -> &str;

    async fn execute(&self, ctx: &CommandContext) -> anyhow::Result<()>;
}

/// A command type with a stable wire kind
pub trait CommandSpec: ExecCommand + Serialize + DeserializeOwned + 'static {
    const KIND: &'static str;

    /// Encode for submission
    fn to_payload(&self) -> Result<CommandPayload> {
        Ok(CommandPayload::with_args(Self::KIND, serde_json::to_value(self)?))
    }
}

type Decoder = Box<dyn Fn(serde_json::Value) -> Result<Box<dyn ExecCommand>> + Send + Sync>;

/// Maps command kinds to decoders
pub struct CommandRegistry {
    decoders: HashMap<String, Decoder>,
}

impl CommandRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry with `noop`, `sleep` and `fail`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register::<NoopCommand>();
        registry.register::<SleepCommand>();
        registry.register::<FailCommand>();
        registry
    }

    /// Register `C` under `C::KIND`, replacing any previous decoder
    pub fn register<C: CommandSpec>(&mut self) {
        self.decoders.insert(
            C::KIND.to_string(),
            Box::new(|args| {
                let cmd: C = serde_json::from_value(args)?;
                Ok(Box::new(cmd) as Box<dyn ExecCommand>)
            }),
        );
    }

    /// Turn a payload back into a runnable command
    pub fn decode(&self, payload: &CommandPayload) -> Result<Box<dyn ExecCommand>> {
        let decoder = self
            .decoders
            .get(&payload.kind)
            .ok_or_else(|| Error::UnknownCommand {
                kind: payload.kind.clone(),
            })?;

        let args = match &payload.args {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };
        decoder(args)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Built-in Commands
// ─────────────────────────────────────────────────────────────────

/// Does nothing and succeeds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoopCommand {}

#[async_trait]
impl ExecCommand for NoopCommand {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, _ctx: &CommandContext) -> anyhow::Result<()> {
        Ok(())
    }
}

impl CommandSpec for NoopCommand {
    const KIND: &'static str = "noop";
}

/// Sleeps, then succeeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepCommand {
    pub millis: u64,
}

#[async_trait]
impl ExecCommand for SleepCommand {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, _ctx: &CommandContext) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(())
    }
}

impl CommandSpec for SleepCommand {
    const KIND: &'static str = "sleep";
}

/// Fails with `message`, on every worker or only on `only_on`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailCommand {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_on: Option<String>,
}

#[async_trait]
impl ExecCommand for FailCommand {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, ctx: &CommandContext) -> anyhow::Result<()> {
        match &self.only_on {
            Some(target) if target != ctx.worker_id.as_str() => Ok(()),
            _ => anyhow::bail!("{}", self.message),
        }
    }
}

impl CommandSpec for FailCommand {
    const KIND: &'static str = "fail";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(worker: &str) -> CommandContext {
        CommandContext {
            worker_id: WorkerId::from(worker),
            dispatch_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_builtin_kinds() {
        let registry = CommandRegistry::with_builtins();
        assert_eq!(registry.kinds(), vec!["fail", "noop", "sleep"]);
    }

    #[test]
    fn test_unknown_kind() {
        let registry = CommandRegistry::with_builtins();
        let err = registry.decode(&CommandPayload::new("reindex")).err().unwrap();
        assert!(matches!(err, Error::UnknownCommand { kind } if kind == "reindex"));
    }

    #[test]
    fn test_bad_args_are_decode_errors() {
        let registry = CommandRegistry::with_builtins();
        let payload = CommandPayload::with_args("sleep", serde_json::json!({ "seconds": 1 }));
        assert!(matches!(registry.decode(&payload), Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn test_noop_without_args() {
        let registry = CommandRegistry::with_builtins();
        let cmd = registry.decode(&CommandPayload::new("noop")).unwrap();
        assert_eq!(cmd.kind(), "noop");
        assert!(cmd.execute(&ctx("w1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_only_on_target() {
        let payload = FailCommand {
            message: "disk full".into(),
            only_on: Some("w2".into()),
        }
        .to_payload()
        .unwrap();
        let cmd = CommandRegistry::with_builtins().decode(&payload).unwrap();

        assert!(cmd.execute(&ctx("w1")).await.is_ok());
        let err = cmd.execute(&ctx("w2")).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_command() {
        let payload = SleepCommand { millis: 250 }.to_payload().unwrap();
        assert_eq!(payload.kind, "sleep");

        let cmd = CommandRegistry::with_builtins().decode(&payload).unwrap();
        let started = tokio::time::Instant::now();
        cmd.execute(&ctx("w1")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
