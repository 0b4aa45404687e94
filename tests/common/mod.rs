//! Common test utilities and fixtures
//!
//! Config fixtures, a recording failure sink, and an in-process cluster
//! (coordinator server plus real WebSocket workers) for end-to-end tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use pdexec_coord::dispatch::{
    CommandDispatcher, CommandRegistry, DispatcherConfig, ParticipantOutcome, WorkerId,
    WorkerRegistry,
};
use pdexec_coord::failure::FailureSink;
use pdexec_coord::lock::{LockCoordinator, LockCoordinatorConfig};
use pdexec_coord::server::{CoordinatorServer, ServerOptions};
use pdexec_coord::worker::{CommandExecutor, WorkerClient, WorkerClientConfig};

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

// ─────────────────────────────────────────────────────────────────
// Failure Sink
// ─────────────────────────────────────────────────────────────────

/// Keeps every reported failure for later assertions
#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<(Uuid, WorkerId, ParticipantOutcome)>>,
}

impl RecordingSink {
    pub fn workers(&self) -> Vec<WorkerId> {
        self.reports.lock().iter().map(|(_, w, _)| w.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }
}

impl FailureSink for RecordingSink {
    fn report(&self, dispatch_id: Uuid, worker: &WorkerId, outcome: &ParticipantOutcome) {
        self.reports
            .lock()
            .push((dispatch_id, worker.clone(), outcome.clone()));
    }
}

// ─────────────────────────────────────────────────────────────────
// In-process Cluster
// ─────────────────────────────────────────────────────────────────

/// A coordinator server on an ephemeral port
pub struct TestServer {
    pub addr: SocketAddr,
    pub locks: Arc<LockCoordinator>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub sink: Arc<RecordingSink>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(LockCoordinatorConfig::default(), DispatcherConfig::default()).await
    }

    pub async fn start_with(lock: LockCoordinatorConfig, dispatch: DispatcherConfig) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let locks = Arc::new(LockCoordinator::new(lock));
        let dispatcher = Arc::new(
            CommandDispatcher::new(dispatch, Arc::new(WorkerRegistry::new()))
                .with_failure_sink(sink.clone()),
        );

        let server = CoordinatorServer::bind(
            "127.0.0.1:0",
            ServerOptions::default(),
            locks.clone(),
            dispatcher.clone(),
        )
        .await
        .expect("bind test server");
        let addr = server.local_addr().expect("local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = server
                .run(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            addr,
            locks,
            dispatcher,
            sink,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Start a worker with the built-in commands and wait until it is registered
    pub async fn spawn_worker(&self, name: &str) -> WorkerClient {
        let before = self.dispatcher.registry().count();
        let client = self.start_worker(name);
        self.wait_for_workers(before + 1).await;
        client
    }

    /// Start a worker without waiting for it to be admitted
    pub fn start_worker(&self, name: &str) -> WorkerClient {
        let executor = Arc::new(CommandExecutor::new(
            Arc::new(CommandRegistry::with_builtins()),
            None,
        ));
        let config = WorkerClientConfig {
            url: self.url(),
            name: name.to_string(),
            max_reconnect_attempts: 1,
            initial_reconnect_delay: Duration::from_millis(50),
            max_reconnect_delay: Duration::from_millis(100),
            ..Default::default()
        };

        let mut client = WorkerClient::new(config, executor);
        let mut events = client.start().expect("start worker");
        // Keep the event channel drained so the client loop never blocks on it
        tokio::spawn(async move { while events.recv().await.is_some() {} });
        client
    }

    /// Wait until exactly `n` workers are registered
    pub async fn wait_for_workers(&self, n: usize) {
        let registry = self.dispatcher.registry().clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while registry.count() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {} registered workers", n));
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_exist() {
        assert!(fixtures_dir().exists(), "Fixtures directory should exist");
        assert!(valid_config_fixture().exists());
        assert!(invalid_config_fixture().exists());
    }
}
