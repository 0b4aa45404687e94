//! Coordinator server
//!
//! Accepts WebSocket connections from clients and workers. Clients use the
//! lock coordinator and submit commands; workers receive the broadcasts.

mod init;
mod remote;
mod session;

pub use remote::RemoteWorker;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::CoordConfig;
use crate::dispatch::{CommandDispatcher, WorkerRegistry};
use crate::error::{Error, Result};
use crate::lock::LockCoordinator;

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// How long a new connection has to send `HELLO`
    pub handshake_timeout: Duration,

    /// Outbound queue size per session
    pub message_queue_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            message_queue_size: 256,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) locks: Arc<LockCoordinator>,
    pub(crate) dispatcher: Arc<CommandDispatcher>,
    pub(crate) init: init::InitSlot,
    pub(crate) options: ServerOptions,
}

/// Listening coordinator
pub struct CoordinatorServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl CoordinatorServer {
    /// Bind to `addr` with explicit components
    pub async fn bind<A: ToSocketAddrs + std::fmt::Display>(
        addr: A,
        options: ServerOptions,
        locks: Arc<LockCoordinator>,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::connection_failed(addr.to_string(), e.to_string()))?;

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                locks,
                dispatcher,
                init: init::InitSlot::default(),
                options,
            }),
        })
    }

    /// Bind using the `[server]`, `[lock]` and `[dispatch]` sections
    pub async fn from_config(config: &CoordConfig) -> Result<Self> {
        let locks = Arc::new(LockCoordinator::new(config.lock.to_coordinator_config()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            config.dispatch.to_dispatcher_config(),
            Arc::new(WorkerRegistry::new()),
        ));
        Self::bind(
            config.server.listen_addr.as_str(),
            config.server.to_options(),
            locks,
            dispatcher,
        )
        .await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.shared.locks
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.shared.dispatcher
    }

    /// Accept connections until `shutdown` completes
    ///
    /// Open sessions are aborted on shutdown.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Coordinator listening");

        let reaper = self
            .shared
            .locks
            .config()
            .lease
            .map(|_| self.shared.locks.spawn_reaper(self.shared.locks.config().reap_interval));

        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        let _ = stream.set_nodelay(true);
                        sessions.spawn(session::serve(stream, peer, self.shared.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = &mut shutdown => break,
            }
        }

        info!(sessions = sessions.len(), "Coordinator shutting down");
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        Ok(())
    }
}
