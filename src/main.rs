//! pdexec coordinator binary
//!
//! `serve` runs the coordination server, `worker` executes broadcast
//! commands, `submit` sends one command to every worker.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use pdexec_coord::cli::{Cli, Commands, ConfigSubcommand};
use pdexec_coord::client::{ClientOptions, ClientSession};
use pdexec_coord::config::{self, CoordConfig};
use pdexec_coord::dispatch::{AggregateResult, CommandPayload, CommandRegistry};
use pdexec_coord::error::{Error, Result};
use pdexec_coord::logging;
use pdexec_coord::server::CoordinatorServer;
use pdexec_coord::version;
use pdexec_coord::worker::{CommandExecutor, WorkerClient, WorkerEvent};

fn main() {
    if let Err(e) = run() {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            println!("{}", version::BUILD);
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone());
        }
        _ => {}
    }

    let mut config = CoordConfig::load(cli.command.config_path())?;
    apply_cli_overrides(&mut config, &cli.command);
    config.validate()?;

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    let build = version::BUILD;
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting pdexec-coord"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pdexec")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    match cli.command {
        Commands::Serve { .. } => runtime.block_on(serve(config)),
        Commands::Worker { .. } => runtime.block_on(run_worker(config)),
        Commands::Submit { kind, args, lock, init, .. } => {
            runtime.block_on(submit(config, kind, args, lock, init))
        }
        Commands::Version | Commands::Config { .. } => Ok(()),
    }
}

/// CLI flags beat environment and file values
fn apply_cli_overrides(config: &mut CoordConfig, command: &Commands) {
    match command {
        Commands::Serve { listen: Some(addr), .. } => {
            config.server.listen_addr = addr.clone();
        }
        Commands::Worker { server, name, .. } => {
            if let Some(url) = server {
                config.worker.server_url = url.clone();
            }
            if let Some(name) = name {
                config.worker.name = Some(name.clone());
            }
        }
        Commands::Submit { server: Some(url), .. } => {
            config.worker.server_url = url.clone();
        }
        _ => {}
    }
}

async fn serve(config: CoordConfig) -> Result<()> {
    let server = CoordinatorServer::from_config(&config).await?;
    info!(
        listen_addr = %server.local_addr()?,
        lease_ms = config.lock.lease_ms,
        participant_timeout_ms = config.dispatch.participant_timeout_ms,
        "Coordinator ready"
    );

    let locks = server.locks().clone();
    let dispatcher = server.dispatcher().clone();
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    info!(
        locks = ?locks.stats(),
        dispatch = ?dispatcher.stats(),
        "Coordinator stopped"
    );
    Ok(())
}

async fn run_worker(config: CoordConfig) -> Result<()> {
    let executor = Arc::new(CommandExecutor::new(
        Arc::new(CommandRegistry::with_builtins()),
        config.worker.command_timeout(),
    ));
    let client_config = config.worker.to_client_config();
    info!(
        name = %client_config.name,
        server_url = %client_config.url,
        kinds = ?executor.registry().kinds(),
        "Starting worker"
    );

    let mut client = WorkerClient::new(client_config, executor.clone());
    let mut events = client.start()?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                if let Err(e) = client.shutdown().await {
                    warn!(error = %e, "Error during shutdown");
                }
                break;
            }
            event = events.recv() => match event {
                Some(WorkerEvent::Registered { worker_id }) => {
                    info!(worker_id = %worker_id, "Registered with coordinator");
                }
                Some(WorkerEvent::Disconnected { reason }) => {
                    warn!(reason = %reason, "Disconnected from coordinator");
                }
                Some(WorkerEvent::Error { message, fatal: true }) => {
                    error!(message = %message, "Fatal worker error");
                    return Err(Error::Internal(message));
                }
                Some(_) => {}
                None => {
                    info!("Worker event channel closed");
                    break;
                }
            }
        }
    }

    info!(stats = ?executor.stats(), "Worker stopped");
    Ok(())
}

async fn submit(
    config: CoordConfig,
    kind: String,
    args: Option<String>,
    lock: Option<String>,
    init: bool,
) -> Result<()> {
    let payload = match args {
        Some(json) => CommandPayload::with_args(kind.clone(), serde_json::from_str(&json)?),
        None => CommandPayload::new(kind.clone()),
    };

    let options = ClientOptions {
        name: Some(format!("submit-{}", std::process::id())),
        ..Default::default()
    };
    let mut session = ClientSession::connect_with(&config.worker.server_url, options).await?;

    if init {
        let installed = session.submit_init(payload).await;
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close session");
        }
        let installed = installed?;
        if installed.applied {
            println!("OK: init command {} installed, ran on {} workers", kind, installed.workers);
        } else {
            println!("Init command already installed, {} ignored", kind);
        }
        return Ok(());
    }

    if let Some(key) = lock.as_deref() {
        let granted = session.lock(Some(key)).await?;
        info!(key = %granted.key, grant_id = granted.grant_id, "Lock acquired");
    }

    let result = session.submit(payload).await;

    // The dispatch result wins over a failed unlock or close.
    if let Some(key) = lock.as_deref() {
        if let Err(e) = session.unlock(Some(key)).await {
            warn!(key = %key, error = %e, "Failed to release lock");
        }
    }
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close session");
    }

    match result? {
        AggregateResult::Ok(_) => {
            println!("OK: {} succeeded on every worker", kind);
            Ok(())
        }
        other => {
            if let Some(report) = other.report() {
                for (worker, outcome) in report.outcomes.iter() {
                    println!(
                        "  {:<20} {:<12} {}",
                        worker.as_str(),
                        outcome.label(),
                        outcome.reason().unwrap_or("")
                    );
                }
            }
            other.into_result(&kind).map(|_| ())
        }
    }
}

/// Handle config subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let config = CoordConfig::load(config.as_deref())?;
            print!("{}", config.to_toml()?);
        }
        ConfigSubcommand::Init { path, force } => {
            let path = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", path.display());
        }
        ConfigSubcommand::Validate { config } => {
            let config = CoordConfig::load(config.as_deref())?;
            println!("Configuration is valid");
            println!("  listen_addr: {}", config.server.listen_addr);
            println!("  server_url:  {}", config.worker.server_url);
            println!("  lease_ms:    {}", config.lock.lease_ms);
        }
    }
    Ok(())
}
