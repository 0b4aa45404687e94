//! Logging infrastructure using tracing + tracing-subscriber
//!
//! Console output, optional daily-rotated file output, JSON format, and
//! per-module levels via RUST_LOG.

use std::fs;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

/// Guards that must be held for the lifetime of the application
/// to ensure logs are flushed properly
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the logging system
///
/// Returns guards that must be kept alive for the duration of the program.
/// When dropped, these guards will flush any remaining log entries.
pub fn init_logging(
    settings: &LoggingSettings,
    verbose: u8,
    quiet: bool,
) -> Result<LogGuards> {
    // Determine the effective log level
    let level = determine_level(settings, verbose, quiet);

    // Build the environment filter
    let env_filter = build_env_filter(level)?;

    // Create the console layer
    let console_layer = build_console_layer(settings.json_format);

    // Create the file layer if configured
    let (file_layer, file_guard) = if let Some(ref log_file) = settings.file {
        let (layer, guard) =
            build_file_layer(log_file, settings.max_files, settings.json_format)?;
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // Combine layers and initialize
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))?;

    tracing::info!(
        level = %level,
        file = ?settings.file,
        json = settings.json_format,
        "Logging initialized"
    );

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

/// Determine the effective log level based on settings and CLI flags
fn determine_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => parse_level(&settings.level),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Parse a log level string
fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn directive(spec: &str) -> Result<Directive> {
    spec.parse()
        .map_err(|e| Error::config_field_invalid("logging.level", format!("bad filter '{}': {}", spec, e)))
}

/// Build the environment filter with support for RUST_LOG
fn build_env_filter(cli_level: Level) -> Result<EnvFilter> {
    let base_filter = cli_level.to_string().to_lowercase();

    // RUST_LOG sets dependency levels; this crate follows the CLI level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&base_filter))
        .add_directive(directive(&format!("pdexec_coord={}", base_filter))?)
        .add_directive(directive("tokio_tungstenite=warn")?)
        .add_directive(directive("tungstenite=warn")?);

    Ok(filter)
}

/// Build the console output layer
fn build_console_layer<S>(json_format: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json_format {
        Box::new(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true)
                .compact(),
        )
    }
}

/// Build the file logging layer, rotated daily
fn build_file_layer<S>(
    log_file: &str,
    max_files: u32,
    json_format: bool,
) -> Result<(Box<dyn Layer<S> + Send + Sync>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let path = Path::new(log_file);
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(directory).map_err(|e| Error::IoWrite {
        path: directory.to_path_buf(),
        source: e,
    })?;

    let file_name = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("pdexec-coord");

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .filename_suffix("log")
        .max_log_files(max_files.max(1) as usize)
        .build(directory)
        .map_err(|e| Error::Internal(format!("Failed to create log file appender: {}", e)))?;

    // Make it non-blocking
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Build the layer
    let layer: Box<dyn Layer<S> + Send + Sync> = if json_format {
        Box::new(
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_ansi(false),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false),
        )
    };

    Ok((layer, guard))
}

/// Minimal console logging, used before the configuration is loaded
pub fn init_simple(level: Level) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}
