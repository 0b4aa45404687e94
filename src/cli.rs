//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the coordinator, worker and
//! submit client.

use clap::{Parser, Subcommand};

/// pdexec coordinator - distributed locks and command broadcast
///
/// Runs the coordination server, a worker that executes broadcast commands,
/// or a one-shot client that submits a command to every worker.
#[derive(Parser, Debug)]
#[command(name = "pdexec-coord")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the coordination server
    Serve {
        /// Path to configuration file
        #[arg(short, long, env = "PDEXEC_CONFIG")]
        config: Option<String>,

        /// Listen address, overrides server.listen_addr
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Run a worker that executes broadcast commands
    Worker {
        /// Path to configuration file
        #[arg(short, long, env = "PDEXEC_CONFIG")]
        config: Option<String>,

        /// Coordinator URL, overrides worker.server_url
        #[arg(short, long)]
        server: Option<String>,

        /// Worker name, overrides worker.name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Broadcast one command to every worker and wait for the result
    Submit {
        /// Path to configuration file
        #[arg(short, long, env = "PDEXEC_CONFIG")]
        config: Option<String>,

        /// Coordinator URL, overrides worker.server_url
        #[arg(short, long)]
        server: Option<String>,

        /// Command kind (noop, sleep, fail, ...)
        kind: String,

        /// Command arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,

        /// Hold this lock key while the command runs
        #[arg(long)]
        lock: Option<String>,

        /// Install as the server's init command instead of a one-off broadcast
        #[arg(long, conflicts_with = "lock")]
        init: bool,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

impl Commands {
    /// The `--config` argument of commands that load configuration
    pub fn config_path(&self) -> Option<&str> {
        match self {
            Commands::Serve { config, .. }
            | Commands::Worker { config, .. }
            | Commands::Submit { config, .. } => config.as_deref(),
            Commands::Version | Commands::Config { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::parse_from(["pdexec-coord", "serve", "--listen", "0.0.0.0:9000"]);
        match cli.command {
            Commands::Serve { config, listen } => {
                assert!(config.is_none());
                assert_eq!(listen.as_deref(), Some("0.0.0.0:9000"));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_worker_command() {
        let cli = Cli::parse_from([
            "pdexec-coord",
            "worker",
            "--server",
            "ws://coord:7420",
            "--name",
            "w1",
        ]);
        match cli.command {
            Commands::Worker { server, name, .. } => {
                assert_eq!(server.as_deref(), Some("ws://coord:7420"));
                assert_eq!(name.as_deref(), Some("w1"));
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_submit_command() {
        let cli = Cli::parse_from([
            "pdexec-coord",
            "submit",
            "sleep",
            "--args",
            r#"{"millis": 5}"#,
            "--lock",
            "K",
        ]);
        match cli.command {
            Commands::Submit { kind, args, lock, .. } => {
                assert_eq!(kind, "sleep");
                assert_eq!(args.as_deref(), Some(r#"{"millis": 5}"#));
                assert_eq!(lock.as_deref(), Some("K"));
            }
            _ => panic!("Expected Submit command"),
        }
    }

    #[test]
    fn test_submit_init() {
        let cli = Cli::parse_from(["pdexec-coord", "submit", "noop", "--init"]);
        assert!(matches!(cli.command, Commands::Submit { init: true, .. }));

        let both = Cli::try_parse_from(["pdexec-coord", "submit", "noop", "--init", "--lock", "K"]);
        assert!(both.is_err());
    }

    #[test]
    fn test_submit_requires_kind() {
        assert!(Cli::try_parse_from(["pdexec-coord", "submit"]).is_err());
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["pdexec-coord", "config", "init", "--path", "c.toml", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert_eq!(path.as_deref(), Some("c.toml"));
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_verbosity_flags() {
        let cli = Cli::parse_from(["pdexec-coord", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);

        let cli = Cli::parse_from(["pdexec-coord", "version", "--quiet"]);
        assert!(cli.quiet);
    }

    #[test]
    fn test_config_path() {
        let cli = Cli::parse_from(["pdexec-coord", "serve", "-c", "x.toml"]);
        assert_eq!(cli.command.config_path(), Some("x.toml"));
    }
}
