//! CLI command handling.
//!
//! Provides subcommands for:
//! - Instance lifecycle (`create`, `start`, `stop`, `restart`, `remove`)
//! - Inspection (`list`, `status`, `stats`, `logs`)
//! - Backups (`backup create`, `backup list`, `backup restore`)
//! - Docker diagnostics (`doctor`)

mod backup;
mod doctor;
mod instance;

pub use backup::{BackupCommand, run_backup_command};
pub use doctor::run_doctor_command;
pub use instance::run_instance_command;

use std::sync::Arc;

use anyhow::Context;
use clap::{ColorChoice, Parser, Subcommand};

use crate::backup::BackupEngine;
use crate::config::Config;
use crate::engine::{ContainerEngine, DockerEngine};
use crate::lifecycle::LifecycleManager;
use crate::logs::{DEFAULT_TAIL_LINES, LogReader};
use crate::registry::Registry;

#[derive(Parser, Debug)]
#[command(name = "helix")]
#[command(about = "Run, back up and restore containerised game servers on one host")]
#[command(
    long_about = "Helix manages game-server containers: ports, data directories, crash-consistent backups.\nExamples:\n  helix create alpha --version 1.20 -e MEMORY=4G\n  helix backup create alpha"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and start a new instance
    #[command(
        about = "Create an instance",
        long_about = "Allocates a host port, creates the data directory, and starts the container.\nExample: helix create alpha --version 1.20 -e MEMORY=2G -e TYPE=PAPER"
    )]
    Create {
        /// Instance name (letters, digits, '_', '.', '-')
        name: String,

        /// Server version (default: HELIX_DEFAULT_VERSION)
        #[arg(long)]
        version: Option<String>,

        /// Extra environment, KEY=VALUE; repeatable
        #[arg(short, long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },

    /// Start a stopped instance
    Start {
        /// Instance id or name
        id: String,
    },

    /// Stop a running instance
    Stop {
        /// Instance id or name
        id: String,
    },

    /// Restart an instance
    Restart {
        /// Instance id or name
        id: String,
    },

    /// Remove an instance and delete its data directory
    #[command(
        about = "Remove an instance",
        long_about = "Stops and removes the container, then deletes the data directory. Backups are kept.\nRe-run after a partial failure to finish cleanup.\nExample: helix remove alpha"
    )]
    Remove {
        /// Instance id or name
        id: String,
    },

    /// List instances
    List {
        /// Include removed instances
        #[arg(long)]
        all: bool,

        /// List raw engine containers instead of registry rows
        #[arg(long, conflicts_with = "all")]
        engine: bool,
    },

    /// Show an instance's record and engine state
    Status {
        /// Instance id or name
        id: String,
    },

    /// Show memory and CPU usage
    Stats {
        /// Instance id or name
        id: String,
    },

    /// Print the tail of an instance's console
    Logs {
        /// Instance id or name
        id: String,

        /// Number of lines
        #[arg(short = 'n', long, default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,

        /// Prefix each line with its engine timestamp
        #[arg(short, long)]
        timestamps: bool,
    },

    /// Create, list and restore backups
    #[command(
        subcommand,
        about = "Manage backups",
        long_about = "Crash-consistent backups: the instance is stopped while its data is archived.\nExample: helix backup list alpha"
    )]
    Backup(BackupCommand),

    /// Check that Docker is installed and reachable
    #[command(
        about = "Run diagnostics",
        long_about = "Checks the docker binary and daemon, and validates configuration.\nExample: helix doctor"
    )]
    Doctor,
}

/// Parse `KEY=VALUE`.
fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// The components a command needs, wired to Docker and the configured registry.
pub struct Services {
    pub lifecycle: Arc<LifecycleManager>,
    pub backups: BackupEngine,
    pub logs: LogReader,
}

impl Services {
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let store = crate::db::connect_from_config(&config.database)
            .await
            .context("Failed to open the instance registry")?;
        let registry = Arc::new(Registry::new(store));

        let engine: Arc<dyn ContainerEngine> = Arc::new(
            DockerEngine::connect(config.engine.stop_timeout)
                .await
                .context("Could not connect to Docker (run `helix doctor` for help)")?,
        );

        let lifecycle = Arc::new(LifecycleManager::new(
            config.instances.clone(),
            Arc::clone(&engine),
            Arc::clone(&registry),
        ));
        let backups = BackupEngine::new(Arc::clone(&lifecycle));
        let logs = LogReader::new(engine, registry);

        Ok(Self {
            lifecycle,
            backups,
            logs,
        })
    }
}

/// Run a parsed command line.
pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command {
        Command::Doctor => run_doctor_command(&config).await,
        Command::Backup(cmd) => {
            let services = Services::connect(&config).await?;
            run_backup_command(&services, cmd, cli.json).await
        }
        other => {
            let services = Services::connect(&config).await?;
            run_instance_command(&services, other, cli.json).await
        }
    }
}

/// Print a value as pretty JSON.
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_version() {
        let cmd = Cli::command();
        assert_eq!(
            cmd.get_version().unwrap_or("unknown"),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_create_parses_env_pairs() {
        let cli = Cli::try_parse_from([
            "helix", "create", "alpha", "--version", "1.20", "-e", "MEMORY=4G", "--env",
            "MOTD=a=b",
        ])
        .unwrap();
        match cli.command {
            Command::Create { name, version, env } => {
                assert_eq!(name, "alpha");
                assert_eq!(version.as_deref(), Some("1.20"));
                assert_eq!(
                    env,
                    vec![
                        ("MEMORY".to_string(), "4G".to_string()),
                        ("MOTD".to_string(), "a=b".to_string()),
                    ]
                );
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_bad_env_pair_rejected() {
        assert!(Cli::try_parse_from(["helix", "create", "alpha", "-e", "NOEQUALS"]).is_err());
        assert!(parse_env_pair("=x").is_err());
    }

    #[test]
    fn test_logs_default_lines() {
        let cli = Cli::try_parse_from(["helix", "logs", "alpha"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Logs {
                lines: DEFAULT_TAIL_LINES,
                timestamps: false,
                ..
            }
        ));
    }

    #[test]
    fn test_backup_subcommands() {
        let cli = Cli::try_parse_from([
            "helix",
            "--json",
            "backup",
            "restore",
            "alpha/backup_20250301T101500.123Z.tar.gz",
            "alpha",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Backup(BackupCommand::Restore { .. })));
    }
}
