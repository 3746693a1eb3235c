//! Command-line interface for telepipe.
//!
//! This module provides the CLI structure for the `telepipe` binary. The
//! handlers live in `main.rs`.

mod commands;
pub mod input;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::Verbosity;

pub use commands::{
    ConfigCommand, DeadLetterCommand, KeygenCommand, OutputFormat, PriorityArg, SendCommand,
    ServeCommand,
};

/// telepipe - Encrypted, prioritized browser telemetry
///
/// Runs the ingestion server that decrypts telemetry batches and aggregates
/// them into time-bucketed metrics, and a client that batches, encrypts and
/// sends events to it.
#[derive(Debug, Parser)]
#[command(name = "telepipe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the ingestion and query server
    Serve(ServeCommand),

    /// Push events from a file through the client pipeline
    Send(SendCommand),

    /// Generate fresh key material
    Keygen(KeygenCommand),

    /// Inspect discarded records
    #[command(subcommand)]
    DeadLetters(DeadLetterCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.verbose, self.quiet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_name() {
        let cli = Cli::command();
        assert_eq!(cli.get_name(), "telepipe");
    }

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbosity_flags() {
        let cli = Cli::try_parse_from(["telepipe", "-q", "keygen"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Quiet);

        let cli = Cli::try_parse_from(["telepipe", "keygen"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Normal);

        let cli = Cli::try_parse_from(["telepipe", "-vv", "keygen"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Trace);
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from(["telepipe", "serve", "--bind", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Command::Serve(cmd) => assert_eq!(cmd.bind.as_deref(), Some("0.0.0.0:9000")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_send() {
        let cli = Cli::try_parse_from(["telepipe", "send", "events.jsonl", "-f", "json"]).unwrap();
        match cli.command {
            Command::Send(cmd) => {
                assert_eq!(cmd.file, PathBuf::from("events.jsonl"));
                assert_eq!(cmd.format, OutputFormat::Json);
                assert!(cmd.endpoint.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_keygen() {
        let cli = Cli::try_parse_from(["telepipe", "keygen", "--aes256"]).unwrap();
        assert!(matches!(cli.command, Command::Keygen(KeygenCommand { aes256: true })));
    }

    #[test]
    fn test_parse_dead_letters_list() {
        let cli = Cli::try_parse_from([
            "telepipe",
            "dead-letters",
            "list",
            "--priority",
            "error",
            "--limit",
            "5",
        ])
        .unwrap();
        match cli.command {
            Command::DeadLetters(DeadLetterCommand::List {
                limit, priority, ..
            }) => {
                assert_eq!(limit, 5);
                assert_eq!(priority, Some(PriorityArg::Error));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_dead_letters_prune() {
        let cli = Cli::try_parse_from(["telepipe", "dead-letters", "prune"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::DeadLetters(DeadLetterCommand::Prune {
                older_than_days: None
            })
        ));
    }

    #[test]
    fn test_parse_with_config() {
        let cli =
            Cli::try_parse_from(["telepipe", "-c", "/custom/config.toml", "config", "path"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
        assert!(matches!(cli.command, Command::Config(ConfigCommand::Path)));
    }

    #[test]
    fn test_send_requires_file() {
        assert!(Cli::try_parse_from(["telepipe", "send"]).is_err());
    }
}
