//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::record::Priority;

/// Arguments for `serve`.
#[derive(Debug, Args)]
pub struct ServeCommand {
    /// Address to listen on (overrides `server.bind`)
    #[arg(short, long, value_name = "ADDR")]
    pub bind: Option<String>,
}

/// Arguments for `send`.
#[derive(Debug, Args)]
pub struct SendCommand {
    /// Newline-delimited JSON file of `{"priority": N, "event": {...}}` lines
    pub file: PathBuf,

    /// Ingestion endpoint (overrides `transport.endpoint`)
    #[arg(short, long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Output format for the final counters
    #[arg(short, long, value_enum, default_value = "plain")]
    pub format: OutputFormat,
}

/// Arguments for `keygen`.
#[derive(Debug, Args)]
pub struct KeygenCommand {
    /// Generate a 256-bit key instead of a 128-bit one
    #[arg(long)]
    pub aes256: bool,
}

/// Dead-letter inspection commands.
#[derive(Debug, Subcommand)]
pub enum DeadLetterCommand {
    /// List the most recent dead letters
    List {
        /// Maximum number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Only show one priority
        #[arg(short, long, value_enum)]
        priority: Option<PriorityArg>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Show store statistics
    Stats {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Delete old dead letters
    Prune {
        /// Remove entries older than this many days (defaults to
        /// `storage.max_age_days`)
        #[arg(long, value_name = "DAYS")]
        older_than_days: Option<u32>,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Priority argument for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    /// Error events
    Error,
    /// Performance samples
    Performance,
    /// User interactions
    UserBehavior,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Error => Self::Error,
            PriorityArg::Performance => Self::Performance,
            PriorityArg::UserBehavior => Self::UserBehavior,
        }
    }
}

/// Output format for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Plain,
    /// Formatted table
    Table,
    /// JSON output
    Json,
}
