//! CLI command definitions and path helpers

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::debug;

/// Config file looked up relative to the working directory
pub const LOCAL_CONFIG_PATH: &str = "config/binary-analysis-config.yaml";

/// EngineResults - analysis job state and engine result monitor
#[derive(Parser)]
#[command(
    name = "er",
    about = "Track binary analysis jobs and watch engine results",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Record that a file was sent to an engine
    Submit {
        /// File hash
        hash: String,

        /// Engine name (defaults to engine.name from config)
        #[arg(short, long)]
        engine: Option<String>,

        /// Original file name
        #[arg(long)]
        file_name: Option<String>,

        /// File size in bytes
        #[arg(long)]
        file_size: Option<u64>,

        /// Operating system the file targets
        #[arg(long)]
        os_type: Option<String>,
    },

    /// Show the most recent state for a hash
    Lookup {
        /// File hash
        hash: String,

        /// Restrict to one engine
        #[arg(short, long)]
        engine: Option<String>,
    },

    /// List files still waiting on an engine
    Unfinished {
        #[arg(short, long)]
        engine: Option<String>,
    },

    /// List hashes an engine has finished
    Done {
        #[arg(short, long)]
        engine: Option<String>,
    },

    /// Show stored findings at one severity
    Report {
        /// Severity, 1 through 10
        #[arg(short, long)]
        severity: i64,

        #[arg(short, long)]
        engine: Option<String>,

        /// Remove the findings after printing them
        #[arg(long)]
        clear: bool,
    },

    /// Remove records older than a timestamp
    Prune {
        /// Cutoff, e.g. "2020-01-12 00:00:00"
        #[arg(short, long)]
        before: String,
    },

    /// Feed JSON-lines results to the monitor until complete, timed out or out of input
    Watch {
        /// Input file (stdin when absent)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

/// Resolve the config file: explicit path, then local, then user config dir
pub fn resolve_config_path(explicit: Option<&PathBuf>) -> Option<PathBuf> {
    debug!(?explicit, "resolve_config_path: called");
    if let Some(path) = explicit {
        return Some(path.clone());
    }

    let local = Path::new(LOCAL_CONFIG_PATH);
    if local.exists() {
        debug!("resolve_config_path: using local config");
        return Some(local.to_path_buf());
    }

    let user = dirs::config_dir()?.join("engineresults").join("config.yml");
    if user.exists() {
        debug!(?user, "resolve_config_path: using user config");
        return Some(user);
    }

    debug!("resolve_config_path: no config found");
    None
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("engineresults")
        .join("logs")
        .join("engineresults.log")
}
