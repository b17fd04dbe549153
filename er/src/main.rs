//! EngineResults - analysis job state and engine result monitor
//!
//! CLI entry point.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use engineresults::cli::{Cli, Command, get_log_path, resolve_config_path};
use engineresults::monitor::{EngineResultsMonitor, MonitorConfig, MonitorState};
use engineresults::pubsub::{DEFAULT_QUEUE_CAPACITY, PubSubManager};
use statestore::{Config, FileStateAttrs, Severity, StateManager, model, parse_timestamp};

fn parse_level(level: Option<&str>) -> tracing::Level {
    match level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    }
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = parse_level(cli_log_level.or(config_log_level));
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    let log_path = get_log_path();
    let log_file = log_path
        .parent()
        .map(fs::create_dir_all)
        .transpose()
        .and_then(|_| fs::File::create(&log_path));

    match log_file {
        Ok(file) => tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init(),
        Err(e) => {
            eprintln!("Warning: cannot open {} ({}), logging to stderr", log_path.display(), e);
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init()
        }
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn load_config(explicit: Option<&PathBuf>) -> Result<Config> {
    let path = resolve_config_path(explicit)
        .ok_or_else(|| eyre!("No config file found; pass --config or create config/binary-analysis-config.yaml"))?;
    Config::load_file(&path).wrap_err_with(|| format!("Failed to load config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref());
    let config_log_level = config
        .as_ref()
        .ok()
        .and_then(|c| c.get::<Option<String>>("log_level", None).ok().flatten());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;
    let config = config?;

    let state = StateManager::from_config(&config).context("Failed to open state store")?;

    debug!(command = ?cli.command, "main: dispatching command");
    let result = match cli.command {
        Command::Submit {
            hash,
            engine,
            file_name,
            file_size,
            os_type,
        } => {
            let engine = engine_name(&config, engine)?;
            cmd_submit(&state, &hash, engine, file_name, file_size, os_type)
        }
        Command::Lookup { hash, engine } => cmd_lookup(&state, &hash, engine.as_deref()),
        Command::Unfinished { engine } => cmd_unfinished(&state, &engine_name(&config, engine)?),
        Command::Done { engine } => cmd_done(&state, &engine_name(&config, engine)?),
        Command::Report {
            severity,
            engine,
            clear,
        } => cmd_report(&state, severity, &engine_name(&config, engine)?, clear),
        Command::Prune { before } => cmd_prune(&state, &before),
        Command::Watch { input } => cmd_watch(&config, &state, input).await,
    };

    if state.degraded_count() > 0 {
        eprintln!(
            "{} {} storage operation(s) failed and returned empty results; see {}",
            "warning:".yellow(),
            state.degraded_count(),
            get_log_path().display()
        );
    }
    result
}

/// `--engine` if given, else `engine.name` from config
fn engine_name(config: &Config, explicit: Option<String>) -> Result<String> {
    match explicit {
        Some(engine) => Ok(engine),
        None => config
            .string("engine.name")
            .context("No --engine given and engine.name missing from config"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_submit(
    state: &StateManager,
    hash: &str,
    engine: String,
    file_name: Option<String>,
    file_size: Option<u64>,
    os_type: Option<String>,
) -> Result<()> {
    debug!(%hash, %engine, "cmd_submit: called");
    let attrs = FileStateAttrs {
        file_name,
        file_size,
        os_type,
        time_sent: Some(model::now()),
        ..FileStateAttrs::for_engine(engine.clone())
    };
    let id = state.set_file_state(hash, &attrs, None)?;
    println!("{} Submitted {} to {}: {}", "✓".green(), hash, engine.cyan(), id);
    Ok(())
}

fn cmd_lookup(state: &StateManager, hash: &str, engine: Option<&str>) -> Result<()> {
    debug!(%hash, ?engine, "cmd_lookup: called");
    match state.lookup(hash, engine)? {
        Some(record) => print_json(&record),
        None => {
            println!("{} {} not found", "✗".red(), hash);
            Ok(())
        }
    }
}

fn cmd_unfinished(state: &StateManager, engine: &str) -> Result<()> {
    debug!(%engine, "cmd_unfinished: called");
    let states = state.get_unfinished_states(engine)?;
    if states.is_empty() {
        println!("{} nothing outstanding for {}", "✓".green(), engine.cyan());
        return Ok(());
    }
    for record in &states {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

fn cmd_done(state: &StateManager, engine: &str) -> Result<()> {
    debug!(%engine, "cmd_done: called");
    for hash in state.get_previous_hashes(engine)? {
        println!("{}", hash);
    }
    Ok(())
}

fn cmd_report(state: &StateManager, severity: i64, engine: &str, clear: bool) -> Result<()> {
    debug!(severity, %engine, clear, "cmd_report: called");
    let severity = Severity::try_from(severity)?;
    let items = state.get_current_report_items(severity, engine)?;
    println!(
        "{} {} finding(s) at severity {} for {}",
        "•".cyan(),
        items.len(),
        severity.to_string().yellow(),
        engine.cyan()
    );
    for item in &items {
        println!("{}", serde_json::to_string(item)?);
    }
    if clear {
        state.clear_report_items(severity, engine)?;
        println!("{} cleared", "✓".green());
    }
    Ok(())
}

fn cmd_prune(state: &StateManager, before: &str) -> Result<()> {
    debug!(%before, "cmd_prune: called");
    let cutoff = parse_timestamp(before).wrap_err_with(|| format!("Invalid timestamp: {}", before))?;
    let outcome = state.prune(cutoff)?;
    println!(
        "{} removed {} state(s) and {} finding(s){}",
        "✓".green(),
        outcome.states_removed,
        outcome.report_items_removed,
        if outcome.reclaimed { "" } else { " (space not reclaimed)" }
    );
    Ok(())
}

/// Push each JSON line of `input` onto the result topic
async fn feed_results<R: AsyncRead + Unpin>(input: R, tx: mpsc::Sender<Value>) -> Result<usize> {
    let mut lines = BufReader::new(input).lines();
    let mut sent = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(document) => {
                tx.send(document).await.map_err(|_| eyre!("Result monitor went away"))?;
                sent += 1;
            }
            Err(e) => warn!(error = %e, "feed_results: skipping line that is not JSON"),
        }
    }
    debug!(sent, "feed_results: input exhausted");
    Ok(sent)
}

async fn cmd_watch(config: &Config, state: &StateManager, input: Option<PathBuf>) -> Result<()> {
    debug!(?input, "cmd_watch: called");
    let monitor_config = MonitorConfig::from_config(config)?;
    let capacity: usize = config.get("pubsub.queue_capacity", DEFAULT_QUEUE_CAPACITY)?;
    let engine = monitor_config.engine_name.clone();

    // the topic's only sender lives in the feeder, so end of input closes it
    let (tx, rx) = {
        let pubsub = PubSubManager::new(capacity);
        pubsub.create_queue(&monitor_config.result_queue_name);
        (
            pubsub.sender(&monitor_config.result_queue_name)?,
            pubsub.subscribe(&monitor_config.result_queue_name)?,
        )
    };

    let handle = EngineResultsMonitor::new(monitor_config, state.clone(), rx).spawn();
    let mut status = handle.status();
    let timeout = handle.timeout_signal();

    let feeder = match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .wrap_err_with(|| format!("Failed to open {}", path.display()))?;
            tokio::spawn(feed_results(file, tx))
        }
        None => tokio::spawn(feed_results(tokio::io::stdin(), tx)),
    };

    info!(%engine, "cmd_watch: monitoring");
    let completed = tokio::select! {
        biased;
        finished = status.wait_for(|s| *s == MonitorState::Complete) => finished.is_ok(),
        _ = timeout.wait() => false,
    };

    if completed {
        println!("{} {} returned results for every submitted file", "✓".green(), engine.cyan());
    } else if timeout.is_set() {
        println!("{} no results from {} within the timeout", "✗".red(), engine.cyan());
    } else {
        let outstanding = state.get_unfinished_states(&engine)?.len();
        println!(
            "{} input ended with {} file(s) outstanding for {}",
            "•".yellow(),
            outstanding,
            engine.cyan()
        );
    }

    feeder.abort();
    handle.stop().await?;
    Ok(())
}
