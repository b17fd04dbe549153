//! Engine completion monitor
//!
//! One long-lived task per engine. It drains the engine's result topic,
//! stamps `time_returned` on each reported hash, files the findings by
//! severity, and publishes whether every tracked hash has come back. A
//! separate timeout signal fires when no result has been processed for the
//! configured interval, so a supervisor can spot a stalled engine without
//! touching the result channel.

use std::time::Duration;

use serde_json::Value;
use statestore::{CHECKPOINT_DONE, Config, ConfigError, FileStateAttrs, StateManager, StoreResult, model};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::messages::{EngineResult, finding_severity};

/// Seconds without results before the timeout signal fires
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Topic engine results arrive on
pub const DEFAULT_RESULT_QUEUE: &str = "results";

/// Settings for one monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub engine_name: String,
    pub timeout: Duration,
    pub result_queue_name: String,
}

impl MonitorConfig {
    pub fn new(engine_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            engine_name: engine_name.into(),
            timeout,
            result_queue_name: DEFAULT_RESULT_QUEUE.to_string(),
        }
    }

    /// Reads `engine.name`, `engine.timeout_secs` and `pubsub.result_queue_name`
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let engine_name = config.string("engine.name")?;
        let timeout_secs: u64 = config.get("engine.timeout_secs", DEFAULT_TIMEOUT_SECS)?;
        Ok(Self {
            engine_name,
            timeout: Duration::from_secs(timeout_secs),
            result_queue_name: config.string_default("pubsub.result_queue_name", DEFAULT_RESULT_QUEUE),
        })
    }
}

/// Logical state of the engine's current batch
///
/// Recomputed after every processed result and whenever the timeout fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Some tracked hash has no result yet, or nothing is tracked
    AwaitingResults,
    /// Every tracked hash has a result
    Complete,
}

/// Observable "no progress" flag
///
/// Advisory only: it does not change [`MonitorState`]. It clears again when
/// the next result is processed.
#[derive(Debug, Clone)]
pub struct TimeoutSignal {
    rx: watch::Receiver<bool>,
}

impl TimeoutSignal {
    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires; false if the monitor ended without firing
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        rx.wait_for(|fired| *fired).await.is_ok()
    }
}

/// Worker bound to a single engine
pub struct EngineResultsMonitor {
    config: MonitorConfig,
    state: StateManager,
    results: mpsc::Receiver<Value>,
    timeout_tx: watch::Sender<bool>,
    status_tx: watch::Sender<MonitorState>,
}

impl EngineResultsMonitor {
    pub fn new(config: MonitorConfig, state: StateManager, results: mpsc::Receiver<Value>) -> Self {
        debug!(engine = %config.engine_name, timeout = ?config.timeout, "EngineResultsMonitor::new: called");
        let (timeout_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(MonitorState::AwaitingResults);
        Self {
            config,
            state,
            results,
            timeout_tx,
            status_tx,
        }
    }

    pub fn engine_name(&self) -> &str {
        &self.config.engine_name
    }

    pub fn timeout_signal(&self) -> TimeoutSignal {
        TimeoutSignal {
            rx: self.timeout_tx.subscribe(),
        }
    }

    pub fn status(&self) -> watch::Receiver<MonitorState> {
        self.status_tx.subscribe()
    }

    /// Stamp `time_returned` on the (hash, engine) record and mark it `DONE`
    ///
    /// Returns whether a submission had been recorded for the pair. A result
    /// for an unknown pair still gets a returned record so it cannot hold up
    /// completion.
    pub fn update_state(&self, hash: &str, engine: &str) -> StoreResult<bool> {
        debug!(%hash, %engine, "EngineResultsMonitor::update_state: called");
        let attrs = FileStateAttrs {
            time_returned: Some(model::now()),
            checkpoint_name: Some(CHECKPOINT_DONE.to_string()),
            ..Default::default()
        };
        match self.state.lookup(hash, Some(engine))? {
            Some(existing) => {
                self.state.set_file_state(hash, &attrs, Some(&existing.persist_id))?;
                Ok(true)
            }
            None => {
                warn!(%hash, %engine, "Result for a hash with no recorded submission");
                let attrs = FileStateAttrs {
                    engine_name: Some(engine.to_string()),
                    ..attrs
                };
                self.state.set_file_state(hash, &attrs, None)?;
                Ok(false)
            }
        }
    }

    /// File each finding under its severity; returns how many were stored
    pub fn accept_report(&self, engine: &str, iocs: &[Value]) -> usize {
        debug!(%engine, count = iocs.len(), "EngineResultsMonitor::accept_report: called");
        let mut accepted = 0;
        for ioc in iocs {
            let severity = match finding_severity(ioc) {
                Ok(severity) => severity,
                Err(e) => {
                    warn!(%engine, error = %e, "Skipping finding");
                    continue;
                }
            };
            match self.state.add_report_item(severity, engine, ioc) {
                Ok(()) => accepted += 1,
                Err(e) => error!(%engine, %severity, error = %e, "Failed to store finding"),
            }
        }
        accepted
    }

    /// True iff the engine tracks at least one hash and all have returned
    pub fn check_completion(&self, engine: &str) -> bool {
        match self.state.get_engine_states(engine) {
            Ok(states) => !states.is_empty() && states.iter().all(|s| !s.is_outstanding()),
            Err(e) => {
                error!(%engine, error = %e, "Completion check failed");
                false
            }
        }
    }

    /// Process one result document; returns whether it changed any state
    pub fn handle_message(&self, document: Value) -> bool {
        let result = match EngineResult::from_value(document) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Discarding malformed engine result");
                return false;
            }
        };

        let engine = self.engine_name();
        if let Some(other) = result.engine_name.as_deref()
            && other != engine
        {
            warn!(%engine, %other, hash = %result.binary_hash, "Discarding result for another engine");
            return false;
        }

        debug!(hash = %result.binary_hash, iocs = result.iocs.len(), "EngineResultsMonitor::handle_message: processing");
        if let Err(e) = self.update_state(&result.binary_hash, engine) {
            error!(hash = %result.binary_hash, error = %e, "Failed to record result");
        }
        self.accept_report(engine, &result.iocs);
        true
    }

    fn refresh_status(&self) {
        let next = if self.check_completion(self.engine_name()) {
            MonitorState::Complete
        } else {
            MonitorState::AwaitingResults
        };
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(engine = %self.engine_name(), state = ?next, "Engine state changed");
        }
    }

    /// Run the monitor on the current runtime
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timeout = self.timeout_signal();
        let status = self.status();
        let join = tokio::spawn(self.run(shutdown_rx));
        MonitorHandle {
            shutdown_tx,
            join,
            timeout,
            status,
        }
    }

    /// Receive loop; ends on shutdown or when every producer has gone
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            engine = %self.config.engine_name,
            timeout_secs = self.config.timeout.as_secs(),
            "EngineResultsMonitor started"
        );
        self.refresh_status();
        let mut deadline = Instant::now() + self.config.timeout;

        loop {
            let timed_out = *self.timeout_tx.borrow();
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(engine = %self.config.engine_name, "EngineResultsMonitor stopping");
                        break;
                    }
                }

                message = self.results.recv() => {
                    let Some(document) = message else {
                        info!(engine = %self.config.engine_name, "Result channel closed");
                        break;
                    };
                    if self.handle_message(document) {
                        deadline = Instant::now() + self.config.timeout;
                        if timed_out {
                            debug!("EngineResultsMonitor::run: activity resumed, clearing timeout");
                            self.timeout_tx.send_replace(false);
                        }
                        self.refresh_status();
                    }
                }

                _ = tokio::time::sleep_until(deadline), if !timed_out => {
                    warn!(
                        engine = %self.config.engine_name,
                        timeout_secs = self.config.timeout.as_secs(),
                        "No engine results within timeout"
                    );
                    // submissions made since the last result show up here
                    self.refresh_status();
                    self.timeout_tx.send_replace(true);
                }
            }
        }
    }
}

/// Supervisor's handle on a spawned monitor
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    timeout: TimeoutSignal,
    status: watch::Receiver<MonitorState>,
}

impl MonitorHandle {
    pub fn timeout_signal(&self) -> TimeoutSignal {
        self.timeout.clone()
    }

    pub fn state(&self) -> MonitorState {
        *self.status.borrow()
    }

    pub fn status(&self) -> watch::Receiver<MonitorState> {
        self.status.clone()
    }

    /// Resolve once the engine's batch is complete; false if the monitor ended first
    pub async fn wait_complete(&mut self) -> bool {
        self.status
            .wait_for(|state| *state == MonitorState::Complete)
            .await
            .is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the monitor to stop after the message in hand, then wait for it
    pub async fn stop(self) -> Result<(), JoinError> {
        debug!("MonitorHandle::stop: called");
        self.shutdown_tx.send_replace(true);
        self.join.await
    }

    /// Wait for the monitor to end on its own (result channel closed)
    pub async fn join(self) -> Result<(), JoinError> {
        let Self { shutdown_tx, join, .. } = self;
        let result = join.await;
        drop(shutdown_tx);
        result
    }
}
