//! StateManager - domain façade over a Persistor
//!
//! Resolves "the current state of a hash" across engines, applies merge
//! semantics for file-state writes, and degrades operational backend failures
//! to empty results so long-running callers keep going.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::StoreResult;
use crate::model::{FileState, FileStateAttrs, PersistId, PruneOutcome, Severity};
use crate::persistor::{Persistor, PersistorRegistry};

/// Configuration section holding the persistor settings
pub const DATABASE_SECTION: &str = "database";

/// Handle to the state store; cheap to clone and share across threads
#[derive(Clone)]
pub struct StateManager {
    persistor: Arc<dyn Persistor>,
    degraded: Arc<AtomicU64>,
}

impl StateManager {
    pub fn new(persistor: Arc<dyn Persistor>) -> Self {
        Self {
            persistor,
            degraded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build the persistor named in the `database` section with the builtin backends
    pub fn from_config(config: &Config) -> StoreResult<Self> {
        Self::with_registry(config, &PersistorRegistry::with_builtin())
    }

    pub fn with_registry(config: &Config, registry: &PersistorRegistry) -> StoreResult<Self> {
        debug!("StateManager::with_registry: called");
        let section = config.section(DATABASE_SECTION)?;
        let persistor = registry.create_persistor(&section)?;
        info!("StateManager ready");
        Ok(Self::new(persistor))
    }

    pub fn persistor(&self) -> &Arc<dyn Persistor> {
        &self.persistor
    }

    /// Number of operations answered with an empty result after a backend failure
    pub fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    fn degrade<T: Default>(&self, op: &'static str, result: StoreResult<T>) -> StoreResult<T> {
        match result {
            Err(e) if e.is_operational() => {
                error!(op, error = %e, "Storage operation degraded to empty result");
                self.degraded.fetch_add(1, Ordering::Relaxed);
                Ok(T::default())
            }
            other => other,
        }
    }

    // === File state ===

    /// Create or merge a file-state record; returns its persist id
    ///
    /// With `persist_id`, `attrs` are merged into exactly that record. Without
    /// it, the record keyed by (`hash`, `attrs.engine_name`) is merged into,
    /// or created with a fresh id if none exists.
    pub fn set_file_state(
        &self,
        hash: &str,
        attrs: &FileStateAttrs,
        persist_id: Option<&PersistId>,
    ) -> StoreResult<PersistId> {
        debug!(%hash, ?persist_id, "StateManager::set_file_state: called");
        self.persistor.merge_file_state(hash, attrs, persist_id)
    }

    /// Current state of `hash`; without an engine the most recent record wins
    pub fn lookup(&self, hash: &str, engine: Option<&str>) -> StoreResult<Option<FileState>> {
        debug!(%hash, ?engine, "StateManager::lookup: called");
        match engine {
            Some(engine) => self.degrade("lookup", self.persistor.get_file_state(hash, engine)),
            None => {
                let candidates = self.degrade("lookup", self.persistor.get_file_states(hash))?;
                Ok(most_recent(candidates))
            }
        }
    }

    /// Records for the engine with no `time_returned`
    pub fn get_unfinished_states(&self, engine: &str) -> StoreResult<Vec<FileState>> {
        debug!(%engine, "StateManager::get_unfinished_states: called");
        self.degrade("get_unfinished_states", self.persistor.get_unfinished_states(engine))
    }

    pub fn get_engine_states(&self, engine: &str) -> StoreResult<Vec<FileState>> {
        debug!(%engine, "StateManager::get_engine_states: called");
        self.degrade("get_engine_states", self.persistor.get_engine_states(engine))
    }

    // === Checkpoints ===

    pub fn set_checkpoint(
        &self,
        hash: &str,
        engine: &str,
        checkpoint_name: &str,
        checkpoint_time: Option<NaiveDateTime>,
    ) -> StoreResult<()> {
        debug!(%hash, %engine, %checkpoint_name, "StateManager::set_checkpoint: called");
        self.degrade(
            "set_checkpoint",
            self.persistor.set_checkpoint(hash, engine, checkpoint_name, checkpoint_time),
        )
    }

    pub fn get_previous_hashes(&self, engine: &str) -> StoreResult<Vec<String>> {
        self.degrade("get_previous_hashes", self.persistor.get_previous_hashes(engine))
    }

    pub fn get_unfinished_hashes(&self, engine: &str) -> StoreResult<Vec<(String, String)>> {
        self.degrade("get_unfinished_hashes", self.persistor.get_unfinished_hashes(engine))
    }

    // === Report items ===

    pub fn add_report_item(&self, severity: Severity, engine: &str, data: &Value) -> StoreResult<()> {
        self.degrade("add_report_item", self.persistor.add_report_item(severity, engine, data))
    }

    pub fn get_current_report_items(&self, severity: Severity, engine: &str) -> StoreResult<Vec<Value>> {
        self.degrade(
            "get_current_report_items",
            self.persistor.get_current_report_items(severity, engine),
        )
    }

    pub fn clear_report_items(&self, severity: Severity, engine: &str) -> StoreResult<()> {
        self.degrade("clear_report_items", self.persistor.clear_report_items(severity, engine))
    }

    /// Remove everything whose last activity is strictly before `cutoff`
    pub fn prune(&self, cutoff: NaiveDateTime) -> StoreResult<PruneOutcome> {
        debug!(%cutoff, "StateManager::prune: called");
        let outcome = self.degrade("prune", self.persistor.prune(cutoff))?;
        info!(
            states_removed = outcome.states_removed,
            report_items_removed = outcome.report_items_removed,
            reclaimed = outcome.reclaimed,
            "Pruned state store"
        );
        Ok(outcome)
    }
}

/// Pick the most recent record; later insertion wins a full tie
fn most_recent(candidates: Vec<FileState>) -> Option<FileState> {
    candidates.into_iter().max_by(FileState::cmp_recency)
}
