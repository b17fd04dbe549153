//! Storage contract and backend registry
//!
//! A [`Persistor`] stores run state rows (one per hash/engine pair, carrying
//! both the file-state attributes and the checkpoint) and severity-bucketed
//! report items. Backends are built by a [`PersistorFactory`] chosen from the
//! `_provider` key of the database configuration section.

mod memory;
mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::model::{FileState, FileStateAttrs, PersistId, PruneOutcome, Severity};

pub use memory::{MemoryPersistor, MemoryPersistorFactory};
pub use sqlite::{SqlitePersistor, SqlitePersistorFactory};

/// Provider used when the configuration section names none
pub const DEFAULT_PROVIDER: &str = "sqlite";

/// Capability set every storage backend implements
///
/// Implementations must be usable from several threads at once. Failures come
/// back as typed errors; [`StoreError::is_operational`] tells callers which
/// ones may be treated as "no data".
pub trait Persistor: Send + Sync {
    /// Upsert the checkpoint for (hash, engine); `None` time means the storage clock
    fn set_checkpoint(
        &self,
        hash: &str,
        engine: &str,
        checkpoint_name: &str,
        checkpoint_time: Option<NaiveDateTime>,
    ) -> StoreResult<()>;

    /// Hashes checkpointed `DONE` for the engine, sorted ascending
    fn get_previous_hashes(&self, engine: &str) -> StoreResult<Vec<String>>;

    /// (hash, checkpoint) for every row of the engine not yet `DONE`
    fn get_unfinished_hashes(&self, engine: &str) -> StoreResult<Vec<(String, String)>>;

    /// Delete everything whose last activity is strictly before `cutoff`
    fn prune(&self, cutoff: NaiveDateTime) -> StoreResult<PruneOutcome>;

    fn add_report_item(&self, severity: Severity, engine: &str, data: &Value) -> StoreResult<()>;

    fn get_current_report_items(&self, severity: Severity, engine: &str) -> StoreResult<Vec<Value>>;

    fn clear_report_items(&self, severity: Severity, engine: &str) -> StoreResult<()>;

    /// Every record for the hash across engines, in insertion order
    fn get_file_states(&self, hash: &str) -> StoreResult<Vec<FileState>>;

    fn get_file_state(&self, hash: &str, engine: &str) -> StoreResult<Option<FileState>>;

    fn get_file_state_by_id(&self, persist_id: &PersistId) -> StoreResult<Option<FileState>>;

    /// Write the record keyed by (hash, engine): update if present, else insert.
    /// Returns the persist id of the row actually written.
    fn save_file_state(&self, state: &FileState) -> StoreResult<PersistId>;

    /// Merge `attrs` into a record as one atomic step; returns its persist id
    ///
    /// With `persist_id`, exactly that record is merged into and it must belong
    /// to `hash` (and to `attrs.engine_name` when given). Without it, the record
    /// keyed by (`hash`, `attrs.engine_name`) is merged into, or created with a
    /// fresh id. Concurrent merges of different fields must all survive.
    fn merge_file_state(
        &self,
        hash: &str,
        attrs: &FileStateAttrs,
        persist_id: Option<&PersistId>,
    ) -> StoreResult<PersistId>;

    /// Every record owned by the engine
    fn get_engine_states(&self, engine: &str) -> StoreResult<Vec<FileState>>;

    /// Records for the engine still waiting on a result
    fn get_unfinished_states(&self, engine: &str) -> StoreResult<Vec<FileState>> {
        Ok(self
            .get_engine_states(engine)?
            .into_iter()
            .filter(FileState::is_outstanding)
            .collect())
    }
}

/// Engine a merge without a persist id is keyed on
pub(crate) fn merge_engine(attrs: &FileStateAttrs) -> StoreResult<&str> {
    attrs
        .engine_name
        .as_deref()
        .ok_or_else(|| StoreError::InvalidArgument("engine_name is required to create a file state".to_string()))
}

/// Apply `attrs` to the record a merge resolved to, or to a fresh one
///
/// Backends call this with their lock or transaction held across the read of
/// `existing` and the write of the result.
pub(crate) fn merged_state(
    existing: Option<FileState>,
    hash: &str,
    attrs: &FileStateAttrs,
    persist_id: Option<&PersistId>,
) -> StoreResult<FileState> {
    let mut state = match (persist_id, existing) {
        (Some(id), None) => return Err(StoreError::NotFound(format!("persist id {}", id))),
        (Some(id), Some(state)) => {
            let engine_differs = attrs.engine_name.as_deref().is_some_and(|e| e != state.engine_name);
            if state.file_hash != hash || engine_differs {
                return Err(StoreError::IdentityMismatch {
                    persist_id: id.to_string(),
                    hash: state.file_hash,
                    engine: state.engine_name,
                });
            }
            state
        }
        (None, Some(state)) => state,
        (None, None) => {
            let mut fresh = FileState::new(hash, merge_engine(attrs)?);
            fresh.checkpoint_time = attrs.time_sent;
            fresh.merge(attrs);
            return Ok(fresh);
        }
    };
    // any later write stamps the storage clock
    state.checkpoint_time = None;
    state.merge(attrs);
    Ok(state)
}

/// Builds a backend from its configuration section
pub trait PersistorFactory: Send + Sync {
    /// Open the backend, creating its schema if absent
    fn create_persistor(&self, config: &Config) -> StoreResult<Arc<dyn Persistor>>;
}

/// Backend factories keyed by provider name
pub struct PersistorRegistry {
    factories: HashMap<String, Box<dyn PersistorFactory>>,
}

impl PersistorRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry holding the `sqlite` and `memory` backends
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("sqlite", SqlitePersistorFactory);
        registry.register("memory", MemoryPersistorFactory);
        registry
    }

    pub fn register(&mut self, provider: impl Into<String>, factory: impl PersistorFactory + 'static) {
        let provider = provider.into();
        debug!(%provider, "PersistorRegistry::register: called");
        self.factories.insert(provider, Box::new(factory));
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the backend named by `section._provider` (default `sqlite`)
    pub fn create_persistor(&self, section: &Config) -> StoreResult<Arc<dyn Persistor>> {
        let provider = section.string_default("_provider", DEFAULT_PROVIDER);
        debug!(%provider, "PersistorRegistry::create_persistor: called");
        let factory = self
            .factories
            .get(&provider)
            .ok_or_else(|| StoreError::UnknownProvider(provider.clone()))?;
        let persistor = factory.create_persistor(section)?;
        info!(%provider, "Persistor created");
        Ok(persistor)
    }
}

impl Default for PersistorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(body: &str) -> Config {
        let text = format!("id: cbc_binary_toolkit\nversion: 0.0.1\ndatabase:\n{}", body);
        Config::load(&text).unwrap().section("database").unwrap()
    }

    #[test]
    fn test_builtin_providers() {
        let registry = PersistorRegistry::with_builtin();
        assert_eq!(registry.providers(), vec!["memory", "sqlite"]);
    }

    #[test]
    fn test_default_provider_is_sqlite() {
        let registry = PersistorRegistry::default();
        let persistor = registry.create_persistor(&section("  location: \":memory:\"\n")).unwrap();
        persistor.set_checkpoint("H", "E", "DONE", None).unwrap();
        assert_eq!(persistor.get_previous_hashes("E").unwrap(), vec!["H".to_string()]);
    }

    #[test]
    fn test_memory_provider() {
        let registry = PersistorRegistry::default();
        let persistor = registry.create_persistor(&section("  _provider: memory\n")).unwrap();
        assert!(persistor.get_file_states("H").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_provider() {
        let registry = PersistorRegistry::default();
        let result = registry.create_persistor(&section("  _provider: postgres\n"));
        assert!(matches!(result, Err(StoreError::UnknownProvider(ref p)) if p == "postgres"));
    }

    #[test]
    fn test_sqlite_requires_location() {
        let registry = PersistorRegistry::default();
        let result = registry.create_persistor(&section("  _provider: sqlite\n"));
        assert!(matches!(result, Err(StoreError::Config(_))));
    }
}
