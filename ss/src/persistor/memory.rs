//! In-memory persistor
//!
//! Same contract as the SQLite backend, held in a mutex-guarded table. Used
//! for tests and ephemeral runs; nothing survives the process.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::debug;

use super::{Persistor, PersistorFactory, merge_engine, merged_state};
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::model::{self, CHECKPOINT_DONE, FileState, FileStateAttrs, PersistId, PruneOutcome, Severity};

#[derive(Debug)]
struct ReportItem {
    severity: Severity,
    engine_name: String,
    data: Value,
    created_at: NaiveDateTime,
}

#[derive(Debug, Default)]
struct Tables {
    /// Insertion order doubles as the stable scan order
    states: Vec<FileState>,
    report_items: Vec<ReportItem>,
}

/// Persistor holding everything in process memory
#[derive(Debug, Default)]
pub struct MemoryPersistor {
    tables: Mutex<Tables>,
}

impl MemoryPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Operational("memory table lock poisoned".to_string()))
    }
}

/// Replace the (hash, engine) record or append a new one; stamps a missing checkpoint time
fn upsert(states: &mut Vec<FileState>, mut stored: FileState) -> PersistId {
    if stored.checkpoint_time.is_none() {
        stored.checkpoint_time = Some(model::now());
    }
    match states
        .iter_mut()
        .find(|s| s.file_hash == stored.file_hash && s.engine_name == stored.engine_name)
    {
        Some(existing) => {
            stored.persist_id = existing.persist_id.clone();
            *existing = stored;
            existing.persist_id.clone()
        }
        None => {
            let id = stored.persist_id.clone();
            states.push(stored);
            id
        }
    }
}

impl Persistor for MemoryPersistor {
    fn set_checkpoint(
        &self,
        hash: &str,
        engine: &str,
        checkpoint_name: &str,
        checkpoint_time: Option<NaiveDateTime>,
    ) -> StoreResult<()> {
        debug!(%hash, %engine, %checkpoint_name, "MemoryPersistor::set_checkpoint: called");
        let time = checkpoint_time.unwrap_or_else(model::now);
        let mut tables = self.lock()?;
        match tables
            .states
            .iter_mut()
            .find(|s| s.file_hash == hash && s.engine_name == engine)
        {
            Some(state) => {
                state.checkpoint_name = checkpoint_name.to_string();
                state.checkpoint_time = Some(time);
            }
            None => {
                let mut state = FileState::new(hash, engine);
                state.checkpoint_name = checkpoint_name.to_string();
                state.checkpoint_time = Some(time);
                tables.states.push(state);
            }
        }
        Ok(())
    }

    fn get_previous_hashes(&self, engine: &str) -> StoreResult<Vec<String>> {
        let tables = self.lock()?;
        let mut hashes: Vec<String> = tables
            .states
            .iter()
            .filter(|s| s.engine_name == engine && s.checkpoint_name == CHECKPOINT_DONE)
            .map(|s| s.file_hash.clone())
            .collect();
        hashes.sort();
        Ok(hashes)
    }

    fn get_unfinished_hashes(&self, engine: &str) -> StoreResult<Vec<(String, String)>> {
        let tables = self.lock()?;
        Ok(tables
            .states
            .iter()
            .filter(|s| s.engine_name == engine && s.checkpoint_name != CHECKPOINT_DONE)
            .map(|s| (s.file_hash.clone(), s.checkpoint_name.clone()))
            .collect())
    }

    fn prune(&self, cutoff: NaiveDateTime) -> StoreResult<PruneOutcome> {
        debug!(%cutoff, "MemoryPersistor::prune: called");
        let mut tables = self.lock()?;

        let before = tables.states.len();
        tables.states.retain(|s| {
            let checkpoint_old = s.checkpoint_time.is_none_or(|t| t < cutoff);
            let sent_old = s.time_sent.is_none_or(|t| t < cutoff);
            !(checkpoint_old && sent_old)
        });
        let states_removed = before - tables.states.len();

        let before = tables.report_items.len();
        tables.report_items.retain(|item| item.created_at >= cutoff);
        let report_items_removed = before - tables.report_items.len();

        tables.states.shrink_to_fit();
        tables.report_items.shrink_to_fit();

        Ok(PruneOutcome {
            states_removed,
            report_items_removed,
            reclaimed: true,
        })
    }

    fn add_report_item(&self, severity: Severity, engine: &str, data: &Value) -> StoreResult<()> {
        let mut tables = self.lock()?;
        tables.report_items.push(ReportItem {
            severity,
            engine_name: engine.to_string(),
            data: data.clone(),
            created_at: model::now(),
        });
        Ok(())
    }

    fn get_current_report_items(&self, severity: Severity, engine: &str) -> StoreResult<Vec<Value>> {
        let tables = self.lock()?;
        Ok(tables
            .report_items
            .iter()
            .filter(|item| item.severity == severity && item.engine_name == engine)
            .map(|item| item.data.clone())
            .collect())
    }

    fn clear_report_items(&self, severity: Severity, engine: &str) -> StoreResult<()> {
        let mut tables = self.lock()?;
        tables
            .report_items
            .retain(|item| !(item.severity == severity && item.engine_name == engine));
        Ok(())
    }

    fn get_file_states(&self, hash: &str) -> StoreResult<Vec<FileState>> {
        let tables = self.lock()?;
        Ok(tables.states.iter().filter(|s| s.file_hash == hash).cloned().collect())
    }

    fn get_file_state(&self, hash: &str, engine: &str) -> StoreResult<Option<FileState>> {
        let tables = self.lock()?;
        Ok(tables
            .states
            .iter()
            .find(|s| s.file_hash == hash && s.engine_name == engine)
            .cloned())
    }

    fn get_file_state_by_id(&self, persist_id: &PersistId) -> StoreResult<Option<FileState>> {
        let tables = self.lock()?;
        Ok(tables.states.iter().find(|s| &s.persist_id == persist_id).cloned())
    }

    fn save_file_state(&self, state: &FileState) -> StoreResult<PersistId> {
        debug!(hash = %state.file_hash, engine = %state.engine_name, "MemoryPersistor::save_file_state: called");
        let mut tables = self.lock()?;
        Ok(upsert(&mut tables.states, state.clone()))
    }

    fn merge_file_state(
        &self,
        hash: &str,
        attrs: &FileStateAttrs,
        persist_id: Option<&PersistId>,
    ) -> StoreResult<PersistId> {
        debug!(%hash, ?persist_id, "MemoryPersistor::merge_file_state: called");
        let mut tables = self.lock()?;
        let existing = match persist_id {
            Some(id) => tables.states.iter().find(|s| &s.persist_id == id).cloned(),
            None => {
                let engine = merge_engine(attrs)?;
                tables
                    .states
                    .iter()
                    .find(|s| s.file_hash == hash && s.engine_name == engine)
                    .cloned()
            }
        };
        let state = merged_state(existing, hash, attrs, persist_id)?;
        Ok(upsert(&mut tables.states, state))
    }

    fn get_engine_states(&self, engine: &str) -> StoreResult<Vec<FileState>> {
        let tables = self.lock()?;
        Ok(tables.states.iter().filter(|s| s.engine_name == engine).cloned().collect())
    }
}

/// Factory for the `memory` provider; takes no settings
pub struct MemoryPersistorFactory;

impl PersistorFactory for MemoryPersistorFactory {
    fn create_persistor(&self, _config: &Config) -> StoreResult<Arc<dyn Persistor>> {
        Ok(Arc::new(MemoryPersistor::new()))
    }
}
