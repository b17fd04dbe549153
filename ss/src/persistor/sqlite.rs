//! SQLite persistor
//!
//! Two tables: `run_state` (one row per hash/engine, file state plus
//! checkpoint) and `report_item` (JSON findings by severity and engine). The
//! connection sits behind a mutex so one handle can be shared between the
//! monitor task and synchronous callers; conflicting writers from other
//! processes are serialized by SQLite's own locking (IMMEDIATE transactions
//! plus a busy timeout).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::NaiveDateTime;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Params, Row, TransactionBehavior, params};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Persistor, PersistorFactory, merge_engine, merged_state};
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::model::{
    CHECKPOINT_DONE, FileState, FileStateAttrs, PersistId, PruneOutcome, Severity, format_timestamp, parse_timestamp,
};

/// Default time to wait on a locked database before giving up (ms)
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS run_state (
    persist_id TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    engine_name TEXT NOT NULL,
    checkpoint_name TEXT NOT NULL,
    checkpoint_time TEXT NOT NULL,
    file_size INTEGER,
    file_name TEXT,
    os_type TEXT,
    time_sent TEXT,
    time_returned TEXT,
    time_published TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS run_hashes ON run_state (engine_name, file_hash);
CREATE INDEX IF NOT EXISTS run_checkpoints ON run_state (engine_name, checkpoint_name);
CREATE INDEX IF NOT EXISTS run_persist_ids ON run_state (persist_id);
CREATE TABLE IF NOT EXISTS report_item (
    severity INTEGER NOT NULL CHECK (severity BETWEEN 1 AND 10),
    engine_name TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS report_items ON report_item (engine_name, severity);
";

const STATE_COLUMNS: &str = "persist_id, file_hash, engine_name, checkpoint_name, checkpoint_time, \
     file_size, file_name, os_type, time_sent, time_returned, time_published";

/// Persistor backed by a single SQLite connection
pub struct SqlitePersistor {
    conn: Mutex<Connection>,
}

impl SqlitePersistor {
    /// Open (or create) the database at `location`; `:memory:` is private to this handle
    pub fn open(location: &str, busy_timeout: Duration) -> StoreResult<Self> {
        debug!(%location, ?busy_timeout, "SqlitePersistor::open: called");
        let conn = if location == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(location)?
        };
        conn.busy_timeout(busy_timeout)?;
        setup_database(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(":memory:", Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Operational("connection lock poisoned".to_string()))
    }
}

/// Idempotent schema creation
fn setup_database(conn: &Connection) -> StoreResult<()> {
    debug!("setup_database: called");
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn timestamp_param(ts: &Option<NaiveDateTime>) -> Option<String> {
    ts.as_ref().map(format_timestamp)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        parse_timestamp(&t).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<FileState> {
    Ok(FileState {
        persist_id: PersistId::from(row.get::<_, String>(0)?),
        file_hash: row.get(1)?,
        engine_name: row.get(2)?,
        checkpoint_name: row.get(3)?,
        checkpoint_time: timestamp_column(row, 4)?,
        file_size: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        file_name: row.get(6)?,
        os_type: row.get(7)?,
        time_sent: timestamp_column(row, 8)?,
        time_returned: timestamp_column(row, 9)?,
        time_published: timestamp_column(row, 10)?,
    })
}

fn query_states<P: Params>(conn: &Connection, sql: &str, params: P) -> StoreResult<Vec<FileState>> {
    let mut stmt = conn.prepare(sql)?;
    let states = stmt
        .query_map(params, state_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(states)
}

/// Update the (hash, engine) row from `state`, inserting it when absent
fn write_state(conn: &Connection, state: &FileState) -> StoreResult<PersistId> {
    let checkpoint_time = timestamp_param(&state.checkpoint_time);
    let file_size = state.file_size.map(|v| v as i64);
    let existing: Option<String> = conn
        .query_row(
            "UPDATE run_state SET checkpoint_name = ?3, checkpoint_time = COALESCE(?4, datetime('now')),
                file_size = ?5, file_name = ?6, os_type = ?7,
                time_sent = ?8, time_returned = ?9, time_published = ?10
                WHERE file_hash = ?1 AND engine_name = ?2
                RETURNING persist_id",
            params![
                state.file_hash,
                state.engine_name,
                state.checkpoint_name,
                checkpoint_time,
                file_size,
                state.file_name,
                state.os_type,
                timestamp_param(&state.time_sent),
                timestamp_param(&state.time_returned),
                timestamp_param(&state.time_published),
            ],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => Ok(PersistId::from(id)),
        None => {
            debug!(persist_id = %state.persist_id, "write_state: no row, inserting");
            conn.execute(
                &format!(
                    "INSERT INTO run_state ({STATE_COLUMNS})
                        VALUES (?1, ?2, ?3, ?4, COALESCE(?5, datetime('now')), ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    state.persist_id.as_str(),
                    state.file_hash,
                    state.engine_name,
                    state.checkpoint_name,
                    checkpoint_time,
                    file_size,
                    state.file_name,
                    state.os_type,
                    timestamp_param(&state.time_sent),
                    timestamp_param(&state.time_returned),
                    timestamp_param(&state.time_published),
                ],
            )?;
            Ok(state.persist_id.clone())
        }
    }
}

impl Persistor for SqlitePersistor {
    fn set_checkpoint(
        &self,
        hash: &str,
        engine: &str,
        checkpoint_name: &str,
        checkpoint_time: Option<NaiveDateTime>,
    ) -> StoreResult<()> {
        debug!(%hash, %engine, %checkpoint_name, "SqlitePersistor::set_checkpoint: called");
        let time = timestamp_param(&checkpoint_time);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // update first so concurrent writers converge on the existing row
        let updated = tx.execute(
            "UPDATE run_state SET checkpoint_name = ?1, checkpoint_time = COALESCE(?2, datetime('now'))
                WHERE file_hash = ?3 AND engine_name = ?4",
            params![checkpoint_name, time, hash, engine],
        )?;
        if updated == 0 {
            debug!(%hash, %engine, "SqlitePersistor::set_checkpoint: no row, inserting");
            tx.execute(
                "INSERT INTO run_state (persist_id, file_hash, engine_name, checkpoint_name, checkpoint_time)
                    VALUES (?1, ?2, ?3, ?4, COALESCE(?5, datetime('now')))",
                params![PersistId::generate().as_str(), hash, engine, checkpoint_name, time],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_previous_hashes(&self, engine: &str) -> StoreResult<Vec<String>> {
        debug!(%engine, "SqlitePersistor::get_previous_hashes: called");
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT file_hash FROM run_state WHERE engine_name = ?1 AND checkpoint_name = ?2 ORDER BY file_hash",
        )?;
        let hashes = stmt
            .query_map(params![engine, CHECKPOINT_DONE], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(hashes)
    }

    fn get_unfinished_hashes(&self, engine: &str) -> StoreResult<Vec<(String, String)>> {
        debug!(%engine, "SqlitePersistor::get_unfinished_hashes: called");
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT file_hash, checkpoint_name FROM run_state
                WHERE engine_name = ?1 AND checkpoint_name <> ?2 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![engine, CHECKPOINT_DONE], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
        Ok(rows)
    }

    fn prune(&self, cutoff: NaiveDateTime) -> StoreResult<PruneOutcome> {
        let cutoff = format_timestamp(&cutoff);
        debug!(%cutoff, "SqlitePersistor::prune: called");
        let mut conn = self.lock()?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let states_removed = tx.execute(
            "DELETE FROM run_state WHERE julianday(checkpoint_time) < julianday(?1)
                AND (time_sent IS NULL OR julianday(time_sent) < julianday(?1))",
            params![cutoff],
        )?;
        let report_items_removed = tx.execute(
            "DELETE FROM report_item WHERE julianday(created_at) < julianday(?1)",
            params![cutoff],
        )?;
        tx.commit()?;

        // reclaiming space is housekeeping; the delete above is already committed
        let reclaimed = match conn.execute_batch("VACUUM;") {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "SqlitePersistor::prune: VACUUM failed");
                false
            }
        };

        Ok(PruneOutcome {
            states_removed,
            report_items_removed,
            reclaimed,
        })
    }

    fn add_report_item(&self, severity: Severity, engine: &str, data: &Value) -> StoreResult<()> {
        debug!(%severity, %engine, "SqlitePersistor::add_report_item: called");
        let json = serde_json::to_string(data)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO report_item (severity, engine_name, data) VALUES (?1, ?2, ?3)",
            params![i64::from(severity), engine, json],
        )?;
        Ok(())
    }

    fn get_current_report_items(&self, severity: Severity, engine: &str) -> StoreResult<Vec<Value>> {
        debug!(%severity, %engine, "SqlitePersistor::get_current_report_items: called");
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT data FROM report_item WHERE severity = ?1 AND engine_name = ?2 ORDER BY rowid")?;
        let rows = stmt
            .query_map(params![i64::from(severity), engine], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let items = rows
            .iter()
            .map(|text| serde_json::from_str(text))
            .collect::<Result<Vec<Value>, _>>()?;
        Ok(items)
    }

    fn clear_report_items(&self, severity: Severity, engine: &str) -> StoreResult<()> {
        debug!(%severity, %engine, "SqlitePersistor::clear_report_items: called");
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM report_item WHERE severity = ?1 AND engine_name = ?2",
            params![i64::from(severity), engine],
        )?;
        Ok(())
    }

    fn get_file_states(&self, hash: &str) -> StoreResult<Vec<FileState>> {
        debug!(%hash, "SqlitePersistor::get_file_states: called");
        let conn = self.lock()?;
        query_states(
            &conn,
            &format!("SELECT {STATE_COLUMNS} FROM run_state WHERE file_hash = ?1 ORDER BY rowid"),
            params![hash],
        )
    }

    fn get_file_state(&self, hash: &str, engine: &str) -> StoreResult<Option<FileState>> {
        debug!(%hash, %engine, "SqlitePersistor::get_file_state: called");
        let conn = self.lock()?;
        let state = conn
            .query_row(
                &format!("SELECT {STATE_COLUMNS} FROM run_state WHERE file_hash = ?1 AND engine_name = ?2"),
                params![hash, engine],
                state_from_row,
            )
            .optional()?;
        Ok(state)
    }

    fn get_file_state_by_id(&self, persist_id: &PersistId) -> StoreResult<Option<FileState>> {
        debug!(%persist_id, "SqlitePersistor::get_file_state_by_id: called");
        let conn = self.lock()?;
        let state = conn
            .query_row(
                &format!("SELECT {STATE_COLUMNS} FROM run_state WHERE persist_id = ?1"),
                params![persist_id.as_str()],
                state_from_row,
            )
            .optional()?;
        Ok(state)
    }

    fn save_file_state(&self, state: &FileState) -> StoreResult<PersistId> {
        debug!(hash = %state.file_hash, engine = %state.engine_name, "SqlitePersistor::save_file_state: called");
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let persist_id = write_state(&tx, state)?;
        tx.commit()?;
        Ok(persist_id)
    }

    fn merge_file_state(
        &self,
        hash: &str,
        attrs: &FileStateAttrs,
        persist_id: Option<&PersistId>,
    ) -> StoreResult<PersistId> {
        debug!(%hash, ?persist_id, "SqlitePersistor::merge_file_state: called");
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock before the read, so no other writer can interleave
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = match persist_id {
            Some(id) => tx
                .query_row(
                    &format!("SELECT {STATE_COLUMNS} FROM run_state WHERE persist_id = ?1"),
                    params![id.as_str()],
                    state_from_row,
                )
                .optional()?,
            None => tx
                .query_row(
                    &format!("SELECT {STATE_COLUMNS} FROM run_state WHERE file_hash = ?1 AND engine_name = ?2"),
                    params![hash, merge_engine(attrs)?],
                    state_from_row,
                )
                .optional()?,
        };
        let state = merged_state(existing, hash, attrs, persist_id)?;
        let written = write_state(&tx, &state)?;
        tx.commit()?;
        Ok(written)
    }

    fn get_engine_states(&self, engine: &str) -> StoreResult<Vec<FileState>> {
        debug!(%engine, "SqlitePersistor::get_engine_states: called");
        let conn = self.lock()?;
        query_states(
            &conn,
            &format!("SELECT {STATE_COLUMNS} FROM run_state WHERE engine_name = ?1 ORDER BY rowid"),
            params![engine],
        )
    }

    fn get_unfinished_states(&self, engine: &str) -> StoreResult<Vec<FileState>> {
        debug!(%engine, "SqlitePersistor::get_unfinished_states: called");
        let conn = self.lock()?;
        query_states(
            &conn,
            &format!(
                "SELECT {STATE_COLUMNS} FROM run_state WHERE engine_name = ?1 AND time_returned IS NULL ORDER BY rowid"
            ),
            params![engine],
        )
    }
}

/// Factory for the `sqlite` provider; reads `location` and `busy_timeout_ms`
pub struct SqlitePersistorFactory;

impl PersistorFactory for SqlitePersistorFactory {
    fn create_persistor(&self, config: &Config) -> StoreResult<Arc<dyn Persistor>> {
        let location = config.string("location")?;
        let busy_timeout_ms = config.get("busy_timeout_ms", DEFAULT_BUSY_TIMEOUT_MS)?;
        let persistor = SqlitePersistor::open(&location, Duration::from_millis(busy_timeout_ms))?;
        Ok(Arc::new(persistor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::limits::Limit;
    use serde_json::json;
    use std::thread;
    use tempfile::TempDir;

    fn ts(text: &str) -> NaiveDateTime {
        parse_timestamp(text).unwrap()
    }

    fn sev(value: i64) -> Severity {
        Severity::try_from(value).unwrap()
    }

    fn row_count(persistor: &SqlitePersistor, hash: &str, engine: &str) -> i64 {
        persistor
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM run_state WHERE file_hash = ?1 AND engine_name = ?2",
                params![hash, engine],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_set_checkpoint_is_an_upsert() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        persistor.set_checkpoint("AAA", "default", "SENT", None).unwrap();
        persistor.set_checkpoint("AAA", "default", "SENT", None).unwrap();
        assert_eq!(row_count(&persistor, "AAA", "default"), 1);

        persistor.set_checkpoint("AAA", "default", "DONE", None).unwrap();
        assert_eq!(row_count(&persistor, "AAA", "default"), 1);
        assert_eq!(persistor.get_previous_hashes("default").unwrap(), vec!["AAA".to_string()]);
    }

    #[test]
    fn test_set_checkpoint_with_explicit_time() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        persistor
            .set_checkpoint("AAA", "default", "SENT", Some(ts("2020-01-10T12:00:00")))
            .unwrap();
        let state = persistor.get_file_state("AAA", "default").unwrap().unwrap();
        assert_eq!(state.checkpoint_name, "SENT");
        assert_eq!(state.checkpoint_time, Some(ts("2020-01-10T12:00:00")));
    }

    #[test]
    fn test_concurrent_checkpoints_converge_on_one_row() {
        let persistor = Arc::new(SqlitePersistor::open_in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let persistor = Arc::clone(&persistor);
                thread::spawn(move || {
                    persistor
                        .set_checkpoint("SHARED", "default", &format!("STEP{}", i), None)
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(row_count(&persistor, "SHARED", "default"), 1);
    }

    #[test]
    fn test_previous_hashes_sorted_and_filtered() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        persistor.set_checkpoint("CCC", "default", "DONE", None).unwrap();
        persistor.set_checkpoint("AAA", "default", "DONE", None).unwrap();
        persistor.set_checkpoint("BBB", "default", "SENT", None).unwrap();
        persistor.set_checkpoint("DDD", "other", "DONE", None).unwrap();
        assert_eq!(
            persistor.get_previous_hashes("default").unwrap(),
            vec!["AAA".to_string(), "CCC".to_string()]
        );
    }

    #[test]
    fn test_unfinished_hashes() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        persistor.set_checkpoint("AAA", "default", "DONE", None).unwrap();
        persistor.set_checkpoint("BBB", "default", "SENT", None).unwrap();
        persistor.set_checkpoint("CCC", "default", "INGESTED", None).unwrap();
        let unfinished = persistor.get_unfinished_hashes("default").unwrap();
        assert_eq!(
            unfinished,
            vec![
                ("BBB".to_string(), "SENT".to_string()),
                ("CCC".to_string(), "INGESTED".to_string())
            ]
        );
        assert!(persistor.get_unfinished_hashes("other").unwrap().is_empty());
    }

    #[test]
    fn test_prune_by_checkpoint_time() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        persistor
            .set_checkpoint("OLD", "default", "DONE", Some(ts("2020-01-10T12:00:00")))
            .unwrap();
        persistor
            .set_checkpoint("NEW", "default", "DONE", Some(ts("2020-01-15T12:00:00")))
            .unwrap();
        let outcome = persistor.prune(ts("2020-01-12T00:00:00")).unwrap();
        assert_eq!(outcome.states_removed, 1);
        assert!(outcome.reclaimed);
        assert_eq!(persistor.get_previous_hashes("default").unwrap(), vec!["NEW".to_string()]);
    }

    #[test]
    fn test_prune_keeps_recent_report_items() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        persistor.add_report_item(sev(3), "default", &json!({"ioc": 1})).unwrap();
        let outcome = persistor.prune(ts("2000-01-01T00:00:00")).unwrap();
        assert_eq!(outcome.report_items_removed, 0);
        assert_eq!(persistor.get_current_report_items(sev(3), "default").unwrap().len(), 1);

        let outcome = persistor.prune(ts("2999-01-01T00:00:00")).unwrap();
        assert_eq!(outcome.report_items_removed, 1);
    }

    #[test]
    fn test_report_items_accumulate_and_clear() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        let item = json!({"id": "ioc-1", "match_type": "equality", "values": ["127.0.0.1"], "severity": 2});
        persistor.add_report_item(sev(2), "default", &item).unwrap();
        persistor.add_report_item(sev(2), "default", &item).unwrap();
        persistor.add_report_item(sev(5), "default", &json!({"id": "ioc-2"})).unwrap();
        persistor.add_report_item(sev(2), "other", &json!({"id": "ioc-3"})).unwrap();

        let items = persistor.get_current_report_items(sev(2), "default").unwrap();
        assert_eq!(items, vec![item.clone(), item]);

        persistor.clear_report_items(sev(2), "default").unwrap();
        assert!(persistor.get_current_report_items(sev(2), "default").unwrap().is_empty());
        assert_eq!(persistor.get_current_report_items(sev(5), "default").unwrap().len(), 1);
        assert_eq!(persistor.get_current_report_items(sev(2), "other").unwrap().len(), 1);
    }

    #[test]
    fn test_save_file_state_upserts_by_hash_and_engine() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        let mut first = FileState::new("AAA", "default");
        first.file_name = Some("blort.exe".to_string());
        let id = persistor.save_file_state(&first).unwrap();
        assert_eq!(id, first.persist_id);

        // a second record for the same key keeps the original row and id
        let mut second = FileState::new("AAA", "default");
        second.file_size = Some(42);
        let id2 = persistor.save_file_state(&second).unwrap();
        assert_eq!(id2, first.persist_id);
        assert_eq!(row_count(&persistor, "AAA", "default"), 1);

        let stored = persistor.get_file_state_by_id(&id).unwrap().unwrap();
        assert_eq!(stored.file_size, Some(42));
    }

    #[test]
    fn test_missing_table_is_operational() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        persistor.lock().unwrap().execute_batch("DROP TABLE report_item;").unwrap();
        let err = persistor.add_report_item(sev(1), "default", &json!({})).unwrap_err();
        assert!(err.is_operational(), "unexpected error: {err}");
        let err = persistor.get_current_report_items(sev(1), "default").unwrap_err();
        assert!(err.is_operational());
    }

    #[test]
    fn test_duplicate_key_is_a_constraint_violation() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        persistor.set_checkpoint("AAA", "default", "SENT", None).unwrap();
        let err: StoreError = persistor
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO run_state (persist_id, file_hash, engine_name, checkpoint_name, checkpoint_time)
                    VALUES ('x', 'AAA', 'default', 'SENT', datetime('now'))",
                [],
            )
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let location = path.to_str().unwrap();
        {
            let persistor = SqlitePersistor::open(location, Duration::from_millis(100)).unwrap();
            persistor.set_checkpoint("AAA", "default", "DONE", None).unwrap();
            persistor.set_checkpoint("BBB", "default", "SENT", None).unwrap();
        }
        // schema setup runs again against the existing file
        let persistor = SqlitePersistor::open(location, Duration::from_millis(100)).unwrap();
        assert_eq!(persistor.get_previous_hashes("default").unwrap(), vec!["AAA".to_string()]);
        assert_eq!(persistor.get_unfinished_hashes("default").unwrap().len(), 1);
    }

    #[test]
    fn test_prune_commits_even_when_vacuum_fails() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        persistor
            .set_checkpoint("OLD", "default", "DONE", Some(ts("2020-01-10T12:00:00")))
            .unwrap();
        persistor
            .set_checkpoint("NEW", "default", "DONE", Some(ts("2020-01-15T12:00:00")))
            .unwrap();

        // VACUUM works through an internal ATTACH, so forbidding attachments makes it fail
        persistor
            .lock()
            .unwrap()
            .set_limit(Limit::SQLITE_LIMIT_ATTACHED, 0)
            .unwrap();

        let outcome = persistor.prune(ts("2020-01-12T00:00:00")).unwrap();
        assert_eq!(outcome.states_removed, 1);
        assert!(!outcome.reclaimed);
        assert!(persistor.get_file_state("OLD", "default").unwrap().is_none());
        assert_eq!(persistor.get_previous_hashes("default").unwrap(), vec!["NEW".to_string()]);
    }

    #[test]
    fn test_concurrent_merges_keep_every_field() {
        let persistor = Arc::new(SqlitePersistor::open_in_memory().unwrap());
        for round in 0..50 {
            let hash = format!("HASH{:03}", round);
            let id = persistor
                .merge_file_state(&hash, &FileStateAttrs::for_engine("default"), None)
                .unwrap();

            let returned = FileStateAttrs {
                time_returned: Some(ts("2020-01-15T12:05:00")),
                ..Default::default()
            };
            let published = FileStateAttrs {
                time_published: Some(ts("2020-01-15T12:05:01")),
                ..Default::default()
            };
            let handles: Vec<_> = [returned, published]
                .into_iter()
                .map(|attrs| {
                    let persistor = Arc::clone(&persistor);
                    let hash = hash.clone();
                    let id = id.clone();
                    thread::spawn(move || persistor.merge_file_state(&hash, &attrs, Some(&id)).unwrap())
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), id);
            }

            let state = persistor.get_file_state(&hash, "default").unwrap().unwrap();
            assert!(state.time_returned.is_some(), "round {} lost time_returned", round);
            assert!(state.time_published.is_some(), "round {} lost time_published", round);
        }
    }

    #[test]
    fn test_merge_by_id_checks_identity() {
        let persistor = SqlitePersistor::open_in_memory().unwrap();
        let id = persistor
            .merge_file_state("AAA", &FileStateAttrs::for_engine("default"), None)
            .unwrap();
        assert!(matches!(
            persistor.merge_file_state("BBB", &FileStateAttrs::default(), Some(&id)),
            Err(StoreError::IdentityMismatch { .. })
        ));
        assert!(matches!(
            persistor.merge_file_state("AAA", &FileStateAttrs::default(), Some(&PersistId::generate())),
            Err(StoreError::NotFound(_))
        ));
    }
}
