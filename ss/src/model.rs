//! Domain types: file states, persist ids, severities, timestamps

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Terminal checkpoint name
pub const CHECKPOINT_DONE: &str = "DONE";

/// Checkpoint assigned when a file state is first recorded
pub const CHECKPOINT_NEW: &str = "NEW";

/// Storage text format for timestamps (SQLite's canonical `datetime()` form)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const ACCEPTED_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Current time on the process clock, truncated to whole seconds
pub fn now() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    now.with_nanosecond(0).unwrap_or(now)
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored or user-supplied timestamp (space or `T` separator)
pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    let text = text.trim();
    ACCEPTED_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map_or_else(|| NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT), Ok)
}

/// Opaque handle addressing one file-state record across merges
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistId(String);

impl PersistId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PersistId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PersistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Report item severity, 1 (lowest) through 10
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Severity(u8);

impl Severity {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn value(self) -> u8 {
        self.0
    }

    /// All severities, lowest first
    pub fn all() -> impl Iterator<Item = Severity> {
        (Self::MIN..=Self::MAX).map(Severity)
    }
}

impl TryFrom<i64> for Severity {
    type Error = StoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (Self::MIN as i64..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(StoreError::InvalidArgument(format!("severity {} outside 1..=10", value)))
        }
    }
}

impl From<Severity> for i64 {
    fn from(value: Severity) -> Self {
        value.0 as i64
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One logical record per (file_hash, engine_name)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub persist_id: PersistId,
    pub file_hash: String,
    pub engine_name: String,
    pub checkpoint_name: String,
    /// `None` until stored; on save it means "stamp with the storage clock"
    pub checkpoint_time: Option<NaiveDateTime>,
    pub file_size: Option<u64>,
    pub file_name: Option<String>,
    pub os_type: Option<String>,
    pub time_sent: Option<NaiveDateTime>,
    pub time_returned: Option<NaiveDateTime>,
    pub time_published: Option<NaiveDateTime>,
}

impl FileState {
    /// A fresh record with a new persist id
    pub fn new(file_hash: impl Into<String>, engine_name: impl Into<String>) -> Self {
        Self {
            persist_id: PersistId::generate(),
            file_hash: file_hash.into(),
            engine_name: engine_name.into(),
            checkpoint_name: CHECKPOINT_NEW.to_string(),
            checkpoint_time: None,
            file_size: None,
            file_name: None,
            os_type: None,
            time_sent: None,
            time_returned: None,
            time_published: None,
        }
    }

    /// Overwrite the fields present in `attrs`, keeping everything else
    pub fn merge(&mut self, attrs: &FileStateAttrs) {
        if let Some(v) = attrs.file_size {
            self.file_size = Some(v);
        }
        if let Some(v) = &attrs.file_name {
            self.file_name = Some(v.clone());
        }
        if let Some(v) = &attrs.os_type {
            self.os_type = Some(v.clone());
        }
        if let Some(v) = attrs.time_sent {
            self.time_sent = Some(v);
        }
        if let Some(v) = attrs.time_returned {
            self.time_returned = Some(v);
        }
        if let Some(v) = attrs.time_published {
            self.time_published = Some(v);
        }
        if let Some(v) = &attrs.checkpoint_name {
            self.checkpoint_name = v.clone();
        }
    }

    pub fn is_outstanding(&self) -> bool {
        self.time_returned.is_none()
    }

    pub fn is_done(&self) -> bool {
        self.checkpoint_name == CHECKPOINT_DONE
    }

    /// Ordering used to pick one record among several for the same hash
    pub fn cmp_recency(&self, other: &Self) -> Ordering {
        self.time_sent
            .cmp(&other.time_sent)
            .then_with(|| self.checkpoint_time.cmp(&other.checkpoint_time))
    }
}

/// Partial update for a [`FileState`]; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStateAttrs {
    pub engine_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_name: Option<String>,
    pub os_type: Option<String>,
    pub time_sent: Option<NaiveDateTime>,
    pub time_returned: Option<NaiveDateTime>,
    pub time_published: Option<NaiveDateTime>,
    pub checkpoint_name: Option<String>,
}

impl FileStateAttrs {
    pub fn for_engine(engine_name: impl Into<String>) -> Self {
        Self {
            engine_name: Some(engine_name.into()),
            ..Default::default()
        }
    }
}

/// What a prune pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub states_removed: usize,
    pub report_items_removed: usize,
    /// Storage space reclamation ran after the delete
    pub reclaimed: bool,
}
