//! StateStore - analysis job state for the binary analysis toolkit
//!
//! Tracks, per (file hash, engine) pair, when a file was submitted, when the
//! engine's results came back and when they were published, plus the
//! checkpoint the job is at and the findings (report items) it produced.
//!
//! # Layout
//!
//! - [`config`] - path-addressable YAML configuration document
//! - [`persistor`] - storage contract, backend registry, SQLite and in-memory backends
//! - [`manager`] - [`StateManager`] façade: merge semantics, most-recent-wins lookup
//!
//! # Example
//!
//! ```ignore
//! use statestore::{Config, FileStateAttrs, StateManager};
//!
//! let config = Config::load_file("config/binary-analysis-config.yaml")?;
//! let state = StateManager::from_config(&config)?;
//! let id = state.set_file_state("ABCDEFGH", &FileStateAttrs::for_engine("yara"), None)?;
//! let current = state.lookup("ABCDEFGH", None)?;
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod persistor;

pub use config::{Config, ConfigError};
pub use error::{StoreError, StoreResult};
pub use manager::StateManager;
pub use model::{
    CHECKPOINT_DONE, CHECKPOINT_NEW, FileState, FileStateAttrs, PersistId, PruneOutcome, Severity, format_timestamp,
    parse_timestamp,
};
pub use persistor::{
    MemoryPersistor, MemoryPersistorFactory, Persistor, PersistorFactory, PersistorRegistry, SqlitePersistor,
    SqlitePersistorFactory,
};
