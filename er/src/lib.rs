//! EngineResults - watches an analysis engine's result topic
//!
//! Results arrive as JSON documents on an in-process topic. The
//! [`EngineResultsMonitor`] records each returned hash in the state store,
//! files the findings by severity and reports when the engine has answered
//! for everything it was sent. A [`TimeoutSignal`] fires when the engine goes
//! quiet for longer than its configured timeout.

pub mod cli;
pub mod messages;
pub mod monitor;
pub mod pubsub;

pub use messages::{EngineResult, finding_severity};
pub use monitor::{EngineResultsMonitor, MonitorConfig, MonitorHandle, MonitorState, TimeoutSignal};
pub use pubsub::{PubSubError, PubSubManager};
