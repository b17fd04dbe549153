//! Engine result documents as they arrive on the result topic

use serde::{Deserialize, Serialize};
use serde_json::Value;
use statestore::{Severity, StoreError};

/// One engine's verdict on one binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResult {
    pub binary_hash: String,

    /// Engine that produced the result; absent means "the monitor's engine"
    #[serde(default)]
    pub engine_name: Option<String>,

    #[serde(default)]
    pub success: Option<bool>,

    /// Findings, each carrying an integer `severity` plus arbitrary fields
    #[serde(default)]
    pub iocs: Vec<Value>,
}

impl EngineResult {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Severity bucket a finding belongs in
pub fn finding_severity(finding: &Value) -> Result<Severity, StoreError> {
    let raw = finding
        .get("severity")
        .and_then(Value::as_i64)
        .ok_or_else(|| StoreError::InvalidArgument("finding has no integer severity".to_string()))?;
    Severity::try_from(raw)
}
