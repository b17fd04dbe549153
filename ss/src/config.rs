//! Configuration document for the binary analysis toolkit
//!
//! A YAML document addressed by dotted paths (`database.location`,
//! `engine.name`, ...). The top level must carry the toolkit identity and a
//! supported version; sections below it are handed to backends unvalidated.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_yaml::Value;
use thiserror::Error;
use tracing::debug;

/// Identity every top-level configuration document must declare
pub const REQUIRED_ID: &str = "cbc_binary_toolkit";

/// Major document versions this crate understands
pub const SUPPORTED_MAJOR_VERSIONS: &[u64] = &[0, 1];

/// Errors raised while loading or reading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Load error: {0}")]
    Parse(String),

    #[error("Invalid configuration ID: {0:?}")]
    InvalidId(Option<String>),

    #[error("Invalid configuration version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration data format")]
    InvalidFormat,

    #[error("Missing configuration value: {0}")]
    MissingPath(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Value at {path} is not {expected}")]
    WrongType { path: String, expected: &'static str },

    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },
}

/// Path-addressable configuration document
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    data: Value,
}

impl Config {
    /// Parse and validate a top-level configuration document
    pub fn load(text: &str) -> Result<Self, ConfigError> {
        debug!(len = text.len(), "Config::load: called");
        let data: Value = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if !data.is_mapping() {
            return Err(ConfigError::InvalidFormat);
        }

        let id = data.get("id").and_then(Value::as_str);
        if id != Some(REQUIRED_ID) {
            return Err(ConfigError::InvalidId(id.map(str::to_string)));
        }
        validate_version(data.get("version"))?;

        Ok(Self { data })
    }

    /// Read and parse a configuration file
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Config::load_file: called");
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::load(&text)
    }

    /// Walk a dotted path; `Ok(None)` when some component is absent
    fn seek(&self, path: &str) -> Result<Option<&Value>, ConfigError> {
        let mut current = &self.data;
        for part in path.split('.') {
            let Value::Mapping(map) = current else {
                return Err(ConfigError::InvalidPath(path.to_string()));
            };
            match map.get(part) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn require(&self, path: &str) -> Result<&Value, ConfigError> {
        self.seek(path)?.ok_or_else(|| ConfigError::MissingPath(path.to_string()))
    }

    /// Required string value
    pub fn string(&self, path: &str) -> Result<String, ConfigError> {
        debug!(%path, "Config::string: called");
        self.require(path)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ConfigError::WrongType {
                path: path.to_string(),
                expected: "a string",
            })
    }

    /// String value, or `default` when absent or not a string
    pub fn string_default(&self, path: &str, default: &str) -> String {
        match self.seek(path) {
            Ok(Some(Value::String(s))) => s.clone(),
            _ => default.to_string(),
        }
    }

    /// Sub-document rooted at `path`; `a.section("x")?.string("y") == a.string("x.y")`
    pub fn section(&self, path: &str) -> Result<Config, ConfigError> {
        debug!(%path, "Config::section: called");
        let value = self.require(path)?;
        if !value.is_mapping() {
            return Err(ConfigError::WrongType {
                path: path.to_string(),
                expected: "a section",
            });
        }
        Ok(Config { data: value.clone() })
    }

    /// Typed value, or `default` when absent
    pub fn get<T: DeserializeOwned>(&self, path: &str, default: T) -> Result<T, ConfigError> {
        match self.seek(path)? {
            None | Some(Value::Null) => Ok(default),
            Some(value) => serde_yaml::from_value(value.clone()).map_err(|_| ConfigError::WrongType {
                path: path.to_string(),
                expected: std::any::type_name::<T>(),
            }),
        }
    }
}

fn validate_version(version: Option<&Value>) -> Result<(), ConfigError> {
    let text = match version {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => return Err(ConfigError::InvalidVersion(format!("{:?}", other))),
        None => return Err(ConfigError::InvalidVersion("missing".to_string())),
    };

    let major = text
        .split('.')
        .next()
        .and_then(|m| m.trim().parse::<u64>().ok())
        .ok_or_else(|| ConfigError::InvalidVersion(text.clone()))?;
    if !SUPPORTED_MAJOR_VERSIONS.contains(&major) {
        return Err(ConfigError::InvalidVersion(text));
    }
    Ok(())
}
