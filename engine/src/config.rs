//! Engine configuration module.
//!
//! This module loads the storage engine configuration from environment
//! variables.
//!
//! # Environment Variables
//!
//! - `ENGINE_DATA_FILE`: Path of the index file (default: `./data/engine.db`)
//! - `ENGINE_TREE_WIDTH`: Maximum items or children per node (default: `32`)
//! - `ENGINE_VALUE_SIZE`: Size in bytes of every stored row (default: `64`)
//!
//! # Invariants
//!
//! - `tree_width` is at least [`MIN_WIDTH`]
//! - `value_size` is at least 1 and leaves room for `tree_width` rows per page

use std::path::PathBuf;

use crate::bptree::MIN_WIDTH;
use crate::storage::{internal_capacity, leaf_capacity};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Path of the file holding the clustered index.
    pub data_file: PathBuf,
    /// Tree width: maximum items per leaf and children per internal node.
    pub tree_width: usize,
    /// Fixed row size in bytes.
    pub value_size: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from(Self::DEFAULT_DATA_FILE),
            tree_width: Self::DEFAULT_TREE_WIDTH,
            value_size: Self::DEFAULT_VALUE_SIZE,
        }
    }
}

impl EngineConfig {
    /// Default index file path.
    pub const DEFAULT_DATA_FILE: &'static str = "./data/engine.db";
    /// Default tree width.
    pub const DEFAULT_TREE_WIDTH: usize = 32;
    /// Default row size.
    pub const DEFAULT_VALUE_SIZE: usize = 64;

    /// Load configuration from environment variables.
    ///
    /// Unset variables take their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through a variable lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_file = lookup("ENGINE_DATA_FILE")
            .map_or_else(|| PathBuf::from(Self::DEFAULT_DATA_FILE), PathBuf::from);
        let tree_width = load_usize(&lookup, "ENGINE_TREE_WIDTH", Self::DEFAULT_TREE_WIDTH)?;
        let value_size = load_usize(&lookup, "ENGINE_VALUE_SIZE", Self::DEFAULT_VALUE_SIZE)?;

        if tree_width < MIN_WIDTH {
            return Err(invalid(
                "ENGINE_TREE_WIDTH",
                format!("must be at least {MIN_WIDTH}"),
            ));
        }
        if tree_width > internal_capacity() {
            return Err(invalid(
                "ENGINE_TREE_WIDTH",
                format!("must be at most {}", internal_capacity()),
            ));
        }
        if value_size == 0 {
            return Err(invalid("ENGINE_VALUE_SIZE", "must not be zero".to_string()));
        }
        if leaf_capacity(value_size) < tree_width {
            return Err(invalid(
                "ENGINE_VALUE_SIZE",
                format!("{value_size}-byte rows do not fit {tree_width} to a page"),
            ));
        }

        Ok(Self {
            data_file,
            tree_width,
            value_size,
        })
    }
}

fn load_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    lookup(name).map_or(Ok(default), |value| {
        value
            .parse::<usize>()
            .map_err(|_| invalid(name, format!("'{value}' is not a valid number")))
    })
}

fn invalid(name: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = EngineConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.data_file, PathBuf::from("./data/engine.db"));
        assert_eq!(config.tree_width, 32);
        assert_eq!(config.value_size, 64);
    }

    #[test]
    fn test_values_from_variables() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("ENGINE_DATA_FILE", "/tmp/rows.db"),
            ("ENGINE_TREE_WIDTH", "8"),
            ("ENGINE_VALUE_SIZE", "16"),
        ]))
        .expect("config");
        assert_eq!(config.data_file, PathBuf::from("/tmp/rows.db"));
        assert_eq!(config.tree_width, 8);
        assert_eq!(config.value_size, 16);
    }

    #[test]
    fn test_width_below_minimum() {
        let result = EngineConfig::from_lookup(lookup(&[("ENGINE_TREE_WIDTH", "2")]));
        assert_eq!(
            result,
            Err(ConfigError::InvalidValue {
                name: "ENGINE_TREE_WIDTH".to_string(),
                message: "must be at least 3".to_string(),
            })
        );
    }

    #[test]
    fn test_unparsable_number() {
        let result = EngineConfig::from_lookup(lookup(&[("ENGINE_VALUE_SIZE", "big")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { name, .. }) if name == "ENGINE_VALUE_SIZE"
        ));
    }

    #[test]
    fn test_rows_must_fit_width_per_page() {
        let result = EngineConfig::from_lookup(lookup(&[
            ("ENGINE_TREE_WIDTH", "64"),
            ("ENGINE_VALUE_SIZE", "1000"),
        ]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { name, .. }) if name == "ENGINE_VALUE_SIZE"
        ));

        let result = EngineConfig::from_lookup(lookup(&[("ENGINE_VALUE_SIZE", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let error = invalid("TEST_VAR", "bad value".to_string());
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}
