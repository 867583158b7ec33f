//! Engine configuration
//!
//! Loaded from TOML, then overridden by `ORRERY_*` environment variables:
//!
//! ```toml
//! worker_name = "orrery-worker"
//! keep_delayed_instances = false
//! max_resolve_passes = 64
//! auto_enable_units = true
//! ```

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "ORRERY_";

/// Runtime tuning knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Name of the work queue thread
    pub worker_name: String,
    /// Keep delayed singletons alive after the last consumer releases them
    pub keep_delayed_instances: bool,
    /// Upper bound on worklist passes per resolve cycle
    pub max_resolve_passes: usize,
    /// Enable `auto_enable` descriptions when their unit becomes available
    pub auto_enable_units: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_name: "orrery-worker".to_string(),
            keep_delayed_instances: false,
            max_resolve_passes: 64,
            auto_enable_units: true,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Read and parse a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `ORRERY_*` overrides from the process environment
    pub fn merge_with_env(&mut self) -> Result<(), ConfigError> {
        self.merge_with_vars(std::env::vars())
    }

    /// Apply overrides from an explicit variable list
    ///
    /// Unknown `ORRERY_*` names are ignored so unrelated tooling can share
    /// the prefix.
    pub fn merge_with_vars<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name.to_ascii_lowercase().as_str() {
                "worker_name" => self.worker_name = value,
                "keep_delayed_instances" => {
                    self.keep_delayed_instances = parse_bool("keep_delayed_instances", &value)?
                }
                "max_resolve_passes" => {
                    self.max_resolve_passes =
                        value.trim().parse().map_err(|_| ConfigError::Invalid {
                            field: "max_resolve_passes",
                            message: format!("'{value}' is not a positive integer"),
                        })?
                }
                "auto_enable_units" => {
                    self.auto_enable_units = parse_bool("auto_enable_units", &value)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Check field values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "worker_name",
                message: "must not be empty".to_string(),
            });
        }
        if self.max_resolve_passes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_resolve_passes",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            field,
            message: format!("'{value}' is not a boolean"),
        }),
    }
}
