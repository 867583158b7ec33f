//! Runtime error types
//!
//! Activation failures are recoverable and never leave the worker: they are
//! logged, the configuration reverts to a resolvable state, and the next
//! relevant capability event retries it. `EngineError` is what public calls
//! return; hook failures are never surfaced through it.

use orrery_core::{ConfigurationId, CoreError, FactoryId, InvalidDescription};
use std::fmt;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure reported by a user hook or constructor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    /// Create a hook error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Wrap any error
    pub fn from_error(error: &dyn std::error::Error) -> Self {
        Self::new(error.to_string())
    }

    /// Build from a caught panic payload
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(format!("panicked: {detail}"))
    }

    /// Human readable message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Why an activation attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivationError {
    /// Mandatory references could not be bound at activation time
    #[error("references unsatisfiable: {}", missing.join(", "))]
    ReferencesUnsatisfiable {
        /// Names of the unbound mandatory references
        missing: Vec<String>,
    },

    /// The implementation constructor failed
    #[error("constructor failed: {0}")]
    ConstructorFailed(HookError),

    /// The activation hook failed
    #[error("activation hook failed: {0}")]
    ActivationHookThrew(HookError),

    /// The description no longer passes validation
    #[error(transparent)]
    InvalidDescription(InvalidDescription),

    /// No constructor is registered under the implementation key
    #[error("no implementation registered for '{0}'")]
    MissingImplementation(String),

    /// The configuration is already mid-activation on this call chain
    #[error("circular activation of {0}")]
    Circular(ConfigurationId),

    /// The configuration is gone or in a state that cannot activate
    #[error("{0} cannot be activated in its current state")]
    NotActivatable(ConfigurationId),
}

/// Work queue failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue no longer accepts jobs
    #[error("work queue is closed")]
    Closed,

    /// The worker thread could not be started
    #[error("failed to start worker thread: {0}")]
    Spawn(String),
}

/// Errors returned by public engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is shutting down or has shut down
    #[error("engine is shutting down")]
    ShuttingDown,

    /// No factory description with this id is enabled
    #[error("factory '{0}' not found")]
    FactoryNotFound(FactoryId),

    /// The factory exists but its references are not satisfied
    #[error("factory '{0}' is not satisfied")]
    FactoryUnsatisfied(FactoryId),

    /// Unknown configuration
    #[error("configuration {0} not found")]
    ConfigurationNotFound(ConfigurationId),

    /// A requested activation failed
    #[error("activation of {config} failed: {source}")]
    Activation {
        /// Configuration that failed
        config: ConfigurationId,
        /// Underlying reason
        #[source]
        source: ActivationError,
    },

    /// A request was dropped by the worker before it completed
    #[error("request was abandoned by the worker")]
    Abandoned,

    /// Work queue failure
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Declaration failure
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Invalid engine configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Create an activation error
    pub fn activation(config: ConfigurationId, source: ActivationError) -> Self {
        Self::Activation { config, source }
    }
}

/// Engine configuration failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read config file {path}: {message}")]
    Io {
        /// File path
        path: String,
        /// Underlying I/O message
        message: String,
    },

    /// The configuration text could not be parsed
    #[error("Invalid config: {message}")]
    Parse {
        /// Parser message
        message: String,
    },

    /// A field holds an unusable value
    #[error("Invalid value for {field}: {message}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        message: String,
    },
}

/// Why an instance is being deactivated, passed to the deactivation hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum DeactivationReason {
    /// Explicitly disabled
    Disabled,
    /// The owning deployment unit went away
    UnitUnavailable,
    /// A statically bound capability departed
    ReferenceDeparted,
    /// A mandatory reference lost its last capability
    Unsatisfied,
    /// A factory-produced configuration was disposed
    Disposed,
    /// The last consumer of a delayed instance released it
    Released,
    /// Configuration properties changed
    ConfigurationChanged,
    /// Activation failed after the instance was constructed
    ActivationFailed,
    /// The engine is shutting down
    Shutdown,
}

impl fmt::Display for DeactivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeactivationReason::Disabled => "disabled",
            DeactivationReason::UnitUnavailable => "unit unavailable",
            DeactivationReason::ReferenceDeparted => "reference departed",
            DeactivationReason::Unsatisfied => "unsatisfied",
            DeactivationReason::Disposed => "disposed",
            DeactivationReason::Released => "released",
            DeactivationReason::ConfigurationChanged => "configuration changed",
            DeactivationReason::ActivationFailed => "activation failed",
            DeactivationReason::Shutdown => "shutdown",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_error_display() {
        let err = ActivationError::ReferencesUnsatisfiable {
            missing: vec!["log".to_string(), "store".to_string()],
        };
        assert_eq!(err.to_string(), "references unsatisfiable: log, store");

        let err = EngineError::activation(
            ConfigurationId(4),
            ActivationError::ConstructorFailed(HookError::new("boom")),
        );
        assert!(err.to_string().contains("config-4"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_hook_error_from_panic_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("kaboom");
        assert_eq!(HookError::from_panic(payload.as_ref()).message(), "panicked: kaboom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(HookError::from_panic(payload.as_ref()).message(), "panicked: owned");
    }
}
