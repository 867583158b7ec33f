//! Error types for the description model
//!
//! Runtime failures live in `orrery-runtime`; this crate only reports
//! problems with the declarations themselves.

use crate::description::InvalidDescription;
use crate::filter::FilterError;
use thiserror::Error;

/// Errors raised while parsing or validating declarations
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A description failed validation
    #[error(transparent)]
    InvalidDescription(#[from] InvalidDescription),

    /// A target filter failed to parse
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// A manifest document could not be read
    #[error("Manifest error: {message}")]
    Manifest {
        /// Error message describing the parse failure
        message: String,
    },
}

impl CoreError {
    /// Create a manifest error
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }
}

/// Standard Result type for description model operations
pub type Result<T> = std::result::Result<T, CoreError>;
