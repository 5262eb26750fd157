//! Core domain errors.

use thiserror::Error;

/// Core domain errors for packo.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Job name is not a valid resource name.
    #[error("Invalid job name '{name}': {reason}")]
    InvalidJobName { name: String, reason: String },

    /// An artifact or builder reference is malformed.
    #[error("Invalid reference '{0}'")]
    InvalidReference(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
