//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while building core values from untrusted input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An artifact reference was empty or malformed.
    #[error("invalid artifact reference: {0}")]
    InvalidArtifactRef(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_artifact_ref(msg: impl Into<String>) -> Self {
        Self::InvalidArtifactRef(msg.into())
    }
}
