//! Parse errors for prefixed identifiers.

use thiserror::Error;

/// Why a string was rejected as a prefixed identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier has no '_' separator")]
    MissingSeparator,

    #[error("wrong identifier prefix: expected '{expected}', got '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("identifier body is not a ULID: {0}")]
    BadUlid(String),
}

impl IdError {
    /// True when the string belonged to a different identifier family.
    pub fn is_prefix_mismatch(&self) -> bool {
        matches!(self, IdError::WrongPrefix { .. })
    }
}
