//! Error types for the HMS billing engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine error type.
///
/// Every engine operation returns exactly one of these kinds. Callers retry
/// `Internal` only, surface `Validation` and `Conflict` to the user, and
/// treat `NotFound` as absence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// Malformed input (negative units, tier gaps, bad discount code)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing subscription, plan, rule, alert, ...
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state transition or uniqueness violation
    #[error("conflict: {0}")]
    Conflict(String),

    /// Persistence or unexpected failure
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classification, stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`BillingError::Validation`]
    Validation,
    /// See [`BillingError::NotFound`]
    NotFound,
    /// See [`BillingError::Conflict`]
    Conflict,
    /// See [`BillingError::Internal`]
    Internal,
}

impl BillingError {
    /// Shorthand for a `NotFound` naming the missing entity
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} {}", what, id))
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only internal failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// Result type for engine operations
pub type BillingResult<T> = Result<T, BillingError>;

/// Persistence port errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Record absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Stale version, duplicate or forbidden transition
    #[error("conflict: {0}")]
    Conflict(String),

    /// Write rejected by a check only the store can make atomically
    #[error("invalid: {0}")]
    Invalid(String),

    /// Backend failure
    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence result type
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::Invalid(msg) => Self::Validation(msg),
            StoreError::Storage(msg) => Self::Internal(msg),
        }
    }
}
