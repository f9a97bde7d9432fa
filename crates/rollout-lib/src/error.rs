//! Error types for the rollout engine
//!
//! Three layers, from the outside in:
//! - [`StoreError`]: anything that went wrong talking to the resource store
//! - [`ShapeError`]: a loosely-typed document did not have the expected shape
//! - [`RolloutError`]: what a single reconciliation cycle reports to the driver

use thiserror::Error;

/// Errors returned by a [`crate::store::ResourceStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The addressed resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The resume point of a watch is too old to be served.
    #[error("resource version expired: {0}")]
    Expired(String),

    /// The write conflicted with a concurrent modification.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other I/O or API failure. Retried on the next cycle.
    #[error("resource store request failed: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Navigation through a generic document hit a node of the wrong type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("expected {expected} at '{path}', found {found}")]
pub struct ShapeError {
    pub path: String,
    pub expected: &'static str,
    pub found: &'static str,
}

/// Errors that abort the reconciliation of a single recommendation.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A malformed override annotation or an unusable recommendation.
    #[error("invalid configuration for {key}: {reason}")]
    Configuration { key: String, reason: String },

    #[error("malformed document: {0}")]
    Shape(#[from] ShapeError),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl RolloutError {
    pub fn configuration(key: impl Into<String>, reason: impl Into<String>) -> Self {
        RolloutError::Configuration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RolloutError::Store(_) => "store",
            RolloutError::Configuration { .. } => "configuration",
            RolloutError::Shape(_) => "shape",
            RolloutError::Invariant(_) => "invariant",
        }
    }
}

impl From<serde_json::Error> for RolloutError {
    fn from(err: serde_json::Error) -> Self {
        RolloutError::Invariant(format!("document decoding failed: {}", err))
    }
}

pub type Result<T, E = RolloutError> = std::result::Result<T, E>;
