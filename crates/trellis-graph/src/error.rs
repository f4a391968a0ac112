//! Error types for graph engine operations.

use thiserror::Error;

/// Result type alias for graph engine operations.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Failures surfaced by the engine.
///
/// Every mutation runs inside one transaction, so any of these returned from
/// a mutating call means nothing from that call was persisted.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The element or identification does not exist (or was removed).
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller passed something the engine refuses to act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A denormalized counter would have gone negative. Always a bug.
    #[error("consistency violation on {uri}: {detail}")]
    Consistency { uri: String, detail: String },

    /// Underlying store failure.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Filesystem failure while preparing the database location.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored JSON payload (suggestion origins) could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    pub(crate) fn not_found(uri: impl Into<String>) -> Self {
        GraphError::NotFound(uri.into())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        GraphError::InvalidArgument(message.into())
    }

    pub(crate) fn consistency(uri: impl Into<String>, detail: impl Into<String>) -> Self {
        GraphError::Consistency {
            uri: uri.into(),
            detail: detail.into(),
        }
    }

    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::NotFound(_))
    }

    /// True for `InvalidArgument`.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, GraphError::InvalidArgument(_))
    }
}
