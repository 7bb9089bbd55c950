//! # Error taxonomy
//!
//! Every fallible operation in this crate returns [`Error`], a closed set of
//! typed discriminants. Callers match on the variant, never on message text.
//! Each variant carries the name of the operation that produced it (`op`), so
//! a `NotFound` from `delete` is distinguishable from one raised by
//! `get_node` without parsing strings.
//!
//! Two rules hold throughout the crate:
//!
//! - [`Error::Cancelled`] is never downgraded or swallowed; once a token
//!   fires, the error propagates to the caller as-is.
//! - Violations of internal invariants (e.g. the HNSW key↔id bijection) are
//!   programmer errors and panic rather than surface here.

use thiserror::Error;

/// Convenience alias used by every public operation.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed error set exposed at the crate boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration failed validation at open time.
    #[error("{op}: invalid config: {reason}")]
    InvalidConfig { op: &'static str, reason: String },

    /// A vector's dimensionality disagrees with what the operation requires.
    #[error("{op}: dimension mismatch: expected {expected}, got {got}")]
    InvalidDimension {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// A vector (or its encoded blob) is malformed: empty id, NaN/Inf
    /// components, or an undecodable byte layout.
    #[error("{op}: invalid vector: {reason}")]
    InvalidVector { op: &'static str, reason: String },

    /// The addressed record, collection, node, bank, or edge does not exist.
    #[error("{op}: not found: {id}")]
    NotFound { op: &'static str, id: String },

    /// A search was issued with neither a usable vector nor query text.
    #[error("{op}: empty query")]
    EmptyQuery { op: &'static str },

    /// The store has been closed; no further operations are accepted.
    #[error("{op}: store is closed")]
    StoreClosed { op: &'static str },

    /// The underlying SQLite engine reported a failure. The enclosing
    /// transaction has been rolled back.
    #[error("{op}: storage error: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// The caller's [`CancelToken`](crate::cancel::CancelToken) fired.
    #[error("{op}: cancelled")]
    Cancelled { op: &'static str },
}

impl Error {
    pub(crate) fn invalid_config(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn dimension(op: &'static str, expected: usize, got: usize) -> Self {
        Self::InvalidDimension { op, expected, got }
    }

    pub(crate) fn invalid_vector(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidVector {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(op: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { op, id: id.into() }
    }

    pub(crate) fn storage(op: &'static str, source: rusqlite::Error) -> Self {
        Self::Storage { op, source }
    }

    /// True when the error is the cancellation discriminant. Background
    /// workers use this to decide whether a failure is worth logging.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// True for `NotFound`, regardless of which operation raised it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The operation tag carried by every variant.
    pub fn op(&self) -> &'static str {
        match self {
            Self::InvalidConfig { op, .. }
            | Self::InvalidDimension { op, .. }
            | Self::InvalidVector { op, .. }
            | Self::NotFound { op, .. }
            | Self::EmptyQuery { op }
            | Self::StoreClosed { op }
            | Self::Storage { op, .. }
            | Self::Cancelled { op } => op,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_tag_is_preserved() {
        let e = Error::not_found("delete", "rec-1");
        assert_eq!(e.op(), "delete");
        assert!(e.is_not_found());
        assert!(!e.is_cancelled());
    }

    #[test]
    fn test_display_includes_op_and_detail() {
        let e = Error::dimension("search", 384, 512);
        let msg = e.to_string();
        assert!(msg.contains("search"));
        assert!(msg.contains("384"));
        assert!(msg.contains("512"));
    }
}
