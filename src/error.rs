use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by octree construction, merging and queries.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller handed over data or configuration that violates the input
    /// contract (mismatched array lengths, non-finite coordinates, a zero
    /// split limit, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A structural invariant of a stored tree does not hold. Always fatal;
    /// the tree must be considered corrupt.
    #[error("invariant violation: {0}")]
    Corrupt(String),

    /// The operation was cancelled through its [crate::cancel::CancellationToken].
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying blob store failed.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl Error {
    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Error::Corrupt(message.into())
    }
}
