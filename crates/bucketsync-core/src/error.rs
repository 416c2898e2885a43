use thiserror::Error;

/// Errors produced by the diff/patch/transform algebra.
#[derive(Debug, Error, PartialEq)]
pub enum DiffError {
    /// An operation could not be decoded: unknown tag or mis-shaped payload.
    #[error("MALFORMED_OPERATION: {0}")]
    MalformedOperation(String),
    /// An operation's precondition did not hold against the document it was
    /// applied to (add over an existing key, remove of a missing key,
    /// increment of a non-number, text patch that does not apply).
    #[error("PRECONDITION_VIOLATED: {0}")]
    PreconditionViolated(String),
}

pub type Result<T> = std::result::Result<T, DiffError>;
