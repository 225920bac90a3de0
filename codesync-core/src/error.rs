use thiserror::Error;

/// Errors produced by the edit algebra.
///
/// Every variant is recoverable: a malformed operation fails the single
/// request that carried it and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// A step that can never be valid (zero-length retain/delete, empty insert,
    /// or a JSON value that is neither an integer nor a string).
    #[error("Invalid step: {0}")]
    InvalidStep(String),

    /// The operation consumes more characters than the text holds.
    #[error("Operation consumes {cursor} characters but the text has {len}")]
    InvalidOperation { cursor: usize, len: usize },

    /// The second operand of a composition does not start where the first ends.
    #[error("Cannot compose: second operation expects length {actual}, first produces {expected}")]
    ComposeMismatch { expected: usize, actual: usize },
}
