use thiserror::Error;

use crate::lang::value::Value;

/// Errors raised by running bytecode. These unwind the interpreter loop
/// through the ordinary `Result` path; the program exit request rides the
/// same channel so a single `?` chain reaches the context.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("index {index} out of bounds")]
    IndexOutOfBounds { index: i64 },

    #[error("dictionary key not found")]
    KeyNotFound,

    #[error("value out of range")]
    OutOfRange,

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    /// Not an error: an `exit` statement carrying the program result.
    #[error("program exit")]
    Exit(Value),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    pub fn type_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        RuntimeError::TypeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        RuntimeError::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            RuntimeError::IndexOutOfBounds { index: 9 }.to_string(),
            "index 9 out of bounds"
        );
        assert_eq!(
            RuntimeError::AssertionFailed("x > 0".into()).to_string(),
            "assertion failed: x > 0"
        );
        assert_eq!(
            RuntimeError::type_mismatch("ordinal", "str").to_string(),
            "type mismatch: expected ordinal, got str"
        );
    }
}
