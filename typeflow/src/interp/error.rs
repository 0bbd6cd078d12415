//! Interpreter errors
//!
//! These are failures of the interpreted graph to be executable at all
//! (an ill-typed operand, a missing argument). Program traps are not errors;
//! they are a normal [`Outcome`](super::Outcome).

use std::fmt;

use crate::ir::OpIndex;

/// Error raised while interpreting a graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Kinds of runtime errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An operand was read before it was computed
    UndefinedValue,
    /// An operand had the wrong kind of value
    TypeError,
    /// Argument count does not match the signature
    ArityMismatch,
    /// A field, type or function index does not exist
    BadIndex,
    /// A non-null global was read before the embedder set it
    UninitializedGlobal,
    /// The block step budget ran out
    OutOfFuel,
}

impl RuntimeError {
    pub fn undefined_value(op: OpIndex, value: OpIndex) -> Self {
        RuntimeError {
            kind: ErrorKind::UndefinedValue,
            message: format!("{op} reads {value} before it is computed"),
        }
    }

    pub fn type_error(op: OpIndex, expected: &str, got: &str) -> Self {
        RuntimeError {
            kind: ErrorKind::TypeError,
            message: format!("{op}: expected {expected}, got {got}"),
        }
    }

    pub fn global_type_error(global: u32, expected: &str, got: &str) -> Self {
        RuntimeError {
            kind: ErrorKind::TypeError,
            message: format!("global {global}: expected {expected}, got {got}"),
        }
    }

    pub fn arity_mismatch(expected: usize, got: usize) -> Self {
        RuntimeError {
            kind: ErrorKind::ArityMismatch,
            message: format!("expected {expected} argument(s), got {got}"),
        }
    }

    pub fn bad_index(what: &str) -> Self {
        RuntimeError {
            kind: ErrorKind::BadIndex,
            message: format!("no such {what}"),
        }
    }

    pub fn uninitialized_global(global: u32) -> Self {
        RuntimeError {
            kind: ErrorKind::UninitializedGlobal,
            message: format!("non-null global {global} read before it was set"),
        }
    }

    pub fn out_of_fuel(steps: usize) -> Self {
        RuntimeError {
            kind: ErrorKind::OutOfFuel,
            message: format!("gave up after {steps} block steps"),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runtime error: {}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Result type for interpreter operations
pub type InterpResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undefined_value() {
        let err = RuntimeError::undefined_value(OpIndex(3), OpIndex(7));
        assert_eq!(err.kind, ErrorKind::UndefinedValue);
        assert_eq!(err.to_string(), "Runtime error: %3 reads %7 before it is computed");
    }

    #[test]
    fn test_arity_mismatch() {
        let err = RuntimeError::arity_mismatch(2, 1);
        assert_eq!(err.kind, ErrorKind::ArityMismatch);
        assert!(err.message.contains("expected 2"));
    }
}
