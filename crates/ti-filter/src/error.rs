//! Error types for the ti-filter crate.
//!
//! - [`FilterError`] - failures of store, selection, and compile operations
//! - [`CompileError`] - a filter expression that cannot be compiled
//! - [`EvalError`] - a predicate that failed on one particular message
//! - [`StorageError`] - the persistence collaborator failed
//!
//! # Error Recovery Strategy
//!
//! - **Validation** ([`FilterError::Validation`]): Recoverable - only the triggering action is blocked
//! - **Not found** ([`FilterError::NotFound`]): Recoverable - only the triggering action is blocked
//! - **Compile** ([`FilterError::Compile`]): Recoverable - the prior active filter stays in effect
//! - **Storage** ([`FilterError::Storage`]): Fatal for the mutation - surfaced, never retried
//!
//! [`EvalError`]s never reach callers of the store; the message is excluded
//! and the failure counted by the session.

use ti_core::FilterId;

/// Errors returned by filter management and compilation.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// The definition cannot be stored as given.
    #[error("invalid filter: {reason}")]
    Validation {
        /// Why the definition was rejected.
        reason: String,
    },

    /// No saved filter has this id.
    #[error("no saved filter with id {0}")]
    NotFound(FilterId),

    /// The predicate source does not compile.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// The persistence collaborator failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl FilterError {
    /// Creates a new [`FilterError::Validation`] error.
    #[inline]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Returns `true` if only the triggering action failed and state is unchanged.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::NotFound(_) | Self::Compile(_)
        )
    }

    /// Returns `true` if the error came from the persistence layer.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }
}

/// A filter expression failed to compile.
///
/// `position` is the byte offset into the source where the problem was found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("compile error at position {position}: {message}")]
pub struct CompileError {
    /// Description of the problem.
    pub message: String,
    /// Byte offset into the expression source.
    pub position: usize,
}

impl CompileError {
    /// Creates a compile error.
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

/// A predicate failed while evaluating one message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    /// An operator was applied to operands of the wrong type.
    #[error("cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        /// The operator or function.
        op: &'static str,
        /// Type of the left (or only) operand.
        left: &'static str,
        /// Type of the right operand, empty for unary operations.
        right: &'static str,
    },

    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// A field or index was applied to a value that has none.
    #[error("cannot access '{field}' on {kind}")]
    NoSuchField {
        /// The accessed field or index.
        field: String,
        /// Type of the accessed value.
        kind: &'static str,
    },

    /// Text could not be converted to a number.
    #[error("'{0}' is not a number")]
    NotANumber(String),

    /// The expression produced a non-boolean result.
    #[error("filter produced {0}, expected a boolean")]
    NotBoolean(&'static str),
}

/// The persistence collaborator failed to load or save filters.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Reading or writing the backing file failed.
    #[error("filter storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored document could not be encoded or decoded.
    #[error("filter storage format error: {0}")]
    Format(#[from] serde_json::Error),

    /// The backing store refused the write.
    #[error("filter storage unavailable: {0}")]
    Unavailable(String),

    /// The stored document decodes but cannot be used as is.
    #[error("filter storage is inconsistent: {0}")]
    Inconsistent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_error_validation() {
        let err = FilterError::validation("predicate source is empty");
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "invalid filter: predicate source is empty");
    }

    #[test]
    fn test_filter_error_not_found() {
        let err = FilterError::NotFound(FilterId::new(7));
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "no saved filter with id 7");
    }

    #[test]
    fn test_filter_error_compile_is_transparent() {
        let err = FilterError::from(CompileError::new("unknown identifier 'foo'", 4));
        assert!(err.is_recoverable());
        insta::assert_snapshot!(err.to_string(), @"compile error at position 4: unknown identifier 'foo'");
    }

    #[test]
    fn test_filter_error_storage_is_fatal() {
        let err = FilterError::from(StorageError::Unavailable("quota exceeded".to_owned()));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn test_eval_error_display() {
        let err = EvalError::TypeMismatch {
            op: "<",
            left: "string",
            right: "number",
        };
        assert_eq!(err.to_string(), "cannot apply '<' to string and number");
        assert_eq!(
            EvalError::NotBoolean("number").to_string(),
            "filter produced number, expected a boolean"
        );
    }
}
