//! Error types for ElementStore.
//!
//! The store uses a single top-level error enum whose variants map 1:1 onto
//! the wire error kinds the REST shell reports (`not_found`, `forbidden`,
//! `conflict`, `validation_failed`, `cycle_detected`, `io_error`,
//! `unavailable`), plus a `config` variant for startup problems.
//!
//! # Error Handling Pattern
//! ```rust,ignore
//! use elementstore::{Config, ElementStore, Result};
//!
//! fn example() -> Result<()> {
//!     let store = ElementStore::open(Config::default())?;
//!     // ... operations that may fail ...
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ElementStore operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Top-level error enum for all ElementStore operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching (or the `is_*` predicates) to handle specific cases.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing class or object. Also returned when ownership enforcement
    /// hides an object the principal does not own.
    #[error("Not found: {entity} {id}")]
    NotFound {
        /// What kind of entity was looked up ("class", "object", "export").
        entity: &'static str,
        /// The id that did not resolve.
        id: String,
    },

    /// Ownership denied an update or delete.
    #[error("Forbidden: {reason}")]
    Forbidden {
        /// Why the operation was refused.
        reason: String,
    },

    /// Unique violation, delete of a populated class, or a caller-supplied
    /// id while custom ids are disallowed.
    #[error("Conflict: {reason}")]
    Conflict {
        /// Why the write conflicts with existing state.
        reason: String,
    },

    /// One or more field-level validation errors.
    #[error("{0}")]
    Validation(#[from] ValidationFailure),

    /// An `extends_id` loop was observed while resolving a class chain.
    #[error("Cycle detected in class inheritance at '{class_id}'")]
    CycleDetected {
        /// The class at which the walk revisited an ancestor.
        class_id: String,
    },

    /// Configuration error (bad storage type, unusable data root).
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// Storage layer failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Provider timeout, exceeded request deadline, or unreachable backend.
    #[error("Unavailable: {reason}")]
    Unavailable {
        /// What was unreachable or which deadline expired.
        reason: String,
    },
}

impl StoreError {
    /// Creates a not-found error for an object in a class.
    pub fn object_not_found(class_id: &str, id: &str) -> Self {
        Self::NotFound {
            entity: "object",
            id: format!("{}/{}", class_id, id),
        }
    }

    /// Creates a not-found error for a class.
    pub fn class_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "class",
            id: id.into(),
        }
    }

    /// Creates a forbidden error with the given reason.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    /// Creates a conflict error with the given reason.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates an I/O error with the given message.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Creates an unavailable error with the given reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Creates a validation error from a single field error.
    pub fn validation(error: FieldError) -> Self {
        Self::Validation(ValidationFailure {
            errors: vec![error],
        })
    }

    /// Returns the stable wire code for this error kind.
    ///
    /// The REST shell maps these to HTTP statuses; the strings themselves
    /// are part of the client contract and never change.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::Conflict { .. } => "conflict",
            Self::Validation(_) => "validation_failed",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::Config { .. } => "config_error",
            Self::Io(_) => "io_error",
            Self::Unavailable { .. } => "unavailable",
        }
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a forbidden error.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    /// Returns true if this is a conflict error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a cycle-detected error.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::CycleDetected { .. })
    }

    /// Returns the per-field error list of a validation failure, if any.
    pub fn field_errors(&self) -> Option<&[FieldError]> {
        match self {
            Self::Validation(failure) => Some(&failure.errors),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Io(format!("JSON serialization: {}", err))
    }
}

/// A single field-level validation error.
///
/// Serializable so the shell can return the full list in the
/// `{error, details}` response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// The offending field key (dotted for nested object props).
    pub field: String,

    /// Stable machine-readable code (e.g. `required`, `min_length`,
    /// `relation_target_missing`).
    pub code: String,

    /// Human-readable explanation.
    pub message: String,
}

impl FieldError {
    /// Creates a new field error.
    pub fn new(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a `required` error for the given field.
    pub fn required(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("{} is required", field);
        Self::new(field, "required", message)
    }

    /// Creates a `relation_target_missing` error.
    pub fn relation_target_missing(field: impl Into<String>, target: &str) -> Self {
        let field = field.into();
        let message = format!("relation target '{}' does not exist", target);
        Self::new(field, "relation_target_missing", message)
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A collected set of field errors from one validation pass.
///
/// The validator never short-circuits: every field is checked and all
/// errors are reported together so the client can fix them in one round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationFailure {
    /// The per-field error list, in prop resolution order.
    pub errors: Vec<FieldError>,
}

impl std::error::Error for ValidationFailure {}

impl ValidationFailure {
    /// Wraps a non-empty error list.
    pub fn new(errors: Vec<FieldError>) -> Self {
        Self { errors }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}
