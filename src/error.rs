use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrellisError>;

/// Errors surfaced by the mapping, planning, and interpretation layers.
///
/// `Mapping` and `Internal` indicate an unusable configuration or a planner
/// bug and abort the whole request; `Type` errors are attached to the cursor
/// path that produced them so callers can report partial results.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrellisError {
    #[error("mapping error: {0}")]
    Mapping(String),
    #[error("type error at {path}: {message}")]
    Type { path: String, message: String },
    #[error("predicate compilation failed: {0}")]
    Predicate(String),
    #[error("driver error: {0}")]
    Driver(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl TrellisError {
    pub fn mapping(message: impl Into<String>) -> Self {
        TrellisError::Mapping(message.into())
    }

    pub fn type_error(path: &[String], message: impl Into<String>) -> Self {
        TrellisError::Type {
            path: format!("/{}", path.join("/")),
            message: message.into(),
        }
    }

    pub fn predicate(message: impl Into<String>) -> Self {
        TrellisError::Predicate(message.into())
    }

    pub fn driver(message: impl Into<String>) -> Self {
        TrellisError::Driver(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        TrellisError::Internal(message.into())
    }

    /// Whether this error leaves the system unusable for the whole request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrellisError::Mapping(_) | TrellisError::Internal(_))
    }
}
