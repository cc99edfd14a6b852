//! Error types for storage adapter operations

use thiserror::Error;

/// Errors that can occur during storage adapter operations
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Malformed or unsupported query shape
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Malformed geo, polygon or text search payload
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Unsupported field type: {0}")]
    UnsupportedType(String),

    #[error("Unsupported update: {0}")]
    UnsupportedUpdate(String),

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Class {0} already exists.")]
    DuplicateClass(String),

    /// Unique index violation on a write
    #[error("{message}")]
    DuplicateValue {
        message: String,
        duplicated_field: Option<String>,
    },

    /// Schema lookup miss; carries only the class name
    #[error("Class not found: {0}")]
    ClassNotFound(String),

    #[error("Object not found.")]
    ObjectNotFound,

    #[error("Nested keys should not contain the '$' or '.' characters")]
    InvalidNestedKey,

    /// Index diff rejected (missing field, index already present, ...)
    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AdapterError {
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    pub fn invalid_json(msg: impl Into<String>) -> Self {
        Self::InvalidJson(msg.into())
    }

    pub fn unsupported_query(msg: impl Into<String>) -> Self {
        Self::UnsupportedQuery(msg.into())
    }

    pub fn unsupported_update(msg: impl Into<String>) -> Self {
        Self::UnsupportedUpdate(msg.into())
    }

    pub fn class_not_found(class_name: impl Into<String>) -> Self {
        Self::ClassNotFound(class_name.into())
    }

    pub fn invalid_index(msg: impl Into<String>) -> Self {
        Self::InvalidIndex(msg.into())
    }

    pub fn duplicate_value(duplicated_field: Option<String>) -> Self {
        Self::DuplicateValue {
            message: "A duplicate value for a field with unique values was provided".to_string(),
            duplicated_field,
        }
    }

    /// Classify the underlying database error, if any
    pub fn pg_kind(&self) -> Option<crate::sql::codes::PgErrorKind> {
        match self {
            Self::Sql(err) => crate::sql::codes::classify(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
