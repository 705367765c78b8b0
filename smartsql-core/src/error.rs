//! Error types for smartsql-core.
//!
//! No storage dependencies; the store crate wraps these in its own error type.

use thiserror::Error;

/// Errors raised while building query specs or translating smart SQL
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SmartSqlError {
    // Query spec construction
    #[error("Invalid query spec: {0}")]
    InvalidQuerySpec(String),

    #[error("Unknown query type '{0}'")]
    UnknownQueryType(String),

    #[error("Unknown sort order '{0}'")]
    UnknownSortOrder(String),

    #[error("Unknown index type '{0}'")]
    UnknownIndexType(String),

    #[error("Missing field '{0}'")]
    MissingField(String),

    // Translation
    #[error("Unknown soup '{0}' in smart sql")]
    UnknownSoup(String),

    #[error("Unknown path '{path}' for soup '{soup}' in smart sql")]
    UnknownPath { soup: String, path: String },

    #[error("Only SELECT statements are supported: {0}")]
    NotASelect(String),

    #[error("Soup '{0}' has no full-text index")]
    NoFullTextIndex(String),
}

/// Result type for smartsql-core operations
pub type SmartSqlResult<T> = Result<T, SmartSqlError>;

impl serde::Serialize for SmartSqlError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}
