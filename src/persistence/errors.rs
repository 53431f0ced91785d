//! # Storage Error Types

use thiserror::Error;

/// Errors raised by a [`super::DataStorage`] backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("Message {id} not found in {table}")]
    NotFound { table: String, id: i64 },

    #[error("Message content serialization failed: {message}")]
    Serialization { message: String },
}

impl StorageError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn not_found(table: impl Into<String>, id: i64) -> Self {
        Self::NotFound {
            table: table.into(),
            id,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
