//! Error types for relayq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Store-level failure outside the database driver (contract violations,
    /// torn-down subscriptions, malformed wire data).
    #[error("store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
