//! Error types for feedview

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ViewError {
    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid lookup code: {0}")]
    InvalidLookupCode(String),

    #[error("Log store error: {0}")]
    LogStore(String),

    #[error("Flag store error: {0}")]
    FlagStore(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ViewError>;
