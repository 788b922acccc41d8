//! Error types for the audit core

use thiserror::Error;

/// Result type alias for core operations
pub type AuditResult<T> = Result<T, AuditError>;

/// Errors that can occur in the audit core
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Catalogue error: {0}")]
    Catalogue(String),

    #[error("Unknown question id: {0}")]
    UnknownQuestion(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Submission already claimed for session {0}")]
    AlreadySubmitted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Semantic mapping error: {0}")]
    Mapping(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sled::Error> for AuditError {
    fn from(err: sled::Error) -> Self {
        AuditError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for AuditError {
    fn from(err: config::ConfigError) -> Self {
        AuditError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for AuditError {
    fn from(err: toml::de::Error) -> Self {
        AuditError::Catalogue(err.to_string())
    }
}
