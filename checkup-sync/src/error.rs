//! Error types for the checkup sync core

use crate::record::Department;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Cache error: {0}")]
    Cache(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Backend rejected request: {0}")]
    BackendRejected(String),

    #[error("Missing required fields for {department}: {}", missing.join(", "))]
    Validation {
        department: Department,
        missing: Vec<String>,
    },

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Connectivity failures degrade to local-only operation instead of
    /// surfacing as blocking errors.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Channel(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Channel(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
