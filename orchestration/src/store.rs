//! Shared error type for the persistence seams.
//!
//! Each subsystem owns its own store trait (`TrustStore`, `WorkflowStore`,
//! `NotificationStore`, `LockStore`); they all report failures through
//! [`StoreError`].

/// Error type for persisted-state operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Result type for persisted-state operations
pub type StoreResult<T> = Result<T, StoreError>;
