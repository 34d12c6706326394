/*
    errors.rs - Error taxonomy for the vault core

    One enum covers every subsystem:
    - Key management and passphrase policy
    - Field encryption and integrity
    - Storage, immutability and quotas
    - Conflict workflow and rotation
    - Sync transport
*/

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur anywhere in the vault core
#[derive(Debug, Error)]
pub enum VaultError {
    /// Passphrase rejected by the strength policy
    #[error("Weak passphrase: {0}")]
    WeakPassphrase(String),

    /// Authentication tag, wrapped key or hash chain did not verify
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// No usable key with this id (unknown, destroyed or past its grace period)
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// A rotation job already holds the company's rotation guard
    #[error("Key rotation already in progress for company {company_id} (job {job_id})")]
    RotationInProgress { company_id: String, job_id: String },

    /// Conflict is already in a terminal state
    #[error("Conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    /// Attempt to rewrite or delete an append-only record
    #[error("Immutability violation: {0}")]
    ImmutabilityViolation(String),

    /// Relay exchange did not finish in time
    #[error("Sync timed out after {0:?}")]
    SyncTimeout(Duration),

    /// Company-level quota exceeded
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Insert-if-absent hit an existing key
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Input failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// State machine transition not allowed
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Causal ordering violation
    #[error("Causal ordering violation: {0}")]
    CausalViolation(String),

    /// Key may only decrypt
    #[error("Key {0} is retired and cannot encrypt new data")]
    KeyRetired(String),

    /// Storage I/O error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Relay transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Cooperative cancellation
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The key session has been locked
    #[error("Key session is locked")]
    SessionLocked,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    /// Whether the operation may succeed if simply tried again
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::SyncTimeout(_) | VaultError::Transport(_))
    }

    /// Errors that indicate tampering or corruption
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            VaultError::Integrity(_) | VaultError::ImmutabilityViolation(_)
        )
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for VaultError {
    fn from(err: bincode::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(err: rusqlite::Error) -> Self {
        VaultError::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for VaultError {
    fn from(err: r2d2::Error) -> Self {
        VaultError::Storage(format!("connection pool: {}", err))
    }
}

impl From<crate::config::ConfigError> for VaultError {
    fn from(err: crate::config::ConfigError) -> Self {
        VaultError::Config(err.to_string())
    }
}

/// Map a poisoned lock to a storage error
pub(crate) fn handle_poison<T>(_err: std::sync::PoisonError<T>) -> VaultError {
    VaultError::Storage("lock poisoned".to_string())
}
