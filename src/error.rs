//! Error types for the Mesh Network Manager
//!
//! Provides structured error types for the durable store, address
//! allocation, config rendering, runtime synchronization and the
//! registration API.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the network manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Stale write rejected for {kind}/{name}, re-read and retry")]
    Conflict { kind: String, name: String },

    #[error("Store call timed out after {0:?}: {1}")]
    StoreTimeout(Duration, String),

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    #[error("Address pool exhausted: {pool}")]
    PoolExhausted { pool: String },

    #[error("No free binding for {token}, batch allocation in flight")]
    AllocationPending { token: String },

    #[error("No binding registered for {kind} {reference}")]
    BindingNotFound { kind: String, reference: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid mesh key: {0}")]
    InvalidKey(String),

    // =========================================================================
    // Runtime Sync Errors
    // =========================================================================
    #[error("Command `{command}` failed with code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Action to take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after specific duration
    RetryAfter(Duration),
    /// Don't retry, the request itself is wrong
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient store errors - retry with backoff
            Error::Kube(_) | Error::Conflict { .. } | Error::StoreTimeout(..) => {
                ErrorAction::RetryWithBackoff
            }

            // A batch is being created - short wait
            Error::AllocationPending { .. } => ErrorAction::RetryAfter(Duration::from_secs(1)),

            // Caller or operator errors
            Error::Configuration(_)
            | Error::ApiValidation(_)
            | Error::InvalidAddress(_)
            | Error::InvalidKey(_)
            | Error::PoolExhausted { .. }
            | Error::BindingNotFound { .. } => ErrorAction::NoRetry,

            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::Conflict { .. }
                | Error::StoreTimeout(..)
                | Error::AllocationPending { .. }
        )
    }

    /// Whether the store reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }

    /// Whether the store reported the object as already present
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::ResourceExists { .. })
    }
}

/// Result type alias for the network manager
pub type Result<T> = std::result::Result<T, Error>;
