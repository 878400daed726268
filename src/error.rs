//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for admission control operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy was configured with parameters it cannot enforce
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// The request processor could not produce a policy list
    #[error("Policy discovery failed: {0}")]
    Discovery(String),

    /// A scope key could not be derived for a request
    #[error("Scope key error: {0}")]
    ScopeKey(String),

    /// A policy failed while evaluating a request
    #[error("Policy evaluation failed: {0}")]
    Evaluation(String),

    /// The accept or deny callback failed
    #[error("Callback failed: {0}")]
    Callback(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
