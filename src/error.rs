//! Common error types for the generator.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from underlying error types used throughout the crate.

use thiserror::Error;

/// Main error type for generator operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bitcoind RPC errors
    #[error("Node error: {0}")]
    Node(String),

    /// Upstream stratum protocol errors
    #[error("Stratum error: {0}")]
    Stratum(#[from] crate::stratum::StratumError),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
