//! Error types for the stratum client.

use thiserror::Error;

/// Errors arising from the upstream stratum session.
#[derive(Error, Debug)]
pub enum StratumError {
    /// I/O errors on the upstream socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No line received within the allowed window
    #[error("timed out waiting for upstream")]
    Timeout,

    /// The upstream closed the connection, or no connection is established
    #[error("upstream disconnected")]
    Disconnected,

    /// A message that could not be decoded or failed validation
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// All subscribe variants were rejected, or the response was unusable
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// The pool rejected our credentials
    #[error("authorize failed: {0}")]
    AuthorizeFailed(String),

    /// The pool's parameters leave no room to re-split the nonce space
    #[error("cannot proxy: {0}")]
    Unproxyable(String),
}

/// Convenience type alias for stratum results.
pub type StratumResult<T> = std::result::Result<T, StratumError>;
