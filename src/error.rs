//! Error types for the keyserver gateway

use std::io;

use thiserror::Error;

/// Result type alias for the keyserver gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Keyserver gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS material or handshake configuration error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Key generation failed
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this is the clean-shutdown sentinel delivered after a
    /// requested shutdown has drained.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}
