//! Common error types for peerconn.
//!
//! Transport I/O errors are never wrapped in this type: connections hand
//! back the transport's `std::io::Error` untouched. `Error` covers the
//! failures that originate locally.

use thiserror::Error;

/// Result type alias using peerconn's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Locally originated errors.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error outside the data path (binding, configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed peer identity
    #[error("identity error: {0}")]
    Identity(String),

    /// Address or transport capability mismatch
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an identity error from any displayable type.
    pub fn identity(msg: impl std::fmt::Display) -> Self {
        Self::Identity(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_category() {
        let err = Error::transport("no tcp component in /ip4/1.2.3.4");
        assert_eq!(
            err.to_string(),
            "transport error: no tcp component in /ip4/1.2.3.4"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::AddrInUse));
    }
}
