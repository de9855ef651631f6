//! Typed errors for the sendcode core library.
//!
//! Library functions return [`Result<T>`]; the CLI binaries convert these into
//! `anyhow::Result` at the point they attach top-level context and print a
//! final diagnostic, mirroring the split between typed library errors and
//! `anyhow`-flavored binaries used throughout the workspace.

use thiserror::Error;

/// The abstract error kinds a sendcode operation can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad path, invalid code phrase, no files found.
    #[error("configuration error: {0}")]
    Config(String),

    /// Timeout awaiting a peer; multicast port busy.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// HMAC/proof mismatch, expired timestamp, missing `cliAuth`.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Fingerprint mismatch, handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Unexpected status, malformed JSON, missing required field.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Network reset mid-stream, sink write failure, size cap exceeded,
    /// path-traversal violation.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// Declined at a confirmation prompt or declined to rename on conflict.
    #[error("{0}")]
    User(String),

    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("json error: {0}")]
    Json(#[source] serde_json::Error),
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Io(source)
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Error::Json(source)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        let err = Error::Auth("proof mismatch".to_string());
        assert_eq!(err.to_string(), "authentication error: proof mismatch");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
