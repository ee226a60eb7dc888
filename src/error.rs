//! Error types for magicproxy

use std::io;

use thiserror::Error;

/// Result type alias for magicproxy
pub type Result<T> = std::result::Result<T, Error>;

/// magicproxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key material error (generation, loading, or use)
    #[error("Key material error: {0}")]
    Keys(String),

    /// A permission rule failed to parse or compile
    #[error("{0}")]
    InvalidPermission(String),

    /// Mint request rejected; the message is returned to the caller verbatim
    #[error("{0}")]
    MintRequest(String),

    /// Magic token rejected (bad signature, malformed envelope, decrypt failure)
    #[error("Not a valid magic token")]
    InvalidToken,

    /// Magic token past its expiry
    #[error("Not a valid magic token")]
    ExpiredToken,

    /// Request denied by the capability check
    #[error("Disallowed by API proxy")]
    Disallowed,

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
