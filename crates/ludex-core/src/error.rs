//! Error types for ludex-core.

use thiserror::Error;

/// Errors that can occur while encoding, hashing, or handling keys.
#[derive(Debug, Error)]
pub enum Error {
    #[error("CBOR encoding error: {0}")]
    CborEncode(String),

    #[error("CBOR decoding error: {0}")]
    CborDecode(String),

    #[error("canonical CBOR violation: {0}")]
    CanonicalViolation(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid content hash: {0}")]
    InvalidHash(String),
}

/// Result type alias for ludex-core operations.
pub type Result<T> = std::result::Result<T, Error>;
