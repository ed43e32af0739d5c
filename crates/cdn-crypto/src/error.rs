/// Errors from hashing and encryption operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Ciphertext failed authentication, was truncated, or is malformed.
    #[error("integrity check failed: {0}")]
    Integrity(String),
}
