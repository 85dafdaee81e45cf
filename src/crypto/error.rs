use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid wrapped key length: expected {expected} bytes, got {got}")]
    InvalidWrappedKeyLength { expected: usize, got: usize },

    #[error("Encrypted data too short")]
    DataTooShort,

    #[error("Unsupported blob version: {0}")]
    UnsupportedVersion(u8),

    /// Tag or key-wrap integrity check failed. Never accompanied by data.
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("AES-KW wrap failed: {0}")]
    WrapFailed(String),

    #[error("Unsupported KDF parameters: {0}")]
    UnsupportedKdf(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Random number generation failed: {0}")]
    RngFailed(String),
}
