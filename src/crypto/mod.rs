//! Crypto primitives: Argon2id derivation, AES-KW key wrapping,
//! AES-256-GCM record sealing, and random generation.

pub mod aead;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod random;
pub mod types;
pub mod wrap;

pub use aead::{decrypt, encrypt, SealedBlob};
pub use error::CryptoError;
pub use kdf::{derive_key, KdfParams};
pub use keys::{VaultKey, WrappingKey};
pub use random::{random_array, random_bytes};
pub use types::{EncryptionContext, AES_GCM_IV_LENGTH, AES_GCM_TAG_LENGTH, SALT_LENGTH};
pub use wrap::{unwrap_key, wrap_key};
