//! Owned key handles. Both zeroize on drop and never print their bytes.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::error::CryptoError;
use crate::crypto::random::random_array;
use crate::crypto::types::AES_KEY_LENGTH;

/// The 256-bit key that encrypts every record.
///
/// Generated once when the vault is enabled and never derived from a
/// passphrase. It only ever leaves memory wrapped.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct VaultKey([u8; AES_KEY_LENGTH]);

impl VaultKey {
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random_array()?))
    }

    pub(crate) fn from_bytes(bytes: [u8; AES_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

/// Key derived from a passphrase or recovery code. Only used to wrap the
/// [`VaultKey`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey([u8; AES_KEY_LENGTH]);

impl WrappingKey {
    pub(crate) fn from_bytes(bytes: [u8; AES_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrappingKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_unique() {
        let a = VaultKey::generate().unwrap();
        let b = VaultKey::generate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn debug_is_redacted() {
        let key = VaultKey::from_bytes([7u8; 32]);
        assert_eq!(format!("{key:?}"), "VaultKey(<redacted>)");
    }
}
