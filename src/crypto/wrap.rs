//! AES-KW (RFC 3394) wrapping of the vault key.
//!
//! Wrapped key wire format: [AES-KW(wrappingKey, vaultKey):40]

use aes_kw::KekAes256;
use zeroize::Zeroizing;

use crate::crypto::error::CryptoError;
use crate::crypto::keys::{VaultKey, WrappingKey};
use crate::crypto::types::{AES_KEY_LENGTH, WRAPPED_KEY_LENGTH};

/// Wrap the vault key under a passphrase- or code-derived key.
pub fn wrap_key(
    vault_key: &VaultKey,
    wrapping_key: &WrappingKey,
) -> Result<[u8; WRAPPED_KEY_LENGTH], CryptoError> {
    let kek = kek(wrapping_key)?;
    let mut wrapped = [0u8; WRAPPED_KEY_LENGTH];
    kek.wrap(vault_key.as_bytes(), &mut wrapped)
        .map_err(|e| CryptoError::WrapFailed(format!("{:?}", e)))?;
    Ok(wrapped)
}

/// Unwrap the vault key. An integrity failure means the wrapping key was
/// derived from the wrong secret.
pub fn unwrap_key(wrapped: &[u8], wrapping_key: &WrappingKey) -> Result<VaultKey, CryptoError> {
    if wrapped.len() != WRAPPED_KEY_LENGTH {
        return Err(CryptoError::InvalidWrappedKeyLength {
            expected: WRAPPED_KEY_LENGTH,
            got: wrapped.len(),
        });
    }
    let kek = kek(wrapping_key)?;
    let mut key = Zeroizing::new([0u8; AES_KEY_LENGTH]);
    kek.unwrap(wrapped, key.as_mut_slice())
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(VaultKey::from_bytes(*key))
}

/// Key schedule built straight from the borrowed key bytes; `aes` zeroizes
/// it on drop.
fn kek(wrapping_key: &WrappingKey) -> Result<KekAes256, CryptoError> {
    KekAes256::try_from(wrapping_key.as_bytes().as_slice())
        .map_err(|e| CryptoError::WrapFailed(format!("{:?}", e)))
}
