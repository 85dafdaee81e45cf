//! Recovery code format.
//!
//! 16 symbols from a 32-symbol alphabet without `0 1 I O`, shown as
//! `XXXX-XXXX-XXXX-XXXX`. Input is normalized by uppercasing and dropping
//! hyphens and whitespace.

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{random_array, CryptoError};
use crate::error::{Result, VaultError};

pub const RECOVERY_ALPHABET: &[u8; 32] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
pub const RECOVERY_CODE_LEN: usize = 16;
const GROUP_LEN: usize = 4;
const HASH_DOMAIN: &[u8] = b"bookmark-vault/recovery-code/v1";

/// A normalized recovery code. `Display` renders the grouped form.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryCode(String);

impl RecoveryCode {
    pub fn generate() -> std::result::Result<Self, CryptoError> {
        let mut raw: [u8; RECOVERY_CODE_LEN] = random_array()?;
        // 256 is a multiple of 32, so masking keeps the draw uniform.
        let code = raw
            .iter()
            .map(|b| RECOVERY_ALPHABET[(b & 0x1f) as usize] as char)
            .collect();
        raw.zeroize();
        Ok(Self(code))
    }

    pub fn parse(input: &str) -> Result<Self> {
        let normalized: String = input
            .chars()
            .filter(|c| *c != '-' && !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if normalized.len() != RECOVERY_CODE_LEN {
            return Err(VaultError::InvalidRecoveryCode(format!(
                "expected {RECOVERY_CODE_LEN} symbols"
            )));
        }
        if !normalized.bytes().all(|b| RECOVERY_ALPHABET.contains(&b)) {
            return Err(VaultError::InvalidRecoveryCode(
                "contains characters outside the recovery alphabet".to_string(),
            ));
        }
        Ok(Self(normalized))
    }

    /// The 16 symbols without separators. This is what the KDF sees.
    pub fn normalized(&self) -> &str {
        &self.0
    }

    /// Lookup hash stored in the wrapper instead of the code itself.
    pub fn hash_with_salt(&self, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(HASH_DOMAIN);
        hasher.update(salt);
        hasher.update(self.0.as_bytes());
        hasher.finalize().into()
    }
}

impl fmt::Display for RecoveryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.as_bytes().chunks(GROUP_LEN).enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            f.write_str(std::str::from_utf8(chunk).map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}

impl fmt::Debug for RecoveryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryCode(<redacted>)")
    }
}
