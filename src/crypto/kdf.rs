//! Argon2id passphrase hardening.
//!
//! Parameters are stored next to every salt so they can be raised for new
//! envelopes without breaking old ones.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::crypto::error::CryptoError;
use crate::crypto::keys::WrappingKey;
use crate::crypto::types::AES_KEY_LENGTH;

pub const KDF_ALGORITHM: &str = "argon2id";
/// Argon2's internal compression hash.
pub const KDF_HASH_FN: &str = "blake2b";
pub const DERIVED_KEY_BITS: u32 = 256;

pub const DEFAULT_ITERATIONS: u32 = 3;
pub const DEFAULT_MEMORY_KIB: u32 = 65_536; // 64 MiB
pub const DEFAULT_PARALLELISM: u32 = 1;

/// Lowest cost an envelope may carry by default (OWASP argon2id baseline).
pub const FLOOR_ITERATIONS: u32 = 2;
pub const FLOOR_MEMORY_KIB: u32 = 19_456; // 19 MiB

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    pub hash_fn: String,
    pub derived_key_bits: u32,
}

fn default_memory_kib() -> u32 {
    DEFAULT_MEMORY_KIB
}

fn default_parallelism() -> u32 {
    DEFAULT_PARALLELISM
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::argon2id(DEFAULT_ITERATIONS, DEFAULT_MEMORY_KIB, DEFAULT_PARALLELISM)
    }
}

impl KdfParams {
    pub fn argon2id(iterations: u32, memory_kib: u32, parallelism: u32) -> Self {
        Self {
            algorithm: KDF_ALGORITHM.to_string(),
            iterations,
            memory_kib,
            parallelism,
            hash_fn: KDF_HASH_FN.to_string(),
            derived_key_bits: DERIVED_KEY_BITS,
        }
    }

    /// The default floor below which stored parameters are refused.
    pub fn floor() -> Self {
        Self::argon2id(FLOOR_ITERATIONS, FLOOR_MEMORY_KIB, 1)
    }

    /// True when both cost dimensions are at least those of `floor`.
    pub fn meets_floor(&self, floor: &KdfParams) -> bool {
        self.iterations >= floor.iterations && self.memory_kib >= floor.memory_kib
    }

    fn argon2(&self) -> Result<Argon2<'static>, CryptoError> {
        if self.algorithm != KDF_ALGORITHM {
            return Err(CryptoError::UnsupportedKdf(format!(
                "algorithm {}",
                self.algorithm
            )));
        }
        if self.derived_key_bits != DERIVED_KEY_BITS {
            return Err(CryptoError::UnsupportedKdf(format!(
                "derivedKeyBits {}",
                self.derived_key_bits
            )));
        }
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(AES_KEY_LENGTH),
        )
        .map_err(|e| CryptoError::UnsupportedKdf(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Derive a wrapping key from a passphrase or normalized recovery code.
pub fn derive_key(
    secret: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<WrappingKey, CryptoError> {
    let argon2 = params.argon2()?;
    let mut output = [0u8; AES_KEY_LENGTH];
    argon2
        .hash_password_into(secret, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(WrappingKey::from_bytes(output))
}
