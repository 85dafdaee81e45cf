//! AES-256-GCM sealing for record payloads.
//!
//! Wire format v1:
//! [1 byte: version=1][12 bytes: IV][N bytes: ciphertext][16 bytes: tag]
//!
//! Every call draws a fresh random IV. A counter is never used: two devices
//! sharing the vault key would collide.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::crypto::error::CryptoError;
use crate::crypto::random::random_array;
use crate::crypto::types::{
    EncryptionContext, AES_GCM_IV_LENGTH, AES_GCM_TAG_LENGTH, AES_KEY_LENGTH,
    CURRENT_BLOB_VERSION, SUPPORTED_BLOB_VERSIONS,
};

/// A sealed payload with its IV and tag held apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    pub iv: [u8; AES_GCM_IV_LENGTH],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; AES_GCM_TAG_LENGTH],
}

impl SealedBlob {
    /// Reassemble from stored columns, checking the fixed-size parts.
    pub fn from_parts(iv: &[u8], ciphertext: Vec<u8>, tag: &[u8]) -> Result<Self, CryptoError> {
        let iv: [u8; AES_GCM_IV_LENGTH] = iv.try_into().map_err(|_| CryptoError::DataTooShort)?;
        let tag: [u8; AES_GCM_TAG_LENGTH] =
            tag.try_into().map_err(|_| CryptoError::DataTooShort)?;
        Ok(Self {
            iv,
            ciphertext,
            tag,
        })
    }

    /// Encode as `[version][IV][ciphertext][tag]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(1 + AES_GCM_IV_LENGTH + self.ciphertext.len() + AES_GCM_TAG_LENGTH);
        out.push(CURRENT_BLOB_VERSION);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let min_length = 1 + AES_GCM_IV_LENGTH + AES_GCM_TAG_LENGTH;
        if bytes.len() < min_length {
            return Err(CryptoError::DataTooShort);
        }
        let version = bytes[0];
        if !SUPPORTED_BLOB_VERSIONS.contains(&version) {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let body = &bytes[1..];
        let tag_start = body.len() - AES_GCM_TAG_LENGTH;
        Self::from_parts(
            &body[..AES_GCM_IV_LENGTH],
            body[AES_GCM_IV_LENGTH..tag_start].to_vec(),
            &body[tag_start..],
        )
    }
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LENGTH,
            got: key.len(),
        });
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

/// Encrypt `plaintext` under `key`, bound to `context`.
pub fn encrypt(
    plaintext: &[u8],
    key: &[u8],
    context: &EncryptionContext<'_>,
) -> Result<SealedBlob, CryptoError> {
    let cipher = cipher_for(key)?;
    let iv: [u8; AES_GCM_IV_LENGTH] = random_array()?;
    let aad = context.aad();

    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // aes-gcm appends the tag; split it off so it can be stored on its own.
    let tag_start = sealed.len() - AES_GCM_TAG_LENGTH;
    let tag: [u8; AES_GCM_TAG_LENGTH] = sealed[tag_start..]
        .try_into()
        .map_err(|_| CryptoError::EncryptionFailed("missing tag".to_string()))?;
    sealed.truncate(tag_start);

    Ok(SealedBlob {
        iv,
        ciphertext: sealed,
        tag,
    })
}

/// Decrypt a sealed blob. Any tag mismatch (wrong key, tampered bytes, or
/// wrong record context) is [`CryptoError::AuthenticationFailed`].
pub fn decrypt(
    blob: &SealedBlob,
    key: &[u8],
    context: &EncryptionContext<'_>,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for(key)?;
    let aad = context.aad();

    let mut combined = Vec::with_capacity(blob.ciphertext.len() + AES_GCM_TAG_LENGTH);
    combined.extend_from_slice(&blob.ciphertext);
    combined.extend_from_slice(&blob.tag);

    cipher
        .decrypt(
            Nonce::from_slice(&blob.iv),
            Payload {
                msg: &combined,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}
