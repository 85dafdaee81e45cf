/// Wire format version for sealed record blobs.
///
/// Version 1: AES-256-GCM with the vault key.
/// Format: [version=1:1B][IV:12B][ciphertext][tag:16B]
pub const CURRENT_BLOB_VERSION: u8 = 1;

/// Supported blob versions (for decryption).
pub const SUPPORTED_BLOB_VERSIONS: &[u8] = &[1];

/// AES-GCM IV length in bytes (96 bits per NIST recommendation).
pub const AES_GCM_IV_LENGTH: usize = 12;

/// AES-GCM tag length in bytes (128 bits).
pub const AES_GCM_TAG_LENGTH: usize = 16;

/// AES key length in bytes (256 bits).
pub const AES_KEY_LENGTH: usize = 32;

/// AES-KW output size for a 32-byte key: 32 + 8 = 40 bytes.
pub const WRAPPED_KEY_LENGTH: usize = 40;

/// Salt length for passphrase and recovery-code derivation.
pub const SALT_LENGTH: usize = 16;

/// Binds a ciphertext to one record via AAD.
///
/// A blob sealed for one record fails authentication when presented as
/// another record's content.
#[derive(Debug, Clone, Copy)]
pub struct EncryptionContext<'a> {
    pub record_type: &'a str,
    pub record_id: &'a str,
}

impl EncryptionContext<'_> {
    /// AAD layout: [recordType UTF-8][0x00][recordId UTF-8]
    pub(crate) fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.record_type.len() + 1 + self.record_id.len());
        aad.extend_from_slice(self.record_type.as_bytes());
        aad.push(0);
        aad.extend_from_slice(self.record_id.as_bytes());
        aad
    }
}
