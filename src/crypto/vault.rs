/// The vault cipher: the opaque `encrypt(bytes) -> bytes` /
/// `decrypt(bytes) -> bytes` service keyed by a locally-held secret.
///
/// The key lives in a single file and is generated on first use; every
/// subsequent run reuses it. Losing the key file means losing access to
/// every stored blob.
use std::fs;
use std::path::Path;

use crate::crypto::{aead, sensitive::SensitiveBytes32};
use crate::error::{Result, VaultError};

/// Domain separation for backup payloads.
const BLOB_AAD: &[u8] = b"drvault:blob:v1";

pub struct VaultCipher {
    key: SensitiveBytes32,
}

impl VaultCipher {
    /// Load the key from `key_path`, generating and persisting a fresh one
    /// if the file does not exist yet.
    pub fn load_or_generate(key_path: &Path) -> Result<Self> {
        if key_path.exists() {
            let bytes = fs::read(key_path)?;
            let key = SensitiveBytes32::from_slice(&bytes).ok_or_else(|| {
                VaultError::Encryption(format!(
                    "key file {} has wrong length ({} bytes)",
                    key_path.display(),
                    bytes.len()
                ))
            })?;
            return Ok(Self { key });
        }

        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let key = aead::generate_key();
        fs::write(key_path, key.as_bytes())?;
        tracing::info!(path = %key_path.display(), "Generated new vault key");
        Ok(Self { key })
    }

    #[cfg(test)]
    pub fn ephemeral() -> Self {
        Self {
            key: aead::generate_key(),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        aead::seal(&self.key, plaintext, BLOB_AAD)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        aead::open(&self.key, ciphertext, BLOB_AAD)
    }
}
