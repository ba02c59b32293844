/// XChaCha20-Poly1305 AEAD primitives.
///
/// The 24-byte nonce of XChaCha20 is large enough for random generation
/// without practical collision risk, so each sealed payload carries its
/// freshly generated nonce as a prefix: `[nonce | ciphertext+tag]`.
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{Result, VaultError};

pub const NONCE_LEN: usize = 24;
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

/// Generate a random 256-bit symmetric key.
pub fn generate_key() -> SensitiveBytes32 {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    SensitiveBytes32::new(key)
}

/// Encrypt and authenticate, returning a self-contained `[nonce | ciphertext]`.
pub fn seal(key: &SensitiveBytes32, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a `[nonce | ciphertext]` payload produced by [`seal`].
///
/// A failure here means a wrong key or a corrupted blob; the two are
/// indistinguishable without additional integrity metadata.
pub fn open(key: &SensitiveBytes32, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(VaultError::Decryption("payload too short".into()));
    }

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Decryption(e.to_string()))?;

    let nonce = XNonce::from_slice(&sealed[..NONCE_LEN]);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed[NONCE_LEN..],
                aad,
            },
        )
        .map_err(|e| VaultError::Decryption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_key();
        let plaintext = b"quarterly report, draft 7";
        let aad = b"drvault:blob";

        let sealed = seal(&key, plaintext, aad).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], plaintext.as_slice());
        let opened = open(&key, &sealed, aad).unwrap();
        assert_eq!(&opened, plaintext);
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let key = generate_key();
        let sealed = seal(&key, b"", b"").unwrap();
        let opened = open(&key, &sealed, b"").unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&generate_key(), b"secret", b"").unwrap();
        assert!(open(&generate_key(), &sealed, b"").is_err());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let key = generate_key();
        let mut sealed = seal(&key, b"secret", b"").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open(&key, &sealed, b"").is_err());
    }

    #[test]
    fn test_truncated_payload_fails() {
        let key = generate_key();
        assert!(open(&key, &[0u8; 10], b"").is_err());
    }
}
