//! AES-256-GCM authenticated encryption (C4).
//!
//! 96-bit IV, 128-bit tag, AAD is the plaintext header up to (but not
//! including) the IV+tag field. See `spec.md` §4.4.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use zeroize::Zeroize;

use crate::error::{OxError, OxResult};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A 256-bit key that zeroizes its backing memory on drop.
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> OxResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(OxError::InvalidParameter(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut k = [0u8; KEY_LEN];
        k.copy_from_slice(bytes);
        Ok(Self(k))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Encrypt `plaintext` under `key`, authenticating `aad`.
///
/// Generates a fresh random IV (`GenerateIv` in `spec.md`'s terms — this
/// crate never accepts a caller-supplied IV, since the only legitimate use
/// of a fixed IV is test determinism, and tests construct ciphertexts
/// directly rather than through this API). Returns `(iv, tag, ciphertext)`
/// as three separate pieces: the on-disk envelope is IV immediately
/// followed by the tag, with ciphertext running after the tag to EOF
/// (`spec.md` §6), which does not match the `aes-gcm` crate's native
/// ciphertext||tag output order.
pub fn encrypt(
    key: &EncryptionKey,
    aad: &[u8],
    plaintext: &[u8],
) -> OxResult<([u8; IV_LEN], [u8; TAG_LEN], Vec<u8>)> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut combined = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| OxError::Unauthorized("AEAD encryption failed".into()))?;
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&nonce);
    let tag_start = combined.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&combined[tag_start..]);
    combined.truncate(tag_start);
    Ok((iv, tag, combined))
}

/// Decrypt `ciphertext` (the tag passed separately, per the wire layout)
/// under `key`, authenticating `aad`. Fails `Unauthorized` on tag mismatch;
/// no plaintext is returned on failure.
pub fn decrypt(
    key: &EncryptionKey,
    iv: &[u8; IV_LEN],
    tag: &[u8; TAG_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> OxResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(iv);
    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    cipher
        .decrypt(nonce, Payload { msg: &combined, aad })
        .map_err(|_| OxError::Unauthorized("AEAD tag verification failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = EncryptionKey::new([7u8; KEY_LEN]);
        let aad = b"header bytes";
        let plaintext = b"secret";
        let (iv, tag, ct) = encrypt(&key, aad, plaintext).unwrap();
        let pt = decrypt(&key, &iv, &tag, aad, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn tamper_detection() {
        let key = EncryptionKey::new([7u8; KEY_LEN]);
        let aad = b"header bytes";
        let (iv, tag, mut ct) = encrypt(&key, aad, b"secret").unwrap();
        ct[0] ^= 1;
        assert!(decrypt(&key, &iv, &tag, aad, &ct).is_err());
    }

    #[test]
    fn aad_mismatch_fails() {
        let key = EncryptionKey::new([7u8; KEY_LEN]);
        let (iv, tag, ct) = encrypt(&key, b"aad-a", b"secret").unwrap();
        assert!(decrypt(&key, &iv, &tag, b"aad-b", &ct).is_err());
    }

    #[test]
    fn tampered_tag_fails() {
        let key = EncryptionKey::new([7u8; KEY_LEN]);
        let (iv, mut tag, ct) = encrypt(&key, b"aad", b"secret").unwrap();
        tag[0] ^= 1;
        assert!(decrypt(&key, &iv, &tag, b"aad", &ct).is_err());
    }
}
