//! Symmetric session cipher.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::core::{CipherKey, CryptoError, NONCE_SIZE, SESSION_KEY_SIZE};

/// Symmetric session key for ordinary traffic.
///
/// Every encryption draws a fresh random 24-byte nonce and prepends it to
/// the ciphertext, so two encryptions of the same plaintext never produce
/// the same bytes. The key material is zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    /// Generate a new random session key.
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Create a session key from existing key material.
    pub fn from_bytes(key: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Get the raw key bytes (for embedding in a handshake payload).
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.key
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl CipherKey for SessionKey {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(CryptoError::TruncatedCiphertext);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_SIZE);

        let cipher = XChaCha20Poly1305::new((&self.key).into());
        cipher
            .decrypt(XNonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Passthrough cipher for deployments without a server keypair.
///
/// Handshake payloads sent through this are not confidential; it exists so
/// the envelope codec has exactly one code path regardless of scheme.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainKey;

impl CipherKey for PlainKey {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }
}
