//! Asymmetric sealed wrap for the first handshake message.
//!
//! The client knows only the server's public key. Each encryption generates
//! an ephemeral x25519 keypair, computes DH with the server key, derives an
//! AEAD key via HKDF-SHA256, and prepends the ephemeral public key and nonce
//! to the ciphertext. The server recovers the AEAD key from its private key
//! and the embedded ephemeral public key.
//!
//! Wire layout: `ephemeral_public(32) ‖ nonce(24) ‖ aead_ciphertext`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::core::{CipherKey, CryptoError, NONCE_SIZE, PUBLIC_KEY_SIZE, SESSION_KEY_SIZE};

/// HKDF context string binding derived keys to this scheme.
const SEALED_INFO: &[u8] = b"pylon-sealed-v1";

/// Asymmetric keypair (or public half) for sealing handshake payloads.
///
/// A full keypair (server side) can open sealed payloads; a public-only
/// instance (client side) can only seal. The private key is zeroized on
/// drop by `x25519_dalek`.
pub struct SealedKey {
    secret: Option<StaticSecret>,
    public: PublicKey,
}

impl SealedKey {
    /// Generate a new keypair. Held by the accepting side.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
        }
    }

    /// Create a seal-only instance from the accepting side's public key.
    pub fn from_public(public: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self {
            secret: None,
            public: PublicKey::from(public),
        }
    }

    /// Recreate a full keypair from stored private key material.
    pub fn from_private(private: [u8; PUBLIC_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
        }
    }

    /// The public key to distribute to connecting clients.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Whether this instance holds the private half and can open payloads.
    pub fn can_open(&self) -> bool {
        self.secret.is_some()
    }

    fn derive_aead_key(
        shared: &x25519_dalek::SharedSecret,
        ephemeral_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<[u8; SESSION_KEY_SIZE], CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(ephemeral_public), shared.as_bytes());
        let mut okm = [0u8; SESSION_KEY_SIZE];
        hk.expand(SEALED_INFO, &mut okm)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(okm)
    }
}

impl CipherKey for SealedKey {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&self.public);

        let aead_key = Self::derive_aead_key(&shared, &ephemeral_public)?;
        let cipher = XChaCha20Poly1305::new((&aead_key).into());

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&ephemeral_public);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let secret = self.secret.as_ref().ok_or(CryptoError::DecryptionFailed)?;

        if ciphertext.len() < PUBLIC_KEY_SIZE + NONCE_SIZE {
            return Err(CryptoError::TruncatedCiphertext);
        }
        let (ephemeral_bytes, rest) = ciphertext.split_at(PUBLIC_KEY_SIZE);
        let (nonce, body) = rest.split_at(NONCE_SIZE);

        let mut ephemeral_public = [0u8; PUBLIC_KEY_SIZE];
        ephemeral_public.copy_from_slice(ephemeral_bytes);
        let shared = secret.diffie_hellman(&PublicKey::from(ephemeral_public));

        let aead_key = Self::derive_aead_key(&shared, &ephemeral_public)?;
        let cipher = XChaCha20Poly1305::new((&aead_key).into());
        cipher
            .decrypt(XNonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
