//! Core trait seams.
//!
//! The transport treats encryption as a pluggable collaborator: every
//! connection is constructed with a [`CipherKey`] rather than resolving one
//! from process-wide state.

use super::error::CryptoError;

/// A key that can encrypt and decrypt opaque byte strings.
///
/// Two schemes implement this in the crate: the symmetric session cipher
/// used for all ordinary traffic, and the asymmetric sealed wrap used only
/// for the first handshake message. A passthrough implementation exists for
/// deployments that run without a server keypair.
///
/// Implementations must be usable from the single tick thread that owns a
/// connection; no interior mutability is required.
pub trait CipherKey: Send + Sync {
    /// Encrypt `plaintext`, returning a self-contained ciphertext (any
    /// nonce or ephemeral material is embedded in the output).
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt a ciphertext produced by [`CipherKey::encrypt`].
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}
