//! Pylon Protocol - Crypto Layer
//!
//! Two encryption schemes sit behind the [`CipherKey`](crate::core::CipherKey)
//! seam:
//!
//! - [`SessionKey`]: XChaCha20-Poly1305 with a random per-message nonce
//!   prepended to the ciphertext, used for all ordinary session traffic.
//! - [`SealedKey`]: an x25519 sealed wrap (ephemeral DH + HKDF-SHA256 +
//!   the same AEAD), used only for the first handshake message so a client
//!   can deliver its chosen session key without a pre-shared secret.
//!
//! [`PlainKey`] is a passthrough for deployments without a server keypair.
//!
//! Real integrity comes from the AEAD tags here; the envelope checksum is an
//! anti-corruption filter only.

mod sealed;
mod session_key;

pub use sealed::*;
pub use session_key::*;
