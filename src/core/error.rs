//! Error types for the Pylon protocol.
//!
//! Network-origin malformed input is never surfaced as an error across the
//! connection boundary; it is rejected and dropped. The types here cover
//! local failures (I/O, misuse, crypto) and the rejection reasons the codec
//! reports internally.

use thiserror::Error;

/// Reasons a network-origin datagram is rejected by the codec.
///
/// All of these are transient drops: the datagram is discarded with no state
/// change and no error surfaced to the application.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input shorter than the fixed header.
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    /// Checksum did not match the envelope contents.
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes.
        expected: u16,
        /// Checksum carried in the envelope.
        actual: u16,
    },

    /// Unexpected protocol version.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this implementation speaks.
        expected: u16,
        /// Version carried in the envelope.
        actual: u16,
    },

    /// Envelope payload failed to decrypt.
    #[error("payload decryption failed")]
    Decrypt,

    /// Envelope carried flag bits this implementation does not define.
    #[error("undefined flag bits: {0:#04x}")]
    UndefinedFlags(u8),
}

/// Errors in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag, corrupted, or wrong key).
    #[error("decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Ciphertext shorter than its prepended nonce or key material.
    #[error("ciphertext too short")]
    TruncatedCiphertext,
}

/// Errors in the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operation on a connection that is already dead. Programmer misuse,
    /// not a network condition.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Socket bind failed, including the random high-port fallback.
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// Outbound queue to the socket task is full.
    #[error("send queue full")]
    QueueFull,

    /// Envelope could not be sealed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in the relay service.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Shared control socket bind failed.
    #[error("relay bind failed: {0}")]
    BindFailed(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level Pylon errors.
#[derive(Debug, Error)]
pub enum PylonError {
    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Relay error.
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
