//! Session envelope: the per-datagram wire frame.
//!
//! Wire layout (big-endian):
//! `checksum(2) ‖ protocol_version(2) ‖ seq(4) ‖ ack(4) ‖ flags(1) ‖ encrypt(payload)`.
//!
//! The checksum is a 16-bit wraparound byte sum over everything except the
//! checksum field itself. It is an anti-corruption filter, not a security
//! mechanism; integrity comes from the AEAD inside. Deserialization fails
//! closed for any network-origin input: too short, bad checksum, wrong
//! version, undefined flags, or a payload that does not decrypt.

use std::ops::BitOr;

use crate::core::{
    CipherKey, CryptoError, WireError, ENVELOPE_HEADER_SIZE, FLAG_FAS, FLAG_FIN, FLAG_MASK,
    FLAG_NCN, FLAG_RSA, FLAG_SYN, PROTOCOL_VERSION,
};

/// Envelope flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnvelopeFlags(u8);

impl EnvelopeFlags {
    /// Handshake start.
    pub const SYN: Self = Self(FLAG_SYN);
    /// Connection end.
    pub const FIN: Self = Self(FLAG_FIN);
    /// Fast mode (unordered, unacknowledged).
    pub const FAS: Self = Self(FLAG_FAS);
    /// Payload wrapped with the asymmetric handshake scheme.
    pub const RSA: Self = Self(FLAG_RSA);
    /// No-such-session notice.
    pub const NCN: Self = Self(FLAG_NCN);

    /// No flags set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Reconstruct from a wire byte; rejects undefined bits.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !FLAG_MASK != 0 {
            return None;
        }
        Some(Self(bits))
    }

    /// Raw wire byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EnvelopeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A decoded session envelope. Immutable; the payload is already decrypted.
///
/// An empty payload is a valid ack-only or keepalive envelope.
#[derive(Debug)]
pub struct SessionEnvelope {
    /// Protocol version the sender spoke.
    pub protocol_version: u16,
    /// Sender's sequence number.
    pub seq_num: u32,
    /// Sender's highest delivered remote sequence.
    pub ack_num: u32,
    /// Flag bits.
    pub flags: EnvelopeFlags,
    /// Decrypted payload bytes (empty for ack-only envelopes).
    pub payload: Vec<u8>,
}

impl SessionEnvelope {
    /// Serialize and encrypt an envelope into a wire datagram.
    pub fn seal(
        seq_num: u32,
        ack_num: u32,
        flags: EnvelopeFlags,
        payload: &[u8],
        key: &dyn CipherKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let encrypted = key.encrypt(payload)?;

        let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + encrypted.len());
        out.extend_from_slice(&[0, 0]); // checksum filled below
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out.extend_from_slice(&seq_num.to_be_bytes());
        out.extend_from_slice(&ack_num.to_be_bytes());
        out.push(flags.bits());
        out.extend_from_slice(&encrypted);

        let checksum = wrapping_checksum(&out[2..]);
        out[0..2].copy_from_slice(&checksum.to_be_bytes());
        Ok(out)
    }

    /// Validate and decrypt a wire datagram.
    ///
    /// Checks run cheapest-first: length, checksum, version, flags, then the
    /// decrypt. Every failure is a rejection; none of them panic.
    pub fn open(datagram: &[u8], key: &dyn CipherKey) -> Result<Self, WireError> {
        if datagram.len() < ENVELOPE_HEADER_SIZE {
            return Err(WireError::Truncated(datagram.len()));
        }

        let actual = u16::from_be_bytes([datagram[0], datagram[1]]);
        let expected = wrapping_checksum(&datagram[2..]);
        if expected != actual {
            return Err(WireError::ChecksumMismatch { expected, actual });
        }

        let protocol_version = u16::from_be_bytes([datagram[2], datagram[3]]);
        if protocol_version != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: protocol_version,
            });
        }

        let seq_num = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        let ack_num = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
        let flags =
            EnvelopeFlags::from_bits(datagram[12]).ok_or(WireError::UndefinedFlags(datagram[12]))?;

        let payload = key
            .decrypt(&datagram[ENVELOPE_HEADER_SIZE..])
            .map_err(|_| WireError::Decrypt)?;

        Ok(Self {
            protocol_version,
            seq_num,
            ack_num,
            flags,
            payload,
        })
    }

    /// Read the flag byte of a wire datagram without validating or
    /// decrypting it. Used to pick the right key (RSA vs session) and to
    /// route SYN/NCN before the full open.
    pub fn peek_flags(datagram: &[u8]) -> Option<EnvelopeFlags> {
        if datagram.len() < ENVELOPE_HEADER_SIZE {
            return None;
        }
        EnvelopeFlags::from_bits(datagram[12])
    }
}

/// 16-bit wraparound sum of every byte.
fn wrapping_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for &b in bytes {
        sum = sum.wrapping_add(b as u16);
    }
    sum
}
