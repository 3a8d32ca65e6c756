//! Application payload codec.
//!
//! A payload is the unit the application hands to the transport: a small
//! type id, a one-byte code, an optional strictly-increasing control
//! sequence, and an opaque body. The transport copies the body and inspects
//! only the header fields.
//!
//! Wire layout (big-endian): `id(2) ‖ code(1) ‖ control_sequence(4) ‖ body`.

use crate::core::{WireError, PAYLOAD_HEADER_SIZE};

/// Application message type identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId(pub u16);

/// An application message as seen by the transport. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    id: PayloadId,
    code: u8,
    control_sequence: u32,
    body: Vec<u8>,
}

impl Payload {
    /// Build a payload. `control_sequence` is zero for message types that
    /// carry no ordering requirement.
    pub fn new(id: PayloadId, code: u8, control_sequence: u32, body: Vec<u8>) -> Self {
        Self {
            id,
            code,
            control_sequence,
            body,
        }
    }

    /// Message type id.
    pub fn id(&self) -> PayloadId {
        self.id
    }

    /// Message code byte.
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Control sequence number (zero when unused).
    pub fn control_sequence(&self) -> u32 {
        self.control_sequence
    }

    /// Opaque body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize to the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PAYLOAD_HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.id.0.to_be_bytes());
        out.push(self.code);
        out.extend_from_slice(&self.control_sequence.to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Deserialize from the wire layout. Fails closed on short input.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < PAYLOAD_HEADER_SIZE {
            return Err(WireError::Truncated(bytes.len()));
        }
        let id = PayloadId(u16::from_be_bytes([bytes[0], bytes[1]]));
        let code = bytes[2];
        let control_sequence = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
        Ok(Self {
            id,
            code,
            control_sequence,
            body: bytes[PAYLOAD_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Per-type delivery rules, supplied by the hosting application.
///
/// The transport consults this on every delivery: strictly-ordered types
/// have their control sequence verified even on the fast path, and types
/// legal only inside the handshake are rejected as protocol violations
/// anywhere else.
pub trait PayloadPolicy: Send + Sync {
    /// Whether this message type must never be processed out of order.
    fn strictly_ordered(&self, id: PayloadId) -> bool {
        let _ = id;
        false
    }

    /// Whether this message type is only legal during the handshake.
    fn handshake_only(&self, id: PayloadId) -> bool {
        let _ = id;
        false
    }
}

/// Policy with no ordered and no handshake-only types.
#[derive(Clone, Copy, Debug, Default)]
pub struct PermissivePolicy;

impl PayloadPolicy for PermissivePolicy {}
