//! Protocol constants.
//!
//! These values are fixed by the wire protocol and MUST NOT be changed;
//! evolution happens through the explicit `protocol_version` field.

use std::time::Duration;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Protocol version carried in every session envelope.
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Session envelope header size (checksum + version + seq + ack + flags).
pub const ENVELOPE_HEADER_SIZE: usize = 13;

/// Payload header size (id + code + control sequence).
pub const PAYLOAD_HEADER_SIZE: usize = 7;

/// Handshake start flag.
pub const FLAG_SYN: u8 = 0x01;

/// Connection end flag.
pub const FLAG_FIN: u8 = 0x02;

/// Fast mode: unordered, unacknowledged, best-effort.
pub const FLAG_FAS: u8 = 0x04;

/// Payload was wrapped with the asymmetric handshake scheme.
pub const FLAG_RSA: u8 = 0x08;

/// No-such-session notice emitted by a listener.
pub const FLAG_NCN: u8 = 0x10;

/// Mask of all defined flag bits.
pub const FLAG_MASK: u8 = FLAG_SYN | FLAG_FIN | FLAG_FAS | FLAG_RSA | FLAG_NCN;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// XChaCha20-Poly1305 session key size.
pub const SESSION_KEY_SIZE: usize = 32;

/// XChaCha20 nonce size, prepended to every ciphertext.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// X25519 public key size (sealed handshake wrap).
pub const PUBLIC_KEY_SIZE: usize = 32;

// =============================================================================
// TIMING CONSTANTS
// =============================================================================

/// Smoothed RTT assumed before any samples exist.
pub const DEFAULT_RTT: Duration = Duration::from_millis(600);

/// Fixed safety offset added to the smoothed RTT for retry deadlines.
pub const RETRY_OFFSET: Duration = Duration::from_millis(100);

/// Fast-mode empty envelope cycle (ack propagation).
pub const FAST_ACK_INTERVAL: Duration = Duration::from_millis(100);

/// Safe-mode empty envelope cycle (liveness probe).
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// BOUNDS
// =============================================================================

/// Retry budget per in-flight safe envelope; exhaustion kills the connection.
pub const MAX_SEND_RETRIES: u8 = 8;

/// Redundant FIN transmissions on deliberate close (termination is unacked).
pub const FIN_REDUNDANCY: usize = 3;

/// Recent RTT samples kept for the median estimate.
pub const RTT_SAMPLE_WINDOW: usize = 10;

/// Outstanding send timestamps kept for RTT measurement before pruning.
pub const SEND_TIME_HORIZON: usize = 256;

/// Out-of-order holding buffer capacity per connection.
pub const HOLDING_BUFFER_CAPACITY: usize = 128;

/// Delivered-payload ready queue capacity per connection.
pub const READY_QUEUE_CAPACITY: usize = 128;

/// Maximum datagram size accepted in either direction.
pub const MAX_DATAGRAM_SIZE: usize = 1400;

// =============================================================================
// RELAY WIRE FORMAT
// =============================================================================

/// Relay control opcode: keep a registration alive.
pub const RELAY_OP_KEEPALIVE: u8 = 0x00;

/// Relay control opcode: register a server.
pub const RELAY_OP_REGISTER: u8 = 0x01;

/// Relay control opcode: unregister a server.
pub const RELAY_OP_UNREGISTER: u8 = 0x02;

/// Client endpoint header on relayed data (IPv4 + big-endian port).
pub const RELAY_CLIENT_HEADER_SIZE: usize = 6;

// =============================================================================
// RELAY DEFAULTS
// =============================================================================

/// Registrations must keep-alive within this window.
pub const REGISTRATION_LIFETIME: Duration = Duration::from_secs(15);

/// Dedicated port release is delayed this long to let in-flight sends drain.
pub const PORT_RELEASE_DRAIN: Duration = Duration::from_millis(250);

/// Anti-reflection TTL for observed client endpoints.
pub const CLIENT_ENDPOINT_TTL: Duration = Duration::from_secs(15);

/// Byte-budget accounting window.
pub const RATE_WINDOW: Duration = Duration::from_millis(100);

/// Global relayed-byte budget per [`RATE_WINDOW`], split across registrations.
pub const GLOBAL_RATE_BUDGET: usize = 512 * 1024;

/// Control messages allowed per source endpoint per second.
pub const CONTROL_RATE_LIMIT: u32 = 6;
