//! # Pylon Protocol
//!
//! Pylon is a reliable, ordered, encrypted messaging transport built over
//! UDP, plus a NAT-traversal relay service, designed for latency-sensitive
//! real-time applications. It provides:
//!
//! - **Reliability**: sequence/acknowledgement tracking with adaptive
//!   retransmission timing from measured round-trip time
//! - **Security**: symmetric authenticated encryption for session traffic,
//!   an asymmetric sealed wrap for the initial handshake
//! - **Latency**: a fast unreliable send mode for high-frequency ephemeral
//!   state alongside the ordered safe mode
//! - **Reachability**: a relay process forwarding datagrams for servers
//!   behind NAT under strict resource and rate quotas
//!
//! ## Feature Flags
//!
//! - `relay` (default): the relay service and the `pylon-relay` binary
//!
//! ## Modules
//!
//! - [`core`]: constants, error types, and the cipher trait
//! - [`crypto`]: session keys and the sealed handshake wrap
//! - [`transport`]: codecs, the connection state machine, session
//!   admission, and the dual-stack socket transport
//! - [`relay`]: the relay service (requires `relay` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Instant;
//! use pylon_protocol::prelude::*;
//!
//! // Each session runs under a fresh symmetric key, carried to the peer
//! // inside the handshake payload.
//! let key = SessionKey::generate();
//! let handshake = Payload::new(PayloadId(1), 0, 0, key.as_bytes().to_vec());
//!
//! let mut conn = Connection::connect(
//!     "203.0.113.10:47000".parse().unwrap(),
//!     key,
//!     &handshake,
//!     None,
//!     Arc::new(PermissivePolicy),
//!     ConnectionConfig::default(),
//!     Instant::now(),
//! )
//! .unwrap();
//!
//! // The SYN-flagged handshake is already queued for the socket.
//! assert_eq!(conn.take_outbound().len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Security layer
pub mod crypto;

// Transport layer
pub mod transport;

// Relay service (feature-gated)
#[cfg(feature = "relay")]
#[cfg_attr(docsrs, doc(cfg(feature = "relay")))]
pub mod relay;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::crypto::{PlainKey, SealedKey, SessionKey};

    pub use crate::transport::{
        AcceptOutcome, Acceptor, Connection, ConnectionConfig, ConnectionPhase, ConnectionRole,
        DualStackSocket, EnvelopeFlags, HandshakeOutcome, HandshakeValidator, Payload, PayloadId,
        PayloadPolicy, PermissivePolicy, SessionEnvelope, SocketConfig,
    };

    #[cfg(feature = "relay")]
    pub use crate::relay::{RelayConfig, RelayService};
}

// Re-export commonly used items at crate root
pub use core::{CipherKey, CryptoError, PylonError, TransportError, WireError};

pub use crypto::{SealedKey, SessionKey};
pub use transport::{Connection, ConnectionConfig, Payload, PayloadId, PayloadPolicy};
