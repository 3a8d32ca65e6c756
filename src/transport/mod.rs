//! Transport layer: payload and envelope codecs, the connection state
//! machine, session admission, and the dual-stack socket transport.

mod connection;
mod envelope;
mod listener;
mod payload;
mod retransmit;
mod socket;
mod timing;

pub use connection::{Connection, ConnectionConfig, ConnectionPhase, ConnectionRole};
pub use envelope::{EnvelopeFlags, SessionEnvelope};
pub use listener::{AcceptOutcome, Acceptor, HandshakeOutcome, HandshakeValidator};
pub use payload::{Payload, PayloadId, PayloadPolicy, PermissivePolicy};
pub use retransmit::RetransmissionRecord;
pub use socket::{decode_client_header, encode_client_header, Datagram, DualStackSocket, SocketConfig};
pub use timing::{RttEstimator, SendTimeTracker};
