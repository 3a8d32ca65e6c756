//! NAT-traversal relay: a standalone UDP forwarder that lets servers
//! unreachable from the public internet receive client traffic.

mod ports;
mod service;

pub use ports::PortAllocator;
pub use service::{ExpiringSet, RelayConfig, RelayService, RelayState, Teardown};
