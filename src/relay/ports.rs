//! Dedicated forwarding port allocation.
//!
//! Each registered server owns one port out of a bounded pool. The preferred
//! port is derived deterministically from the server's address so a server
//! re-registering after a relay restart tends to land on the same port; on
//! collision or pool exhaustion the allocator scans round-robin from the
//! preferred slot.

use std::collections::HashSet;
use std::net::IpAddr;

/// Bounded pool of dedicated forwarding ports.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    count: u16,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    /// Create a pool covering `base..base + count`.
    pub fn new(base: u16, count: u16) -> Self {
        Self {
            base,
            count,
            in_use: HashSet::new(),
        }
    }

    /// The deterministic preferred port for a server address.
    ///
    /// IPv4 hashes the top 3 octets (the /24), so a server whose last octet
    /// changes between sessions still prefers the same port. IPv6 hashes
    /// the full address. A zero-sized pool degenerates to the base port.
    pub fn preferred(&self, ip: &IpAddr) -> u16 {
        if self.count == 0 {
            return self.base;
        }
        let hash = match ip {
            IpAddr::V4(v4) => fnv1a(&v4.octets()[..3]),
            IpAddr::V6(v6) => fnv1a(&v6.octets()),
        };
        self.base + (hash % self.count as u64) as u16
    }

    /// Allocate a port for `ip`: the preferred slot, else the first free
    /// port scanning round-robin from it. `None` when the pool is full
    /// (a zero-sized pool is always full).
    pub fn allocate(&mut self, ip: &IpAddr) -> Option<u16> {
        if self.count == 0 {
            return None;
        }
        let preferred = self.preferred(ip);
        for offset in 0..self.count as u32 {
            let slot = ((preferred - self.base) as u32 + offset) % self.count as u32;
            let port = self.base + slot as u16;
            if self.in_use.insert(port) {
                return Some(port);
            }
        }
        None
    }

    /// Return a port to the pool.
    pub fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }

    /// Number of ports currently allocated.
    pub fn allocated(&self) -> usize {
        self.in_use.len()
    }
}

/// FNV-1a, fixed so preferred ports survive process restarts.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
