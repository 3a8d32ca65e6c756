//! Dual-stack UDP socket transport.
//!
//! Hides one socket per address family and an optional relay fallback behind
//! a single send/receive surface. Datagram I/O runs on background tokio
//! tasks; the owning tick thread exchanges data with them only through
//! bounded channels, so a blocked socket never stalls a tick.
//!
//! When a relay is configured, inbound datagrams arriving from the relay
//! carry a 6-byte client endpoint header. The transport strips it, surfaces
//! the datagram as if it came from the true client endpoint, and tags that
//! endpoint in a capacity-bounded cache; later sends to a tagged endpoint
//! are routed back through the relay. The cache is a connectivity hint with
//! no correctness requirement; a stale entry only sends one datagram down
//! the wrong path.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::core::{TransportError, RELAY_CLIENT_HEADER_SIZE};

/// Receive buffer size per socket task.
const RECV_BUFFER_SIZE: usize = 65535;

/// Dynamic/private port range probed when the requested port is taken.
const HIGH_PORT_RANGE: std::ops::Range<u16> = 49152..65535;

/// Socket transport parameters.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Requested port, or `None` for an OS-assigned ephemeral port.
    pub port: Option<u16>,
    /// Random high ports probed when the requested port is unavailable.
    pub bind_probes: usize,
    /// Depth of the inbound and outbound channels.
    pub queue_depth: usize,
    /// Relay shared-port endpoint, when relay fallback is active.
    pub relay: Option<SocketAddr>,
    /// Capacity of the relay-forwarded endpoint hint cache.
    pub hint_capacity: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            port: None,
            bind_probes: 16,
            queue_depth: 1024,
            relay: None,
            hint_capacity: 256,
        }
    }
}

/// One received datagram and its logical source.
///
/// For relay-forwarded traffic the source is the true client endpoint from
/// the stripped header, not the relay's address.
#[derive(Debug)]
pub struct Datagram {
    /// Logical sender.
    pub source: SocketAddr,
    /// Raw datagram bytes (relay header already stripped).
    pub bytes: Vec<u8>,
}

/// Bounded set of endpoints recently observed behind the relay.
///
/// Insertion order doubles as eviction order.
#[derive(Debug, Default)]
struct RelayHintCache {
    members: HashSet<SocketAddr>,
    order: VecDeque<SocketAddr>,
    capacity: usize,
}

impl RelayHintCache {
    fn new(capacity: usize) -> Self {
        Self {
            members: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn tag(&mut self, endpoint: SocketAddr) {
        if !self.members.insert(endpoint) {
            return;
        }
        self.order.push_back(endpoint);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.members.contains(endpoint)
    }
}

/// Dual-family UDP transport with background I/O tasks.
pub struct DualStackSocket {
    v4_port: Option<u16>,
    v6_port: Option<u16>,
    inbound: mpsc::Receiver<Datagram>,
    outbound: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    relay: Option<SocketAddr>,
    hints: RelayHintCache,
    tasks: Vec<JoinHandle<()>>,
}

impl DualStackSocket {
    /// Bind both address families and spawn the I/O tasks.
    ///
    /// A requested port that is unavailable falls back to a bounded number
    /// of random high-port probes per family. At least one family must bind
    /// or the whole transport fails.
    pub async fn bind(config: SocketConfig) -> Result<Self, TransportError> {
        let v4 = bind_family(IpAddr::V4(Ipv4Addr::UNSPECIFIED), &config).await;
        let v6 = bind_family(IpAddr::V6(Ipv6Addr::UNSPECIFIED), &config).await;
        if v4.is_none() && v6.is_none() {
            return Err(TransportError::BindFailed(
                "no address family could bind".into(),
            ));
        }

        let (in_tx, in_rx) = mpsc::channel(config.queue_depth);
        let (out_tx, out_rx) = mpsc::channel(config.queue_depth);

        let mut tasks = Vec::new();
        for socket in [&v4, &v6].into_iter().flatten() {
            tasks.push(tokio::spawn(recv_loop(Arc::clone(socket), in_tx.clone())));
        }
        tasks.push(tokio::spawn(send_loop(out_rx, v4.clone(), v6.clone())));

        Ok(Self {
            v4_port: v4.and_then(|s| s.local_addr().ok()).map(|a| a.port()),
            v6_port: v6.and_then(|s| s.local_addr().ok()).map(|a| a.port()),
            inbound: in_rx,
            outbound: out_tx,
            relay: config.relay,
            hints: RelayHintCache::new(config.hint_capacity),
            tasks,
        })
    }

    /// Local IPv4 port, when that family bound.
    pub fn v4_port(&self) -> Option<u16> {
        self.v4_port
    }

    /// Local IPv6 port, when that family bound.
    pub fn v6_port(&self) -> Option<u16> {
        self.v6_port
    }

    /// Drain every datagram received since the last call. Non-blocking;
    /// call once per tick.
    pub fn poll_inbound(&mut self) -> Vec<Datagram> {
        let mut drained = Vec::new();
        while let Ok(datagram) = self.inbound.try_recv() {
            if Some(datagram.source) == self.relay {
                // Relay-forwarded: recover the true client endpoint and tag
                // it for the return path.
                let Some((client, payload)) = decode_client_header(&datagram.bytes) else {
                    continue;
                };
                self.hints.tag(client);
                drained.push(Datagram {
                    source: client,
                    bytes: payload.to_vec(),
                });
            } else {
                drained.push(datagram);
            }
        }
        drained
    }

    /// Queue a datagram for transmission.
    ///
    /// Targets tagged as relay-forwarded are wrapped with the client
    /// endpoint header and sent to the relay instead of directly.
    pub fn send_to(&self, target: SocketAddr, bytes: Vec<u8>) -> Result<(), TransportError> {
        let (wire_target, wire_bytes) = match self.relay {
            Some(relay) if self.hints.contains(&target) => {
                let Some(header) = encode_client_header(&target) else {
                    // Non-IPv4 client cannot be expressed in the relay
                    // framing; fall through to the direct path.
                    return self.enqueue(target, bytes);
                };
                let mut framed = Vec::with_capacity(RELAY_CLIENT_HEADER_SIZE + bytes.len());
                framed.extend_from_slice(&header);
                framed.extend_from_slice(&bytes);
                (relay, framed)
            }
            _ => (target, bytes),
        };
        self.enqueue(wire_target, wire_bytes)
    }

    fn enqueue(&self, target: SocketAddr, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.outbound
            .try_send((target, bytes))
            .map_err(|_| TransportError::QueueFull)
    }
}

impl Drop for DualStackSocket {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Bind one family: the requested port first, then bounded random probes.
async fn bind_family(ip: IpAddr, config: &SocketConfig) -> Option<Arc<UdpSocket>> {
    let Some(port) = config.port else {
        return UdpSocket::bind(SocketAddr::new(ip, 0)).await.ok().map(Arc::new);
    };

    match UdpSocket::bind(SocketAddr::new(ip, port)).await {
        Ok(socket) => return Some(Arc::new(socket)),
        Err(err) => debug!(%ip, port, %err, "requested port unavailable, probing"),
    }
    for _ in 0..config.bind_probes {
        let probe = rand::thread_rng().gen_range(HIGH_PORT_RANGE);
        if let Ok(socket) = UdpSocket::bind(SocketAddr::new(ip, probe)).await {
            return Some(Arc::new(socket));
        }
    }
    None
}

async fn recv_loop(socket: Arc<UdpSocket>, inbound: mpsc::Sender<Datagram>) {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (len, source) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(err) => {
                trace!(%err, "socket receive error");
                continue;
            }
        };
        let datagram = Datagram {
            source,
            bytes: buffer[..len].to_vec(),
        };
        // A full queue means the tick thread is behind; dropping here is the
        // same loss the network could have inflicted.
        if inbound.try_send(datagram).is_err() {
            trace!(%source, "inbound queue full, dropping datagram");
        }
    }
}

async fn send_loop(
    mut outbound: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
) {
    while let Some((target, bytes)) = outbound.recv().await {
        let socket = match target {
            SocketAddr::V4(_) => v4.as_ref(),
            SocketAddr::V6(_) => v6.as_ref(),
        };
        let Some(socket) = socket else {
            trace!(%target, "no socket for target address family");
            continue;
        };
        if let Err(err) = socket.send_to(&bytes, target).await {
            trace!(%target, %err, "socket send error");
        }
    }
}

/// Encode the relay framing header for an IPv4 client endpoint.
pub fn encode_client_header(endpoint: &SocketAddr) -> Option<[u8; RELAY_CLIENT_HEADER_SIZE]> {
    let SocketAddr::V4(v4) = endpoint else {
        return None;
    };
    let mut header = [0u8; RELAY_CLIENT_HEADER_SIZE];
    header[..4].copy_from_slice(&v4.ip().octets());
    header[4..].copy_from_slice(&v4.port().to_be_bytes());
    Some(header)
}

/// Split a relay-framed datagram into its client endpoint and payload.
pub fn decode_client_header(bytes: &[u8]) -> Option<(SocketAddr, &[u8])> {
    if bytes.len() < RELAY_CLIENT_HEADER_SIZE {
        return None;
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Some((
        SocketAddr::new(IpAddr::V4(ip), port),
        &bytes[RELAY_CLIENT_HEADER_SIZE..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain_one(socket: &mut DualStackSocket) -> Option<Datagram> {
        for _ in 0..50 {
            let mut drained = socket.poll_inbound();
            if !drained.is_empty() {
                return Some(drained.remove(0));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[test]
    fn test_client_header_roundtrip() {
        let endpoint: SocketAddr = "192.168.4.20:3074".parse().unwrap();
        let header = encode_client_header(&endpoint).unwrap();
        assert_eq!(header, [192, 168, 4, 20, 0x0c, 0x02]);

        let mut framed = header.to_vec();
        framed.extend_from_slice(b"payload");
        let (decoded, payload) = decode_client_header(&framed).unwrap();
        assert_eq!(decoded, endpoint);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_client_header_rejects_v6_and_short() {
        let v6: SocketAddr = "[::1]:9999".parse().unwrap();
        assert!(encode_client_header(&v6).is_none());
        assert!(decode_client_header(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_hint_cache_bounded() {
        let mut cache = RelayHintCache::new(2);
        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:2".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:3".parse().unwrap();

        cache.tag(a);
        cache.tag(a); // re-tag is a no-op
        cache.tag(b);
        assert!(cache.contains(&a) && cache.contains(&b));

        cache.tag(c);
        assert!(!cache.contains(&a), "oldest entry not evicted");
        assert!(cache.contains(&b) && cache.contains(&c));
    }

    #[tokio::test]
    async fn test_bind_and_roundtrip() {
        let mut receiver = DualStackSocket::bind(SocketConfig::default()).await.unwrap();
        let sender = DualStackSocket::bind(SocketConfig::default()).await.unwrap();
        let target: SocketAddr =
            format!("127.0.0.1:{}", receiver.v4_port().unwrap()).parse().unwrap();

        sender.send_to(target, b"across the transport".to_vec()).unwrap();

        let datagram = drain_one(&mut receiver).await.expect("datagram not delivered");
        assert_eq!(datagram.bytes, b"across the transport");
    }

    #[tokio::test]
    async fn test_bind_probes_fallback_port() {
        let holder = DualStackSocket::bind(SocketConfig::default()).await.unwrap();
        let taken = holder.v4_port().unwrap();

        // Requesting an occupied port must still bind, on some high port.
        let config = SocketConfig {
            port: Some(taken),
            ..SocketConfig::default()
        };
        let fallback = DualStackSocket::bind(config).await.unwrap();
        let port = fallback.v4_port().or(fallback.v6_port()).unwrap();
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn test_relay_forwarded_inbound_tags_return_path() {
        // A plain socket standing in for the relay's shared port.
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();

        let config = SocketConfig {
            relay: Some(relay_addr),
            ..SocketConfig::default()
        };
        let mut server = DualStackSocket::bind(config).await.unwrap();
        let server_addr: SocketAddr =
            format!("127.0.0.1:{}", server.v4_port().unwrap()).parse().unwrap();

        // Relay-forwarded datagram: header names the true client endpoint.
        let client: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        let mut framed = encode_client_header(&client).unwrap().to_vec();
        framed.extend_from_slice(b"from client");
        relay.send_to(&framed, server_addr).await.unwrap();

        let datagram = drain_one(&mut server).await.expect("datagram not surfaced");
        assert_eq!(datagram.source, client);
        assert_eq!(datagram.bytes, b"from client");

        // The reply to the tagged endpoint is routed through the relay,
        // re-wrapped with the client header.
        server.send_to(client, b"reply".to_vec()).unwrap();
        let mut buffer = [0u8; 128];
        let (len, from) = tokio::time::timeout(
            Duration::from_secs(2),
            relay.recv_from(&mut buffer),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(from.port(), server_addr.port());
        let (target, payload) = decode_client_header(&buffer[..len]).unwrap();
        assert_eq!(target, client);
        assert_eq!(payload, b"reply");
    }
}
