//! Relay service: admission control, forwarding, liveness, and quotas.
//!
//! One shared UDP port carries control messages and relayed server-to-client
//! data; every registered server additionally owns one dedicated forwarding
//! port that its clients talk to. Decision logic lives in [`RelayState`]
//! behind a single coarse lock (per-packet work is cheap relative to lock
//! overhead, and no blocking call runs while holding it); socket loops in
//! [`RelayService`] stay thin.
//!
//! The relay has no reverse channel for rejections: a refused registration
//! gets no reply, and rate-limited traffic is dropped silently.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::core::{
    RelayError, CLIENT_ENDPOINT_TTL, CONTROL_RATE_LIMIT, GLOBAL_RATE_BUDGET, MAX_DATAGRAM_SIZE,
    PORT_RELEASE_DRAIN, RATE_WINDOW, REGISTRATION_LIFETIME, RELAY_OP_KEEPALIVE, RELAY_OP_REGISTER,
    RELAY_OP_UNREGISTER,
};
use crate::transport::{decode_client_header, encode_client_header};

use super::ports::PortAllocator;

/// Interval between liveness/TTL sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Relay service parameters. Defaults are the protocol values.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Shared control/data port. Zero binds an ephemeral port.
    pub shared_port: u16,
    /// First dedicated forwarding port.
    pub port_base: u16,
    /// Size of the dedicated port pool.
    pub port_count: u16,
    /// Global cap on simultaneous registrations.
    pub max_registrations: usize,
    /// Cap on registrations per source IP.
    pub max_per_ip: usize,
    /// Keep-alive deadline for registrations.
    pub registration_lifetime: Duration,
    /// Delay before a released port is returned to the pool.
    pub drain_delay: Duration,
    /// TTL for observed client endpoints (anti-reflection).
    pub client_ttl: Duration,
    /// Byte-budget accounting window.
    pub rate_window: Duration,
    /// Global relayed-byte budget per window, split across registrations.
    pub rate_budget: usize,
    /// Control messages allowed per source endpoint per second.
    pub control_rate_limit: u32,
    /// Datagrams larger than this are dropped in either direction.
    pub max_datagram: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            shared_port: 47700,
            port_base: 47710,
            port_count: 256,
            max_registrations: 128,
            max_per_ip: 4,
            registration_lifetime: REGISTRATION_LIFETIME,
            drain_delay: PORT_RELEASE_DRAIN,
            client_ttl: CLIENT_ENDPOINT_TTL,
            rate_window: RATE_WINDOW,
            rate_budget: GLOBAL_RATE_BUDGET,
            control_rate_limit: CONTROL_RATE_LIMIT,
            max_datagram: MAX_DATAGRAM_SIZE,
        }
    }
}

/// TTL-bounded membership set of client endpoints.
#[derive(Debug)]
pub struct ExpiringSet {
    entries: HashMap<SocketAddr, Instant>,
    ttl: Duration,
}

impl ExpiringSet {
    /// Create an empty set with the given entry lifetime.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Insert or refresh an endpoint.
    pub fn touch(&mut self, endpoint: SocketAddr, now: Instant) {
        self.entries.insert(endpoint, now);
    }

    /// Whether the endpoint was touched within the TTL.
    pub fn contains(&self, endpoint: &SocketAddr, now: Instant) -> bool {
        self.entries
            .get(endpoint)
            .is_some_and(|&at| now.saturating_duration_since(at) <= self.ttl)
    }

    /// Drop expired entries.
    pub fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, &mut at| now.saturating_duration_since(at) <= ttl);
    }

    /// Live entry count (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One registered server's relay-side state.
struct Registration {
    port: u16,
    last_keepalive: Instant,
    /// Endpoints allowed as forwarding targets (anti-reflection).
    clients: ExpiringSet,
    /// Bytes relayed this window, both directions combined.
    bytes_used: usize,
    /// Dedicated socket, once the listener is up.
    socket: Option<Arc<UdpSocket>>,
    /// Dedicated listener task, once spawned.
    task: Option<JoinHandle<()>>,
}

/// A removed registration whose port is still draining.
pub struct Teardown {
    /// The server the registration belonged to.
    pub server: SocketAddr,
    /// The dedicated port, not yet returned to the pool.
    pub port: u16,
    task: Option<JoinHandle<()>>,
}

/// Registration table, quotas, and rate counters. Pure decision logic with
/// caller-supplied time; the socket loops translate its answers into I/O.
pub struct RelayState {
    config: RelayConfig,
    registrations: HashMap<SocketAddr, Registration>,
    by_port: HashMap<u16, SocketAddr>,
    per_ip: HashMap<IpAddr, usize>,
    allocator: PortAllocator,
    window_start: Instant,
    /// Per-registration byte share, fixed for the duration of a window.
    window_share: usize,
    control: HashMap<SocketAddr, (u32, Instant)>,
}

impl RelayState {
    /// Create an empty table.
    pub fn new(config: RelayConfig, now: Instant) -> Self {
        let allocator = PortAllocator::new(config.port_base, config.port_count);
        let window_share = config.rate_budget;
        Self {
            config,
            registrations: HashMap::new(),
            by_port: HashMap::new(),
            per_ip: HashMap::new(),
            allocator,
            window_start: now,
            window_share,
            control: HashMap::new(),
        }
    }

    /// Per-source control-message rate gate.
    pub fn control_allowed(&mut self, source: SocketAddr, now: Instant) -> bool {
        let entry = self.control.entry(source).or_insert((0, now));
        if now.saturating_duration_since(entry.1) >= Duration::from_secs(1) {
            *entry = (0, now);
        }
        if entry.0 >= self.config.control_rate_limit {
            return false;
        }
        entry.0 += 1;
        true
    }

    /// Admit a server registration; returns its dedicated port.
    ///
    /// `None` is a refusal (caps or port pool exhausted) and leaves no
    /// partial state. Re-registering a live server refreshes it and returns
    /// its existing port.
    pub fn register(&mut self, server: SocketAddr, now: Instant) -> Option<u16> {
        if let Some(registration) = self.registrations.get_mut(&server) {
            registration.last_keepalive = now;
            return Some(registration.port);
        }
        if self.registrations.len() >= self.config.max_registrations {
            debug!(%server, "registration refused: global cap");
            return None;
        }
        let ip_count = self.per_ip.get(&server.ip()).copied().unwrap_or(0);
        if ip_count >= self.config.max_per_ip {
            debug!(%server, "registration refused: per-IP cap");
            return None;
        }
        let port = match self.allocator.allocate(&server.ip()) {
            Some(port) => port,
            None => {
                warn!(%server, "registration refused: port pool exhausted");
                return None;
            }
        };

        self.registrations.insert(
            server,
            Registration {
                port,
                last_keepalive: now,
                clients: ExpiringSet::new(self.config.client_ttl),
                bytes_used: 0,
                socket: None,
                task: None,
            },
        );
        self.by_port.insert(port, server);
        *self.per_ip.entry(server.ip()).or_insert(0) += 1;
        info!(%server, port, live = self.registrations.len(), "server registered");
        Some(port)
    }

    /// Attach the dedicated socket and listener task to a registration.
    pub fn attach_listener(
        &mut self,
        server: SocketAddr,
        socket: Arc<UdpSocket>,
        task: JoinHandle<()>,
    ) {
        if let Some(registration) = self.registrations.get_mut(&server) {
            registration.socket = Some(socket);
            registration.task = Some(task);
        }
    }

    /// Refresh a registration's keep-alive deadline.
    pub fn keepalive(&mut self, server: SocketAddr, now: Instant) -> bool {
        match self.registrations.get_mut(&server) {
            Some(registration) => {
                registration.last_keepalive = now;
                true
            }
            None => false,
        }
    }

    /// Remove a registration. The port stays allocated until the caller
    /// finishes the drain and calls [`RelayState::release_port`].
    pub fn unregister(&mut self, server: SocketAddr) -> Option<Teardown> {
        let registration = self.registrations.remove(&server)?;
        self.by_port.remove(&registration.port);
        if let Some(count) = self.per_ip.get_mut(&server.ip()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_ip.remove(&server.ip());
            }
        }
        info!(%server, port = registration.port, "server unregistered");
        Some(Teardown {
            server,
            port: registration.port,
            task: registration.task,
        })
    }

    /// Return a drained port to the pool.
    pub fn release_port(&mut self, port: u16) {
        self.allocator.release(port);
    }

    /// Liveness and TTL sweep: expired registrations are removed and
    /// returned for teardown; survivors get their client sets pruned.
    pub fn sweep(&mut self, now: Instant) -> Vec<Teardown> {
        let lifetime = self.config.registration_lifetime;
        let expired: Vec<SocketAddr> = self
            .registrations
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.last_keepalive) > lifetime)
            .map(|(&server, _)| server)
            .collect();

        let mut teardowns = Vec::with_capacity(expired.len());
        for server in expired {
            debug!(%server, "registration expired");
            if let Some(teardown) = self.unregister(server) {
                teardowns.push(teardown);
            }
        }
        for registration in self.registrations.values_mut() {
            registration.clients.sweep(now);
        }
        self.control
            .retain(|_, &mut (_, at)| now.saturating_duration_since(at) < Duration::from_secs(2));
        teardowns
    }

    /// Record a client observed on a server's dedicated listener.
    pub fn note_client(&mut self, port: u16, client: SocketAddr, now: Instant) {
        let Some(server) = self.by_port.get(&port).copied() else {
            return;
        };
        if let Some(registration) = self.registrations.get_mut(&server) {
            registration.clients.touch(client, now);
        }
    }

    /// Anti-reflection gate: a server-to-client forward is allowed only
    /// toward endpoints recently seen on that server's own listener.
    pub fn client_allowed(&self, server: SocketAddr, client: &SocketAddr, now: Instant) -> bool {
        self.registrations
            .get(&server)
            .is_some_and(|r| r.clients.contains(client, now))
    }

    /// Charge `len` bytes against a registration's share of the global
    /// budget. Traffic over the share is dropped, never queued.
    pub fn charge_bytes(&mut self, server: SocketAddr, len: usize, now: Instant) -> bool {
        self.roll_window(now);
        let share = self.window_share;
        let Some(registration) = self.registrations.get_mut(&server) else {
            return false;
        };
        if registration.bytes_used + len > share {
            trace!(%server, len, "over byte budget, dropping");
            return false;
        }
        registration.bytes_used += len;
        true
    }

    /// Server registered at a dedicated port.
    pub fn server_for_port(&self, port: u16) -> Option<SocketAddr> {
        self.by_port.get(&port).copied()
    }

    /// Dedicated socket of a registered server, once attached.
    fn socket_for(&self, server: &SocketAddr) -> Option<Arc<UdpSocket>> {
        self.registrations
            .get(server)
            .and_then(|r| r.socket.clone())
    }

    /// Whether this source endpoint is a registered server.
    pub fn is_registered(&self, server: &SocketAddr) -> bool {
        self.registrations.contains_key(server)
    }

    /// Live registration count.
    pub fn live_count(&self) -> usize {
        self.registrations.len()
    }

    /// The per-registration byte share of the current window; the global
    /// budget is split evenly at each window roll, not mid-window.
    fn roll_window(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) < self.config.rate_window {
            return;
        }
        self.window_start = now;
        self.window_share = self.config.rate_budget / self.registrations.len().max(1);
        for registration in self.registrations.values_mut() {
            registration.bytes_used = 0;
        }
    }
}

/// The relay process: one receive loop on the shared socket, one per
/// dedicated listener, and a periodic sweep.
pub struct RelayService {
    shared: Arc<UdpSocket>,
    state: Arc<Mutex<RelayState>>,
    config: RelayConfig,
}

fn lock(state: &Mutex<RelayState>) -> MutexGuard<'_, RelayState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayService {
    /// Bind the shared control/data socket.
    ///
    /// The dedicated port range is validated up front: a relay whose pool
    /// is empty or runs past the port space would otherwise accept traffic
    /// and fail only on the first registration.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        if config.port_count == 0 {
            return Err(RelayError::BindFailed(
                "dedicated port pool is empty".into(),
            ));
        }
        if config.port_base as u32 + config.port_count as u32 > 65536 {
            return Err(RelayError::BindFailed(format!(
                "dedicated port range {}..{} exceeds the port space",
                config.port_base,
                config.port_base as u32 + config.port_count as u32,
            )));
        }
        let addr = format!("0.0.0.0:{}", config.shared_port);
        let shared = UdpSocket::bind(&addr)
            .await
            .map_err(|err| RelayError::BindFailed(format!("{addr}: {err}")))?;
        let state = RelayState::new(config.clone(), Instant::now());
        Ok(Self {
            shared: Arc::new(shared),
            state: Arc::new(Mutex::new(state)),
            config,
        })
    }

    /// Local address of the shared socket.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.shared.local_addr()?)
    }

    /// Run the relay until the task is cancelled.
    pub async fn run(self) -> Result<(), RelayError> {
        info!(addr = %self.shared.local_addr()?, "relay listening");
        self.spawn_sweeper();

        let mut buffer = vec![0u8; 65535];
        loop {
            let (len, source) = self.shared.recv_from(&mut buffer).await?;
            self.handle_shared(source, &buffer[..len]).await;
        }
    }

    /// Dispatch one datagram from the shared socket: 1-byte control
    /// messages, or relay-framed data from a registered server.
    async fn handle_shared(&self, source: SocketAddr, bytes: &[u8]) {
        let now = Instant::now();
        if bytes.len() > self.config.max_datagram {
            trace!(%source, len = bytes.len(), "oversized datagram dropped");
            return;
        }

        if bytes.len() == 1 {
            if !lock(&self.state).control_allowed(source, now) {
                trace!(%source, "control rate limited");
                return;
            }
            match bytes[0] {
                RELAY_OP_REGISTER => self.handle_register(source, now).await,
                RELAY_OP_KEEPALIVE => {
                    lock(&self.state).keepalive(source, now);
                }
                RELAY_OP_UNREGISTER => {
                    let teardown = lock(&self.state).unregister(source);
                    if let Some(teardown) = teardown {
                        self.spawn_drain(teardown);
                    }
                }
                opcode => trace!(%source, opcode, "unknown control opcode"),
            }
            return;
        }

        // Server -> client data: strip the endpoint header, forward the
        // payload from the server's dedicated port.
        let Some((client, payload)) = decode_client_header(bytes) else {
            return;
        };
        let socket = {
            let mut state = lock(&self.state);
            if !state.is_registered(&source) {
                trace!(%source, "data from unregistered endpoint");
                return;
            }
            if !state.client_allowed(source, &client, now) {
                trace!(%source, %client, "reflection target not validated, dropping");
                return;
            }
            if !state.charge_bytes(source, payload.len(), now) {
                return;
            }
            state.socket_for(&source)
        };
        if let Some(socket) = socket {
            if let Err(err) = socket.send_to(payload, client).await {
                trace!(%client, %err, "forward to client failed");
            }
        }
    }

    async fn handle_register(&self, server: SocketAddr, now: Instant) {
        let Some(port) = lock(&self.state).register(server, now) else {
            return; // refusal is silence
        };

        let needs_listener = lock(&self.state).socket_for(&server).is_none();
        if needs_listener {
            let dedicated = match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => Arc::new(socket),
                Err(err) => {
                    warn!(port, %err, "dedicated port bind failed");
                    let teardown = lock(&self.state).unregister(server);
                    if let Some(teardown) = teardown {
                        self.spawn_drain(teardown);
                    }
                    return;
                }
            };
            let task = tokio::spawn(dedicated_loop(
                Arc::clone(&dedicated),
                Arc::clone(&self.shared),
                Arc::clone(&self.state),
                server,
                port,
                self.config.max_datagram,
            ));
            lock(&self.state).attach_listener(server, dedicated, task);
        }

        if let Err(err) = self.shared.send_to(&port.to_be_bytes(), server).await {
            debug!(%server, %err, "registration reply failed");
        }
    }

    /// Release the port only after a short drain so in-flight sends on the
    /// dedicated socket can complete.
    fn spawn_drain(&self, teardown: Teardown) {
        let state = Arc::clone(&self.state);
        let delay = self.config.drain_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(task) = teardown.task {
                task.abort();
            }
            lock(&state).release_port(teardown.port);
            debug!(server = %teardown.server, port = teardown.port, "port released");
        });
    }

    fn spawn_sweeper(&self) {
        let state = Arc::clone(&self.state);
        let drain_delay = self.config.drain_delay;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let teardowns = lock(&state).sweep(Instant::now());
                for teardown in teardowns {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        tokio::time::sleep(drain_delay).await;
                        if let Some(task) = teardown.task {
                            task.abort();
                        }
                        lock(&state).release_port(teardown.port);
                    });
                }
            }
        });
    }
}

/// Client -> server leg: datagrams on a dedicated port are prefixed with
/// the client endpoint header and forwarded to the server via the shared
/// socket. Seeing a client here is what later authorizes forwards back to
/// it.
async fn dedicated_loop(
    dedicated: Arc<UdpSocket>,
    shared: Arc<UdpSocket>,
    state: Arc<Mutex<RelayState>>,
    server: SocketAddr,
    port: u16,
    max_datagram: usize,
) {
    let mut buffer = vec![0u8; 65535];
    loop {
        let (len, client) = match dedicated.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(err) => {
                trace!(port, %err, "dedicated receive error");
                continue;
            }
        };
        if len > max_datagram {
            continue;
        }
        let Some(header) = encode_client_header(&client) else {
            continue; // relay framing is IPv4-only on the client side
        };
        let now = Instant::now();
        {
            let mut state = lock(&state);
            state.note_client(port, client, now);
            if !state.charge_bytes(server, len, now) {
                continue;
            }
        }
        let mut framed = Vec::with_capacity(header.len() + len);
        framed.extend_from_slice(&header);
        framed.extend_from_slice(&buffer[..len]);
        if let Err(err) = shared.send_to(&framed, server).await {
            trace!(%server, %err, "forward to server failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RELAY_OP_KEEPALIVE, RELAY_OP_REGISTER};

    fn test_config() -> RelayConfig {
        RelayConfig {
            shared_port: 0,
            port_base: 43710,
            port_count: 16,
            max_registrations: 4,
            max_per_ip: 2,
            ..RelayConfig::default()
        }
    }

    fn server(ip_last: u8, port: u16) -> SocketAddr {
        format!("198.51.100.{ip_last}:{port}").parse().unwrap()
    }

    #[test]
    fn test_expiring_set_ttl() {
        let now = Instant::now();
        let mut set = ExpiringSet::new(Duration::from_secs(15));
        let endpoint = server(1, 1000);

        set.touch(endpoint, now);
        assert!(set.contains(&endpoint, now + Duration::from_secs(15)));
        assert!(!set.contains(&endpoint, now + Duration::from_secs(16)));

        set.sweep(now + Duration::from_secs(16));
        assert!(set.is_empty());

        // Re-touching resets the clock.
        set.touch(endpoint, now + Duration::from_secs(20));
        assert!(set.contains(&endpoint, now + Duration::from_secs(30)));
    }

    #[test]
    fn test_global_registration_cap() {
        let now = Instant::now();
        let mut state = RelayState::new(test_config(), now);

        for n in 0..4 {
            assert!(state.register(server(n + 1, 7777), now).is_some());
        }
        assert_eq!(state.live_count(), 4);
        // One past the cap is refused, with no partial state.
        assert!(state.register(server(9, 7777), now).is_none());
        assert_eq!(state.live_count(), 4);
        assert_eq!(state.allocator.allocated(), 4);
    }

    #[test]
    fn test_per_ip_cap_independent_of_global() {
        let now = Instant::now();
        let mut state = RelayState::new(test_config(), now);

        assert!(state.register(server(1, 1000), now).is_some());
        assert!(state.register(server(1, 1001), now).is_some());
        // Third from the same IP refused despite global room.
        assert!(state.register(server(1, 1002), now).is_none());
        assert!(state.register(server(2, 1000), now).is_some());
    }

    #[test]
    fn test_reregistration_returns_same_port() {
        let now = Instant::now();
        let mut state = RelayState::new(test_config(), now);
        let endpoint = server(5, 2000);

        let first = state.register(endpoint, now).unwrap();
        let second = state.register(endpoint, now + Duration::from_secs(1)).unwrap();
        assert_eq!(first, second);
        assert_eq!(state.live_count(), 1);
    }

    #[test]
    fn test_anti_reflection_gate() {
        let now = Instant::now();
        let mut state = RelayState::new(test_config(), now);
        let endpoint = server(3, 3000);
        let port = state.register(endpoint, now).unwrap();
        let client = server(77, 40000);

        // Unseen client: forward refused.
        assert!(!state.client_allowed(endpoint, &client, now));

        // Client sends through the dedicated listener: forward allowed
        // until the TTL lapses.
        state.note_client(port, client, now);
        assert!(state.client_allowed(endpoint, &client, now + Duration::from_secs(10)));
        assert!(!state.client_allowed(endpoint, &client, now + Duration::from_secs(20)));
    }

    #[test]
    fn test_byte_budget_split_and_window_reset() {
        let now = Instant::now();
        let mut config = test_config();
        config.rate_budget = 1000;
        let mut state = RelayState::new(config, now);
        let a = server(1, 1000);
        let b = server(2, 1000);
        state.register(a, now).unwrap();
        state.register(b, now).unwrap();

        // First window still carries the pre-registration share; roll into
        // a fresh window where the budget splits two ways.
        let t1 = now + Duration::from_millis(100);
        assert!(state.charge_bytes(a, 500, t1));
        assert!(!state.charge_bytes(a, 1, t1), "share not enforced");
        // The other registration draws from its own share.
        assert!(state.charge_bytes(b, 500, t1));

        // Next window restores both.
        let t2 = t1 + Duration::from_millis(100);
        assert!(state.charge_bytes(a, 500, t2));
    }

    #[test]
    fn test_control_rate_limit() {
        let now = Instant::now();
        let mut state = RelayState::new(test_config(), now);
        let source = server(8, 5555);

        for _ in 0..6 {
            assert!(state.control_allowed(source, now));
        }
        assert!(!state.control_allowed(source, now));
        // A different source has its own counter.
        assert!(state.control_allowed(server(9, 5555), now));
        // The window rolls over after a second.
        assert!(state.control_allowed(source, now + Duration::from_secs(1)));
    }

    #[test]
    fn test_sweep_expires_silent_registrations() {
        let now = Instant::now();
        let mut state = RelayState::new(test_config(), now);
        let quiet = server(1, 1000);
        let chatty = server(2, 1000);
        let quiet_port = state.register(quiet, now).unwrap();
        state.register(chatty, now).unwrap();

        let later = now + Duration::from_secs(16);
        state.keepalive(chatty, later);
        let teardowns = state.sweep(later);

        assert_eq!(teardowns.len(), 1);
        assert_eq!(teardowns[0].server, quiet);
        assert_eq!(teardowns[0].port, quiet_port);
        assert!(state.is_registered(&chatty));
        assert!(!state.is_registered(&quiet));

        // The port stays out of the pool until the drain completes.
        assert_eq!(state.allocator.allocated(), 2);
        state.release_port(quiet_port);
        assert_eq!(state.allocator.allocated(), 1);
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_port_range() {
        // An empty pool must be refused at startup, not panic on the first
        // registration.
        let empty = RelayConfig {
            port_count: 0,
            ..test_config()
        };
        assert!(matches!(
            RelayService::bind(empty).await,
            Err(RelayError::BindFailed(_))
        ));

        // A range running past the end of the port space is refused too.
        let overflowing = RelayConfig {
            port_base: 65000,
            port_count: 1000,
            ..test_config()
        };
        assert!(matches!(
            RelayService::bind(overflowing).await,
            Err(RelayError::BindFailed(_))
        ));

        // The last representable range is still accepted.
        let edge = RelayConfig {
            port_base: 65520,
            port_count: 16,
            ..test_config()
        };
        assert!(RelayService::bind(edge).await.is_ok());
    }

    #[tokio::test]
    async fn test_relay_end_to_end_forwarding() {
        let service = RelayService::bind(test_config()).await.unwrap();
        let shared_addr: SocketAddr =
            format!("127.0.0.1:{}", service.local_addr().unwrap().port()).parse().unwrap();
        tokio::spawn(service.run());

        // Register a server; the reply carries the dedicated port.
        let game_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        game_server
            .send_to(&[RELAY_OP_REGISTER], shared_addr)
            .await
            .unwrap();
        let mut reply = [0u8; 8];
        let (len, _) = tokio::time::timeout(
            Duration::from_secs(2),
            game_server.recv_from(&mut reply),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(len, 2);
        let dedicated_port = u16::from_be_bytes([reply[0], reply[1]]);
        let dedicated_addr: SocketAddr =
            format!("127.0.0.1:{dedicated_port}").parse().unwrap();

        // A client talks to the dedicated port; the server receives it with
        // the client endpoint header prepended.
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", dedicated_addr).await.unwrap();

        let mut buffer = [0u8; 128];
        let (len, _) = tokio::time::timeout(
            Duration::from_secs(2),
            game_server.recv_from(&mut buffer),
        )
        .await
        .unwrap()
        .unwrap();
        let (client_endpoint, payload) = decode_client_header(&buffer[..len]).unwrap();
        assert_eq!(payload, b"ping");
        assert_eq!(client_endpoint.port(), client.local_addr().unwrap().port());

        // The server replies through the relay; the anti-reflection gate
        // passes because the client was just seen.
        let mut framed = encode_client_header(&client_endpoint).unwrap().to_vec();
        framed.extend_from_slice(b"pong");
        game_server.send_to(&framed, shared_addr).await.unwrap();

        let (len, from) = tokio::time::timeout(
            Duration::from_secs(2),
            client.recv_from(&mut buffer),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buffer[..len], b"pong");
        assert_eq!(from.port(), dedicated_port);

        // Keep-alive from the server is accepted silently.
        game_server
            .send_to(&[RELAY_OP_KEEPALIVE], shared_addr)
            .await
            .unwrap();
    }
}
