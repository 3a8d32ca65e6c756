//! Connection: the core state machine.
//!
//! One `Connection` per remote peer. It composes the envelope codec, the
//! retransmission records, and the RTT estimator into ordered ("safe") and
//! best-effort ("fast") delivery, the optimistic handshake, and teardown.
//!
//! A connection is driven by a single owning thread: the owner feeds
//! inbound datagrams through [`Connection::handle_datagram`], calls
//! [`Connection::tick`] once per period, drains [`Connection::take_outbound`]
//! onto a socket, and consumes delivered payloads via
//! [`Connection::receive`]. There is no internal synchronization.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::core::{
    CipherKey, CryptoError, TransportError, FAST_ACK_INTERVAL, FIN_REDUNDANCY,
    HOLDING_BUFFER_CAPACITY, KEEPALIVE_INTERVAL, MAX_SEND_RETRIES, READY_QUEUE_CAPACITY,
    RETRY_OFFSET,
};
use crate::crypto::{PlainKey, SealedKey, SessionKey};

use super::envelope::{EnvelopeFlags, SessionEnvelope};
use super::payload::{Payload, PayloadPolicy};
use super::retransmit::RetransmissionRecord;
use super::timing::{RttEstimator, SendTimeTracker};

/// Which side constructed the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Initiated the handshake.
    Client,
    /// Constructed by the listener after credential validation.
    Accepted,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Handshake sent, no peer traffic seen yet.
    Handshaking,
    /// Data transfer active.
    Established,
    /// Deliberate close in progress (FIN burst being emitted).
    Finishing,
    /// Terminal. No further send or receive mutates state.
    Dead,
}

/// Tunable connection parameters. The defaults are the protocol values.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Retry budget per in-flight safe envelope.
    pub retry_budget: u8,
    /// Fixed safety offset added to the smoothed RTT for retry deadlines.
    pub retry_offset: Duration,
    /// Fast-mode empty envelope cycle.
    pub fast_ack_interval: Duration,
    /// Safe-mode empty envelope cycle.
    pub keepalive_interval: Duration,
    /// Out-of-order holding buffer capacity.
    pub holding_capacity: usize,
    /// Ready queue capacity.
    pub ready_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_budget: MAX_SEND_RETRIES,
            retry_offset: RETRY_OFFSET,
            fast_ack_interval: FAST_ACK_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
            holding_capacity: HOLDING_BUFFER_CAPACITY,
            ready_capacity: READY_QUEUE_CAPACITY,
        }
    }
}

/// An in-flight safe-mode envelope kept until acked or exhausted.
#[derive(Debug)]
struct PendingSend {
    seq: u32,
    datagram: Vec<u8>,
    record: RetransmissionRecord,
}

enum Admit {
    Deliver,
    Drop,
    Violation(&'static str),
}

/// A logical session with exactly one remote peer.
pub struct Connection {
    endpoint: SocketAddr,
    role: ConnectionRole,
    phase: ConnectionPhase,
    errored: bool,

    /// Highest sequence number assigned to a local safe send.
    local_seq: u32,
    /// Highest local sequence the peer has acknowledged. Only increases.
    local_ack: u32,
    /// Highest remote sequence delivered in order. Advances by exactly one
    /// per delivered safe envelope.
    local_get: u32,
    /// Highest control sequence delivered for strictly-ordered types.
    last_ordered_control: u32,

    pending_send: Vec<PendingSend>,
    /// Out-of-order holding buffer, keyed by sequence. `None` marks a
    /// sequenced keepalive that consumes the slot without a payload.
    pending_recv: BTreeMap<u32, Option<Payload>>,
    ready: VecDeque<Payload>,

    rtt: RttEstimator,
    send_times: SendTimeTracker,
    retransmitted_this_tick: HashSet<u32>,

    session_key: Arc<dyn CipherKey>,
    policy: Arc<dyn PayloadPolicy>,
    config: ConnectionConfig,

    outbound: Vec<Vec<u8>>,
    last_fast_ack: Instant,
    last_keepalive: Instant,
}

impl Connection {
    /// Initiate a connection to `endpoint`.
    ///
    /// The application-provided `handshake` payload (identity plus the
    /// chosen session key) becomes the first safe-mode send, SYN-flagged and
    /// sealed with `wrap` when a server keypair is known (RSA flag), or sent
    /// through the passthrough cipher otherwise. The connection proceeds
    /// optimistically; the handshake is acked like any sequence-1 send.
    pub fn connect(
        endpoint: SocketAddr,
        session_key: SessionKey,
        handshake: &Payload,
        wrap: Option<&SealedKey>,
        policy: Arc<dyn PayloadPolicy>,
        config: ConnectionConfig,
        now: Instant,
    ) -> Result<Self, CryptoError> {
        let mut conn = Self::new_inner(
            endpoint,
            ConnectionRole::Client,
            ConnectionPhase::Handshaking,
            0,
            Arc::new(session_key),
            policy,
            config,
            now,
        );

        let encoded = handshake.encode();
        let datagram = match wrap {
            Some(key) => SessionEnvelope::seal(
                1,
                0,
                EnvelopeFlags::SYN | EnvelopeFlags::RSA,
                &encoded,
                key,
            )?,
            None => SessionEnvelope::seal(1, 0, EnvelopeFlags::SYN, &encoded, &PlainKey)?,
        };
        conn.register_safe(1, datagram, now);
        Ok(conn)
    }

    /// Construct the accepted side of a session whose SYN the listener has
    /// already validated. The consumed SYN counts as delivered sequence 1.
    pub fn accept(
        endpoint: SocketAddr,
        session_key: SessionKey,
        policy: Arc<dyn PayloadPolicy>,
        config: ConnectionConfig,
        now: Instant,
    ) -> Self {
        Self::new_inner(
            endpoint,
            ConnectionRole::Accepted,
            ConnectionPhase::Established,
            1,
            Arc::new(session_key),
            policy,
            config,
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new_inner(
        endpoint: SocketAddr,
        role: ConnectionRole,
        phase: ConnectionPhase,
        local_get: u32,
        session_key: Arc<dyn CipherKey>,
        policy: Arc<dyn PayloadPolicy>,
        config: ConnectionConfig,
        now: Instant,
    ) -> Self {
        Self {
            endpoint,
            role,
            phase,
            errored: false,
            local_seq: 0,
            local_ack: 0,
            local_get,
            last_ordered_control: 0,
            pending_send: Vec::new(),
            pending_recv: BTreeMap::new(),
            ready: VecDeque::new(),
            rtt: RttEstimator::new(),
            send_times: SendTimeTracker::new(),
            retransmitted_this_tick: HashSet::new(),
            session_key,
            policy,
            config,
            outbound: Vec::new(),
            last_fast_ack: now,
            last_keepalive: now,
        }
    }

    /// Queue an application payload for transmission.
    ///
    /// `reliable` selects safe mode (sequenced, acknowledged, retransmitted
    /// until acked or exhausted); otherwise fast mode (transmitted once,
    /// never retried, may be silently lost).
    pub fn send(
        &mut self,
        payload: &Payload,
        reliable: bool,
        now: Instant,
    ) -> Result<(), TransportError> {
        if self.is_dead() {
            return Err(TransportError::ConnectionClosed);
        }
        let encoded = payload.encode();
        if reliable {
            self.send_safe_bytes(&encoded, EnvelopeFlags::empty(), now)?;
        } else {
            let datagram = SessionEnvelope::seal(
                self.local_seq,
                self.local_get,
                EnvelopeFlags::FAS,
                &encoded,
                self.session_key.as_ref(),
            )
            .map_err(TransportError::from)?;
            self.outbound.push(datagram);
        }
        Ok(())
    }

    /// Drain payloads delivered since the last call, in delivery order.
    pub fn receive(&mut self) -> VecDeque<Payload> {
        std::mem::take(&mut self.ready)
    }

    /// Drain datagrams queued for transmission to [`Connection::remote_endpoint`].
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound)
    }

    /// Feed one network-origin datagram into the state machine.
    ///
    /// Malformed, duplicate, or unverifiable input is dropped without any
    /// state change; it never surfaces as an error.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) {
        if self.is_dead() {
            return;
        }
        let Some(flags) = SessionEnvelope::peek_flags(datagram) else {
            return;
        };

        // Listener no-session notices are sealed with the passthrough key:
        // the sender has no session key, so the notice cannot be
        // authenticated. An off-path party that learns the 4-tuple can
        // forge one and reset the session, the same exposure as a TCP RST.
        if flags.contains(EnvelopeFlags::NCN) {
            if SessionEnvelope::open(datagram, &PlainKey).is_ok() {
                debug!(endpoint = %self.endpoint, "peer reports no such session, terminating");
                self.phase = ConnectionPhase::Dead;
            }
            return;
        }

        let envelope = match SessionEnvelope::open(datagram, self.session_key.as_ref()) {
            Ok(envelope) => envelope,
            Err(err) => {
                trace!(endpoint = %self.endpoint, %err, "rejected inbound datagram");
                return;
            }
        };

        if self.phase == ConnectionPhase::Handshaking {
            debug!(endpoint = %self.endpoint, "connection established");
            self.phase = ConnectionPhase::Established;
        }

        self.process_ack(envelope.ack_num, now);

        if envelope.flags.contains(EnvelopeFlags::FIN) {
            debug!(endpoint = %self.endpoint, "received FIN, terminating");
            self.phase = ConnectionPhase::Dead;
            return;
        }

        if envelope.flags.contains(EnvelopeFlags::FAS) {
            if envelope.payload.is_empty() {
                return; // ack-only
            }
            let Ok(payload) = Payload::decode(&envelope.payload) else {
                return;
            };
            match self.admit(&payload, false) {
                Admit::Deliver => {
                    if self.ready.len() < self.config.ready_capacity {
                        self.ready.push_back(payload);
                    }
                }
                Admit::Drop => {}
                Admit::Violation(reason) => self.protocol_violation(reason),
            }
            return;
        }

        // Safe mode: hold out-of-order, deliver in sequence.
        let slot = if envelope.payload.is_empty() {
            None
        } else {
            match Payload::decode(&envelope.payload) {
                Ok(payload) => Some(payload),
                Err(_) => return,
            }
        };
        self.enqueue_safe(envelope.seq_num, slot);
        self.drain_holding();
    }

    /// Advance cooperative timers: retransmissions, the fast ack cycle, and
    /// the safe keepalive probe. Call once per period from the owning thread.
    pub fn tick(&mut self, now: Instant) {
        if self.is_dead() {
            return;
        }
        self.retransmitted_this_tick.clear();
        let delay = self.retry_delay();

        let mut exhausted = false;
        for pending in self.pending_send.iter_mut() {
            if !pending.record.is_due(now) {
                continue;
            }
            if !pending.record.try_consume(now, delay) {
                exhausted = true;
                break;
            }
            self.outbound.push(pending.datagram.clone());
            self.retransmitted_this_tick.insert(pending.seq);
        }
        if exhausted {
            debug!(endpoint = %self.endpoint, "retry budget exhausted, peer unreachable");
            self.phase = ConnectionPhase::Dead;
            return;
        }

        if now.saturating_duration_since(self.last_fast_ack) >= self.config.fast_ack_interval {
            self.last_fast_ack = now;
            if let Ok(datagram) = SessionEnvelope::seal(
                self.local_seq,
                self.local_get,
                EnvelopeFlags::FAS,
                b"",
                self.session_key.as_ref(),
            ) {
                self.outbound.push(datagram);
            }
        }

        if now.saturating_duration_since(self.last_keepalive) >= self.config.keepalive_interval {
            self.last_keepalive = now;
            let _ = self.send_safe_bytes(b"", EnvelopeFlags::empty(), now);
        }
    }

    /// Deliberately close the session.
    ///
    /// The FIN is emitted redundantly (termination is unacknowledged) and
    /// the connection is dead locally as soon as this returns; the owner
    /// should still flush [`Connection::take_outbound`].
    pub fn finish_connection(&mut self) {
        if self.is_dead() {
            return;
        }
        self.phase = ConnectionPhase::Finishing;
        if let Ok(datagram) = SessionEnvelope::seal(
            self.local_seq,
            self.local_get,
            EnvelopeFlags::FAS | EnvelopeFlags::FIN,
            b"",
            self.session_key.as_ref(),
        ) {
            for _ in 0..FIN_REDUNDANCY {
                self.outbound.push(datagram.clone());
            }
        }
        debug!(endpoint = %self.endpoint, "connection finished locally");
        self.phase = ConnectionPhase::Dead;
    }

    /// Remote peer address.
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Which side constructed this connection.
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Terminal: no further send or receive mutates state.
    pub fn is_dead(&self) -> bool {
        self.phase == ConnectionPhase::Dead
    }

    /// Whether termination was caused by a protocol violation rather than a
    /// clean close or an unreachable peer.
    pub fn is_error(&self) -> bool {
        self.errored
    }

    /// Smoothed round-trip time (diagnostic / ping display).
    pub fn avg_rtt(&self) -> Duration {
        self.rtt.smoothed()
    }

    /// Highest remote sequence delivered in order.
    pub fn delivered_seq(&self) -> u32 {
        self.local_get
    }

    /// Number of safe-mode envelopes awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.pending_send.len()
    }

    // ---------------------------------------------------------------------

    fn retry_delay(&self) -> Duration {
        self.rtt.smoothed() + self.config.retry_offset
    }

    fn send_safe_bytes(
        &mut self,
        payload: &[u8],
        flags: EnvelopeFlags,
        now: Instant,
    ) -> Result<(), TransportError> {
        let seq = self.local_seq.wrapping_add(1);
        let datagram = SessionEnvelope::seal(
            seq,
            self.local_get,
            flags,
            payload,
            self.session_key.as_ref(),
        )
        .map_err(TransportError::from)?;
        self.register_safe(seq, datagram, now);
        Ok(())
    }

    fn register_safe(&mut self, seq: u32, datagram: Vec<u8>, now: Instant) {
        self.local_seq = seq;
        self.send_times.record(seq, now);
        self.pending_send.push(PendingSend {
            seq,
            datagram: datagram.clone(),
            record: RetransmissionRecord::new(self.config.retry_budget, now, self.retry_delay()),
        });
        self.outbound.push(datagram);
    }

    fn process_ack(&mut self, ack: u32, now: Instant) {
        if ack <= self.local_ack {
            return;
        }
        self.local_ack = ack;

        let mut retired = Vec::new();
        self.pending_send.retain(|pending| {
            if pending.seq <= ack {
                retired.push(pending.seq);
                false
            } else {
                true
            }
        });

        for seq in retired {
            let sent_at = self.send_times.take(seq);
            // A sequence retransmitted this tick yields no sample: its ack
            // cannot be attributed to the original transmission.
            if self.retransmitted_this_tick.contains(&seq) {
                continue;
            }
            if let Some(sent_at) = sent_at {
                self.rtt.record_sample(now.saturating_duration_since(sent_at));
            }
        }
    }

    fn enqueue_safe(&mut self, seq: u32, slot: Option<Payload>) {
        if seq <= self.local_get {
            return; // obsolete or duplicate
        }
        if self.pending_recv.contains_key(&seq) {
            return;
        }
        let immediate = seq == self.local_get.wrapping_add(1);
        if !immediate && self.pending_recv.len() >= self.config.holding_capacity {
            trace!(endpoint = %self.endpoint, seq, "holding buffer full, dropping");
            return;
        }
        self.pending_recv.insert(seq, slot);
    }

    fn drain_holding(&mut self) {
        loop {
            if self.is_dead() {
                return;
            }
            let next = self.local_get.wrapping_add(1);
            let has_payload = match self.pending_recv.get(&next) {
                None => return,
                Some(slot) => slot.is_some(),
            };
            if has_payload && self.ready.len() >= self.config.ready_capacity {
                return; // slow consumer; peer retransmits past the stall
            }
            let Some(slot) = self.pending_recv.remove(&next) else {
                return;
            };
            self.local_get = next;
            if let Some(payload) = slot {
                let first_sequenced = next == 1;
                match self.admit(&payload, first_sequenced) {
                    Admit::Deliver => self.ready.push_back(payload),
                    Admit::Drop => {}
                    Admit::Violation(reason) => {
                        self.protocol_violation(reason);
                        return;
                    }
                }
            }
        }
    }

    /// Per-payload delivery check, applied on both the safe and fast paths.
    fn admit(&mut self, payload: &Payload, first_sequenced: bool) -> Admit {
        if self.policy.handshake_only(payload.id()) && !first_sequenced {
            return Admit::Violation("handshake-only message outside handshake");
        }
        if self.policy.strictly_ordered(payload.id()) {
            let control = payload.control_sequence();
            if control <= self.last_ordered_control {
                return Admit::Drop;
            }
            if control != self.last_ordered_control.wrapping_add(1) {
                return Admit::Violation("control sequence gap");
            }
            self.last_ordered_control = control;
        }
        Admit::Deliver
    }

    fn protocol_violation(&mut self, reason: &'static str) {
        warn!(endpoint = %self.endpoint, reason, "protocol violation, terminating");
        self.errored = true;
        self.phase = ConnectionPhase::Dead;
    }
}
