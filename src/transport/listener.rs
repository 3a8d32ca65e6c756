//! Listener-side session admission.
//!
//! A listener owns one socket shared by many sessions and routes inbound
//! datagrams by source endpoint. Datagrams from unknown endpoints go through
//! the [`Acceptor`]: a SYN is opened (asymmetric wrap or passthrough),
//! validated by the hosting application, and promoted to a [`Connection`];
//! anything else earns a no-session notice so a peer holding a stale session
//! can terminate instead of retrying into silence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::core::CipherKey;
use crate::crypto::{PlainKey, SealedKey, SessionKey};

use super::connection::{Connection, ConnectionConfig};
use super::envelope::{EnvelopeFlags, SessionEnvelope};
use super::payload::{Payload, PayloadPolicy};

/// Result of validating a handshake: the session key the client proposed
/// (or the validator derived) plus an optional reply payload, sent reliably
/// as the accepted side's first sequenced message.
pub struct HandshakeOutcome {
    /// Symmetric key for all further traffic on this session.
    pub session_key: SessionKey,
    /// Optional handshake response (credential receipt, server state).
    pub reply: Option<Payload>,
}

/// Application hook deciding whether a handshake becomes a session.
///
/// Returning `None` refuses the handshake; refusal is silent on the wire,
/// the client gives up through its own retry budget.
pub trait HandshakeValidator: Send + Sync {
    /// Inspect a decoded handshake payload from `source`.
    fn validate(&self, source: SocketAddr, handshake: &Payload) -> Option<HandshakeOutcome>;
}

/// What the acceptor decided about a datagram from an unknown endpoint.
pub enum AcceptOutcome {
    /// A validated handshake; the connection is live and its queued
    /// outbound traffic (handshake reply, if any) must be flushed.
    Accepted(Connection),
    /// Non-handshake traffic from an endpoint with no session. The notice
    /// datagram should be sent back to the source.
    NoSession(Vec<u8>),
    /// Dropped without reply.
    Ignored,
}

/// Admission logic for datagrams that match no live session.
pub struct Acceptor {
    identity: Option<SealedKey>,
    validator: Arc<dyn HandshakeValidator>,
    policy: Arc<dyn PayloadPolicy>,
    config: ConnectionConfig,
}

impl Acceptor {
    /// Create an acceptor that accepts passthrough (unwrapped) handshakes
    /// only.
    pub fn new(validator: Arc<dyn HandshakeValidator>, policy: Arc<dyn PayloadPolicy>) -> Self {
        Self {
            identity: None,
            validator,
            policy,
            config: ConnectionConfig::default(),
        }
    }

    /// Attach the listener keypair, enabling asymmetrically wrapped
    /// handshakes. Unwrapped handshakes remain accepted.
    pub fn with_identity(mut self, identity: SealedKey) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Override the connection parameters given to accepted sessions.
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Process a datagram from an endpoint with no live session.
    pub fn handle_unknown(
        &self,
        source: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> AcceptOutcome {
        let Some(flags) = SessionEnvelope::peek_flags(datagram) else {
            return AcceptOutcome::Ignored;
        };

        if !flags.contains(EnvelopeFlags::SYN) {
            // Stale or misdirected session traffic: tell the sender no
            // session exists here. The notice is passthrough-sealed since
            // no shared key exists, and carries no amplification (it is
            // never larger than the minimum valid inbound datagram).
            trace!(%source, "non-handshake traffic from unknown endpoint");
            return match SessionEnvelope::seal(
                0,
                0,
                EnvelopeFlags::NCN | EnvelopeFlags::FAS,
                b"",
                &PlainKey,
            ) {
                Ok(notice) => AcceptOutcome::NoSession(notice),
                Err(_) => AcceptOutcome::Ignored,
            };
        }

        let key: &dyn CipherKey = if flags.contains(EnvelopeFlags::RSA) {
            match self.identity.as_ref().filter(|id| id.can_open()) {
                Some(identity) => identity,
                None => {
                    trace!(%source, "wrapped handshake but no listener keypair");
                    return AcceptOutcome::Ignored;
                }
            }
        } else {
            &PlainKey
        };

        let envelope = match SessionEnvelope::open(datagram, key) {
            Ok(envelope) => envelope,
            Err(err) => {
                trace!(%source, %err, "rejected handshake datagram");
                return AcceptOutcome::Ignored;
            }
        };
        let Ok(handshake) = Payload::decode(&envelope.payload) else {
            return AcceptOutcome::Ignored;
        };

        let Some(outcome) = self.validator.validate(source, &handshake) else {
            debug!(%source, "handshake refused");
            return AcceptOutcome::Ignored;
        };

        let mut conn = Connection::accept(
            source,
            outcome.session_key,
            Arc::clone(&self.policy),
            self.config.clone(),
            now,
        );
        if let Some(reply) = outcome.reply {
            if conn.send(&reply, true, now).is_err() {
                return AcceptOutcome::Ignored;
            }
        }
        debug!(%source, "session accepted");
        AcceptOutcome::Accepted(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connection::ConnectionPhase;
    use crate::transport::payload::{PayloadId, PermissivePolicy};
    use std::net::{IpAddr, Ipv4Addr};

    const HELLO: PayloadId = PayloadId(0x0001);
    const WELCOME: PayloadId = PayloadId(0x0002);

    fn source_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 40100)
    }

    /// Accepts any handshake whose body is a full session key; replies with
    /// a welcome payload.
    struct KeyInBody;

    impl HandshakeValidator for KeyInBody {
        fn validate(&self, _source: SocketAddr, handshake: &Payload) -> Option<HandshakeOutcome> {
            let key = SessionKey::from_bytes(handshake.body().try_into().ok()?);
            Some(HandshakeOutcome {
                session_key: key,
                reply: Some(Payload::new(WELCOME, 0, 0, vec![0xee])),
            })
        }
    }

    struct RefuseAll;

    impl HandshakeValidator for RefuseAll {
        fn validate(&self, _source: SocketAddr, _handshake: &Payload) -> Option<HandshakeOutcome> {
            None
        }
    }

    fn acceptor(validator: Arc<dyn HandshakeValidator>) -> Acceptor {
        Acceptor::new(validator, Arc::new(PermissivePolicy))
    }

    fn syn_datagram(key: &SessionKey, wrap: Option<&SealedKey>) -> Vec<u8> {
        let handshake = Payload::new(HELLO, 0, 0, key.as_bytes().to_vec());
        match wrap {
            Some(wrap) => SessionEnvelope::seal(
                1,
                0,
                EnvelopeFlags::SYN | EnvelopeFlags::RSA,
                &handshake.encode(),
                wrap,
            )
            .unwrap(),
            None => {
                SessionEnvelope::seal(1, 0, EnvelopeFlags::SYN, &handshake.encode(), &PlainKey)
                    .unwrap()
            }
        }
    }

    #[test]
    fn test_accepts_plain_handshake_with_reply() {
        let now = Instant::now();
        let key = SessionKey::generate();
        let acceptor = acceptor(Arc::new(KeyInBody));

        let outcome = acceptor.handle_unknown(source_addr(), &syn_datagram(&key, None), now);
        let AcceptOutcome::Accepted(mut conn) = outcome else {
            panic!("handshake not accepted");
        };
        assert_eq!(conn.phase(), ConnectionPhase::Established);
        assert_eq!(conn.remote_endpoint(), source_addr());

        // The reply is the accepted side's safe sequence 1, readable with
        // the session key the client proposed.
        let outbound = conn.take_outbound();
        assert_eq!(outbound.len(), 1);
        let envelope = SessionEnvelope::open(&outbound[0], &key).unwrap();
        assert_eq!(envelope.seq_num, 1);
        assert_eq!(envelope.ack_num, 1);
        let reply = Payload::decode(&envelope.payload).unwrap();
        assert_eq!(reply.id(), WELCOME);
    }

    #[test]
    fn test_accepts_wrapped_handshake() {
        let now = Instant::now();
        let key = SessionKey::generate();
        let identity = SealedKey::generate();
        let wrap = SealedKey::from_public(identity.public_key());
        let acceptor = acceptor(Arc::new(KeyInBody)).with_identity(identity);

        let outcome = acceptor.handle_unknown(source_addr(), &syn_datagram(&key, Some(&wrap)), now);
        assert!(matches!(outcome, AcceptOutcome::Accepted(_)));
    }

    #[test]
    fn test_wrapped_handshake_without_keypair_ignored() {
        let now = Instant::now();
        let key = SessionKey::generate();
        let stranger = SealedKey::from_public(SealedKey::generate().public_key());
        let acceptor = acceptor(Arc::new(KeyInBody));

        let outcome =
            acceptor.handle_unknown(source_addr(), &syn_datagram(&key, Some(&stranger)), now);
        assert!(matches!(outcome, AcceptOutcome::Ignored));
    }

    #[test]
    fn test_refused_handshake_is_silent() {
        let now = Instant::now();
        let key = SessionKey::generate();
        let acceptor = acceptor(Arc::new(RefuseAll));

        let outcome = acceptor.handle_unknown(source_addr(), &syn_datagram(&key, None), now);
        assert!(matches!(outcome, AcceptOutcome::Ignored));
    }

    #[test]
    fn test_unknown_session_traffic_gets_notice() {
        let now = Instant::now();
        let stale_key = SessionKey::generate();
        let acceptor = acceptor(Arc::new(KeyInBody));

        // Traffic from a session this listener does not hold.
        let datagram =
            SessionEnvelope::seal(9, 4, EnvelopeFlags::FAS, b"stale", &stale_key).unwrap();
        let outcome = acceptor.handle_unknown(source_addr(), &datagram, now);
        let AcceptOutcome::NoSession(notice) = outcome else {
            panic!("expected a no-session notice");
        };

        // The notice terminates the stale peer cleanly.
        let flags = SessionEnvelope::peek_flags(&notice).unwrap();
        assert!(flags.contains(EnvelopeFlags::NCN));
        assert!(notice.len() <= datagram.len());
    }

    #[test]
    fn test_full_handshake_exchange() {
        // Client sends a wrapped SYN carrying session key K; the listener
        // accepts, and its first safe reply lands at the client as
        // delivered sequence 1, exactly once.
        let now = Instant::now();
        let identity = SealedKey::generate();
        let wrap = SealedKey::from_public(identity.public_key());
        let acceptor = acceptor(Arc::new(KeyInBody)).with_identity(identity);

        let key = SessionKey::generate();
        let hello = Payload::new(HELLO, 0, 0, key.as_bytes().to_vec());
        let mut client = Connection::connect(
            "203.0.113.5:47000".parse().unwrap(),
            key,
            &hello,
            Some(&wrap),
            Arc::new(PermissivePolicy),
            ConnectionConfig::default(),
            now,
        )
        .unwrap();
        assert_eq!(client.phase(), ConnectionPhase::Handshaking);

        let syn = client.take_outbound().remove(0);
        let AcceptOutcome::Accepted(mut server) =
            acceptor.handle_unknown(source_addr(), &syn, now)
        else {
            panic!("handshake not accepted");
        };

        for datagram in server.take_outbound() {
            client.handle_datagram(&datagram, now);
        }
        assert_eq!(client.phase(), ConnectionPhase::Established);
        assert_eq!(client.delivered_seq(), 1);
        let delivered = client.receive();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id(), WELCOME);
        assert!(client.receive().is_empty());

        // The reply also acked the handshake, clearing the client's
        // retransmission queue.
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn test_garbage_ignored() {
        let now = Instant::now();
        let acceptor = acceptor(Arc::new(KeyInBody));
        let outcome = acceptor.handle_unknown(source_addr(), &[0xff; 40], now);
        assert!(matches!(outcome, AcceptOutcome::Ignored));
    }
}
