//! Transport seam: the encrypted net-crypto layer the core drives.
//!
//! The core never does I/O. Everything network-shaped goes through
//! [`Transport`], implemented by the host over its DHT/onion/net-crypto
//! stack. [`MockTransport`] is the in-memory implementation used by the
//! crate's own tests and by host test harnesses.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::identity::{Nospam, PublicKey};

/// Opaque handle to one encrypted connection, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u32);

/// Reliable packets get a monotonically assigned number for ACK polling.
pub type PacketNumber = u32;

/// How an online connection currently reaches the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Udp,
    Tcp,
    /// Transitional: no direct path confirmed and no relay picked yet.
    Unknown,
}

/// Friend-level connection kind reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionKind {
    #[default]
    None,
    Tcp,
    Udp,
    Unknown,
}

/// Our own reachability, reported by the transport's network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkStatus {
    #[default]
    None,
    Tcp,
    Udp,
}

/// A TCP relay worth remembering across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpRelay {
    pub addr: SocketAddr,
    pub public_key: PublicKey,
}

/// Reliable send queue length per connection; the file engine keeps a
/// quarter of it free for non-file traffic.
pub const CRYPTO_MIN_QUEUE_LENGTH: u32 = 64;

/// Error from a transport call. All calls are non-blocking; "would block"
/// surfaces as [`TransportError::QueueFull`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no connection for this handle")]
    NotConnected,
    #[error("send queue full")]
    QueueFull,
    #[error("connection could not be created")]
    ConnectionFailed,
}

/// The encrypted transport consumed by the core. One instance serves every
/// friend; connections are per device.
pub trait Transport {
    /// Our long-term public key. The transport owns the key pair.
    fn self_public_key(&self) -> PublicKey;

    fn nospam(&self) -> Nospam;
    fn set_nospam(&mut self, nospam: Nospam);

    /// Open (or start seeking) an encrypted connection to a public key.
    fn open(&mut self, public_key: &PublicKey) -> Result<ConnectionId, TransportError>;

    /// Release a connection handle. The handle is dead afterwards.
    fn close(&mut self, conn: ConnectionId);

    fn is_connected(&self, conn: ConnectionId) -> bool;

    /// Current path kind for a connected handle.
    fn link_kind(&self, conn: ConnectionId) -> LinkKind;

    /// Queue one reliable packet; returns its number for ACK polling.
    fn send_lossless(
        &mut self,
        conn: ConnectionId,
        packet: &[u8],
    ) -> Result<PacketNumber, TransportError>;

    fn send_lossy(&mut self, conn: ConnectionId, packet: &[u8]) -> Result<(), TransportError>;

    /// Whether the peer has acknowledged a reliable packet yet.
    fn is_packet_delivered(&self, conn: ConnectionId, packet: PacketNumber) -> bool;

    /// Free entries in the reliable send queue.
    fn free_send_slots(&self, conn: ConnectionId) -> u32;

    /// Whether congestion control wants no more bulk data right now.
    fn max_speed_reached(&self, conn: ConnectionId) -> bool;

    /// Hand a friend request to the request-routing subsystem.
    fn send_friend_request(
        &mut self,
        conn: ConnectionId,
        nospam: Nospam,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Our own reachability (for the core-level connection event).
    fn network_status(&self) -> NetworkStatus;

    /// Currently connected TCP relays, best first, at most `max`.
    fn connected_tcp_relays(&self, max: usize) -> Vec<TcpRelay>;

    /// Seed a relay restored from saved state.
    fn add_tcp_relay(&mut self, relay: &TcpRelay);

    /// Advised milliseconds until the transport wants the next tick.
    fn run_interval(&self) -> u64 {
        50
    }
}

#[derive(Debug)]
struct MockConnection {
    peer: PublicKey,
    connected: bool,
    link_kind: Option<LinkKind>,
    closed: bool,
    next_packet_number: PacketNumber,
    sent_lossless: Vec<(PacketNumber, Vec<u8>)>,
    sent_lossy: Vec<Vec<u8>>,
    delivered: Vec<PacketNumber>,
}

impl MockConnection {
    fn new(peer: PublicKey) -> Self {
        MockConnection {
            peer,
            connected: false,
            link_kind: None,
            closed: false,
            next_packet_number: 0,
            sent_lossless: Vec::new(),
            sent_lossy: Vec::new(),
            delivered: Vec::new(),
        }
    }
}

/// Scriptable in-memory transport. Tests open connections through the core,
/// then flip link state and acknowledgements by hand and shuttle the
/// recorded packets into the peer's `Messenger`.
#[derive(Debug)]
pub struct MockTransport {
    self_key: PublicKey,
    nospam: Nospam,
    next_conn: u32,
    conns: HashMap<ConnectionId, MockConnection>,
    free_slots: u32,
    congested: bool,
    refuse_sends: bool,
    refuse_open: bool,
    network_status: NetworkStatus,
    relays: Vec<TcpRelay>,
    added_relays: Vec<TcpRelay>,
    sent_requests: Vec<(ConnectionId, Nospam, Vec<u8>)>,
}

impl MockTransport {
    pub fn new(self_key: PublicKey) -> Self {
        MockTransport {
            self_key,
            nospam: Nospam::default(),
            next_conn: 0,
            conns: HashMap::new(),
            free_slots: CRYPTO_MIN_QUEUE_LENGTH,
            congested: false,
            refuse_sends: false,
            refuse_open: false,
            network_status: NetworkStatus::None,
            relays: Vec::new(),
            added_relays: Vec::new(),
            sent_requests: Vec::new(),
        }
    }

    pub fn connection_to(&self, peer: &PublicKey) -> Option<ConnectionId> {
        self.conns
            .iter()
            .find(|(_, c)| !c.closed && c.peer == *peer)
            .map(|(id, _)| *id)
    }

    pub fn set_connected(&mut self, conn: ConnectionId, connected: bool) {
        if let Some(c) = self.conns.get_mut(&conn) {
            c.connected = connected;
        }
    }

    pub fn set_link_kind(&mut self, conn: ConnectionId, kind: Option<LinkKind>) {
        if let Some(c) = self.conns.get_mut(&conn) {
            c.link_kind = kind;
        }
    }

    pub fn set_free_slots(&mut self, slots: u32) {
        self.free_slots = slots;
    }

    pub fn set_congested(&mut self, congested: bool) {
        self.congested = congested;
    }

    pub fn set_refuse_sends(&mut self, refuse: bool) {
        self.refuse_sends = refuse;
    }

    pub fn set_refuse_open(&mut self, refuse: bool) {
        self.refuse_open = refuse;
    }

    pub fn set_network_status(&mut self, status: NetworkStatus) {
        self.network_status = status;
    }

    pub fn set_relays(&mut self, relays: Vec<TcpRelay>) {
        self.relays = relays;
    }

    pub fn added_relays(&self) -> &[TcpRelay] {
        &self.added_relays
    }

    /// Mark one reliable packet as acknowledged by the peer.
    pub fn mark_delivered(&mut self, conn: ConnectionId, packet: PacketNumber) {
        if let Some(c) = self.conns.get_mut(&conn) {
            c.delivered.push(packet);
        }
    }

    /// Acknowledge every reliable packet sent so far on the connection.
    pub fn deliver_all(&mut self, conn: ConnectionId) {
        if let Some(c) = self.conns.get_mut(&conn) {
            let numbers: Vec<PacketNumber> = c.sent_lossless.iter().map(|(n, _)| *n).collect();
            c.delivered.extend(numbers);
        }
    }

    /// Take the reliable packets queued on a connection, oldest first.
    pub fn drain_lossless(&mut self, conn: ConnectionId) -> Vec<(PacketNumber, Vec<u8>)> {
        self.conns
            .get_mut(&conn)
            .map(|c| std::mem::take(&mut c.sent_lossless))
            .unwrap_or_default()
    }

    pub fn drain_lossy(&mut self, conn: ConnectionId) -> Vec<Vec<u8>> {
        self.conns
            .get_mut(&conn)
            .map(|c| std::mem::take(&mut c.sent_lossy))
            .unwrap_or_default()
    }

    pub fn sent_requests(&self) -> &[(ConnectionId, Nospam, Vec<u8>)] {
        &self.sent_requests
    }

    pub fn is_closed(&self, conn: ConnectionId) -> bool {
        self.conns.get(&conn).map_or(true, |c| c.closed)
    }

    fn live(&self, conn: ConnectionId) -> Option<&MockConnection> {
        self.conns.get(&conn).filter(|c| !c.closed)
    }
}

impl Transport for MockTransport {
    fn self_public_key(&self) -> PublicKey {
        self.self_key
    }

    fn nospam(&self) -> Nospam {
        self.nospam
    }

    fn set_nospam(&mut self, nospam: Nospam) {
        self.nospam = nospam;
    }

    fn open(&mut self, public_key: &PublicKey) -> Result<ConnectionId, TransportError> {
        if self.refuse_open {
            return Err(TransportError::ConnectionFailed);
        }

        let id = ConnectionId(self.next_conn);
        self.next_conn += 1;
        self.conns.insert(id, MockConnection::new(*public_key));
        Ok(id)
    }

    fn close(&mut self, conn: ConnectionId) {
        if let Some(c) = self.conns.get_mut(&conn) {
            c.closed = true;
            c.connected = false;
        }
    }

    fn is_connected(&self, conn: ConnectionId) -> bool {
        self.live(conn).map_or(false, |c| c.connected)
    }

    fn link_kind(&self, conn: ConnectionId) -> LinkKind {
        self.live(conn)
            .and_then(|c| c.link_kind)
            .unwrap_or(LinkKind::Unknown)
    }

    fn send_lossless(
        &mut self,
        conn: ConnectionId,
        packet: &[u8],
    ) -> Result<PacketNumber, TransportError> {
        if self.refuse_sends {
            return Err(TransportError::QueueFull);
        }

        let c = self
            .conns
            .get_mut(&conn)
            .filter(|c| !c.closed && c.connected)
            .ok_or(TransportError::NotConnected)?;
        let number = c.next_packet_number;
        c.next_packet_number += 1;
        c.sent_lossless.push((number, packet.to_vec()));
        Ok(number)
    }

    fn send_lossy(&mut self, conn: ConnectionId, packet: &[u8]) -> Result<(), TransportError> {
        if self.refuse_sends {
            return Err(TransportError::QueueFull);
        }

        let c = self
            .conns
            .get_mut(&conn)
            .filter(|c| !c.closed && c.connected)
            .ok_or(TransportError::NotConnected)?;
        c.sent_lossy.push(packet.to_vec());
        Ok(())
    }

    fn is_packet_delivered(&self, conn: ConnectionId, packet: PacketNumber) -> bool {
        self.live(conn).map_or(false, |c| c.delivered.contains(&packet))
    }

    fn free_send_slots(&self, _conn: ConnectionId) -> u32 {
        self.free_slots
    }

    fn max_speed_reached(&self, _conn: ConnectionId) -> bool {
        self.congested
    }

    fn send_friend_request(
        &mut self,
        conn: ConnectionId,
        nospam: Nospam,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.refuse_sends {
            return Err(TransportError::QueueFull);
        }

        if self.live(conn).is_none() {
            return Err(TransportError::NotConnected);
        }

        self.sent_requests.push((conn, nospam, payload.to_vec()));
        Ok(())
    }

    fn network_status(&self) -> NetworkStatus {
        self.network_status
    }

    fn connected_tcp_relays(&self, max: usize) -> Vec<TcpRelay> {
        self.relays.iter().take(max).copied().collect()
    }

    fn add_tcp_relay(&mut self, relay: &TcpRelay) {
        self.added_relays.push(*relay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> PublicKey {
        PublicKey::from_bytes([seed; 32])
    }

    #[test]
    fn packet_numbers_are_monotonic_per_connection() {
        let mut t = MockTransport::new(key(1));
        let a = t.open(&key(2)).unwrap();
        let b = t.open(&key(3)).unwrap();
        t.set_connected(a, true);
        t.set_connected(b, true);

        assert_eq!(t.send_lossless(a, &[1]).unwrap(), 0);
        assert_eq!(t.send_lossless(a, &[2]).unwrap(), 1);
        assert_eq!(t.send_lossless(b, &[3]).unwrap(), 0);
    }

    #[test]
    fn delivery_is_explicit() {
        let mut t = MockTransport::new(key(1));
        let conn = t.open(&key(2)).unwrap();
        t.set_connected(conn, true);
        let number = t.send_lossless(conn, &[0]).unwrap();

        assert!(!t.is_packet_delivered(conn, number));
        t.mark_delivered(conn, number);
        assert!(t.is_packet_delivered(conn, number));
    }

    #[test]
    fn closed_connection_refuses_sends() {
        let mut t = MockTransport::new(key(1));
        let conn = t.open(&key(2)).unwrap();
        t.set_connected(conn, true);
        t.close(conn);
        assert_eq!(
            t.send_lossless(conn, &[0]),
            Err(TransportError::NotConnected)
        );
        assert!(t.is_closed(conn));
    }
}
