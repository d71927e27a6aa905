//! Connection-oriented datagram transport over plain UDP.
//!
//! [`Endpoint`] is a sans-IO state machine: the owner feeds it received
//! datagrams and the current time, and drains two queues in return, typed
//! [`TransportEvent`]s for the dispatcher and encoded datagrams for the socket.
//! Nothing here touches a socket, which keeps the server and the client drivers
//! thin and lets the protocol be tested without the network.
//!
//! Each datagram is one [`Frame`]. Application packets ride inside
//! `Unreliable` frames (fire and forget) or `Reliable` frames, which carry a
//! per-peer sequence number, are acknowledged, retransmitted on a fixed
//! interval, and delivered to the receiver strictly in order.
//!
//! Every connection attempt carries a random connection id that the accept
//! echoes back. A connect request with a new id from an address that is
//! already connected replaces the old connection, so a peer that restarts
//! from the same socket never inherits stale sequence numbers.

use crate::packet::{WireReader, WireWriter};
use log::{debug, trace, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Version of the framing layer itself, checked before any application payload is looked at.
pub const TRANSPORT_PROTOCOL_VERSION: u8 = 1;
pub const REJECT_REASON_MAX_LENGTH: usize = 200;

mod tag {
    pub const CONNECT_REQUEST: u8 = 0xC1;
    pub const CONNECT_ACCEPT: u8 = 0xC2;
    pub const CONNECT_REJECT: u8 = 0xC3;
    pub const DISCONNECT: u8 = 0xC4;
    pub const UNRELIABLE: u8 = 0xD1;
    pub const RELIABLE: u8 = 0xD2;
    pub const ACK: u8 = 0xD3;
    pub const PING: u8 = 0xE1;
    pub const PONG: u8 = 0xE2;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ConnectRequest {
        protocol_version: u8,
        connection_id: u32,
        payload: Vec<u8>,
    },
    ConnectAccept { connection_id: u32 },
    ConnectReject { reason: String },
    Disconnect,
    Unreliable { payload: Vec<u8> },
    Reliable { sequence: u32, payload: Vec<u8> },
    Ack { sequence: u32 },
    Ping { sequence: u32 },
    Pong { sequence: u32 },
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        match self {
            Frame::ConnectRequest {
                protocol_version,
                connection_id,
                payload,
            } => {
                writer.put(&tag::CONNECT_REQUEST);
                writer.put(protocol_version);
                writer.put(connection_id);
                writer.put_bytes(payload);
            }
            Frame::ConnectAccept { connection_id } => {
                writer.put(&tag::CONNECT_ACCEPT);
                writer.put(connection_id);
            }
            Frame::ConnectReject { reason } => {
                writer.put(&tag::CONNECT_REJECT);
                writer.put_str(reason, REJECT_REASON_MAX_LENGTH);
            }
            Frame::Disconnect => writer.put(&tag::DISCONNECT),
            Frame::Unreliable { payload } => {
                writer.put(&tag::UNRELIABLE);
                writer.put_bytes(payload);
            }
            Frame::Reliable { sequence, payload } => {
                writer.put(&tag::RELIABLE);
                writer.put(sequence);
                writer.put_bytes(payload);
            }
            Frame::Ack { sequence } => {
                writer.put(&tag::ACK);
                writer.put(sequence);
            }
            Frame::Ping { sequence } => {
                writer.put(&tag::PING);
                writer.put(sequence);
            }
            Frame::Pong { sequence } => {
                writer.put(&tag::PONG);
                writer.put(sequence);
            }
        }
        writer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Option<Frame> {
        let (&frame_tag, body) = data.split_first()?;
        let mut reader = WireReader::new(body);

        let frame = match frame_tag {
            tag::CONNECT_REQUEST => Frame::ConnectRequest {
                protocol_version: reader.get()?,
                connection_id: reader.get()?,
                payload: reader.take_rest().to_vec(),
            },
            tag::CONNECT_ACCEPT => Frame::ConnectAccept {
                connection_id: reader.get()?,
            },
            tag::CONNECT_REJECT => Frame::ConnectReject {
                reason: reader.get_str(REJECT_REASON_MAX_LENGTH)?,
            },
            tag::DISCONNECT => Frame::Disconnect,
            tag::UNRELIABLE => Frame::Unreliable {
                payload: reader.take_rest().to_vec(),
            },
            tag::RELIABLE => Frame::Reliable {
                sequence: reader.get()?,
                payload: reader.take_rest().to_vec(),
            },
            tag::ACK => Frame::Ack {
                sequence: reader.get()?,
            },
            tag::PING => Frame::Ping {
                sequence: reader.get()?,
            },
            tag::PONG => Frame::Pong {
                sequence: reader.get()?,
            },
            _ => return None,
        };

        reader.is_empty().then_some(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Unreliable,
    ReliableOrdered,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub resend_interval: Duration,
    pub max_resend_attempts: u32,
    /// How far ahead of the next expected sequence a reliable frame may be and still get buffered.
    pub receive_window: u32,
    pub ping_interval: Duration,
    pub disconnect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(100),
            max_resend_attempts: 50,
            receive_window: 256,
            ping_interval: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Timeout,
    RemoteDisconnect,
    LocalDisconnect,
    Rejected(String),
    ConnectFailed,
    ReliableDeliveryFailed,
    /// The same address opened a new connection.
    Reconnected,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Timeout => write!(f, "connection timed out"),
            DisconnectReason::RemoteDisconnect => write!(f, "remote peer disconnected"),
            DisconnectReason::LocalDisconnect => write!(f, "disconnected locally"),
            DisconnectReason::Rejected(reason) => write!(f, "connection rejected: {}", reason),
            DisconnectReason::ConnectFailed => write!(f, "could not reach remote peer"),
            DisconnectReason::ReliableDeliveryFailed => {
                write!(f, "reliable message was never acknowledged")
            }
            DisconnectReason::Reconnected => write!(f, "peer opened a new connection"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An unknown (or already accepted) peer asked to connect. Answer with
    /// [`Endpoint::accept`] or [`Endpoint::reject`].
    ConnectionRequest { peer: SocketAddr, payload: Vec<u8> },
    Connected { peer: SocketAddr },
    Disconnected { peer: SocketAddr, reason: DisconnectReason },
    Received {
        peer: SocketAddr,
        payload: Vec<u8>,
        delivery: Delivery,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Connecting,
    Connected,
}

#[derive(Debug)]
struct InFlight {
    datagram: Vec<u8>,
    last_sent: Instant,
    attempts: u32,
}

#[derive(Debug)]
struct Peer {
    state: PeerState,
    connection_id: u32,
    last_received: Instant,

    next_send_sequence: u32,
    in_flight: BTreeMap<u32, InFlight>,

    next_receive_sequence: u32,
    reorder_buffer: BTreeMap<u32, Vec<u8>>,

    ping_sequence: u32,
    ping_sent_at: Option<Instant>,
    last_ping: Instant,
    rtt: Option<Duration>,
}

impl Peer {
    fn new(state: PeerState, connection_id: u32, now: Instant) -> Self {
        Self {
            state,
            connection_id,
            last_received: now,
            next_send_sequence: 0,
            in_flight: BTreeMap::new(),
            next_receive_sequence: 0,
            reorder_buffer: BTreeMap::new(),
            ping_sequence: 0,
            ping_sent_at: None,
            last_ping: now,
            rtt: None,
        }
    }
}

/// One side of the transport: a server endpoint accepts many peers, a client
/// endpoint usually connects to exactly one.
#[derive(Debug, Default)]
pub struct Endpoint {
    config: TransportConfig,
    peers: HashMap<SocketAddr, Peer>,
    /// Connection ids of requests waiting for `accept` or `reject`.
    pending_requests: HashMap<SocketAddr, u32>,
    events: VecDeque<TransportEvent>,
    outbox: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl Endpoint {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Starts (or retries) a connection attempt carrying `payload` to `peer`.
    ///
    /// Calling this again while still connecting re-sends the request; calling
    /// it on an established connection does nothing.
    pub fn connect(&mut self, peer: SocketAddr, payload: &[u8], now: Instant) {
        let entry = self
            .peers
            .entry(peer)
            .or_insert_with(|| Peer::new(PeerState::Connecting, rand::random(), now));
        if entry.state == PeerState::Connected {
            return;
        }
        entry.last_received = now;

        debug!("Sending connection request to {}", peer);
        let request = Frame::ConnectRequest {
            protocol_version: TRANSPORT_PROTOCOL_VERSION,
            connection_id: entry.connection_id,
            payload: payload.to_vec(),
        };
        self.outbox.push_back((peer, request.encode()));
    }

    /// Accepts a pending [`TransportEvent::ConnectionRequest`]. Accepting a
    /// retransmitted request for the current connection re-sends the
    /// acceptance and keeps the connection's state.
    pub fn accept(&mut self, peer: SocketAddr, now: Instant) {
        let requested = self.pending_requests.remove(&peer);
        let same_connection = self
            .peers
            .get(&peer)
            .is_some_and(|p| requested.map_or(true, |id| id == p.connection_id));
        if !same_connection {
            let connection_id = requested.unwrap_or_default();
            self.peers
                .insert(peer, Peer::new(PeerState::Connecting, connection_id, now));
        }

        let Some(remote) = self.peers.get_mut(&peer) else {
            return;
        };
        remote.last_received = now;
        let newly_connected = remote.state == PeerState::Connecting;
        remote.state = PeerState::Connected;
        let accept = Frame::ConnectAccept {
            connection_id: remote.connection_id,
        };

        self.outbox.push_back((peer, accept.encode()));
        if newly_connected {
            self.events.push_back(TransportEvent::Connected { peer });
        }
    }

    pub fn reject(&mut self, peer: SocketAddr, reason: &str) {
        debug!("Rejecting connection from {}: {}", peer, reason);
        self.pending_requests.remove(&peer);
        self.peers.remove(&peer);
        let frame = Frame::ConnectReject {
            reason: reason.to_string(),
        };
        self.outbox.push_back((peer, frame.encode()));
    }

    /// Drops `peer`, telling it so. Returns false if the peer was unknown.
    pub fn disconnect(&mut self, peer: SocketAddr) -> bool {
        self.drop_peer(peer, DisconnectReason::LocalDisconnect, true)
    }

    /// Queues `payload` for a connected peer. Returns false if the peer is not connected.
    pub fn send(&mut self, peer: SocketAddr, payload: &[u8], delivery: Delivery, now: Instant) -> bool {
        let Some(remote) = self.peers.get_mut(&peer) else {
            return false;
        };
        if remote.state != PeerState::Connected {
            return false;
        }

        let datagram = match delivery {
            Delivery::Unreliable => Frame::Unreliable {
                payload: payload.to_vec(),
            }
            .encode(),
            Delivery::ReliableOrdered => {
                let sequence = remote.next_send_sequence;
                remote.next_send_sequence = remote.next_send_sequence.wrapping_add(1);
                let datagram = Frame::Reliable {
                    sequence,
                    payload: payload.to_vec(),
                }
                .encode();
                remote.in_flight.insert(
                    sequence,
                    InFlight {
                        datagram: datagram.clone(),
                        last_sent: now,
                        attempts: 1,
                    },
                );
                datagram
            }
        };

        self.outbox.push_back((peer, datagram));
        true
    }

    /// Sends `payload` to every connected peer except `exclude`.
    pub fn broadcast(
        &mut self,
        payload: &[u8],
        delivery: Delivery,
        exclude: Option<SocketAddr>,
        now: Instant,
    ) {
        for peer in self.live_peers() {
            if Some(peer) != exclude {
                self.send(peer, payload, delivery, now);
            }
        }
    }

    /// Feeds one received datagram into the state machine. Malformed datagrams
    /// and traffic from unknown peers are dropped.
    pub fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        let Some(frame) = Frame::decode(data) else {
            trace!("Dropping malformed datagram ({} bytes) from {}", data.len(), from);
            return;
        };

        if let Frame::ConnectRequest {
            protocol_version,
            connection_id,
            payload,
        } = frame
        {
            if protocol_version != TRANSPORT_PROTOCOL_VERSION {
                self.reject(
                    from,
                    &format!(
                        "transport protocol {} is not supported (expected {})",
                        protocol_version, TRANSPORT_PROTOCOL_VERSION
                    ),
                );
                return;
            }
            if self
                .peers
                .get(&from)
                .is_some_and(|p| p.connection_id != connection_id)
            {
                debug!("{} opened a new connection; dropping the old one", from);
                self.drop_peer(from, DisconnectReason::Reconnected, false);
            }
            self.pending_requests.insert(from, connection_id);
            self.events.push_back(TransportEvent::ConnectionRequest {
                peer: from,
                payload,
            });
            return;
        }

        let Some(peer) = self.peers.get_mut(&from) else {
            trace!("Ignoring frame from unknown peer {}", from);
            return;
        };
        peer.last_received = now;

        match frame {
            Frame::ConnectAccept { connection_id } => {
                if peer.state == PeerState::Connecting && peer.connection_id == connection_id {
                    peer.state = PeerState::Connected;
                    self.events.push_back(TransportEvent::Connected { peer: from });
                } else {
                    trace!("Ignoring stale accept from {}", from);
                }
                return;
            }
            Frame::ConnectReject { reason } => {
                if peer.state == PeerState::Connecting {
                    warn!("Connection to {} rejected: {}", from, reason);
                    self.drop_peer(from, DisconnectReason::Rejected(reason), false);
                }
                return;
            }
            Frame::Disconnect => {
                self.drop_peer(from, DisconnectReason::RemoteDisconnect, false);
                return;
            }
            _ => {}
        }

        // Until the accept arrives, traffic may still belong to an older connection
        if peer.state == PeerState::Connecting {
            trace!("Ignoring traffic from {} before the accept", from);
            return;
        }

        match frame {
            Frame::Unreliable { payload } => {
                self.events.push_back(TransportEvent::Received {
                    peer: from,
                    payload,
                    delivery: Delivery::Unreliable,
                });
            }
            Frame::Reliable { sequence, payload } => {
                // Sequences wrap; anything in the lower half of the ring behind
                // the expected sequence counts as already delivered.
                let offset = sequence.wrapping_sub(peer.next_receive_sequence);
                let already_delivered = offset > u32::MAX / 2;
                if offset >= self.config.receive_window && !already_delivered {
                    trace!("Reliable frame {} from {} is outside the window", sequence, from);
                    return;
                }

                self.outbox
                    .push_back((from, Frame::Ack { sequence }.encode()));

                if already_delivered {
                    return;
                }
                peer.reorder_buffer.entry(sequence).or_insert(payload);

                while let Some(payload) = peer.reorder_buffer.remove(&peer.next_receive_sequence) {
                    peer.next_receive_sequence = peer.next_receive_sequence.wrapping_add(1);
                    self.events.push_back(TransportEvent::Received {
                        peer: from,
                        payload,
                        delivery: Delivery::ReliableOrdered,
                    });
                }
            }
            Frame::Ack { sequence } => {
                peer.in_flight.remove(&sequence);
            }
            Frame::Ping { sequence } => {
                self.outbox
                    .push_back((from, Frame::Pong { sequence }.encode()));
            }
            Frame::Pong { sequence } => {
                if sequence == peer.ping_sequence {
                    if let Some(sent_at) = peer.ping_sent_at.take() {
                        peer.rtt = Some(now.saturating_duration_since(sent_at));
                    }
                }
            }
            Frame::ConnectAccept { .. }
            | Frame::ConnectRequest { .. }
            | Frame::ConnectReject { .. }
            | Frame::Disconnect => {}
        }
    }

    /// Runs timers: expires silent peers, retransmits unacknowledged reliable
    /// frames, and sends pings.
    pub fn update(&mut self, now: Instant) {
        let mut dropped = Vec::new();

        for (&addr, peer) in self.peers.iter_mut() {
            if now.saturating_duration_since(peer.last_received) > self.config.disconnect_timeout {
                let reason = match peer.state {
                    PeerState::Connecting => DisconnectReason::ConnectFailed,
                    PeerState::Connected => DisconnectReason::Timeout,
                };
                dropped.push((addr, reason, false));
                continue;
            }

            if peer.state != PeerState::Connected {
                continue;
            }

            let mut delivery_failed = false;
            for in_flight in peer.in_flight.values_mut() {
                if now.saturating_duration_since(in_flight.last_sent) < self.config.resend_interval {
                    continue;
                }
                if in_flight.attempts >= self.config.max_resend_attempts {
                    delivery_failed = true;
                    break;
                }
                in_flight.attempts += 1;
                in_flight.last_sent = now;
                self.outbox.push_back((addr, in_flight.datagram.clone()));
            }
            if delivery_failed {
                dropped.push((addr, DisconnectReason::ReliableDeliveryFailed, true));
                continue;
            }

            if now.saturating_duration_since(peer.last_ping) >= self.config.ping_interval {
                peer.ping_sequence = peer.ping_sequence.wrapping_add(1);
                peer.ping_sent_at = Some(now);
                peer.last_ping = now;
                let ping = Frame::Ping {
                    sequence: peer.ping_sequence,
                };
                self.outbox.push_back((addr, ping.encode()));
            }
        }

        for (addr, reason, notify) in dropped {
            debug!("Dropping peer {}: {}", addr, reason);
            self.drop_peer(addr, reason, notify);
        }
    }

    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    /// Next datagram the I/O driver should put on the wire.
    pub fn pop_outgoing(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.outbox.pop_front()
    }

    pub fn peek_outgoing(&self) -> Option<&(SocketAddr, Vec<u8>)> {
        self.outbox.front()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.peers
            .get(&peer)
            .is_some_and(|p| p.state == PeerState::Connected)
    }

    pub fn is_connecting(&self, peer: SocketAddr) -> bool {
        self.peers
            .get(&peer)
            .is_some_and(|p| p.state == PeerState::Connecting)
    }

    pub fn live_peers(&self) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter(|(_, p)| p.state == PeerState::Connected)
            .map(|(addr, _)| *addr)
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    /// Most recent round-trip time measured by ping.
    pub fn rtt(&self, peer: SocketAddr) -> Option<Duration> {
        self.peers.get(&peer).and_then(|p| p.rtt)
    }

    fn drop_peer(&mut self, peer: SocketAddr, reason: DisconnectReason, notify_remote: bool) -> bool {
        if self.peers.remove(&peer).is_none() {
            return false;
        }
        if notify_remote {
            self.outbox.push_back((peer, Frame::Disconnect.encode()));
        }
        self.events
            .push_back(TransportEvent::Disconnected { peer, reason });
        true
    }
}

/// True for socket errors that only report an unreachable remote port.
///
/// On some platforms an ICMP "port unreachable" surfaces on the next receive
/// of an unconnected UDP socket. The peer's absence is detected by the
/// transport timeout anyway, so drivers skip these errors.
pub fn is_connection_reset(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}
