//! Server network layer: owns the UDP socket and transport endpoint, feeds
//! transport events into the session table and runs the maintenance tick.

use crate::session_table::{Outgoing, SessionTable};
use log::{debug, error, info, trace, warn};
use shared::transport::{is_connection_reset, Endpoint, TransportConfig, TransportEvent};
use shared::{saturating_millis, BoxError, Packet, PacketKind, StalenessThresholds, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_players: usize,
    /// Maintenance interval while at least one player is connected.
    pub active_tick: Duration,
    /// Maintenance interval on an empty server.
    pub idle_tick: Duration,
    /// How often the player list is written to the log.
    pub status_interval: Duration,
    /// When a silent player stops being drawn and when they are dropped.
    pub staleness: StalenessThresholds,
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_players: 255,
            active_tick: Duration::from_millis(5),
            idle_tick: Duration::from_millis(250),
            status_interval: Duration::from_secs(60),
            staleness: StalenessThresholds::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Sync server coordinating the transport and the session table
pub struct Server {
    socket: UdpSocket,
    endpoint: Endpoint,
    sessions: Arc<RwLock<SessionTable>>,
    config: ServerConfig,
    last_status: Instant,
}

impl Server {
    pub async fn new(addr: &str, config: ServerConfig) -> Result<Self, BoxError> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Server listening on {}", socket.local_addr()?);

        Ok(Server {
            socket,
            endpoint: Endpoint::new(config.transport.clone()),
            sessions: Arc::new(RwLock::new(
                SessionTable::new(config.max_players).with_thresholds(config.staleness),
            )),
            config,
            last_status: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BoxError> {
        Ok(self.socket.local_addr()?)
    }

    /// Shared handle on the session table, for status reporting and tests.
    pub fn sessions(&self) -> Arc<RwLock<SessionTable>> {
        Arc::clone(&self.sessions)
    }

    /// Runs until `shutdown` turns true (or its sender is dropped), then
    /// disconnects every peer.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BoxError> {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        let mut next_maintenance = tokio::time::Instant::now();

        info!("Server started successfully");

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, from)) => {
                            self.endpoint.handle_datagram(from, &buffer[..len], Instant::now());
                            self.dispatch_events().await;
                            self.flush().await;
                        }
                        Err(e) if is_connection_reset(&e) => {
                            trace!("Ignoring connection reset: {}", e);
                        }
                        Err(e) => error!("Error receiving datagram: {}", e),
                    }
                },

                _ = tokio::time::sleep_until(next_maintenance) => {
                    self.maintain().await;
                    next_maintenance = tokio::time::Instant::now() + self.tick_interval();
                },

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn tick_interval(&self) -> Duration {
        if self.endpoint.connected_count() > 0 {
            self.config.active_tick
        } else {
            self.config.idle_tick
        }
    }

    /// One maintenance tick: transport timers, reconciliation against live
    /// peers, timeout pruning and ping bookkeeping.
    async fn maintain(&mut self) {
        let now = Instant::now();
        self.endpoint.update(now);
        self.dispatch_events().await;

        let live_peers = self.endpoint.live_peers();
        let outgoing = {
            let mut sessions = self.sessions.write().await;
            for peer in &live_peers {
                let ping_ms = self.endpoint.rtt(*peer).map(saturating_millis);
                sessions.set_ping(*peer, ping_ms);
            }
            let mut outgoing = sessions.reconcile(&live_peers);
            outgoing.extend(sessions.prune_timed_out(now));
            outgoing
        };
        self.apply(outgoing, now);

        if now.saturating_duration_since(self.last_status) >= self.config.status_interval {
            self.last_status = now;
            self.log_status().await;
        }

        self.flush().await;
    }

    async fn dispatch_events(&mut self) {
        while let Some(event) = self.endpoint.poll_event() {
            let now = Instant::now();
            match event {
                TransportEvent::ConnectionRequest { peer, payload } => {
                    self.handle_connection_request(peer, &payload, now).await;
                }
                TransportEvent::Connected { peer } => {
                    debug!("Transport connected to {}", peer);
                }
                TransportEvent::Disconnected { peer, reason } => {
                    debug!("Transport lost {}: {}", peer, reason);
                    let outgoing = self.sessions.write().await.handle_disconnect(peer);
                    self.apply(outgoing, now);
                }
                TransportEvent::Received { peer, payload, .. } => match Packet::decode(&payload) {
                    Some(packet) => {
                        let outgoing = self.sessions.write().await.handle_packet(peer, packet, now);
                        self.apply(outgoing, now);
                    }
                    None => trace!("Dropping malformed packet from {}", peer),
                },
            }
        }
    }

    async fn handle_connection_request(&mut self, peer: SocketAddr, payload: &[u8], now: Instant) {
        let Some(Packet::JoinRequest {
            api_version,
            name,
            color,
        }) = Packet::decode_as(PacketKind::JoinRequest, payload)
        else {
            debug!("Rejecting {}: malformed join request", peer);
            self.endpoint.reject(peer, "Malformed join request");
            return;
        };

        let result = self
            .sessions
            .write()
            .await
            .handle_join(peer, api_version, &name, color, now);

        match result {
            Ok(outgoing) => {
                self.endpoint.accept(peer, now);
                self.apply(outgoing, now);
            }
            Err(rejection) => {
                warn!("Rejected join from {}: {}", peer, rejection);
                self.endpoint.reject(peer, &rejection.to_string());
            }
        }
    }

    fn apply(&mut self, outgoing: Vec<Outgoing>, now: Instant) {
        for action in outgoing {
            match action {
                Outgoing::Send {
                    peer,
                    packet,
                    delivery,
                } => {
                    if !self.endpoint.send(peer, &packet.encode(), delivery, now) {
                        debug!("Dropped {:?} for disconnected peer {}", packet.kind(), peer);
                    }
                }
                Outgoing::Broadcast {
                    packet,
                    delivery,
                    exclude,
                } => self
                    .endpoint
                    .broadcast(&packet.encode(), delivery, exclude, now),
                Outgoing::Disconnect { peer } => {
                    self.endpoint.disconnect(peer);
                }
            }
        }
    }

    async fn flush(&mut self) {
        while let Some((to, datagram)) = self.endpoint.pop_outgoing() {
            if let Err(e) = self.socket.send_to(&datagram, to).await {
                if !is_connection_reset(&e) {
                    warn!("Failed to send to {}: {}", to, e);
                }
            }
        }
    }

    async fn log_status(&self) {
        let players = self.sessions.read().await.players();
        if players.is_empty() {
            return;
        }

        info!("{} player(s) online", players.len());
        for player in players {
            info!(
                "  #{} {} ({}) world {} level {} pieces {} ping {}",
                player.player_id,
                player.name,
                player.color,
                player.snapshot.world,
                player.snapshot.level,
                player.puzzle_pieces,
                player
                    .ping
                    .map_or_else(|| "-".to_string(), |ms| format!("{}ms", ms)),
            );
        }
    }

    async fn shutdown(&mut self) {
        info!("Server shutting down");
        for peer in self.endpoint.live_peers() {
            self.endpoint.disconnect(peer);
        }
        // Disconnect events only concern the session table at this point
        while let Some(event) = self.endpoint.poll_event() {
            if let TransportEvent::Disconnected { peer, .. } = event {
                self.sessions.write().await.handle_disconnect(peer);
            }
        }
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::transport::{Delivery, DisconnectReason, Frame};
    use shared::{PlayerColor, PlayerId, API_VERSION};
    use tokio_test::assert_ok;

    async fn start_server() -> (SocketAddr, Arc<RwLock<SessionTable>>, watch::Sender<bool>) {
        let mut server = Server::new("127.0.0.1:0", ServerConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let sessions = server.sessions();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move { server.run(shutdown_rx).await });
        (addr, sessions, shutdown_tx)
    }

    /// Drives a raw endpoint over a real socket until `done` returns true.
    async fn pump_until(
        socket: &UdpSocket,
        endpoint: &mut Endpoint,
        events: &mut Vec<TransportEvent>,
        mut done: impl FnMut(&[TransportEvent]) -> bool,
    ) {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        for _ in 0..200 {
            while let Some((to, datagram)) = endpoint.pop_outgoing() {
                socket.send_to(&datagram, to).await.unwrap();
            }
            if let Ok(Ok((len, from))) =
                tokio::time::timeout(Duration::from_millis(10), socket.recv_from(&mut buffer)).await
            {
                endpoint.handle_datagram(from, &buffer[..len], Instant::now());
            }
            endpoint.update(Instant::now());
            events.extend(std::iter::from_fn(|| endpoint.poll_event()));
            if done(events) {
                return;
            }
        }
        panic!("Condition not reached; events so far: {:?}", events);
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_players, 255);
        assert!(config.active_tick < config.idle_tick);
    }

    #[tokio::test]
    async fn test_join_over_udp() {
        let (server_addr, sessions, shutdown) = start_server().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut endpoint = Endpoint::new(TransportConfig::default());
        let join = Packet::JoinRequest {
            api_version: API_VERSION,
            name: "Alice".to_string(),
            color: PlayerColor::RED,
        };
        endpoint.connect(server_addr, &join.encode(), Instant::now());

        let mut events = Vec::new();
        pump_until(&socket, &mut endpoint, &mut events, |events| {
            events
                .iter()
                .any(|e| matches!(e, TransportEvent::Received { .. }))
        })
        .await;

        assert!(events.contains(&TransportEvent::Connected { peer: server_addr }));
        let response = events.iter().find_map(|e| match e {
            TransportEvent::Received { payload, delivery, .. } => {
                assert_eq!(*delivery, Delivery::ReliableOrdered);
                Packet::decode(payload)
            }
            _ => None,
        });
        match response {
            Some(Packet::JoinResponse {
                player_id,
                name,
                color,
                ..
            }) => {
                assert_eq!(player_id, PlayerId(1));
                assert_eq!(name, "Alice");
                assert_eq!(color, PlayerColor::RED);
            }
            other => panic!("Expected join response, got {:?}", other),
        }
        assert_eq!(sessions.read().await.len(), 1);

        shutdown.send(true).unwrap();
    }

    fn received_chat(events: &[TransportEvent], needle: &str) -> bool {
        events.iter().any(|e| match e {
            TransportEvent::Received { payload, .. } => matches!(
                Packet::decode(payload),
                Some(Packet::ChatBroadcast { text, .. }) if text.contains(needle)
            ),
            _ => false,
        })
    }

    #[tokio::test]
    async fn test_rejoin_from_same_socket_after_lost_disconnect() {
        let (server_addr, sessions, _shutdown) = start_server().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let join = |name: &str| {
            Packet::JoinRequest {
                api_version: API_VERSION,
                name: name.to_string(),
                color: PlayerColor::RED,
            }
            .encode()
        };

        let mut first = Endpoint::new(TransportConfig::default());
        first.connect(server_addr, &join("Alice"), Instant::now());
        let mut events = Vec::new();
        pump_until(&socket, &mut first, &mut events, |events| {
            events
                .iter()
                .any(|e| matches!(e, TransportEvent::Received { .. }))
        })
        .await;
        for text in ["one", "two", "three"] {
            let chat = Packet::ChatMessage { text: text.to_string() }.encode();
            first.send(server_addr, &chat, Delivery::ReliableOrdered, Instant::now());
        }
        pump_until(&socket, &mut first, &mut events, |events| received_chat(events, "three")).await;

        // The game restarts on the same port without saying goodbye
        drop(first);
        let mut second = Endpoint::new(TransportConfig::default());
        second.connect(server_addr, &join("Alice"), Instant::now());
        let mut events = Vec::new();
        pump_until(&socket, &mut second, &mut events, |events| {
            events.iter().any(|e| match e {
                TransportEvent::Received { payload, .. } => {
                    matches!(Packet::decode(payload), Some(Packet::JoinResponse { .. }))
                }
                _ => false,
            })
        })
        .await;

        let chat = Packet::ChatMessage { text: "back again".to_string() }.encode();
        second.send(server_addr, &chat, Delivery::ReliableOrdered, Instant::now());
        pump_until(&socket, &mut second, &mut events, |events| received_chat(events, "back again")).await;

        let sessions = sessions.read().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.players()[0].name, "Alice");
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected_with_reason() {
        let (server_addr, sessions, _shutdown) = start_server().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut endpoint = Endpoint::new(TransportConfig::default());
        let join = Packet::JoinRequest {
            api_version: API_VERSION.wrapping_add(1),
            name: "Old".to_string(),
            color: PlayerColor::UNDEFINED,
        };
        endpoint.connect(server_addr, &join.encode(), Instant::now());

        let mut events = Vec::new();
        pump_until(&socket, &mut endpoint, &mut events, |events| !events.is_empty()).await;

        match &events[0] {
            TransportEvent::Disconnected {
                reason: DisconnectReason::Rejected(reason),
                ..
            } => assert!(reason.contains("version"), "reason: {}", reason),
            other => panic!("Expected rejection, got {:?}", other),
        }
        assert!(sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_datagrams_are_ignored() {
        let (server_addr, sessions, _shutdown) = start_server().await;
        let noisy = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        for garbage in [&[][..], &[0xff; 64][..], &Frame::ConnectRequest {
            protocol_version: shared::transport::TRANSPORT_PROTOCOL_VERSION,
            connection_id: 7,
            payload: vec![1, 2, 3],
        }
        .encode()[..]]
        {
            assert_ok!(noisy.send_to(garbage, server_addr).await);
        }

        // The server keeps answering real joins afterwards
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut endpoint = Endpoint::new(TransportConfig::default());
        let join = Packet::JoinRequest {
            api_version: API_VERSION,
            name: "Bob".to_string(),
            color: PlayerColor::UNDEFINED,
        };
        endpoint.connect(server_addr, &join.encode(), Instant::now());
        let mut events = Vec::new();
        pump_until(&socket, &mut endpoint, &mut events, |events| {
            events
                .iter()
                .any(|e| matches!(e, TransportEvent::Received { .. }))
        })
        .await;
        assert_eq!(sessions.read().await.len(), 1);
    }
}
