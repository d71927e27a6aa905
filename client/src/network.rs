use crate::chat::ChatLog;
use crate::session::{ClientEvent, ClientSession};
use crate::simulation::{LinkSimulator, LinkStats, NetworkSimulation};
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::transport::{
    is_connection_reset, Delivery, DisconnectReason, Endpoint, TransportConfig, TransportEvent,
};
use shared::{
    saturating_millis, truncate_chars, BoxError, EntitySnapshot, Packet, PlayerColor,
    PlayerSummary, API_VERSION, MAX_DATAGRAM_SIZE, PLAYER_NAME_MAX_LENGTH,
};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How many times the join request is sent before giving up.
    pub connect_attempts: u32,
    pub polls_per_attempt: u32,
    pub poll_interval: Duration,
    pub transport: TransportConfig,
    /// Artificial latency and loss on incoming datagrams.
    pub simulation: Option<NetworkSimulation>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            polls_per_attempt: 20,
            poll_interval: Duration::from_millis(50),
            transport: TransportConfig::default(),
            simulation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Transport link is up, join response not yet received.
    Connected,
    Initialized,
}

pub struct Client {
    socket: UdpSocket,
    endpoint: Endpoint,
    server_addr: Option<SocketAddr>,
    state: ConnectionState,
    session: ClientSession,
    events: VecDeque<ClientEvent>,
    link: Option<LinkSimulator>,
    config: ClientConfig,
}

impl Client {
    pub async fn new(config: ClientConfig) -> Result<Self, BoxError> {
        Self::with_rng(config, StdRng::from_entropy()).await
    }

    /// Like [`Client::new`], with the random source of the network simulation
    /// supplied by the caller.
    pub async fn with_rng(config: ClientConfig, rng: StdRng) -> Result<Self, BoxError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        debug!("Client bound to {}", socket.local_addr()?);
        let link = config.simulation.map(|settings| {
            info!(
                "Simulating {:?}-{:?} latency with {}% packet loss",
                settings.min_latency, settings.max_latency, settings.packet_loss_percent
            );
            LinkSimulator::new(settings, rng)
        });

        Ok(Client {
            socket,
            endpoint: Endpoint::new(config.transport.clone()),
            server_addr: None,
            state: ConnectionState::Disconnected,
            session: ClientSession::new(),
            events: VecDeque::new(),
            link,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BoxError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// Joins `server`, retrying the join request up to the configured number
    /// of attempts.
    ///
    /// Returns true once the join response has been received. `cancel` is
    /// checked before every attempt and between every poll; cancelling never
    /// interrupts a send that is already under way.
    pub async fn connect_to_server(
        &mut self,
        server: &str,
        name: &str,
        color: PlayerColor,
        cancel: &watch::Receiver<bool>,
    ) -> bool {
        if self.state != ConnectionState::Disconnected {
            self.disconnect();
        }
        if *cancel.borrow() {
            return false;
        }

        let server_addr = match resolve(server).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Could not resolve server address {}: {}", server, e);
                return false;
            }
        };

        info!("Connecting to {} as '{}'", server_addr, name);
        let request = Packet::JoinRequest {
            api_version: API_VERSION,
            name: truncate_chars(name, PLAYER_NAME_MAX_LENGTH).to_string(),
            color,
        }
        .encode();

        self.server_addr = Some(server_addr);
        self.state = ConnectionState::Connecting;

        for attempt in 1..=self.config.connect_attempts {
            if *cancel.borrow() {
                info!("Connection attempt cancelled");
                self.abort_connect();
                return false;
            }

            if !self.endpoint.is_connected(server_addr) {
                debug!("Join attempt {}/{}", attempt, self.config.connect_attempts);
                self.endpoint.connect(server_addr, &request, Instant::now());
                self.flush_async().await;
            }

            for _ in 0..self.config.polls_per_attempt {
                self.poll_events();
                match self.state {
                    ConnectionState::Initialized => return true,
                    // Rejected, or the link dropped while joining
                    ConnectionState::Disconnected => return false,
                    ConnectionState::Connecting | ConnectionState::Connected => {}
                }

                if *cancel.borrow() {
                    info!("Connection attempt cancelled");
                    self.abort_connect();
                    return false;
                }
                sleep(self.config.poll_interval).await;
            }
        }

        warn!(
            "No answer from {} after {} attempts",
            server_addr, self.config.connect_attempts
        );
        self.abort_connect();
        false
    }

    fn abort_connect(&mut self) {
        self.disconnect();
        // An aborted attempt is not a disconnect the caller needs to hear about
        self.events
            .retain(|event| !matches!(event, ClientEvent::Disconnected { .. }));
    }

    /// Reads every pending datagram, runs transport timers, applies received
    /// packets and prunes stale players. Never blocks. Returns the number of
    /// packets applied.
    pub fn poll_events(&mut self) -> usize {
        let now = Instant::now();
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            match self.socket.try_recv_from(&mut buffer) {
                Ok((len, from)) => match self.link.as_mut() {
                    Some(link) => {
                        link.submit(from, &buffer[..len], now);
                    }
                    None => self.endpoint.handle_datagram(from, &buffer[..len], now),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_connection_reset(&e) => {
                    trace!("Ignoring connection reset: {}", e);
                }
                Err(e) => {
                    warn!("Error receiving datagram: {}", e);
                    break;
                }
            }
        }

        if let Some(link) = self.link.as_mut() {
            while let Some((from, datagram)) = link.pop_due(now) {
                self.endpoint.handle_datagram(from, &datagram, now);
            }
        }
        self.endpoint.update(now);

        let mut processed = 0;
        while let Some(event) = self.endpoint.poll_event() {
            match event {
                TransportEvent::Connected { peer } if Some(peer) == self.server_addr => {
                    debug!("Transport connected to {}", peer);
                    if self.state == ConnectionState::Connecting {
                        self.state = ConnectionState::Connected;
                    }
                }
                TransportEvent::Disconnected { peer, reason } if Some(peer) == self.server_addr => {
                    self.handle_disconnected(reason);
                }
                TransportEvent::Received { peer, payload, .. } if Some(peer) == self.server_addr => {
                    match Packet::decode(&payload) {
                        Some(packet) => {
                            processed += 1;
                            if let Some(event) = self.session.handle_packet(packet, now) {
                                if matches!(event, ClientEvent::Initialized { .. }) {
                                    self.state = ConnectionState::Initialized;
                                }
                                self.events.push_back(event);
                            }
                        }
                        None => trace!("Dropping malformed packet from {}", peer),
                    }
                }
                TransportEvent::ConnectionRequest { peer, .. } => {
                    self.endpoint.reject(peer, "Clients do not accept connections");
                }
                other => trace!("Ignoring transport event {:?}", other),
            }
        }

        if let Some(server) = self.server_addr {
            let ping_ms = self.endpoint.rtt(server).map(saturating_millis);
            self.session.set_server_ping(ping_ms);
        }
        self.session.prune(now);
        self.flush();

        processed
    }

    fn handle_disconnected(&mut self, reason: DisconnectReason) {
        match &reason {
            DisconnectReason::LocalDisconnect => info!("Disconnected from server"),
            other => warn!("Lost connection to server: {}", other),
        }
        self.state = ConnectionState::Disconnected;
        self.server_addr = None;
        self.session.reset();
        if let Some(link) = self.link.as_mut() {
            link.clear();
        }
        self.events.push_back(ClientEvent::Disconnected { reason });
    }

    /// Sends the local player's state for a newly observed game frame.
    ///
    /// Does nothing before the join completes, or if `snapshot` is not newer
    /// than the last frame sent.
    pub fn send_player_state_update(
        &mut self,
        speedrun_frame_index: Option<i32>,
        puzzle_pieces: u8,
        snapshot: EntitySnapshot,
    ) {
        if self.state != ConnectionState::Initialized {
            return;
        }
        let packet = self.session.prepare_state_update(
            speedrun_frame_index,
            puzzle_pieces,
            snapshot,
            Instant::now(),
        );
        if let Some(packet) = packet {
            self.send(&packet, Delivery::Unreliable);
        }
    }

    /// Re-sends the last state with a bumped frame index while the game is paused.
    pub fn send_keep_alive(&mut self) {
        if self.state != ConnectionState::Initialized {
            return;
        }
        if let Some(packet) = self.session.prepare_keep_alive(Instant::now()) {
            self.send(&packet, Delivery::Unreliable);
        }
    }

    pub fn send_chat_message(&mut self, text: &str) {
        if self.state != ConnectionState::Initialized {
            return;
        }
        if let Some(packet) = self.session.prepare_chat_message(text) {
            self.send(&packet, Delivery::ReliableOrdered);
        }
    }

    fn send(&mut self, packet: &Packet, delivery: Delivery) {
        let Some(server) = self.server_addr else {
            return;
        };
        if self
            .endpoint
            .send(server, &packet.encode(), delivery, Instant::now())
        {
            self.flush();
        }
    }

    /// Leaves the server, telling it so.
    pub fn disconnect(&mut self) {
        if let Some(server) = self.server_addr {
            self.endpoint.disconnect(server);
            self.flush();
        }
        while let Some(event) = self.endpoint.poll_event() {
            if let TransportEvent::Disconnected { reason, .. } = event {
                self.handle_disconnected(reason);
            }
        }
        self.state = ConnectionState::Disconnected;
        self.server_addr = None;
        self.session.reset();
    }

    /// Pops the next pending notification.
    pub fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn players(&self) -> Vec<PlayerSummary> {
        self.session.players()
    }

    pub fn visible_players(&self, world: u8, level: u8) -> Vec<PlayerSummary> {
        self.session.visible_players(world, level, Instant::now())
    }

    pub fn leaderboard(&self) -> Vec<PlayerSummary> {
        self.session.leaderboard()
    }

    pub fn chat_log(&self) -> &ChatLog {
        self.session.chat_log()
    }

    pub fn own_player_color(&self) -> Option<PlayerColor> {
        self.session.own_player_color()
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Counters of the simulated link, when one is configured.
    pub fn link_stats(&self) -> Option<LinkStats> {
        self.link.as_ref().map(LinkSimulator::stats)
    }

    /// Writes queued datagrams without blocking. Anything the socket cannot
    /// take right now stays queued for the next flush.
    fn flush(&mut self) {
        while let Some((to, datagram)) = self.endpoint.peek_outgoing() {
            let result = self.socket.try_send_to(datagram, *to);
            if matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
                break;
            }
            let to = *to;
            self.endpoint.pop_outgoing();
            if let Err(e) = result {
                if !is_connection_reset(&e) {
                    warn!("Failed to send to {}: {}", to, e);
                }
            }
        }
    }

    async fn flush_async(&mut self) {
        while let Some((to, datagram)) = self.endpoint.pop_outgoing() {
            if let Err(e) = self.socket.send_to(&datagram, to).await {
                if !is_connection_reset(&e) {
                    warn!("Failed to send to {}: {}", to, e);
                }
            }
        }
    }
}

/// Resolves `server`, preferring IPv4 since the socket is bound to an IPv4 address.
async fn resolve(server: &str) -> Result<SocketAddr, BoxError> {
    let addrs: Vec<SocketAddr> = lookup_host(server).await?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| format!("{} did not resolve to any address", server).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connect_budget() {
        let config = ClientConfig::default();
        let total = config.poll_interval * config.polls_per_attempt * config.connect_attempts;
        assert_eq!(total, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_sends_are_noops_before_join() {
        let mut client = Client::new(ClientConfig::default()).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.send_player_state_update(None, 0, EntitySnapshot::default());
        client.send_keep_alive();
        client.send_chat_message("hello?");
        assert_eq!(client.poll_events(), 0);
        assert!(client.next_event().is_none());
        assert!(client.players().is_empty());
        assert!(client.own_player_color().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut client = Client::new(ClientConfig::default()).await.unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(true);

        assert!(
            !client
                .connect_to_server("127.0.0.1:9", "Alice", PlayerColor::RED, &cancel_rx)
                .await
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unreachable_server_gives_up() {
        let config = ClientConfig {
            connect_attempts: 2,
            polls_per_attempt: 2,
            poll_interval: Duration::from_millis(5),
            ..ClientConfig::default()
        };
        let mut client = Client::new(config).await.unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        // Nothing listens here; the attempts run out
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = silent.local_addr().unwrap().to_string();
        let started = Instant::now();
        assert!(
            !client
                .connect_to_server(&target, "Alice", PlayerColor::RED, &cancel_rx)
                .await
        );
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.next_event().is_none());
    }

    #[tokio::test]
    async fn test_simulated_loss_drops_every_reply() {
        let config = ClientConfig {
            connect_attempts: 2,
            polls_per_attempt: 4,
            poll_interval: Duration::from_millis(5),
            simulation: Some(NetworkSimulation {
                min_latency: Duration::ZERO,
                max_latency: Duration::ZERO,
                packet_loss_percent: 100,
            }),
            ..ClientConfig::default()
        };
        let mut client = Client::with_rng(config, StdRng::seed_from_u64(1)).await.unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        // Something that answers every datagram, but nothing it says gets through
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap();
        let echo_task = tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
            while let Ok((len, from)) = echo.recv_from(&mut buffer).await {
                let _ = echo.send_to(&buffer[..len], from).await;
            }
        });

        assert!(
            !client
                .connect_to_server(&target.to_string(), "Alice", PlayerColor::RED, &cancel_rx)
                .await
        );
        let stats = client.link_stats().unwrap();
        assert!(stats.received > 0);
        assert_eq!(stats.dropped, stats.received);
        assert_eq!(stats.delivered, 0);
        echo_task.abort();
    }

    #[tokio::test]
    async fn test_no_link_without_simulation() {
        let client = Client::new(ClientConfig::default()).await.unwrap();
        assert!(client.link_stats().is_none());
    }

    #[tokio::test]
    async fn test_unresolvable_server() {
        let mut client = Client::new(ClientConfig::default()).await.unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        assert!(
            !client
                .connect_to_server("not an address", "Alice", PlayerColor::RED, &cancel_rx)
                .await
        );
    }
}
