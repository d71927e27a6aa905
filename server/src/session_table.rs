//! Authoritative per-peer player records.
//!
//! The session table owns one [`Player`] per connected transport peer and
//! turns every inbound request into a list of [`Outgoing`] actions for the
//! network layer to carry out. It performs no I/O itself, so every path
//! (joins, state updates, chat commands, pruning) is unit-testable.
//!
//! The network layer keeps the table behind an `Arc<RwLock<_>>`; a join runs
//! entirely under one write guard, so the free-id check, the allocation and the
//! insert can never interleave with another join.

use crate::commands::{self, ChatCommand, COMMANDS};
use crate::identity;
use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::leaderboard;
use shared::transport::Delivery;
use shared::{
    truncate_chars, EntitySnapshot, Packet, Player, PlayerColor, PlayerId, PlayerSummary,
    Staleness, StalenessThresholds, API_VERSION, CHAT_MESSAGE_MAX_LENGTH,
};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Why a join request was turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRejection {
    ApiVersionMismatch { expected: u8, received: u8 },
    ServerFull { capacity: usize },
    NoFreePlayerId,
}

impl fmt::Display for JoinRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinRejection::ApiVersionMismatch { expected, received } => write!(
                f,
                "API version mismatch: server speaks {}, client sent {}",
                expected, received
            ),
            JoinRejection::ServerFull { capacity } => {
                write!(f, "Server is full ({} players)", capacity)
            }
            JoinRejection::NoFreePlayerId => write!(f, "No free player id"),
        }
    }
}

impl std::error::Error for JoinRejection {}

/// An action the network layer should perform on behalf of the session table.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Send {
        peer: SocketAddr,
        packet: Packet,
        delivery: Delivery,
    },
    Broadcast {
        packet: Packet,
        delivery: Delivery,
        exclude: Option<SocketAddr>,
    },
    Disconnect {
        peer: SocketAddr,
    },
}

/// The state fields of a [`Packet::StateUpdate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateUpdate {
    pub player_id: PlayerId,
    pub access_token: i32,
    pub speedrun_frame_index: Option<i32>,
    pub puzzle_pieces: u8,
    pub snapshot: EntitySnapshot,
}

#[derive(Debug)]
struct Session {
    player: Player,
    ping_ms: Option<u32>,
    /// `None` until the first state update arrives.
    last_frame_index: Option<i32>,
}

impl Session {
    fn join_response(&self) -> Packet {
        Packet::JoinResponse {
            player_id: self.player.player_id,
            name: self.player.name.clone(),
            color: self.player.color,
            access_token: self.player.access_token,
        }
    }

    fn name_color_broadcast(&self) -> Packet {
        Packet::NameColorBroadcast {
            player_id: self.player.player_id,
            name: self.player.name.clone(),
            color: self.player.color,
        }
    }
}

pub struct SessionTable {
    sessions: HashMap<SocketAddr, Session>,
    max_players: usize,
    rng: StdRng,
    thresholds: StalenessThresholds,
}

impl SessionTable {
    pub fn new(max_players: usize) -> Self {
        Self::with_rng(max_players, StdRng::from_entropy())
    }

    pub fn with_rng(max_players: usize, rng: StdRng) -> Self {
        Self {
            sessions: HashMap::new(),
            max_players,
            rng,
            thresholds: StalenessThresholds::default(),
        }
    }

    /// Overrides how long a silent player stays drawn and stays connected.
    pub fn with_thresholds(mut self, thresholds: StalenessThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> StalenessThresholds {
        self.thresholds
    }

    pub fn capacity(&self) -> usize {
        self.max_players
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, peer: SocketAddr) -> bool {
        self.sessions.contains_key(&peer)
    }

    pub fn get(&self, peer: SocketAddr) -> Option<&Player> {
        self.sessions.get(&peer).map(|s| &s.player)
    }

    pub fn peer_of(&self, player_id: PlayerId) -> Option<SocketAddr> {
        self.sessions
            .iter()
            .find(|(_, s)| s.player.player_id == player_id)
            .map(|(peer, _)| *peer)
    }

    /// Handles a join handshake from `peer`.
    ///
    /// A peer that already has a player gets its original join response again,
    /// so retransmitted requests are harmless. Unusable names and colors are
    /// replaced, never refused.
    pub fn handle_join(
        &mut self,
        peer: SocketAddr,
        api_version: u8,
        requested_name: &str,
        requested_color: PlayerColor,
        now: Instant,
    ) -> Result<Vec<Outgoing>, JoinRejection> {
        if api_version != API_VERSION {
            return Err(JoinRejection::ApiVersionMismatch {
                expected: API_VERSION,
                received: api_version,
            });
        }

        if let Some(existing) = self.sessions.get(&peer) {
            debug!("Repeating join response for {} ({})", existing.player.name, peer);
            return Ok(vec![Outgoing::Send {
                peer,
                packet: existing.join_response(),
                delivery: Delivery::ReliableOrdered,
            }]);
        }

        if self.sessions.len() >= self.max_players {
            return Err(JoinRejection::ServerFull {
                capacity: self.max_players,
            });
        }

        let player_id = identity::allocate_player_id(self.sessions.values().map(|s| s.player.player_id))
            .ok_or(JoinRejection::NoFreePlayerId)?;

        let names: Vec<&str> = self.sessions.values().map(|s| s.player.name.as_str()).collect();
        let name = identity::resolve_name(requested_name, &names);
        let colors: Vec<PlayerColor> = self.sessions.values().map(|s| s.player.color).collect();
        let color = identity::resolve_color(requested_color, &colors, &mut self.rng);
        let access_token = identity::generate_access_token(&mut self.rng);

        let mut player = Player::new(player_id, access_token, name, color);
        player.last_updated = now;
        info!(
            "Player {} joined as '{}' ({}) from {}",
            player_id, player.name, player.color, peer
        );

        let session = Session {
            player,
            ping_ms: None,
            last_frame_index: None,
        };
        let response = session.join_response();
        let notice = format!("{} joined the game", session.player.name);
        self.sessions.insert(peer, session);

        Ok(vec![
            Outgoing::Send {
                peer,
                packet: response,
                delivery: Delivery::ReliableOrdered,
            },
            notify_all(notice, Some(peer)),
        ])
    }

    /// Routes a decoded application packet from a joined peer.
    pub fn handle_packet(&mut self, peer: SocketAddr, packet: Packet, now: Instant) -> Vec<Outgoing> {
        match packet {
            Packet::StateUpdate {
                player_id,
                access_token,
                speedrun_frame_index,
                puzzle_pieces,
                snapshot,
            } => self.handle_state_update(
                peer,
                StateUpdate {
                    player_id,
                    access_token,
                    speedrun_frame_index,
                    puzzle_pieces,
                    snapshot,
                },
                now,
            ),
            Packet::ChatMessage { text } => self.handle_chat(peer, &text),
            other => {
                debug!("Ignoring {:?} packet from {}", other.kind(), peer);
                Vec::new()
            }
        }
    }

    /// Applies a state update if it comes from the session's owner and is
    /// newer than anything applied before, then relays it to everyone else.
    pub fn handle_state_update(
        &mut self,
        peer: SocketAddr,
        update: StateUpdate,
        now: Instant,
    ) -> Vec<Outgoing> {
        let Some(session) = self.sessions.get_mut(&peer) else {
            trace!("State update from {} without a session", peer);
            return Vec::new();
        };

        if update.player_id != session.player.player_id
            || update.access_token != session.player.access_token
        {
            debug!(
                "Ignoring state update from {} claiming player {}",
                peer, update.player_id
            );
            return Vec::new();
        }

        let frame_index = update.snapshot.frame_index;
        if session
            .last_frame_index
            .is_some_and(|last| !update.snapshot.is_newer_than(last))
        {
            trace!("Dropping stale frame {} from {}", frame_index, peer);
            return Vec::new();
        }

        session.last_frame_index = Some(frame_index);
        let player = &mut session.player;
        player.speedrun_frame_index = update.speedrun_frame_index;
        player.puzzle_pieces = update.puzzle_pieces;
        player.snapshot = update.snapshot;
        player.last_updated = now;

        vec![Outgoing::Broadcast {
            packet: Packet::StateBroadcast {
                player_id: player.player_id,
                name: player.name.clone(),
                color: player.color,
                speedrun_frame_index: player.speedrun_frame_index,
                puzzle_pieces: player.puzzle_pieces,
                snapshot: player.snapshot,
            },
            delivery: Delivery::Unreliable,
            exclude: Some(peer),
        }]
    }

    /// Runs a chat command or relays the message to every player, the sender included.
    pub fn handle_chat(&mut self, peer: SocketAddr, text: &str) -> Vec<Outgoing> {
        let Some(session) = self.sessions.get(&peer) else {
            return Vec::new();
        };

        let text = truncate_chars(text.trim(), CHAT_MESSAGE_MAX_LENGTH);
        if text.is_empty() {
            return Vec::new();
        }

        if let Some(command) = commands::parse(text) {
            debug!("{} ran {:?}", session.player.name, command);
            return self.run_command(peer, command);
        }

        info!("[chat] {}: {}", session.player.name, text);
        vec![Outgoing::Broadcast {
            packet: Packet::ChatBroadcast {
                sender_id: session.player.player_id,
                sender_name: session.player.name.clone(),
                text: text.to_string(),
                color: session.player.color,
            },
            delivery: Delivery::ReliableOrdered,
            exclude: None,
        }]
    }

    fn run_command(&mut self, peer: SocketAddr, command: ChatCommand) -> Vec<Outgoing> {
        match command {
            ChatCommand::Start => self.start_speedrun(peer),
            ChatCommand::Disconnect => vec![Outgoing::Disconnect { peer }],
            ChatCommand::Name(name) => self.rename(peer, &name),
            ChatCommand::Color(color) => self.recolor(peer, color.as_deref()),
            ChatCommand::Ping => {
                let text = match self.sessions.get(&peer).and_then(|s| s.ping_ms) {
                    Some(ms) => format!("Your ping is {} ms", ms),
                    None => "Your ping has not been measured yet".to_string(),
                };
                vec![reply(peer, text)]
            }
            ChatCommand::Help => COMMANDS
                .iter()
                .map(|(usage, description)| reply(peer, format!("{} - {}", usage, description)))
                .collect(),
        }
    }

    fn start_speedrun(&mut self, peer: SocketAddr) -> Vec<Outgoing> {
        if let Some(runner) = self
            .sessions
            .values()
            .find(|s| s.player.speedrun_frame_index.is_some())
        {
            return vec![reply(
                peer,
                format!("Can't start: {} is already in a speedrun", runner.player.name),
            )];
        }

        let starter = self
            .sessions
            .get(&peer)
            .map(|s| s.player.name.clone())
            .unwrap_or_default();
        info!("{} started a synchronized speedrun", starter);

        vec![
            notify_all(format!("{} started a speedrun!", starter), None),
            Outgoing::Broadcast {
                packet: Packet::StartSpeedrunBroadcast,
                delivery: Delivery::ReliableOrdered,
                exclude: None,
            },
        ]
    }

    fn rename(&mut self, peer: SocketAddr, requested: &str) -> Vec<Outgoing> {
        if !identity::is_valid_name(requested) {
            return vec![reply(peer, "Names must be 1 to 25 characters long")];
        }
        let requested = requested.trim();

        let others: Vec<&str> = self
            .sessions
            .iter()
            .filter(|(other, _)| **other != peer)
            .map(|(_, s)| s.player.name.as_str())
            .collect();
        if identity::is_name_taken(requested, &others) {
            return vec![reply(peer, format!("The name {} is already taken", requested))];
        }

        let Some(session) = self.sessions.get_mut(&peer) else {
            return Vec::new();
        };
        if session.player.name == requested {
            return vec![reply(peer, format!("Your name is already {}", requested))];
        }

        let old_name = std::mem::replace(&mut session.player.name, requested.to_string());
        info!("{} renamed to {}", old_name, session.player.name);

        vec![
            Outgoing::Broadcast {
                packet: session.name_color_broadcast(),
                delivery: Delivery::ReliableOrdered,
                exclude: None,
            },
            notify_all(format!("{} is now known as {}", old_name, requested), None),
        ]
    }

    fn recolor(&mut self, peer: SocketAddr, requested: Option<&str>) -> Vec<Outgoing> {
        let color = match requested {
            None => identity::random_color(&mut self.rng),
            Some(text) => match PlayerColor::parse(text) {
                Some(color) if !color.is_undefined() => color,
                _ => return vec![reply(peer, format!("Unknown color '{}'", text))],
            },
        };

        let Some(session) = self.sessions.get_mut(&peer) else {
            return Vec::new();
        };
        if session.player.color == color {
            return vec![reply(peer, format!("Your color is already {}", color))];
        }
        session.player.color = color;
        debug!("{} changed color to {}", session.player.name, color);

        vec![
            Outgoing::Broadcast {
                packet: session.name_color_broadcast(),
                delivery: Delivery::ReliableOrdered,
                exclude: None,
            },
            reply(peer, format!("Your color is now {}", color)),
        ]
    }

    /// Removes the player of a peer that left, announcing it to the others.
    pub fn handle_disconnect(&mut self, peer: SocketAddr) -> Vec<Outgoing> {
        match self.sessions.remove(&peer) {
            Some(session) => {
                info!(
                    "Player {} ('{}') left ({} remaining)",
                    session.player.player_id,
                    session.player.name,
                    self.sessions.len()
                );
                vec![notify_all(
                    format!("{} left the game", session.player.name),
                    Some(peer),
                )]
            }
            None => Vec::new(),
        }
    }

    /// Drops players whose peer the transport no longer reports as connected.
    pub fn reconcile(&mut self, live_peers: &[SocketAddr]) -> Vec<Outgoing> {
        let gone: Vec<SocketAddr> = self
            .sessions
            .keys()
            .filter(|peer| !live_peers.contains(peer))
            .copied()
            .collect();

        gone.into_iter()
            .flat_map(|peer| {
                debug!("Peer {} vanished from the transport", peer);
                self.handle_disconnect(peer)
            })
            .collect()
    }

    /// Drops players that have not sent a state update within the timeout.
    pub fn prune_timed_out(&mut self, now: Instant) -> Vec<Outgoing> {
        let expired: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                self.thresholds.classify(s.player.last_updated, now) == Staleness::TimedOut
            })
            .map(|(peer, _)| *peer)
            .collect();

        let mut outgoing = Vec::new();
        for peer in expired {
            info!("Player at {} timed out", peer);
            outgoing.extend(self.handle_disconnect(peer));
            outgoing.push(Outgoing::Disconnect { peer });
        }
        outgoing
    }

    pub fn set_ping(&mut self, peer: SocketAddr, ping_ms: Option<u32>) {
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.ping_ms = ping_ms;
        }
    }

    /// All players, ordered by id.
    pub fn players(&self) -> Vec<PlayerSummary> {
        let mut players: Vec<PlayerSummary> = self
            .sessions
            .values()
            .map(|s| s.player.to_summary(false, s.ping_ms))
            .collect();
        players.sort_by_key(|p| p.player_id);
        players
    }

    /// Players in the given room that updated recently enough to be drawn.
    pub fn visible_players(&self, world: u8, level: u8, now: Instant) -> Vec<PlayerSummary> {
        self.players()
            .into_iter()
            .filter(|p| {
                p.snapshot.is_in_room(world, level)
                    && self.thresholds.classify(p.last_updated, now) == Staleness::Fresh
            })
            .collect()
    }

    pub fn leaderboard(&self) -> Vec<PlayerSummary> {
        leaderboard::leaderboard(self.players())
    }
}

fn reply(peer: SocketAddr, text: impl AsRef<str>) -> Outgoing {
    Outgoing::Send {
        peer,
        packet: Packet::server_notice(text),
        delivery: Delivery::ReliableOrdered,
    }
}

fn notify_all(text: impl AsRef<str>, exclude: Option<SocketAddr>) -> Outgoing {
    Outgoing::Broadcast {
        packet: Packet::server_notice(text),
        delivery: Delivery::ReliableOrdered,
        exclude,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::RwLock;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn table() -> SessionTable {
        SessionTable::with_rng(255, StdRng::seed_from_u64(3))
    }

    fn join(table: &mut SessionTable, port: u16, name: &str, color: PlayerColor) -> Player {
        table
            .handle_join(peer(port), API_VERSION, name, color, Instant::now())
            .expect("join accepted");
        table.get(peer(port)).cloned().expect("player stored")
    }

    fn update_for(player: &Player, frame_index: i32) -> StateUpdate {
        StateUpdate {
            player_id: player.player_id,
            access_token: player.access_token,
            speedrun_frame_index: None,
            puzzle_pieces: 0,
            snapshot: EntitySnapshot {
                frame_index,
                ..EntitySnapshot::default()
            },
        }
    }

    fn notices(outgoing: &[Outgoing]) -> Vec<String> {
        outgoing
            .iter()
            .filter_map(|o| match o {
                Outgoing::Send {
                    packet: Packet::ChatBroadcast { text, sender_id, .. },
                    ..
                }
                | Outgoing::Broadcast {
                    packet: Packet::ChatBroadcast { text, sender_id, .. },
                    ..
                } if !sender_id.is_known() => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_first_join() {
        let mut table = table();
        let outgoing = table
            .handle_join(peer(1000), API_VERSION, "Alice", PlayerColor::RED, Instant::now())
            .unwrap();

        match &outgoing[0] {
            Outgoing::Send {
                peer: to,
                packet:
                    Packet::JoinResponse {
                        player_id,
                        name,
                        color,
                        access_token,
                    },
                delivery,
            } => {
                assert_eq!(*to, peer(1000));
                assert_eq!(*player_id, PlayerId(1));
                assert_eq!(name, "Alice");
                assert_eq!(*color, PlayerColor::RED);
                assert_ne!(*access_token, 0);
                assert_eq!(*delivery, Delivery::ReliableOrdered);
            }
            other => panic!("Unexpected first action: {:?}", other),
        }
        assert_eq!(notices(&outgoing), vec!["Alice joined the game"]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut table = table();
        let result = table.handle_join(peer(1), API_VERSION + 1, "A", PlayerColor::RED, Instant::now());
        assert_eq!(
            result,
            Err(JoinRejection::ApiVersionMismatch {
                expected: API_VERSION,
                received: API_VERSION + 1
            })
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_join_repeats_response() {
        let mut table = table();
        let player = join(&mut table, 1, "Alice", PlayerColor::RED);

        let again = table
            .handle_join(peer(1), API_VERSION, "Someone else", PlayerColor::BLUE, Instant::now())
            .unwrap();
        assert_eq!(
            again,
            vec![Outgoing::Send {
                peer: peer(1),
                packet: Packet::JoinResponse {
                    player_id: player.player_id,
                    name: "Alice".to_string(),
                    color: PlayerColor::RED,
                    access_token: player.access_token,
                },
                delivery: Delivery::ReliableOrdered,
            }]
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_capacity_limit() {
        let mut table = SessionTable::with_rng(2, StdRng::seed_from_u64(1));
        join(&mut table, 1, "A", PlayerColor::UNDEFINED);
        join(&mut table, 2, "B", PlayerColor::UNDEFINED);

        let result = table.handle_join(peer(3), API_VERSION, "C", PlayerColor::UNDEFINED, Instant::now());
        assert_eq!(result, Err(JoinRejection::ServerFull { capacity: 2 }));

        // A retry from an existing player is still answered at capacity
        assert!(table
            .handle_join(peer(2), API_VERSION, "B", PlayerColor::UNDEFINED, Instant::now())
            .is_ok());
    }

    #[test]
    fn test_id_reuse_after_leave() {
        let mut table = table();
        join(&mut table, 1, "A", PlayerColor::UNDEFINED);
        join(&mut table, 2, "B", PlayerColor::UNDEFINED);
        join(&mut table, 3, "C", PlayerColor::UNDEFINED);

        let outgoing = table.handle_disconnect(peer(2));
        assert_eq!(notices(&outgoing), vec!["B left the game"]);
        assert!(table.handle_disconnect(peer(2)).is_empty());

        let d = join(&mut table, 4, "D", PlayerColor::UNDEFINED);
        assert_eq!(d.player_id, PlayerId(2));
    }

    #[test]
    fn test_name_and_color_collisions() {
        let mut table = table();
        let first = join(&mut table, 1, "", PlayerColor::UNDEFINED);
        let second = join(&mut table, 2, "", PlayerColor::UNDEFINED);
        let third = join(&mut table, 3, "tim", PlayerColor::UNDEFINED);

        assert_eq!(first.name, "Tim");
        assert_eq!(second.name, "Tim_2");
        assert_eq!(third.name, "tim_3");
        assert_ne!(first.color, second.color);
        assert_ne!(second.color, third.color);
        assert_ne!(first.color, third.color);
    }

    #[test]
    fn test_state_update_broadcast_and_antispoofing() {
        let mut table = table();
        let alice = join(&mut table, 1, "Alice", PlayerColor::RED);
        let bob = join(&mut table, 2, "Bob", PlayerColor::BLUE);
        let now = Instant::now();

        let outgoing = table.handle_state_update(peer(1), update_for(&alice, 10), now);
        match &outgoing[..] {
            [Outgoing::Broadcast {
                packet: Packet::StateBroadcast { player_id, name, snapshot, .. },
                delivery: Delivery::Unreliable,
                exclude: Some(excluded),
            }] => {
                assert_eq!(*player_id, alice.player_id);
                assert_eq!(name, "Alice");
                assert_eq!(snapshot.frame_index, 10);
                assert_eq!(*excluded, peer(1));
            }
            other => panic!("Unexpected actions: {:?}", other),
        }

        // Bob claiming Alice's id, and Alice with a wrong token
        assert!(table.handle_state_update(peer(2), update_for(&alice, 20), now).is_empty());
        let mut forged = update_for(&alice, 20);
        forged.access_token = alice.access_token.wrapping_add(1);
        assert!(table.handle_state_update(peer(1), forged, now).is_empty());

        // Unknown peer
        assert!(table.handle_state_update(peer(9), update_for(&bob, 1), now).is_empty());
        assert_eq!(table.get(peer(1)).unwrap().snapshot.frame_index, 10);
    }

    #[test]
    fn test_frame_index_is_monotonic() {
        let mut table = table();
        let alice = join(&mut table, 1, "Alice", PlayerColor::RED);
        let now = Instant::now();

        let deliveries = [5, 3, 9, 9, 1, 7, 12, 11, 12, 0];
        for frame in deliveries {
            table.handle_state_update(peer(1), update_for(&alice, frame), now);
        }
        assert_eq!(table.get(peer(1)).unwrap().snapshot.frame_index, 12);
    }

    #[test]
    fn test_frame_index_wraps_past_max() {
        let mut table = table();
        let alice = join(&mut table, 1, "Alice", PlayerColor::RED);
        let now = Instant::now();

        table.handle_state_update(peer(1), update_for(&alice, i32::MAX), now);
        let outgoing = table.handle_state_update(peer(1), update_for(&alice, i32::MIN), now);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(table.get(peer(1)).unwrap().snapshot.frame_index, i32::MIN);
    }

    #[test]
    fn test_first_update_accepts_frame_zero() {
        let mut table = table();
        let alice = join(&mut table, 1, "Alice", PlayerColor::RED);
        assert_eq!(
            table.handle_state_update(peer(1), update_for(&alice, 0), Instant::now()).len(),
            1
        );
    }

    #[test]
    fn test_chat_relayed_to_everyone() {
        let mut table = table();
        let alice = join(&mut table, 1, "Alice", PlayerColor::RED);

        let outgoing = table.handle_chat(peer(1), "  hello world  ");
        assert_eq!(
            outgoing,
            vec![Outgoing::Broadcast {
                packet: Packet::ChatBroadcast {
                    sender_id: alice.player_id,
                    sender_name: "Alice".to_string(),
                    text: "hello world".to_string(),
                    color: PlayerColor::RED,
                },
                delivery: Delivery::ReliableOrdered,
                exclude: None,
            }]
        );

        assert!(table.handle_chat(peer(1), "   ").is_empty());
        assert!(table.handle_chat(peer(7), "who am I").is_empty());
    }

    #[test]
    fn test_start_command_race() {
        let mut table = table();
        let alice = join(&mut table, 1, "Alice", PlayerColor::RED);
        join(&mut table, 2, "Bob", PlayerColor::BLUE);

        let outgoing = table.handle_chat(peer(2), "!start");
        assert!(outgoing.contains(&Outgoing::Broadcast {
            packet: Packet::StartSpeedrunBroadcast,
            delivery: Delivery::ReliableOrdered,
            exclude: None,
        }));

        let mut running = update_for(&alice, 1);
        running.speedrun_frame_index = Some(0);
        table.handle_state_update(peer(1), running, Instant::now());

        let outgoing = table.handle_chat(peer(2), "!start");
        assert_eq!(outgoing.len(), 1);
        match &outgoing[0] {
            Outgoing::Send {
                peer: to,
                packet: Packet::ChatBroadcast { text, .. },
                ..
            } => {
                assert_eq!(*to, peer(2));
                assert!(text.contains("Alice"));
            }
            other => panic!("Expected a private rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_rename_command() {
        let mut table = table();
        let alice = join(&mut table, 1, "Alice", PlayerColor::RED);
        join(&mut table, 2, "Bob", PlayerColor::BLUE);

        let outgoing = table.handle_chat(peer(1), "!name Alicia");
        assert!(outgoing.contains(&Outgoing::Broadcast {
            packet: Packet::NameColorBroadcast {
                player_id: alice.player_id,
                name: "Alicia".to_string(),
                color: PlayerColor::RED,
            },
            delivery: Delivery::ReliableOrdered,
            exclude: None,
        }));
        assert_eq!(table.get(peer(1)).unwrap().name, "Alicia");

        for rejected in ["!name BOB", "!name", "!name Alicia"] {
            let outgoing = table.handle_chat(peer(1), rejected);
            assert_eq!(outgoing.len(), 1, "{}", rejected);
            assert!(matches!(outgoing[0], Outgoing::Send { .. }));
        }
        assert_eq!(table.get(peer(1)).unwrap().name, "Alicia");
    }

    #[test]
    fn test_color_command() {
        let mut table = table();
        join(&mut table, 1, "Alice", PlayerColor::RED);

        table.handle_chat(peer(1), "!color teal");
        assert_eq!(table.get(peer(1)).unwrap().color, PlayerColor::TEAL);

        table.handle_chat(peer(1), "!color #102030");
        assert_eq!(table.get(peer(1)).unwrap().color, PlayerColor::rgb(0x10, 0x20, 0x30));

        let outgoing = table.handle_chat(peer(1), "!color notacolor");
        assert_eq!(notices(&outgoing), vec!["Unknown color 'notacolor'"]);

        let outgoing = table.handle_chat(peer(1), "!color");
        assert!(outgoing
            .iter()
            .any(|o| matches!(o, Outgoing::Broadcast { packet: Packet::NameColorBroadcast { .. }, .. })));
        assert!(!table.get(peer(1)).unwrap().color.is_undefined());
    }

    #[test]
    fn test_ping_help_and_disconnect_commands() {
        let mut table = table();
        join(&mut table, 1, "Alice", PlayerColor::RED);

        assert_eq!(
            notices(&table.handle_chat(peer(1), "!ping")),
            vec!["Your ping has not been measured yet"]
        );
        table.set_ping(peer(1), Some(42));
        assert_eq!(notices(&table.handle_chat(peer(1), "!ping")), vec!["Your ping is 42 ms"]);

        let help = table.handle_chat(peer(1), "!help");
        assert_eq!(help.len(), COMMANDS.len());
        assert!(help.iter().all(|o| matches!(o, Outgoing::Send { peer: to, .. } if *to == peer(1))));

        assert_eq!(
            table.handle_chat(peer(1), "!disconnect"),
            vec![Outgoing::Disconnect { peer: peer(1) }]
        );
    }

    #[test]
    fn test_reconcile_against_live_peers() {
        let mut table = table();
        join(&mut table, 1, "A", PlayerColor::UNDEFINED);
        join(&mut table, 2, "B", PlayerColor::UNDEFINED);

        let outgoing = table.reconcile(&[peer(2)]);
        assert_eq!(notices(&outgoing), vec!["A left the game"]);
        assert!(!table.contains(peer(1)));
        assert!(table.contains(peer(2)));
    }

    #[test]
    fn test_staleness_tiers() {
        let mut table = table();
        let alice = join(&mut table, 1, "Alice", PlayerColor::RED);
        let now = Instant::now();
        let mut update = update_for(&alice, 1);
        update.snapshot.world = 2;
        update.snapshot.level = 4;
        table.handle_state_update(peer(1), update, now - Duration::from_secs(3));

        assert!(table.visible_players(2, 4, now).is_empty());
        assert_eq!(table.players().len(), 1);
        assert_eq!(table.leaderboard().len(), 1);
        assert!(table.prune_timed_out(now).is_empty());
        assert_eq!(
            table.visible_players(2, 4, now - Duration::from_secs(2)).len(),
            1
        );

        let later = now + Duration::from_secs(28);
        let outgoing = table.prune_timed_out(later);
        assert!(outgoing.contains(&Outgoing::Disconnect { peer: peer(1) }));
        assert!(table.is_empty());

        let newcomer = join(&mut table, 2, "Bob", PlayerColor::UNDEFINED);
        assert_eq!(newcomer.player_id, alice.player_id);
    }

    #[test]
    fn test_custom_staleness_thresholds() {
        let thresholds = StalenessThresholds {
            visibility: Duration::from_millis(100),
            timeout: Duration::from_millis(300),
        };
        let mut table = SessionTable::with_rng(16, StdRng::seed_from_u64(9)).with_thresholds(thresholds);
        assert_eq!(table.thresholds(), thresholds);

        let alice = join(&mut table, 1, "Alice", PlayerColor::RED);
        let start = Instant::now();
        table.handle_state_update(peer(1), update_for(&alice, 1), start);

        assert_eq!(table.visible_players(0, 0, start + Duration::from_millis(50)).len(), 1);
        assert!(table.visible_players(0, 0, start + Duration::from_millis(200)).is_empty());
        assert!(table.prune_timed_out(start + Duration::from_millis(200)).is_empty());

        let outgoing = table.prune_timed_out(start + Duration::from_millis(400));
        assert!(outgoing.contains(&Outgoing::Disconnect { peer: peer(1) }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_exhaust_at_255() {
        let mut table = SessionTable::with_rng(1000, StdRng::seed_from_u64(5));
        for port in 1..=255u16 {
            join(&mut table, port, "p", PlayerColor::UNDEFINED);
        }
        let result = table.handle_join(peer(256), API_VERSION, "late", PlayerColor::UNDEFINED, Instant::now());
        assert_eq!(result, Err(JoinRejection::NoFreePlayerId));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_get_distinct_ids() {
        let table = Arc::new(RwLock::new(SessionTable::new(255)));

        let tasks: Vec<_> = (0..256u16)
            .map(|i| {
                let table = Arc::clone(&table);
                tokio::spawn(async move {
                    let mut guard = table.write().await;
                    guard
                        .handle_join(peer(2000 + i), API_VERSION, "racer", PlayerColor::UNDEFINED, Instant::now())
                        .map(|_| guard.get(peer(2000 + i)).map(|p| p.player_id))
                })
            })
            .collect();

        let mut granted = Vec::new();
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(Some(id)) => granted.push(id),
                Ok(None) => panic!("accepted join without a player"),
                Err(_) => rejected += 1,
            }
        }

        granted.sort();
        granted.dedup();
        assert_eq!(granted.len(), 255);
        assert!(granted.iter().all(|id| id.is_known()));
        assert_eq!(rejected, 1);
    }
}
