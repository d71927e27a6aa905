//! Client-side view of the session: the local player plus a cache of every
//! remote player heard about, and the chat log.
//!
//! `ClientSession` is pure state. It turns received packets into cache updates
//! and [`ClientEvent`]s, and builds the packets the network layer should send.

use crate::chat::ChatLog;
use log::{debug, info};
use shared::leaderboard;
use shared::transport::DisconnectReason;
use shared::{
    truncate_chars, ChatMessage, EntitySnapshot, Packet, Player, PlayerColor, PlayerId,
    PlayerSummary, Staleness, CHAT_MESSAGE_MAX_LENGTH,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Instant;

/// Notifications for the game-control and UI layers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The join response arrived and the local player exists.
    Initialized { player_id: PlayerId },
    /// Every connected game should launch a speedrun now.
    StartSpeedrun,
    ChatReceived(ChatMessage),
    Disconnected { reason: DisconnectReason },
}

#[derive(Debug, Default)]
pub struct ClientSession {
    own_player: Option<Player>,
    /// Frame index of the last state update handed to the network.
    last_sent_frame: Option<i32>,
    other_players: HashMap<PlayerId, Player>,
    chat: ChatLog,
    server_ping_ms: Option<u32>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.own_player.is_some()
    }

    pub fn own_player(&self) -> Option<&Player> {
        self.own_player.as_ref()
    }

    pub fn own_player_id(&self) -> Option<PlayerId> {
        self.own_player.as_ref().map(|p| p.player_id)
    }

    pub fn own_player_color(&self) -> Option<PlayerColor> {
        self.own_player.as_ref().map(|p| p.color)
    }

    pub fn chat_log(&self) -> &ChatLog {
        &self.chat
    }

    pub fn set_server_ping(&mut self, ping_ms: Option<u32>) {
        self.server_ping_ms = ping_ms;
    }

    /// Applies a packet from the server.
    pub fn handle_packet(&mut self, packet: Packet, now: Instant) -> Option<ClientEvent> {
        match packet {
            Packet::JoinResponse {
                player_id,
                name,
                color,
                access_token,
            } => {
                if self.own_player_id() == Some(player_id) {
                    debug!("Ignoring repeated join response");
                    return None;
                }
                info!("Joined as player {} '{}' ({})", player_id, name, color);
                let mut player = Player::new(player_id, access_token, name, color);
                player.last_updated = now;
                self.own_player = Some(player);
                self.last_sent_frame = None;
                self.other_players.remove(&player_id);
                Some(ClientEvent::Initialized { player_id })
            }

            Packet::StateBroadcast {
                player_id,
                name,
                color,
                speedrun_frame_index,
                puzzle_pieces,
                snapshot,
            } => {
                if !player_id.is_known() || self.own_player_id() == Some(player_id) {
                    return None;
                }
                let player = match self.other_players.entry(player_id) {
                    Entry::Occupied(entry) => {
                        if !snapshot.is_newer_than(entry.get().snapshot.frame_index) {
                            return None;
                        }
                        entry.into_mut()
                    }
                    Entry::Vacant(entry) => {
                        debug!("Player {} '{}' appeared", player_id, name);
                        entry.insert(Player::new(player_id, 0, name.clone(), color))
                    }
                };
                player.name = name;
                player.color = color;
                player.speedrun_frame_index = speedrun_frame_index;
                player.puzzle_pieces = puzzle_pieces;
                player.snapshot = snapshot;
                player.last_updated = now;
                None
            }

            Packet::NameColorBroadcast {
                player_id,
                name,
                color,
            } => {
                let player = match &mut self.own_player {
                    Some(own) if own.player_id == player_id => Some(own),
                    _ => self.other_players.get_mut(&player_id),
                };
                if let Some(player) = player {
                    player.name = name;
                    player.color = color;
                }
                None
            }

            Packet::ChatBroadcast {
                sender_id,
                sender_name,
                text,
                color,
            } => {
                let message = ChatMessage {
                    sender_id,
                    sender: sender_name,
                    text,
                    color,
                    received: now,
                };
                self.chat.push(message.clone());
                Some(ClientEvent::ChatReceived(message))
            }

            Packet::StartSpeedrunBroadcast => Some(ClientEvent::StartSpeedrun),

            other => {
                debug!("Ignoring unexpected {:?} from server", other.kind());
                None
            }
        }
    }

    /// Records the local player's new state and returns the update to send,
    /// or `None` before the join completes or when `snapshot` is not newer
    /// than the last one sent.
    pub fn prepare_state_update(
        &mut self,
        speedrun_frame_index: Option<i32>,
        puzzle_pieces: u8,
        snapshot: EntitySnapshot,
        now: Instant,
    ) -> Option<Packet> {
        let own = self.own_player.as_mut()?;
        if self
            .last_sent_frame
            .is_some_and(|last| !snapshot.is_newer_than(last))
        {
            return None;
        }

        self.last_sent_frame = Some(snapshot.frame_index);
        own.speedrun_frame_index = speedrun_frame_index.filter(|index| *index >= 0);
        own.puzzle_pieces = puzzle_pieces;
        own.snapshot = snapshot;
        own.last_updated = now;

        Some(Packet::StateUpdate {
            player_id: own.player_id,
            access_token: own.access_token,
            speedrun_frame_index: own.speedrun_frame_index,
            puzzle_pieces,
            snapshot,
        })
    }

    /// Re-sends the last known state with the frame index bumped, so a paused
    /// game keeps its player alive on the server.
    pub fn prepare_keep_alive(&mut self, now: Instant) -> Option<Packet> {
        let own = self.own_player.as_ref()?;
        let last_frame = self.last_sent_frame.unwrap_or(own.snapshot.frame_index);
        let snapshot = own.snapshot.with_frame_index(last_frame.wrapping_add(1));
        let (speedrun_frame_index, puzzle_pieces) = (own.speedrun_frame_index, own.puzzle_pieces);
        self.prepare_state_update(speedrun_frame_index, puzzle_pieces, snapshot, now)
    }

    pub fn prepare_chat_message(&self, text: &str) -> Option<Packet> {
        self.own_player.as_ref()?;
        let text = truncate_chars(text.trim(), CHAT_MESSAGE_MAX_LENGTH);
        if text.is_empty() {
            return None;
        }
        Some(Packet::ChatMessage {
            text: text.to_string(),
        })
    }

    /// Forgets remote players silent past the timeout. Returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.other_players.len();
        self.other_players
            .retain(|_, player| player.staleness(now) != Staleness::TimedOut);
        before - self.other_players.len()
    }

    /// Own player first, then everyone else by id.
    pub fn players(&self) -> Vec<PlayerSummary> {
        let mut others: Vec<PlayerSummary> = self
            .other_players
            .values()
            .map(|p| p.to_summary(false, None))
            .collect();
        others.sort_by_key(|p| p.player_id);

        self.own_player
            .iter()
            .map(|p| p.to_summary(true, self.server_ping_ms))
            .chain(others)
            .collect()
    }

    /// Remote players in the given room that updated recently enough to be drawn.
    pub fn visible_players(&self, world: u8, level: u8, now: Instant) -> Vec<PlayerSummary> {
        let mut visible: Vec<PlayerSummary> = self
            .other_players
            .values()
            .filter(|p| p.is_visible_in(world, level, now))
            .map(|p| p.to_summary(false, None))
            .collect();
        visible.sort_by_key(|p| p.player_id);
        visible
    }

    pub fn leaderboard(&self) -> Vec<PlayerSummary> {
        leaderboard::leaderboard(self.players())
    }

    /// Drops everything learned from the current server. The chat log survives
    /// so the reason for a disconnect stays readable.
    pub fn reset(&mut self) {
        self.own_player = None;
        self.last_sent_frame = None;
        self.other_players.clear();
        self.server_ping_ms = None;
    }
}
