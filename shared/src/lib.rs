//! Types and protocol pieces shared by the sync server and its clients.
//!
//! The server and the clients exchange a handful of small, fixed-schema
//! datagrams (see [`packet`]) over a thin UDP transport (see [`transport`])
//! that offers both best-effort and reliable-ordered delivery. Everything the
//! renderer needs to draw other players is expressed with the value types in
//! this crate root.

pub mod color;
pub mod leaderboard;
pub mod packet;
pub mod transport;

pub use color::PlayerColor;
pub use packet::{Packet, PacketKind};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Bumped whenever the packet schema changes; joins with another version are rejected.
pub const API_VERSION: u8 = 1;
pub const DEFAULT_SERVER_PORT: u16 = 55555;
pub const PLAYER_NAME_MAX_LENGTH: usize = 25;
pub const CHAT_MESSAGE_MAX_LENGTH: usize = 100;
/// Wire value of a speedrun frame index when no timed run is active.
pub const SPEEDRUN_FRAME_INDEX_NOT_STARTED: i32 = -1;
/// Players silent for longer than this are hidden from room views.
pub const VISIBILITY_THRESHOLD: Duration = Duration::from_secs(2);
/// Players silent for longer than this are dropped entirely.
pub const TIMEOUT_THRESHOLD: Duration = Duration::from_secs(30);
pub const CHAT_LOG_CAPACITY: usize = 10;
/// Chat lines older than this are no longer drawn.
pub const CHAT_MESSAGE_LIFETIME: Duration = Duration::from_secs(10);
pub const MAX_DATAGRAM_SIZE: usize = 2048;
pub const SERVER_SENDER_NAME: &str = "Server";
pub const SPEEDRUN_FPS: i32 = 60;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One-byte session identifier. `0` is reserved for "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PlayerId(pub u8);

impl PlayerId {
    pub const UNKNOWN: PlayerId = PlayerId(0);
    pub const MIN: PlayerId = PlayerId(1);
    pub const MAX: PlayerId = PlayerId(255);

    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-frame avatar state captured by the game hook.
///
/// Field order is the wire order; bincode encodes it as exactly 20 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub frame_index: i32,
    pub world: u8,
    pub level: u8,
    pub position_x: f32,
    pub position_y: f32,
    pub facing_left: bool,
    pub animation_index: u8,
    pub animation_time: f32,
}

impl EntitySnapshot {
    pub const ENCODED_LEN: usize = 20;

    pub fn with_frame_index(self, frame_index: i32) -> Self {
        Self {
            frame_index,
            ..self
        }
    }

    /// Whether this snapshot comes after frame `last`. Frame counters wrap, so
    /// anything less than half the `i32` range ahead counts as newer.
    pub fn is_newer_than(&self, last: i32) -> bool {
        self.frame_index.wrapping_sub(last) > 0
    }

    pub fn is_in_room(&self, world: u8, level: u8) -> bool {
        self.world == world && self.level == level
    }
}

/// How long a player has been silent, bucketed by the two thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Hidden,
    TimedOut,
}

impl Staleness {
    /// Buckets with the default thresholds.
    pub fn of(last_updated: Instant, now: Instant) -> Self {
        StalenessThresholds::default().classify(last_updated, now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessThresholds {
    pub visibility: Duration,
    pub timeout: Duration,
}

impl Default for StalenessThresholds {
    fn default() -> Self {
        Self {
            visibility: VISIBILITY_THRESHOLD,
            timeout: TIMEOUT_THRESHOLD,
        }
    }
}

impl StalenessThresholds {
    pub fn classify(&self, last_updated: Instant, now: Instant) -> Staleness {
        let silent_for = now.saturating_duration_since(last_updated);
        if silent_for > self.timeout {
            Staleness::TimedOut
        } else if silent_for > self.visibility {
            Staleness::Hidden
        } else {
            Staleness::Fresh
        }
    }
}

/// Mutable record of one player, held by the server per session and by each
/// client for itself and for every remote player it has heard about.
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub player_id: PlayerId,
    /// Zero for remote players on the client side; the token never leaves the server/owner pair.
    pub access_token: i32,
    pub name: String,
    pub color: PlayerColor,
    pub speedrun_frame_index: Option<i32>,
    pub puzzle_pieces: u8,
    pub snapshot: EntitySnapshot,
    pub last_updated: Instant,
}

impl Player {
    pub fn new(player_id: PlayerId, access_token: i32, name: String, color: PlayerColor) -> Self {
        Self {
            player_id,
            access_token,
            name,
            color,
            speedrun_frame_index: None,
            puzzle_pieces: 0,
            snapshot: EntitySnapshot::default(),
            last_updated: Instant::now(),
        }
    }

    pub fn staleness(&self, now: Instant) -> Staleness {
        Staleness::of(self.last_updated, now)
    }

    pub fn is_visible_in(&self, world: u8, level: u8, now: Instant) -> bool {
        self.snapshot.is_in_room(world, level) && self.staleness(now) == Staleness::Fresh
    }

    pub fn to_summary(&self, is_own_player: bool, ping: Option<u32>) -> PlayerSummary {
        PlayerSummary {
            player_id: self.player_id,
            name: self.name.clone(),
            color: self.color,
            speedrun_frame_index: self.speedrun_frame_index,
            puzzle_pieces: self.puzzle_pieces,
            snapshot: self.snapshot,
            last_updated: self.last_updated,
            is_own_player,
            ping,
        }
    }
}

/// Read-only projection of a [`Player`] handed to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSummary {
    pub player_id: PlayerId,
    pub name: String,
    pub color: PlayerColor,
    pub speedrun_frame_index: Option<i32>,
    pub puzzle_pieces: u8,
    pub snapshot: EntitySnapshot,
    pub last_updated: Instant,
    pub is_own_player: bool,
    /// Round-trip time in milliseconds, when measured.
    pub ping: Option<u32>,
}

impl PlayerSummary {
    /// Formats the speedrun timer as `m:ss.hh`, or `None` outside a timed run.
    pub fn format_speedrun_time(&self) -> Option<String> {
        self.speedrun_frame_index.map(format_frames)
    }
}

fn format_frames(frames: i32) -> String {
    // Round to the nearest hundredth
    let total_hundredths = (frames as i64 * 100 + SPEEDRUN_FPS as i64 / 2) / SPEEDRUN_FPS as i64;
    let minutes = total_hundredths / (60 * 100);
    let seconds = (total_hundredths / 100) % 60;
    let hundredths = total_hundredths % 100;
    format!("{}:{:02}.{:02}", minutes, seconds, hundredths)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub sender_id: PlayerId,
    pub sender: String,
    pub text: String,
    pub color: PlayerColor,
    pub received: Instant,
}

impl ChatMessage {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.received)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.age(now) > CHAT_MESSAGE_LIFETIME
    }
}

/// Whole milliseconds in `duration`, clamped to `u32::MAX`.
pub fn saturating_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Truncates `text` to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
