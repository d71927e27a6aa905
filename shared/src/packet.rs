//! Binary packet codec.
//!
//! Every packet starts with one discriminant byte followed by its fields in a
//! fixed order. Fields are written one at a time through bincode configured for
//! fixed-width little-endian integers, so the layout never depends on how a
//! struct happens to sit in memory. Strings carry a `u16` byte length and are
//! capped by character count; nullable integers use a reserved sentinel on the
//! wire and become `Option` as soon as they are decoded.
//!
//! Decoding never panics: empty, truncated, over-long, or unknown input yields
//! `None`.

use crate::{
    truncate_chars, EntitySnapshot, PlayerColor, PlayerId, CHAT_MESSAGE_MAX_LENGTH,
    PLAYER_NAME_MAX_LENGTH, SPEEDRUN_FRAME_INDEX_NOT_STARTED,
};
use bincode::Options;
use log::error;
use serde::{de::DeserializeOwned, Serialize};

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// Appends fields to an outgoing datagram.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Serialize>(&mut self, value: &T) {
        if let Err(e) = wire_options().serialize_into(&mut self.buf, value) {
            error!("Failed to encode field: {}", e);
        }
    }

    /// Writes at most `max_chars` characters of `text`.
    pub fn put_str(&mut self, text: &str, max_chars: usize) {
        let text = truncate_chars(text, max_chars);
        let bytes = &text.as_bytes()[..text.len().min(u16::MAX as usize)];
        self.put(&(bytes.len() as u16));
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Consumes fields from an incoming datagram.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn get<T: DeserializeOwned>(&mut self) -> Option<T> {
        wire_options().deserialize_from(&mut self.buf).ok()
    }

    /// Reads a string, rejecting invalid UTF-8 and anything longer than `max_chars`.
    pub fn get_str(&mut self, max_chars: usize) -> Option<String> {
        let len = self.get::<u16>()? as usize;
        if self.buf.len() < len {
            return None;
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;

        let text = std::str::from_utf8(head).ok()?;
        if text.chars().count() > max_chars {
            return None;
        }
        Some(text.to_owned())
    }

    pub fn take_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    JoinRequest = 1,
    JoinResponse = 2,
    NameColorBroadcast = 3,
    StateUpdate = 4,
    StateBroadcast = 5,
    ChatMessage = 6,
    ChatBroadcast = 7,
    StartSpeedrunBroadcast = 8,
}

impl TryFrom<u8> for PacketKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::JoinRequest),
            2 => Ok(PacketKind::JoinResponse),
            3 => Ok(PacketKind::NameColorBroadcast),
            4 => Ok(PacketKind::StateUpdate),
            5 => Ok(PacketKind::StateBroadcast),
            6 => Ok(PacketKind::ChatMessage),
            7 => Ok(PacketKind::ChatBroadcast),
            8 => Ok(PacketKind::StartSpeedrunBroadcast),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // Client to server
    JoinRequest {
        api_version: u8,
        name: String,
        color: PlayerColor,
    },
    StateUpdate {
        player_id: PlayerId,
        access_token: i32,
        /// Frames since the timed run started. Negative values share the
        /// not-started encoding and decode as `None`.
        speedrun_frame_index: Option<i32>,
        puzzle_pieces: u8,
        snapshot: EntitySnapshot,
    },
    ChatMessage {
        text: String,
    },

    // Server to client
    JoinResponse {
        player_id: PlayerId,
        name: String,
        color: PlayerColor,
        access_token: i32,
    },
    NameColorBroadcast {
        player_id: PlayerId,
        name: String,
        color: PlayerColor,
    },
    StateBroadcast {
        player_id: PlayerId,
        name: String,
        color: PlayerColor,
        speedrun_frame_index: Option<i32>,
        puzzle_pieces: u8,
        snapshot: EntitySnapshot,
    },
    ChatBroadcast {
        sender_id: PlayerId,
        sender_name: String,
        text: String,
        color: PlayerColor,
    },
    StartSpeedrunBroadcast,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::JoinRequest { .. } => PacketKind::JoinRequest,
            Packet::JoinResponse { .. } => PacketKind::JoinResponse,
            Packet::NameColorBroadcast { .. } => PacketKind::NameColorBroadcast,
            Packet::StateUpdate { .. } => PacketKind::StateUpdate,
            Packet::StateBroadcast { .. } => PacketKind::StateBroadcast,
            Packet::ChatMessage { .. } => PacketKind::ChatMessage,
            Packet::ChatBroadcast { .. } => PacketKind::ChatBroadcast,
            Packet::StartSpeedrunBroadcast => PacketKind::StartSpeedrunBroadcast,
        }
    }

    /// A chat line from the server itself.
    pub fn server_notice(text: impl AsRef<str>) -> Self {
        Packet::ChatBroadcast {
            sender_id: PlayerId::UNKNOWN,
            sender_name: crate::SERVER_SENDER_NAME.to_string(),
            text: truncate_chars(text.as_ref(), CHAT_MESSAGE_MAX_LENGTH).to_string(),
            color: PlayerColor::WHITE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        writer.put(&(self.kind() as u8));

        match self {
            Packet::JoinRequest {
                api_version,
                name,
                color,
            } => {
                writer.put(api_version);
                writer.put_str(name, PLAYER_NAME_MAX_LENGTH);
                writer.put(color);
            }
            Packet::JoinResponse {
                player_id,
                name,
                color,
                access_token,
            } => {
                writer.put(player_id);
                writer.put_str(name, PLAYER_NAME_MAX_LENGTH);
                writer.put(color);
                writer.put(access_token);
            }
            Packet::NameColorBroadcast {
                player_id,
                name,
                color,
            } => {
                writer.put(player_id);
                writer.put_str(name, PLAYER_NAME_MAX_LENGTH);
                writer.put(color);
            }
            Packet::StateUpdate {
                player_id,
                access_token,
                speedrun_frame_index,
                puzzle_pieces,
                snapshot,
            } => {
                writer.put(player_id);
                writer.put(access_token);
                put_speedrun_frame_index(&mut writer, *speedrun_frame_index);
                writer.put(puzzle_pieces);
                writer.put(snapshot);
            }
            Packet::StateBroadcast {
                player_id,
                name,
                color,
                speedrun_frame_index,
                puzzle_pieces,
                snapshot,
            } => {
                writer.put(player_id);
                writer.put_str(name, PLAYER_NAME_MAX_LENGTH);
                writer.put(color);
                put_speedrun_frame_index(&mut writer, *speedrun_frame_index);
                writer.put(puzzle_pieces);
                writer.put(snapshot);
            }
            Packet::ChatMessage { text } => {
                writer.put_str(text, CHAT_MESSAGE_MAX_LENGTH);
            }
            Packet::ChatBroadcast {
                sender_id,
                sender_name,
                text,
                color,
            } => {
                writer.put(sender_id);
                writer.put_str(sender_name, PLAYER_NAME_MAX_LENGTH);
                writer.put_str(text, CHAT_MESSAGE_MAX_LENGTH);
                writer.put(color);
            }
            Packet::StartSpeedrunBroadcast => {}
        }

        writer.into_bytes()
    }

    /// Decodes any known packet kind.
    pub fn decode(data: &[u8]) -> Option<Packet> {
        let kind = PacketKind::try_from(*data.first()?).ok()?;
        Self::decode_as(kind, data)
    }

    /// Decodes `data` only if it is a packet of the `expected` kind.
    pub fn decode_as(expected: PacketKind, data: &[u8]) -> Option<Packet> {
        let (&discriminant, body) = data.split_first()?;
        if discriminant != expected as u8 {
            return None;
        }

        let mut reader = WireReader::new(body);
        let packet = match expected {
            PacketKind::JoinRequest => Packet::JoinRequest {
                api_version: reader.get()?,
                name: reader.get_str(PLAYER_NAME_MAX_LENGTH)?,
                color: reader.get()?,
            },
            PacketKind::JoinResponse => Packet::JoinResponse {
                player_id: reader.get()?,
                name: reader.get_str(PLAYER_NAME_MAX_LENGTH)?,
                color: reader.get()?,
                access_token: reader.get()?,
            },
            PacketKind::NameColorBroadcast => Packet::NameColorBroadcast {
                player_id: reader.get()?,
                name: reader.get_str(PLAYER_NAME_MAX_LENGTH)?,
                color: reader.get()?,
            },
            PacketKind::StateUpdate => Packet::StateUpdate {
                player_id: reader.get()?,
                access_token: reader.get()?,
                speedrun_frame_index: get_speedrun_frame_index(&mut reader)?,
                puzzle_pieces: reader.get()?,
                snapshot: reader.get()?,
            },
            PacketKind::StateBroadcast => Packet::StateBroadcast {
                player_id: reader.get()?,
                name: reader.get_str(PLAYER_NAME_MAX_LENGTH)?,
                color: reader.get()?,
                speedrun_frame_index: get_speedrun_frame_index(&mut reader)?,
                puzzle_pieces: reader.get()?,
                snapshot: reader.get()?,
            },
            PacketKind::ChatMessage => Packet::ChatMessage {
                text: reader.get_str(CHAT_MESSAGE_MAX_LENGTH)?,
            },
            PacketKind::ChatBroadcast => Packet::ChatBroadcast {
                sender_id: reader.get()?,
                sender_name: reader.get_str(PLAYER_NAME_MAX_LENGTH)?,
                text: reader.get_str(CHAT_MESSAGE_MAX_LENGTH)?,
                color: reader.get()?,
            },
            PacketKind::StartSpeedrunBroadcast => Packet::StartSpeedrunBroadcast,
        };

        // Trailing bytes mean the sender speaks a different schema
        reader.is_empty().then_some(packet)
    }
}

fn put_speedrun_frame_index(writer: &mut WireWriter, value: Option<i32>) {
    let raw = value
        .filter(|index| *index >= 0)
        .unwrap_or(SPEEDRUN_FRAME_INDEX_NOT_STARTED);
    writer.put(&raw);
}

/// Outer `None` means the field is missing; inner `None` means no timed run.
fn get_speedrun_frame_index(reader: &mut WireReader<'_>) -> Option<Option<i32>> {
    let raw: i32 = reader.get()?;
    Some((raw >= 0).then_some(raw))
}
