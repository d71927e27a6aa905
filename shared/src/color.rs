//! Player colors, the named-color table and the join-time preference palette.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An RGBA color. The all-zero value is the "caller did not pick a color" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PlayerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl PlayerColor {
    pub const UNDEFINED: PlayerColor = PlayerColor::rgba(0, 0, 0, 0);

    pub const WHITE: PlayerColor = PlayerColor::rgb(255, 255, 255);
    pub const RED: PlayerColor = PlayerColor::rgb(255, 0, 0);
    pub const CYAN: PlayerColor = PlayerColor::rgb(0, 255, 255);
    pub const YELLOW: PlayerColor = PlayerColor::rgb(255, 255, 0);
    pub const GREEN: PlayerColor = PlayerColor::rgb(0, 128, 0);
    pub const PURPLE: PlayerColor = PlayerColor::rgb(128, 0, 128);
    pub const ORANGE: PlayerColor = PlayerColor::rgb(255, 165, 0);
    pub const PINK: PlayerColor = PlayerColor::rgb(255, 192, 203);
    pub const BLUE: PlayerColor = PlayerColor::rgb(0, 0, 255);
    pub const GOLD: PlayerColor = PlayerColor::rgb(255, 215, 0);
    pub const MAGENTA: PlayerColor = PlayerColor::rgb(255, 0, 255);
    pub const VIOLET: PlayerColor = PlayerColor::rgb(238, 130, 238);
    pub const CHOCOLATE: PlayerColor = PlayerColor::rgb(210, 105, 30);
    pub const TEAL: PlayerColor = PlayerColor::rgb(0, 128, 128);
    pub const AQUAMARINE: PlayerColor = PlayerColor::rgb(127, 255, 212);
    pub const KHAKI: PlayerColor = PlayerColor::rgb(240, 230, 140);
    pub const ORANGE_RED: PlayerColor = PlayerColor::rgb(255, 69, 0);
    pub const BLACK: PlayerColor = PlayerColor::rgb(0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }

    /// Looks up a color by (case-insensitive) name, ignoring spaces, dashes and underscores.
    pub fn from_name(name: &str) -> Option<Self> {
        let wanted: String = name
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .flat_map(char::to_lowercase)
            .collect();
        NAMED_COLORS
            .iter()
            .find(|(known, _)| *known == wanted)
            .map(|(_, color)| *color)
    }

    /// Name of this color in the named-color table, if it has one.
    pub fn name(&self) -> Option<&'static str> {
        NAMED_COLORS
            .iter()
            .find(|(_, color)| color == self)
            .map(|(name, _)| *name)
    }

    /// Parses `rrggbb` or `rrggbbaa`, with or without a leading `#`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().trim_start_matches('#');
        // from_str_radix tolerates a leading sign, so check the digits first
        if !(hex.len() == 6 || hex.len() == 8) || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        let a = if hex.len() == 8 { channel(6)? } else { 255 };
        Some(Self::rgba(channel(0)?, channel(2)?, channel(4)?, a))
    }

    /// Accepts either a known color name or a hex string.
    pub fn parse(text: &str) -> Option<Self> {
        Self::from_name(text).or_else(|| Self::from_hex(text))
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
    }

    /// Builds an opaque color from hue (degrees), saturation and lightness (0..=1).
    pub fn from_hsl(hue: f32, saturation: f32, lightness: f32) -> Self {
        let hue = hue.rem_euclid(360.0);
        let saturation = saturation.clamp(0.0, 1.0);
        let lightness = lightness.clamp(0.0, 1.0);

        let chroma = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
        let sector = hue / 60.0;
        let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
        let (r, g, b) = match sector as u32 {
            0 => (chroma, x, 0.0),
            1 => (x, chroma, 0.0),
            2 => (0.0, chroma, x),
            3 => (0.0, x, chroma),
            4 => (x, 0.0, chroma),
            _ => (chroma, 0.0, x),
        };
        let m = lightness - chroma / 2.0;
        let to_byte = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
        Self::rgb(to_byte(r), to_byte(g), to_byte(b))
    }
}

impl fmt::Display for PlayerColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{}", self.to_hex()),
        }
    }
}

const NAMED_COLORS: &[(&str, PlayerColor)] = &[
    ("white", PlayerColor::WHITE),
    ("red", PlayerColor::RED),
    ("cyan", PlayerColor::CYAN),
    ("yellow", PlayerColor::YELLOW),
    ("green", PlayerColor::GREEN),
    ("purple", PlayerColor::PURPLE),
    ("orange", PlayerColor::ORANGE),
    ("pink", PlayerColor::PINK),
    ("blue", PlayerColor::BLUE),
    ("gold", PlayerColor::GOLD),
    ("magenta", PlayerColor::MAGENTA),
    ("violet", PlayerColor::VIOLET),
    ("chocolate", PlayerColor::CHOCOLATE),
    ("teal", PlayerColor::TEAL),
    ("aquamarine", PlayerColor::AQUAMARINE),
    ("khaki", PlayerColor::KHAKI),
    ("orangered", PlayerColor::ORANGE_RED),
    ("black", PlayerColor::BLACK),
];

/// Colors handed out to players who did not request one, most preferred first.
pub const PRIORITIZED_COLORS: &[PlayerColor] = &[
    PlayerColor::CYAN,
    PlayerColor::YELLOW,
    PlayerColor::GREEN,
    PlayerColor::PURPLE,
    PlayerColor::RED,
    PlayerColor::ORANGE,
    PlayerColor::PINK,
    PlayerColor::BLUE,
    PlayerColor::GOLD,
    PlayerColor::MAGENTA,
    PlayerColor::VIOLET,
    PlayerColor::CHOCOLATE,
    PlayerColor::TEAL,
    PlayerColor::AQUAMARINE,
    PlayerColor::KHAKI,
    PlayerColor::WHITE,
];
