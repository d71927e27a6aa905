//! Player identity allocation: ids, display names, colors and access tokens.
//!
//! Invalid requests are never refused here. An empty or over-long name, or
//! the undefined color, is replaced with a generated value that does not clash
//! with anyone currently in the session table.

use rand::seq::SliceRandom;
use rand::Rng;
use shared::color::PRIORITIZED_COLORS;
use shared::{truncate_chars, PlayerColor, PlayerId, PLAYER_NAME_MAX_LENGTH};

/// Name handed to players whose requested name is unusable.
pub const FALLBACK_NAME: &str = "Tim";

/// Returns the smallest id in `1..=255` not present in `taken`.
pub fn allocate_player_id(taken: impl IntoIterator<Item = PlayerId>) -> Option<PlayerId> {
    let mut used = [false; 256];
    for id in taken {
        used[id.0 as usize] = true;
    }
    (PlayerId::MIN.0..=PlayerId::MAX.0)
        .find(|id| !used[*id as usize])
        .map(PlayerId)
}

pub fn is_valid_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty() && trimmed.chars().count() <= PLAYER_NAME_MAX_LENGTH
}

/// Case-insensitive membership test against the names already in use.
pub fn is_name_taken(name: &str, taken: &[&str]) -> bool {
    taken.iter().any(|other| other.to_lowercase() == name.to_lowercase())
}

/// Picks the display name for a player.
///
/// A valid, unused name is kept as is (trimmed). A valid name that clashes
/// with another player gets the first free `_<n>` suffix; an invalid one
/// falls back to `Tim`, `Tim_2`, `Tim_3`, ... Comparison is case-insensitive.
pub fn resolve_name(requested: &str, taken: &[&str]) -> String {
    let base = if is_valid_name(requested) {
        requested.trim()
    } else {
        FALLBACK_NAME
    };

    if !is_name_taken(base, taken) {
        return base.to_string();
    }

    let mut suffix = 2usize;
    loop {
        let tail = format!("_{}", suffix);
        let room = PLAYER_NAME_MAX_LENGTH.saturating_sub(tail.chars().count());
        let candidate = format!("{}{}", truncate_chars(base, room), tail);
        if !is_name_taken(&candidate, taken) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Keeps a requested color, or picks the most preferred palette color nobody
/// uses yet. With the whole palette in use, any palette color is drawn at random.
pub fn resolve_color<R: Rng + ?Sized>(
    requested: PlayerColor,
    taken: &[PlayerColor],
    rng: &mut R,
) -> PlayerColor {
    if !requested.is_undefined() {
        return requested;
    }

    PRIORITIZED_COLORS
        .iter()
        .find(|color| !taken.contains(color))
        .or_else(|| PRIORITIZED_COLORS.choose(rng))
        .copied()
        .unwrap_or(PlayerColor::WHITE)
}

/// A random, readable color from a fixed saturation/lightness band.
pub fn random_color<R: Rng + ?Sized>(rng: &mut R) -> PlayerColor {
    PlayerColor::from_hsl(rng.gen_range(0.0..360.0), 0.85, 0.6)
}

/// Random non-zero session token. Deters casual id spoofing between peers;
/// it is not a cryptographic credential.
pub fn generate_access_token<R: Rng + ?Sized>(rng: &mut R) -> i32 {
    rng.gen_range(1..=i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_allocates_smallest_free_id() {
        assert_eq!(allocate_player_id(vec![]), Some(PlayerId(1)));
        assert_eq!(
            allocate_player_id(vec![PlayerId(1), PlayerId(2), PlayerId(4)]),
            Some(PlayerId(3))
        );
        // The unknown sentinel never counts as free or taken
        assert_eq!(allocate_player_id(vec![PlayerId::UNKNOWN]), Some(PlayerId(1)));
    }

    #[test]
    fn test_id_exhaustion() {
        let all = (1..=255u8).map(PlayerId);
        assert_eq!(allocate_player_id(all), None);

        let all_but_last = (1..=254u8).map(PlayerId);
        assert_eq!(allocate_player_id(all_but_last), Some(PlayerId(255)));
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("Alice"));
        assert!(is_valid_name("  Alice  "));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("   "));
        assert!(is_valid_name(&"a".repeat(PLAYER_NAME_MAX_LENGTH)));
        assert!(!is_valid_name(&"a".repeat(PLAYER_NAME_MAX_LENGTH + 1)));
    }

    #[test]
    fn test_fallback_name_series() {
        assert_eq!(resolve_name("", &[]), "Tim");
        assert_eq!(resolve_name("", &["tim"]), "Tim_2");
        assert_eq!(resolve_name("   ", &["Tim", "TIM_2"]), "Tim_3");
        assert_eq!(resolve_name(&"x".repeat(40), &["Tim", "Tim_3"]), "Tim_2");
    }

    #[test]
    fn test_colliding_name_gets_suffix() {
        assert_eq!(resolve_name(" Alice ", &["Bob"]), "Alice");
        assert_eq!(resolve_name("alice", &["Alice"]), "alice_2");

        let long = "a".repeat(PLAYER_NAME_MAX_LENGTH);
        let resolved = resolve_name(&long, &[long.as_str()]);
        assert_eq!(resolved.chars().count(), PLAYER_NAME_MAX_LENGTH);
        assert!(resolved.ends_with("_2"));
    }

    #[test]
    fn test_requested_color_is_kept() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            resolve_color(PlayerColor::RED, &[PlayerColor::RED], &mut rng),
            PlayerColor::RED
        );
    }

    #[test]
    fn test_unspecified_colors_follow_palette() {
        let mut rng = StdRng::seed_from_u64(1);
        let first = resolve_color(PlayerColor::UNDEFINED, &[], &mut rng);
        let second = resolve_color(PlayerColor::UNDEFINED, &[first], &mut rng);

        assert_eq!(first, PRIORITIZED_COLORS[0]);
        assert_eq!(second, PRIORITIZED_COLORS[1]);
        assert_ne!(first, second);

        let skipped = resolve_color(PlayerColor::UNDEFINED, &[PRIORITIZED_COLORS[0]], &mut rng);
        assert_eq!(skipped, PRIORITIZED_COLORS[1]);
    }

    #[test]
    fn test_exhausted_palette_still_yields_palette_color() {
        let mut rng = StdRng::seed_from_u64(7);
        let color = resolve_color(PlayerColor::UNDEFINED, PRIORITIZED_COLORS, &mut rng);
        assert!(PRIORITIZED_COLORS.contains(&color));
    }

    #[test]
    fn test_random_values() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            assert!(generate_access_token(&mut rng) > 0);
            let color = random_color(&mut rng);
            assert!(!color.is_undefined());
            assert_eq!(color.a, 255);
        }
    }
}
