//! Deterministic progress ranking over player summaries.
//!
//! Players are ranked by puzzle pieces (most first), then by how far into the
//! game they are (world, then level, highest first), then by speedrun timer
//! (lowest first, players outside a timed run last). Name and id break any
//! remaining tie so the order is total.

use crate::PlayerSummary;
use std::cmp::Ordering;

pub fn compare(a: &PlayerSummary, b: &PlayerSummary) -> Ordering {
    b.puzzle_pieces
        .cmp(&a.puzzle_pieces)
        .then_with(|| b.snapshot.world.cmp(&a.snapshot.world))
        .then_with(|| b.snapshot.level.cmp(&a.snapshot.level))
        .then_with(|| compare_speedrun(a.speedrun_frame_index, b.speedrun_frame_index))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.player_id.cmp(&b.player_id))
}

fn compare_speedrun(a: Option<i32>, b: Option<i32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn order_by_leaderboard_position(players: &mut [PlayerSummary]) {
    players.sort_by(compare);
}

pub fn leaderboard(players: impl IntoIterator<Item = PlayerSummary>) -> Vec<PlayerSummary> {
    let mut ranked: Vec<_> = players.into_iter().collect();
    order_by_leaderboard_position(&mut ranked);
    ranked
}
