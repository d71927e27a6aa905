//! # Sync Server Library
//!
//! This library provides the relay server of the co-op sync system. Every
//! game instance runs a client next to the game process; the server is the
//! single place that knows who is connected, hands out identities, and fans
//! state and chat out to everyone else.
//!
//! ## Core Responsibilities
//!
//! ### Identity
//! Each joining peer receives a player id (the smallest free one in
//! `1..=255`), a display name and a color that do not clash with anybody
//! already connected, and a random access token that must accompany every
//! later state update. Unusable names and colors are silently replaced.
//!
//! ### State Relay
//! Position updates arrive best-effort and possibly out of order. The server
//! checks the sender's id and token, drops anything not newer than what it
//! already applied, and relays accepted updates unreliably to every other
//! peer.
//!
//! ### Chat and Commands
//! Chat lines are relayed reliably and in order. Lines starting with a known
//! `!command` are executed server-side instead, most notably `!start`, which
//! launches a synchronized speedrun on every connected game at once.
//!
//! ## Architecture Design
//!
//! ### Single Socket Task
//! One tokio task owns the UDP socket and the transport endpoint. It wakes
//! for incoming datagrams and for a maintenance tick that is short while
//! players are connected and long on an empty server.
//!
//! ### Shared Session Table
//! The session table sits behind an `Arc<RwLock<_>>`. A join request holds the
//! write lock for the whole check-allocate-insert sequence, so concurrent
//! joins can never be handed the same id.
//!
//! ## Module Organization
//!
//! ### Identity Module (`identity`)
//! Id allocation, name and color resolution, access token generation.
//!
//! ### Session Table Module (`session_table`)
//! Per-peer player records and every request handler. Produces a list of
//! outgoing actions instead of touching the network.
//!
//! ### Commands Module (`commands`)
//! Parsing of `!command` chat lines and the `!help` table.
//!
//! ### Network Module (`network`)
//! Socket I/O, transport event dispatch and the maintenance loop.
//!
//! ### Dashboard Module (`dashboard`)
//! A small HTTP page and JSON endpoint listing who is connected, read from
//! the same session table.

pub mod commands;
pub mod dashboard;
pub mod identity;
pub mod network;
pub mod session_table;

pub use dashboard::Dashboard;
pub use network::{Server, ServerConfig};
pub use session_table::{JoinRejection, Outgoing, SessionTable};
