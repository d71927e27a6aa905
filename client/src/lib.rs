//! # Sync Client Library
//!
//! This library is the client half of the co-op sync system. It runs next to
//! a single-player game, publishes the local player's avatar state to the
//! relay server, and keeps a cache of every other player for the renderer.
//!
//! ## Architecture Overview
//!
//! The game hook calls into the client once per observed frame. Nothing on
//! that path ever waits on the network: sends are queued on the transport and
//! written with non-blocking socket calls, and received datagrams are only
//! read when the caller asks for them with `poll_events`.
//!
//! ### Best-Effort State
//! Avatar state travels unreliably. Every update carries the game's frame
//! index, and both ends drop anything that is not newer than what they
//! already have, so reordered or duplicated datagrams correct themselves.
//!
//! ### Reliable Chat
//! Chat, name/color changes and the synchronized speedrun start are delivered
//! reliably and in order.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! The local player, the remote player cache, staleness rules and the packets
//! to send. Contains no I/O.
//!
//! ### Chat Module (`chat`)
//! A bounded log of the most recent chat messages.
//!
//! ### Network Module (`network`)
//! Socket ownership, the bounded and cancellable connect loop, and the
//! non-blocking poll/send calls used by the game hook.
//!
//! ### Simulation Module (`simulation`)
//! Optional artificial latency and packet loss on incoming datagrams.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::{Client, ClientConfig, ClientEvent};
//! use shared::{EntitySnapshot, PlayerColor};
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), shared::BoxError> {
//! let mut client = Client::new(ClientConfig::default()).await?;
//! let (_cancel_tx, cancel_rx) = watch::channel(false);
//!
//! if client
//!     .connect_to_server("127.0.0.1:55555", "Alice", PlayerColor::RED, &cancel_rx)
//!     .await
//! {
//!     // Once per game frame:
//!     client.poll_events();
//!     client.send_player_state_update(None, 0, EntitySnapshot::default());
//!     while let Some(event) = client.next_event() {
//!         if event == ClientEvent::StartSpeedrun {
//!             // launch the run
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod network;
pub mod session;
pub mod simulation;

pub use chat::ChatLog;
pub use network::{Client, ClientConfig, ConnectionState};
pub use session::{ClientEvent, ClientSession};
pub use simulation::NetworkSimulation;
