//! # Arena Client Library
//!
//! This library provides the client side of the arena synchronization layer.
//! A client connects to one server, applies the join snapshot, and from then
//! on keeps a mirror of the authoritative world while streaming its own
//! inputs back.
//!
//! ## Architecture Overview
//!
//! ### Synchronization State Machine
//! [`network::ClientSession`] moves through `Connecting`, `Syncing` and
//! `Synced`, and ends in `Disconnected` (the client left) or `Faulted` (the
//! server rejected it, shut down, or went silent). The client is only
//! considered synced once it has seen its own `PlayerJoin`, which the server
//! sends as the last message of the snapshot.
//!
//! ### World Mirror
//! [`game::ClientWorld`] changes only through server messages. Sequenced
//! updates that arrive late are dropped by the connection before they reach
//! the mirror, so a stale position never overwrites a newer one. Between
//! updates avatars are extrapolated along their last known velocity.
//!
//! ### Input Sequencing
//! [`input::InputManager`] stamps every input with the next sequence number
//! of the session; the sequence restarts at 1 after a reconnect. The
//! [`input::Autopilot`] stands in for a human player in the headless binary.
//!
//! ## Module Organization
//!
//! - `config`: client tunables
//! - `game`: the world mirror
//! - `input`: input sequencing and the autopilot
//! - `network`: the session state machine
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use arena_client::config::ClientConfig;
//! use arena_client::network::ClientSession;
//! use std::time::Instant;
//! use tokio::net::UdpSocket;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket = UdpSocket::bind("0.0.0.0:0").await?;
//!     let server = "127.0.0.1:27960".parse()?;
//!     let mut session = ClientSession::connect(socket, server, ClientConfig::default(), Instant::now());
//!
//!     let mut ticker = tokio::time::interval(std::time::Duration::from_millis(33));
//!     while session.state().is_active() {
//!         ticker.tick().await;
//!         session.tick(Instant::now());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod game;
pub mod input;
pub mod network;
