//! # Arena Server Library
//!
//! This library provides the authoritative server for the arena game. It owns
//! the canonical world, admits players, applies their inputs, and keeps every
//! client's mirror of the world in step with its own.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! Every unknown sender address gets a provisional connection. Once its
//! `ClientConnect` arrives the server either rejects it (protocol mismatch,
//! server full) or admits it and sends the join snapshot:
//! - `ConnectAccept` with the new player's id
//! - `PlayerJoin` and `PlayerStats` for every player already present
//! - `EntityAdd` for every live entity
//! - the newcomer's own `PlayerJoin`, which marks the end of the snapshot
//!
//! ### Authoritative Simulation
//! The world advances in fixed steps. Avatars move from the latest input,
//! overlapping avatars push apart, and charged orbs fire lightning bolts
//! that score kills.
//!
//! ### State Broadcasting
//! Topology changes (joins, leaves, spawns, removals, kills, stats) travel
//! reliably and in order. Entity state travels as sequenced updates that
//! may be lost, with a full refresh at a fixed interval.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Tick
//! [`network::Server::tick`] does all of its work on the caller's task: it
//! drains the socket, dispatches sessions in player id order, steps the
//! world, and flushes. Nothing blocks and no tasks are spawned, so the same
//! server runs over UDP in the binary and over an in-memory network in tests.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! The roster of admitted players, their connections and address routing.
//!
//! ### Config Module (`config`)
//! Tunables for the server loop, admission and the per-client connections.
//!
//! ### Game Module (`game`)
//! The authoritative world and its simulation step.
//!
//! ### Network Module (`network`)
//! The tick pipeline tying the roster, the world and the transport together.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use arena_server::config::ServerConfig;
//! use arena_server::network::Server;
//! use std::time::Instant;
//! use tokio::net::UdpSocket;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket = UdpSocket::bind("0.0.0.0:27960").await?;
//!     let mut server = Server::new(socket, ServerConfig::default());
//!
//!     let mut ticker = tokio::time::interval(std::time::Duration::from_millis(33));
//!     loop {
//!         ticker.tick().await;
//!         server.tick(Instant::now())?;
//!     }
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod game;
pub mod network;
