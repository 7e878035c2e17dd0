//! # Riffle Net
//!
//! Replication transport for Riffle cores: the framed-TCP endpoint every
//! core serves ([`CoreServer`]) and the client side the primary uses to
//! push snapshots to followers ([`TcpTransport`]).
//!
//! The wire protocol is deliberately small: one connection per call, a
//! backup RPC or a single file stream, with an explicit cancel frame for
//! deadline expiry. See [`message`] for the framing.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// TCP client implementing the core's transport seam.
pub mod client;

/// Wire framing and RPC payloads.
pub mod message;

/// The replication endpoint served by every core.
pub mod server;

pub use client::{TcpTransport, DEFAULT_RPC_TIMEOUT};
pub use message::{Tag, FILE_CHUNK_SIZE, MAX_FRAME};
pub use server::CoreServer;
