//! # Riffle Core
//!
//! The per-core storage facade: clock-versioned atomic writes over the
//! durable engine, instruction persistence and replay, snapshot
//! orchestration, and the control-plane runner that serializes background
//! work. Replication reaches peers through the [`transport`] seam; an
//! external arbiter drives [`role`] transitions.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Configuration recognized by a core.
pub mod config;

/// The storage core facade.
pub mod core;

/// Core error types.
pub mod error;

/// Core identity types.
pub mod meta;

/// Roles and role-change events.
pub mod role;

/// The control-plane task runner.
pub mod runner;

/// The replication transport seam.
pub mod transport;

pub use self::core::{Applier, Instruction, Reader, StorageCore, Writer};
pub use config::CoreOptions;
pub use error::CoreError;
pub use meta::{CoreId, CoreMeta, Location, MpuId};
pub use role::{Role, RoleEvent};
pub use runner::ControlRunner;
pub use transport::{NoTransport, ReplicaTransport, TransportError};
