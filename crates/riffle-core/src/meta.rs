//! Core identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a mirror processing unit (a replica group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MpuId(
    /// Numeric id.
    pub u64,
);

/// Identifier of one core within an MPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoreId(
    /// Numeric id.
    pub u64,
);

/// Network location of a core, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Host name or address.
    pub host: String,
    /// TCP port of the core's replication endpoint.
    pub port: u16,
}

impl Location {
    /// Creates a location.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity of one core: which MPU it belongs to, which member it is,
/// a human-readable label (used for thread and span names), and where its
/// replication endpoint listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreMeta {
    /// Replica group id.
    pub mpu_id: MpuId,
    /// Member id within the group.
    pub core_id: CoreId,
    /// Human-readable label.
    pub label: String,
    /// Replication endpoint.
    pub location: Location,
}

impl CoreMeta {
    /// Creates a core identity.
    #[must_use]
    pub fn new(mpu_id: MpuId, core_id: CoreId, label: impl Into<String>, location: Location) -> Self {
        Self {
            mpu_id,
            core_id,
            label: label.into(),
            location,
        }
    }
}

impl fmt::Display for CoreMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}/{}]@{}", self.label, self.mpu_id.0, self.core_id.0, self.location)
    }
}
