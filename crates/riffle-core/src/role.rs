//! Core roles and role-change events.
//!
//! Roles are assigned by an external arbiter; the core only reacts.
//! Listeners receive events as a tagged enum over a channel rather than
//! through callback objects.

/// The role a core currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No arbiter has assigned a role yet (standalone operation).
    Idle,
    /// Accepts writes and drives replication.
    Primary,
    /// Read-only synchronous follower.
    Back,
    /// Read-only asynchronous follower.
    Mirror,
}

impl Role {
    /// Stable lowercase name, used in errors and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Idle => "idle",
            Role::Primary => "primary",
            Role::Back => "back",
            Role::Mirror => "mirror",
        }
    }

    /// Whether this role accepts writes. `Idle` does: a core no arbiter
    /// has claimed runs standalone.
    #[must_use]
    pub fn accepts_writes(self) -> bool {
        matches!(self, Role::Idle | Role::Primary)
    }
}

/// A role transition delivered to the core, stamped with the clock at
/// which the arbiter decided it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleEvent {
    /// This core is now primary.
    BecamePrimary {
        /// Arbiter clock of the decision.
        clock: u64,
    },
    /// This core is now a synchronous follower.
    BecameBack {
        /// Arbiter clock of the decision.
        clock: u64,
    },
    /// This core is now an asynchronous follower.
    BecameMirror {
        /// Arbiter clock of the decision.
        clock: u64,
    },
    /// This core is losing primary; in-flight writes drain before the
    /// transition completes.
    LostPrimary {
        /// Arbiter clock of the decision.
        clock: u64,
    },
}

impl RoleEvent {
    /// The arbiter clock carried by the event.
    #[must_use]
    pub fn clock(self) -> u64 {
        match self {
            RoleEvent::BecamePrimary { clock }
            | RoleEvent::BecameBack { clock }
            | RoleEvent::BecameMirror { clock }
            | RoleEvent::LostPrimary { clock } => clock,
        }
    }

    /// The role this event transitions into.
    #[must_use]
    pub fn target_role(self) -> Role {
        match self {
            RoleEvent::BecamePrimary { .. } => Role::Primary,
            RoleEvent::BecameBack { .. } | RoleEvent::LostPrimary { .. } => Role::Back,
            RoleEvent::BecameMirror { .. } => Role::Mirror,
        }
    }
}
