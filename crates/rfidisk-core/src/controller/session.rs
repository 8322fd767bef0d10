use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::registry::TagEntry;
use crate::supervisor::ProcessHandle;
use crate::tag::TagId;

/// What the controller holds for the inserted tag.
#[derive(Debug, Clone)]
pub struct Session {
    pub tag: TagId,
    /// Entry as it was when the tag was inserted.
    pub entry: TagEntry,
    /// `None` for display-only entries and failed launches.
    pub process: Option<ProcessHandle>,
    pub started_at: DateTime<Utc>,
    /// Epoch of the connection that last reported this tag.
    pub epoch: u64,
}

/// Controller state. Owned by the controller loop only.
#[derive(Debug, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Active(Session),
    PendingRemoval { session: Session, deadline: Instant },
}

impl ControllerState {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::Active(_) => Phase::Active,
            Self::PendingRemoval { .. } => Phase::PendingRemoval,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::Idle => None,
            Self::Active(session) | Self::PendingRemoval { session, .. } => Some(session),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Self::PendingRemoval { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }
}

/// Coarse state, for callers that only need to know where the machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active,
    PendingRemoval,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::PendingRemoval => "pending_removal",
        };
        f.write_str(s)
    }
}
