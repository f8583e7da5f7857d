//! Execution unit lifecycle
//!
//! ```text
//! Created ──► Initializing ──► Running ──► Closed
//!    │             │              │
//!    └─────────────┴──────────────┴──────► Failed
//! ```
//!
//! Edges only go forward. The cell is shared between the unit's thread, which
//! drives it, and the supervisor's registry, which only reads it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{HostError, HostResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum UnitState {
    Created = 0,
    Initializing = 1,
    Running = 2,
    Closed = 3,
    Failed = 4,
}

impl UnitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Initializing,
            2 => Self::Running,
            3 => Self::Closed,
            _ => Self::Failed,
        }
    }

    /// `true` for states a unit never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    fn can_become(self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Created, Initializing)
                | (Initializing, Running)
                | (Running, Closed)
                | (Created | Initializing | Running, Failed)
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Shared, forward-only state of one unit.
#[derive(Debug, Clone)]
pub struct StateCell {
    state: Arc<AtomicU8>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(UnitState::Created as u8)),
        }
    }

    pub fn get(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`, failing if that edge is not in the lifecycle graph.
    pub fn transition(&self, next: UnitState) -> HostResult<()> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                UnitState::from_u8(raw)
                    .can_become(next)
                    .then_some(next as u8)
            })
            .map(|_| ())
            .map_err(|raw| HostError::InvalidTransition {
                from: UnitState::from_u8(raw),
                to: next,
            })
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
