//! Host/unit message protocol
//!
//! Units and the supervisor only ever talk through the types in this module.
//! Supervisor-to-unit traffic is a single [`InitMessage`] per unit; everything
//! flowing the other way is a [`HostMessage`] wrapped in a [`SupervisorEvent`]
//! together with the identity of the sending unit.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::HostError;
use crate::memory::SharedMemoryRegion;

/// An opaque address in the module's 32-bit address space.
///
/// The host never does arithmetic on these. They are compared against bounds
/// and handed back to the module exactly as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleAddr(u32);

impl ModuleAddr {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Reinterpret a wasm `i32` argument. Bit-exact, no sign handling.
    pub const fn from_wasm(raw: i32) -> Self {
        Self(raw as u32)
    }

    /// The value to pass back into the module as an `i32` argument.
    pub const fn to_wasm(self) -> i32 {
        self.0 as i32
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Byte offset into the shared memory, for host-side bounds checks and copies.
    pub(crate) fn offset(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ModuleAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Arguments a running unit supplies when it asks for a new worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Module-side global context shared by the spawning threads.
    pub context: ModuleAddr,
    /// Function-table index of the worker body.
    pub entry: ModuleAddr,
    /// Per-worker payload.
    pub data: ModuleAddr,
    /// Distinguishes workers requested together.
    pub index: u32,
}

/// Which entry point a unit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Main,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Process-unique unit identity. The Main unit is always `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u64);

impl UnitId {
    pub const MAIN: UnitId = UnitId(0);
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Supervisor → unit: the one message a unit waits for before running module code.
#[derive(Debug, Clone)]
pub enum InitMessage {
    /// `init:main`
    Main { memory: SharedMemoryRegion },
    /// `init:worker`
    Worker {
        memory: SharedMemoryRegion,
        args: SpawnRequest,
    },
}

impl InitMessage {
    pub fn role(&self) -> Role {
        match self {
            Self::Main { .. } => Role::Main,
            Self::Worker { .. } => Role::Worker,
        }
    }

    pub fn memory(&self) -> &SharedMemoryRegion {
        match self {
            Self::Main { memory } | Self::Worker { memory, .. } => memory,
        }
    }

    pub fn entry_args(&self) -> Option<SpawnRequest> {
        match self {
            Self::Main { .. } => None,
            Self::Worker { args, .. } => Some(*args),
        }
    }
}

/// Unit → supervisor messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    #[serde(rename = "worker:start")]
    WorkerStart(SpawnRequest),
    #[serde(rename = "worker:closed")]
    WorkerClosed,
    #[serde(rename = "main:closed")]
    MainClosed,
    /// Any discriminator this host does not understand.
    #[serde(other)]
    Unknown,
}

impl HostMessage {
    /// Decode a message from its JSON wire form.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// The closure notification for a unit of the given role.
    pub fn closed(role: Role) -> Self {
        match role {
            Role::Main => Self::MainClosed,
            Role::Worker => Self::WorkerClosed,
        }
    }
}

/// Lifecycle notifications the supervisor records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    WorkerStarted,
    WorkerClosed,
    MainClosed,
}

/// Everything the supervisor's inbox carries.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// A protocol message from a running unit.
    Message { from: UnitId, message: HostMessage },
    /// The unit's thread is about to end. Always the last event a unit sends.
    Exited {
        unit: UnitId,
        outcome: Result<(), HostError>,
    },
}
