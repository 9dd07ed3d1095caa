//! Threads capability
//!
//! Whether a module gets threads is decided once, from its declared imports,
//! and the resulting value is passed to everything that needs it (host
//! adapter and pool construction) instead of being re-derived.

use serde::{Deserialize, Serialize};

/// Declared limits of an imported linear memory, in 64 KiB pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub minimum: u32,
    pub maximum: Option<u32>,
    pub shared: bool,
}

/// Outcome of capability negotiation for one module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadsCapability {
    /// Module allocates its own memory: single-threaded, no pool
    Absent,
    /// Module imports a shared memory with these limits
    Present(MemoryLimits),
}

impl ThreadsCapability {
    pub fn is_present(&self) -> bool {
        matches!(self, ThreadsCapability::Present(_))
    }

    /// Limits of the memory to create for the module, if any.
    pub fn memory(&self) -> Option<&MemoryLimits> {
        match self {
            ThreadsCapability::Present(limits) => Some(limits),
            ThreadsCapability::Absent => None,
        }
    }
}
