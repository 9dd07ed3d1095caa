//! Guest backend traits and the spawn hook
//!
//! The coordinator does not know how the guest module is executed. A backend
//! (wasmtime in `wth-host`, mocks in tests) implements [`GuestModule`]; the
//! pool hands it to every worker together with the shared linear memory.
//!
//! The `thread-spawn` import is modelled by [`SpawnThread`]. Each execution
//! context gets exactly one implementation:
//!
//! | Context          | Hook            | Behaviour                      |
//! |------------------|-----------------|--------------------------------|
//! | main, threads on | `ThreadPool`    | assigns an idle worker         |
//! | main, threads off| [`NoThreads`]   | `ThreadsUnavailable`           |
//! | pool worker      | [`RejectSpawn`] | `SpawnFromWorker` (fails fast) |

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{GuestError, SpawnError};

/// Largest thread id the wasi-threads ABI can return (top bits reserved).
pub const MAX_THREAD_ID: u32 = 0x1FFF_FFFF;

/// Identifier of a spawned guest thread. Starts at 1, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(u32);

impl ThreadId {
    /// First id handed out by a pool.
    pub const FIRST: ThreadId = ThreadId(1);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// The `thread-spawn` system call as seen by one execution context.
pub trait SpawnThread: Send + Sync {
    /// Start a guest thread running the thread-entry export with
    /// `start_arg`. Returns as soon as the thread is assigned.
    fn spawn_thread(&self, start_arg: u32) -> Result<ThreadId, SpawnError>;
}

/// Spawn hook installed in pool workers.
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectSpawn;

impl SpawnThread for RejectSpawn {
    fn spawn_thread(&self, _start_arg: u32) -> Result<ThreadId, SpawnError> {
        Err(SpawnError::SpawnFromWorker)
    }
}

/// Spawn hook for modules without the threads capability.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoThreads;

impl SpawnThread for NoThreads {
    fn spawn_thread(&self, _start_arg: u32) -> Result<ThreadId, SpawnError> {
        Err(SpawnError::ThreadsUnavailable)
    }
}

/// Encode a spawn result as the `i32` returned to the guest.
///
/// Positive thread id on success, negative errno on failure.
pub fn spawn_result_to_guest(result: Result<ThreadId, SpawnError>) -> i32 {
    match result {
        Ok(tid) => tid.get() as i32,
        Err(err) => {
            warn!(error = %err, "thread-spawn failed");
            -err.errno()
        }
    }
}

/// A compiled guest module that can be instantiated in any context.
///
/// Cloning must be cheap; the pool sends one clone to every worker.
pub trait GuestModule: Clone + Send + 'static {
    /// Linear memory shared by every instance.
    type Memory: Clone + Send + 'static;

    /// One instantiation, owned by the context that created it.
    type Instance: GuestInstance;

    /// Instantiate against `memory`, wiring `spawn` as the `thread-spawn`
    /// import.
    fn instantiate(
        &self,
        memory: &Self::Memory,
        spawn: Arc<dyn SpawnThread>,
    ) -> Result<Self::Instance, GuestError>;

    /// Forcibly stop guest code running in any context. Used by teardown;
    /// the default does nothing.
    fn interrupt(&self) {}
}

/// A guest instance inside one execution context.
pub trait GuestInstance {
    /// Call the thread-entry export with `(thread_id, start_arg)`.
    fn thread_start(&mut self, thread_id: ThreadId, start_arg: u32) -> Result<(), GuestError>;
}
