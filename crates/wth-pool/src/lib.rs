//! Thread-pool coordinator for wasi-threads guests
//!
//! Emulates "spawn a thread and run this entry point" for a guest module on a
//! fixed pool of independent worker contexts. The guest cannot create
//! contexts; its `thread-spawn` import asks the coordinator to hand an idle
//! worker a `(thread_id, start_arg)` pair through the shared slot channel.
//!
//! # Components
//!
//! - [`ThreadPool`] - coordinator: pool, channel, id allocation, teardown
//! - `worker` - runtime executed inside each worker context
//! - [`GuestModule`] / [`GuestInstance`] - backend seam (wasmtime, mocks)
//! - [`SpawnThread`] - the `thread-spawn` call per execution context
//! - [`ThreadsCapability`] - explicit threads/no-threads decision
//!
//! # Error Kinds
//!
//! | Kind                 | Type                           | Effect                       |
//! |----------------------|--------------------------------|------------------------------|
//! | PoolExhaustion       | `SpawnError::PoolExhaustion`   | spawn call fails             |
//! | SpawnFromWorker      | `SpawnError::SpawnFromWorker`  | spawn call fails             |
//! | InstantiationFailure | `GuestError::Instantiation`    | worker never becomes ready   |
//! | WorkerTrap           | `GuestError::Trap`             | logged, slot `Finished`      |

mod capability;
mod error;
mod guest;
mod pool;
mod worker;

pub use capability::{MemoryLimits, ThreadsCapability};
pub use error::{GuestError, PoolError, SpawnError, ERRNO_AGAIN, ERRNO_NOTSUP};
pub use guest::{
    spawn_result_to_guest, GuestInstance, GuestModule, NoThreads, RejectSpawn, SpawnThread,
    ThreadId, MAX_THREAD_ID,
};
pub use pool::{SlotSnapshot, ThreadPool};
pub use wth_channel::SlotState;
