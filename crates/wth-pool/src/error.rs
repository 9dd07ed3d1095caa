//! Error types for the coordinator, the workers and guest backends.

use thiserror::Error;
use wth_channel::{ChannelError, SlotState};

/// WASI errno `EAGAIN`.
pub const ERRNO_AGAIN: i32 = 6;

/// WASI errno `ENOTSUP`.
pub const ERRNO_NOTSUP: i32 = 58;

/// Why a `thread-spawn` call failed.
///
/// Every variant is synchronous and local to the call: nothing is queued or
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    /// No slot in the pool is `Ready`
    #[error("no available worker (pool size {pool_size})")]
    PoolExhaustion { pool_size: usize },

    /// Guest tried to spawn from a worker context
    #[error("cannot spawn a new thread from a worker thread")]
    SpawnFromWorker,

    /// Module was not given the threads capability
    #[error("threads capability not available for this module")]
    ThreadsUnavailable,

    /// Thread id space is used up
    #[error("thread id space exhausted")]
    ThreadIdsExhausted,

    /// `warm_up` has not completed yet
    #[error("thread pool is not warmed up")]
    NotWarm,

    /// Pool was torn down
    #[error("thread pool has been terminated")]
    Terminated,

    /// Slot protocol violation
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl SpawnError {
    /// Errno reported to the guest (as a negative return value).
    pub fn errno(&self) -> i32 {
        match self {
            SpawnError::PoolExhaustion { .. }
            | SpawnError::ThreadIdsExhausted
            | SpawnError::NotWarm => ERRNO_AGAIN,
            SpawnError::SpawnFromWorker
            | SpawnError::ThreadsUnavailable
            | SpawnError::Terminated
            | SpawnError::Channel(_) => ERRNO_NOTSUP,
        }
    }
}

/// Errors from pool construction, warm-up and draining.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A pool needs at least one worker
    #[error("thread pool size must be at least 1")]
    EmptyPool,

    /// `warm_up` was called more than once
    #[error("thread pool was already warmed up")]
    AlreadyWarm,

    /// Operating system refused to create a worker context
    #[error("failed to start worker {slot}: {source}")]
    WorkerStart {
        slot: usize,
        #[source]
        source: std::io::Error,
    },

    /// Worker exited before it could receive its init message
    #[error("worker {slot} is gone")]
    WorkerGone { slot: usize },

    /// Worker did not become ready in time
    #[error("worker {slot} did not become ready in time")]
    WarmUpTimeout { slot: usize },

    /// Worker left `NotStarted` for something other than `Ready`
    #[error("worker {slot} is {state} instead of ready")]
    WorkerNotReady { slot: usize, state: SlotState },

    /// In-flight thread did not finish in time
    #[error("thread on worker {slot} still running after drain timeout")]
    DrainTimeout { slot: usize },

    /// Pool was torn down
    #[error("thread pool has been terminated")]
    Terminated,

    /// Slot protocol violation
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Failure reported by a guest backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestError {
    /// Module or memory setup failed
    #[error("instantiation failed: {0}")]
    Instantiation(String),

    /// Guest code trapped or threw
    #[error("guest trapped: {0}")]
    Trap(String),
}
