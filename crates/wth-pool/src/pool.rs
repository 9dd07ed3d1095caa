//! Thread-pool coordinator
//!
//! Owns the worker contexts, the shared channel and thread-id allocation,
//! and implements `thread-spawn` for the main context.
//!
//! # Lifecycle
//!
//! ```text
//! new(n)        n workers started, every slot NotStarted
//! warm_up(..)   init sent to every worker, resolves when every slot is Ready
//! spawn_thread  first Ready slot (by index) -> Started, returns the new id
//! drain(..)     optional: wait until no slot is Started
//! terminate_all unconditional teardown
//! ```
//!
//! Slots are never recycled: a pool of size `n` runs at most `n` threads.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use wth_channel::{ChannelError, SharedChannel, SlotState};

use crate::capability::ThreadsCapability;
use crate::guest::{GuestModule, SpawnThread, ThreadId, MAX_THREAD_ID};
use crate::worker::{self, Worker, WorkerInit};
use crate::{PoolError, SpawnError};

/// Coordinator-side handle of one worker context.
struct WorkerHandle<G: GuestModule> {
    init: Option<oneshot::Sender<WorkerInit<G>>>,
    thread: Option<JoinHandle<()>>,
}

/// Point-in-time view of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub slot: usize,
    #[serde(serialize_with = "serialize_state")]
    pub state: SlotState,
    /// Assigned thread, once the slot has been `Started`
    pub thread_id: Option<ThreadId>,
    pub start_arg: Option<u32>,
}

fn serialize_state<S: serde::Serializer>(state: &SlotState, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(state)
}

/// Fixed-size pool of worker contexts emulating thread spawn.
pub struct ThreadPool<G: GuestModule> {
    channel: Arc<SharedChannel>,
    workers: Mutex<Vec<WorkerHandle<G>>>,
    /// Spawn gate; holds the next thread id to hand out
    next_thread_id: Mutex<u32>,
    warming: AtomicBool,
    warm: AtomicBool,
    terminated: Arc<AtomicBool>,
    /// Module clone kept for `GuestModule::interrupt` at teardown
    module: Mutex<Option<G>>,
    spawned: AtomicU32,
}

impl<G: GuestModule> ThreadPool<G> {
    /// Allocate the channel and start `pool_size` workers.
    pub fn new(pool_size: usize) -> Result<Self, PoolError> {
        if pool_size == 0 {
            return Err(PoolError::EmptyPool);
        }

        let channel = Arc::new(SharedChannel::new(pool_size));
        let terminated = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(pool_size);
        for slot in 0..pool_size {
            let (init_tx, init_rx) = oneshot::channel();
            let thread = worker::spawn(Worker {
                slot,
                channel: channel.clone(),
                terminated: terminated.clone(),
                init: init_rx,
            })
            .map_err(|source| PoolError::WorkerStart { slot, source })?;
            workers.push(WorkerHandle {
                init: Some(init_tx),
                thread: Some(thread),
            });
        }

        debug!(
            pool_size,
            channel_bytes = channel.byte_len(),
            "thread pool created"
        );

        Ok(Self {
            channel,
            workers: Mutex::new(workers),
            next_thread_id: Mutex::new(ThreadId::FIRST.get()),
            warming: AtomicBool::new(false),
            warm: AtomicBool::new(false),
            terminated,
            module: Mutex::new(None),
            spawned: AtomicU32::new(0),
        })
    }

    /// Build a pool only when the module has the threads capability.
    pub fn with_capability(
        capability: &ThreadsCapability,
        pool_size: usize,
    ) -> Result<Option<Self>, PoolError> {
        match capability {
            ThreadsCapability::Present(_) => Self::new(pool_size).map(Some),
            ThreadsCapability::Absent => {
                debug!("module has no threads capability, no pool created");
                Ok(None)
            }
        }
    }

    /// Number of workers.
    pub fn pool_size(&self) -> usize {
        self.channel.slot_count()
    }

    /// Shared channel (read access for diagnostics and tests).
    pub fn channel(&self) -> &Arc<SharedChannel> {
        &self.channel
    }

    pub fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Number of successful spawns so far.
    pub fn threads_spawned(&self) -> u32 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Send the module and shared memory to every worker and wait until
    /// every slot is `Ready`.
    ///
    /// The waits run off the calling task, so the coordinating context keeps
    /// servicing other work. With `timeout`, a worker that never becomes
    /// ready fails the call instead of hanging it; without one,
    /// [`terminate_all`](Self::terminate_all) releases the wait.
    pub async fn warm_up(
        &self,
        module: G,
        memory: G::Memory,
        timeout: Option<Duration>,
    ) -> Result<(), PoolError> {
        if self.is_terminated() {
            return Err(PoolError::Terminated);
        }
        if self.warming.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyWarm);
        }

        {
            let mut workers = self.workers.lock();
            for (slot, handle) in workers.iter_mut().enumerate() {
                let init = WorkerInit {
                    module: module.clone(),
                    memory: memory.clone(),
                };
                handle
                    .init
                    .take()
                    .ok_or(PoolError::WorkerGone { slot })?
                    .send(init)
                    .map_err(|_| PoolError::WorkerGone { slot })?;
            }
        }
        *self.module.lock() = Some(module);

        let deadline = timeout.map(|t| Instant::now() + t);
        for slot in 0..self.pool_size() {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let state = self
                .channel
                .wait_async(
                    slot,
                    SlotState::NotStarted,
                    self.terminated.clone(),
                    remaining,
                )
                .await
                .map_err(|err| match err {
                    ChannelError::TimedOut { slot } => PoolError::WarmUpTimeout { slot },
                    ChannelError::Cancelled { .. } => PoolError::Terminated,
                    other => PoolError::Channel(other),
                })?;
            if state != SlotState::Ready {
                return Err(PoolError::WorkerNotReady { slot, state });
            }
        }

        self.warm.store(true, Ordering::Release);
        info!(pool_size = self.pool_size(), "thread pool warmed up");
        Ok(())
    }

    /// Assign `start_arg` to the first idle worker.
    ///
    /// Returns immediately with the new thread id; the thread may not have
    /// begun running yet. Id allocation and slot claim happen under one gate,
    /// so concurrent callers never share a slot or an id.
    pub fn spawn_thread(&self, start_arg: u32) -> Result<ThreadId, SpawnError> {
        if self.is_terminated() {
            return Err(SpawnError::Terminated);
        }
        if !self.is_warm() {
            return Err(SpawnError::NotWarm);
        }

        let mut next_thread_id = self.next_thread_id.lock();
        let tid = *next_thread_id;
        if tid > MAX_THREAD_ID {
            return Err(SpawnError::ThreadIdsExhausted);
        }
        *next_thread_id = tid + 1;

        let Some(slot) = self.channel.find_first(SlotState::Ready) else {
            warn!(
                thread_id = tid,
                pool_size = self.pool_size(),
                "no available worker"
            );
            return Err(SpawnError::PoolExhaustion {
                pool_size: self.pool_size(),
            });
        };

        self.channel.publish(slot, tid, start_arg)?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        debug!(thread_id = tid, slot, start_arg, "thread assigned");
        Ok(ThreadId::new(tid))
    }

    /// State of one slot.
    pub fn slot_state(&self, slot: usize) -> Result<SlotState, ChannelError> {
        self.channel.state(slot)
    }

    /// Snapshot of every slot, in index order.
    pub fn snapshot(&self) -> Result<Vec<SlotSnapshot>, ChannelError> {
        (0..self.pool_size())
            .map(|slot| {
                let state = self.channel.state(slot)?;
                let assigned = matches!(state, SlotState::Started | SlotState::Finished);
                let assignment = self.channel.assignment(slot)?;
                Ok(SlotSnapshot {
                    slot,
                    state,
                    thread_id: assigned.then(|| ThreadId::new(assignment.thread_id)),
                    start_arg: assigned.then_some(assignment.start_arg),
                })
            })
            .collect()
    }

    /// Wait until no slot is `Started`.
    ///
    /// Threads are fire-and-forget; this is only used at teardown and in
    /// tests to observe `Finished`.
    pub async fn drain(&self, timeout: Option<Duration>) -> Result<(), PoolError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        for slot in 0..self.pool_size() {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.channel
                .wait_async(slot, SlotState::Started, self.terminated.clone(), remaining)
                .await
                .map_err(|err| match err {
                    ChannelError::TimedOut { slot } => PoolError::DrainTimeout { slot },
                    ChannelError::Cancelled { .. } => PoolError::Terminated,
                    other => PoolError::Channel(other),
                })?;
        }
        Ok(())
    }

    /// Tear down every worker regardless of its slot state.
    ///
    /// Running guest code is interrupted through the backend, idle workers
    /// are woken and exit, and worker contexts are detached. Thread bodies
    /// are not guaranteed to complete.
    pub fn terminate_all(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(module) = self.module.lock().as_ref() {
            module.interrupt();
        }
        let woken = self.channel.interrupt_all();

        let mut workers = self.workers.lock();
        for handle in workers.iter_mut() {
            handle.init.take();
            handle.thread.take();
        }
        info!(
            pool_size = self.pool_size(),
            woken,
            spawned = self.threads_spawned(),
            "thread pool terminated"
        );
    }
}

impl<G: GuestModule> SpawnThread for ThreadPool<G> {
    fn spawn_thread(&self, start_arg: u32) -> Result<ThreadId, SpawnError> {
        ThreadPool::spawn_thread(self, start_arg)
    }
}

impl<G: GuestModule> Drop for ThreadPool<G> {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

impl<G: GuestModule> core::fmt::Debug for ThreadPool<G> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("channel", &self.channel)
            .field("warm", &self.is_warm())
            .field("terminated", &self.is_terminated())
            .field("spawned", &self.threads_spawned())
            .finish()
    }
}
