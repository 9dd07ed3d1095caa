//! Worker runtime
//!
//! Code running inside each pool worker context. A worker is created with
//! the pool, then:
//!
//! 1. waits for its init message (module + shared memory)
//! 2. instantiates the guest once with a fail-fast spawn hook
//! 3. marks its slot `Ready` and blocks while it stays `Ready`
//! 4. reads `(thread_id, start_arg)` after observing `Started`
//! 5. instantiates the guest again and runs the thread entry
//! 6. marks its slot `Finished`
//!
//! Failures never reach the coordinator; they are logged here. A worker
//! that fails before step 3 leaves its slot `NotStarted`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span};
use wth_channel::{SharedChannel, SlotState};

use crate::guest::{GuestInstance, GuestModule, RejectSpawn, SpawnThread, ThreadId};
use crate::GuestError;

/// Init message delivered to a worker by `warm_up`.
pub(crate) struct WorkerInit<G: GuestModule> {
    pub module: G,
    pub memory: G::Memory,
}

/// How a worker context ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// Ran its thread body to completion (or to a trap)
    Finished { thread_id: ThreadId, trapped: bool },
    /// Pool was dropped or terminated before a thread was assigned
    Terminated,
}

/// Everything a worker context owns.
pub(crate) struct Worker<G: GuestModule> {
    pub slot: usize,
    pub channel: Arc<SharedChannel>,
    pub terminated: Arc<AtomicBool>,
    pub init: oneshot::Receiver<WorkerInit<G>>,
}

/// Start a worker in its own execution context.
pub(crate) fn spawn<G: GuestModule>(worker: Worker<G>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("wth-worker-{}", worker.slot))
        .spawn(move || worker.run())
}

impl<G: GuestModule> Worker<G> {
    fn run(self) {
        let span = info_span!("worker", slot = self.slot);
        let _enter = span.enter();

        let Worker {
            slot,
            channel,
            terminated,
            init,
        } = self;

        let init = match init.blocking_recv() {
            Ok(init) => init,
            Err(_) => {
                debug!("pool went away before init");
                return;
            }
        };

        match serve(slot, &channel, &terminated, init) {
            Ok(WorkerExit::Finished { thread_id, trapped }) => {
                debug!(%thread_id, trapped, "worker finished");
            }
            Ok(WorkerExit::Terminated) => debug!("worker terminated while idle"),
            Err(err) => error!(error = %err, "worker failed"),
        }
    }
}

/// Worker protocol after init.
///
/// Errors returned here happened before a thread was assigned or are slot
/// protocol violations; guest traps inside the thread body are logged and
/// reported as `trapped`.
pub(crate) fn serve<G: GuestModule>(
    slot: usize,
    channel: &SharedChannel,
    terminated: &AtomicBool,
    init: WorkerInit<G>,
) -> Result<WorkerExit, WorkerFault> {
    let hook: Arc<dyn SpawnThread> = Arc::new(RejectSpawn);

    // Probe instantiation so a broken module is reported before Ready.
    drop(init.module.instantiate(&init.memory, hook.clone())?);

    channel.mark_ready(slot)?;
    debug!("worker ready");

    let state = loop {
        if terminated.load(Ordering::SeqCst) {
            return Ok(WorkerExit::Terminated);
        }
        let state = channel.state(slot)?;
        if state != SlotState::Ready {
            break state;
        }
        channel.wait_or_cancel(slot, SlotState::Ready, terminated, None)?;
    };
    if state != SlotState::Started {
        return Err(WorkerFault::UnexpectedState(state));
    }

    let assignment = channel.assignment(slot)?;
    let thread_id = ThreadId::new(assignment.thread_id);
    info!(%thread_id, start_arg = assignment.start_arg, "thread started");

    let trapped = match run_thread(&init, hook, thread_id, assignment.start_arg) {
        Ok(()) => false,
        Err(err) => {
            error!(%thread_id, error = %err, "thread body failed");
            true
        }
    };

    channel.mark_finished(slot)?;
    Ok(WorkerExit::Finished { thread_id, trapped })
}

fn run_thread<G: GuestModule>(
    init: &WorkerInit<G>,
    hook: Arc<dyn SpawnThread>,
    thread_id: ThreadId,
    start_arg: u32,
) -> Result<(), GuestError> {
    let mut instance = init.module.instantiate(&init.memory, hook)?;
    panic::catch_unwind(AssertUnwindSafe(|| instance.thread_start(thread_id, start_arg)))
        .unwrap_or_else(|_| Err(GuestError::Trap("thread entry panicked".to_string())))
}

/// Failure that ends a worker without running a thread body.
#[derive(Debug, thiserror::Error)]
pub(crate) enum WorkerFault {
    #[error(transparent)]
    Guest(#[from] GuestError),

    #[error(transparent)]
    Channel(#[from] wth_channel::ChannelError),

    #[error("woke up in state {0}")]
    UnexpectedState(SlotState),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        instantiations: Arc<AtomicUsize>,
        calls: Arc<Mutex<Vec<(u32, u32)>>>,
        fail_instantiate: bool,
        trap: bool,
    }

    struct RecorderInstance(Recorder);

    impl GuestModule for Recorder {
        type Memory = ();
        type Instance = RecorderInstance;

        fn instantiate(
            &self,
            _memory: &(),
            _spawn: Arc<dyn SpawnThread>,
        ) -> Result<RecorderInstance, GuestError> {
            if self.fail_instantiate {
                return Err(GuestError::Instantiation("bad module".into()));
            }
            self.instantiations.fetch_add(1, Ordering::SeqCst);
            Ok(RecorderInstance(self.clone()))
        }
    }

    impl GuestInstance for RecorderInstance {
        fn thread_start(&mut self, thread_id: ThreadId, start_arg: u32) -> Result<(), GuestError> {
            self.0.calls.lock().unwrap().push((thread_id.get(), start_arg));
            if self.0.trap {
                return Err(GuestError::Trap("unreachable".into()));
            }
            Ok(())
        }
    }

    fn started_channel(thread_id: u32, start_arg: u32) -> SharedChannel {
        let channel = SharedChannel::new(1);
        // Pretend the worker already went through Ready
        channel.mark_ready(0).unwrap();
        channel.publish(0, thread_id, start_arg).unwrap();
        channel
    }

    #[test]
    fn test_instantiation_failure_leaves_slot_not_started() {
        let channel = SharedChannel::new(1);
        let module = Recorder {
            fail_instantiate: true,
            ..Default::default()
        };
        let init = WorkerInit { module, memory: () };
        let result = serve(0, &channel, &AtomicBool::new(false), init);
        assert!(matches!(result, Err(WorkerFault::Guest(_))));
        assert_eq!(channel.state(0).unwrap(), SlotState::NotStarted);
    }

    #[test]
    fn test_terminated_before_assignment() {
        let channel = SharedChannel::new(1);
        let module = Recorder::default();
        let init = WorkerInit {
            module: module.clone(),
            memory: (),
        };
        let result = serve(0, &channel, &AtomicBool::new(true), init).unwrap();
        assert_eq!(result, WorkerExit::Terminated);
        assert_eq!(channel.state(0).unwrap(), SlotState::Ready);
        assert!(module.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_already_started_slot_is_unexpected() {
        // A slot that skipped Ready cannot be marked ready by its worker
        let channel = started_channel(1, 2);
        let init = WorkerInit {
            module: Recorder::default(),
            memory: (),
        };
        let result = serve(0, &channel, &AtomicBool::new(false), init);
        assert!(matches!(result, Err(WorkerFault::Channel(_))));
    }

    #[test]
    fn test_trap_still_finishes_slot() {
        let channel = Arc::new(SharedChannel::new(1));
        let module = Recorder {
            trap: true,
            ..Default::default()
        };
        let init = WorkerInit {
            module: module.clone(),
            memory: (),
        };

        let worker = {
            let channel = channel.clone();
            thread::spawn(move || serve(0, &channel, &AtomicBool::new(false), init))
        };

        channel
            .wait_while(0, SlotState::NotStarted, Some(std::time::Duration::from_secs(5)))
            .unwrap();
        channel.publish(0, 4, 40).unwrap();

        let exit = worker.join().unwrap().unwrap();
        assert_eq!(
            exit,
            WorkerExit::Finished {
                thread_id: ThreadId::new(4),
                trapped: true
            }
        );
        assert_eq!(channel.state(0).unwrap(), SlotState::Finished);
        assert_eq!(*module.calls.lock().unwrap(), vec![(4, 40)]);
        // Probe instance + thread instance
        assert_eq!(module.instantiations.load(Ordering::SeqCst), 2);
    }
}
