//! Host adapter
//!
//! Glue between a module, the thread pool and the main execution context.
//!
//! # Lifecycle
//!
//! ```text
//! load(bytes, config)        compile, negotiate capability, build pool + memory
//!   -> prepare().await       warm the pool (no-op without threads)
//!   -> run_main().await      instantiate + call _start on a blocking thread
//!   -> shutdown().await      drain in-flight threads, then terminate_all
//! ```
//!
//! [`HostAdapter::run`] performs all of the above and always shuts the pool
//! down, whatever the main context did.

use std::sync::Arc;

use tracing::{error, info, warn};
use wasmtime::SharedMemory;
use wth_pool::{MemoryLimits, NoThreads, SpawnThread, ThreadPool, ThreadsCapability};

use crate::capability;
use crate::config::HostConfig;
use crate::error::HostError;
use crate::module::{LinkedMemory, WasiModule};
use crate::report::TestReport;

pub struct HostAdapter {
    config: HostConfig,
    module: WasiModule,
    capability: ThreadsCapability,
    /// Declared `env.memory` import, shared or not
    memory_import: Option<MemoryLimits>,
    /// Present iff `capability` is
    threads: Option<Threads>,
}

struct Threads {
    pool: Arc<ThreadPool<WasiModule>>,
    memory: SharedMemory,
}

impl HostAdapter {
    /// Compile `bytes` and set up threads support if the module asks for it.
    pub fn load(bytes: &[u8], config: HostConfig) -> Result<Self, HostError> {
        let module = WasiModule::compile(bytes, &config)?;
        let capability = capability::negotiate(module.module())?;
        let memory_import = capability::memory_import(module.module())?;

        let pool = ThreadPool::with_capability(&capability, config.pool_size)?;
        let threads = match (pool, capability.memory()) {
            (Some(pool), Some(limits)) => Some(Threads {
                pool: Arc::new(pool),
                memory: module.create_shared_memory(limits)?,
            }),
            _ => None,
        };

        info!(
            threads = capability.is_present(),
            memory_import = memory_import.is_some(),
            pool_size = threads.as_ref().map(|t| t.pool.pool_size()).unwrap_or(0),
            "module loaded"
        );
        Ok(Self {
            config,
            module,
            capability,
            memory_import,
            threads,
        })
    }

    pub fn capability(&self) -> &ThreadsCapability {
        &self.capability
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The thread pool, when the module has the threads capability.
    pub fn pool(&self) -> Option<&Arc<ThreadPool<WasiModule>>> {
        self.threads.as_ref().map(|t| &t.pool)
    }

    /// Warm the pool so the first spawn finds every worker ready.
    pub async fn prepare(&self) -> Result<(), HostError> {
        let Some(threads) = &self.threads else {
            return Ok(());
        };
        threads
            .pool
            .warm_up(
                self.module.clone(),
                threads.memory.clone(),
                self.config.warm_up_timeout(),
            )
            .await?;
        Ok(())
    }

    /// Instantiate the module for the main context and run `_start`.
    ///
    /// The guest runs on a blocking thread, never on the async runtime's own
    /// thread: the synchronous WASI imports enter the runtime themselves.
    /// Only instantiation problems are errors; everything the guest does is
    /// reflected in the report.
    pub async fn run_main(&self) -> Result<TestReport, HostError> {
        let (memory, spawn) = match (&self.threads, self.memory_import) {
            (Some(threads), _) => {
                let spawn: Arc<dyn SpawnThread> = threads.pool.clone();
                (LinkedMemory::Shared(threads.memory.clone()), spawn)
            }
            (None, Some(limits)) => {
                let spawn: Arc<dyn SpawnThread> = Arc::new(NoThreads);
                (LinkedMemory::Private(limits), spawn)
            }
            (None, None) => {
                let spawn: Arc<dyn SpawnThread> = Arc::new(NoThreads);
                (LinkedMemory::None, spawn)
            }
        };

        let module = self.module.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let main = module.instantiate_main(&memory, spawn)?;
            info!("running main");
            Ok::<_, HostError>(TestReport::from_main_result(main.run()))
        })
        .await;
        let report = match joined {
            Ok(result) => result?,
            Err(err) => TestReport::fail(format!("main context panicked: {err}")),
        };

        if report.passed {
            info!("main finished");
        } else {
            error!(
                error = report.error.as_deref().unwrap_or_default(),
                "main failed"
            );
        }
        Ok(report)
    }

    /// Give in-flight threads up to the drain timeout, then tear the pool
    /// down.
    pub async fn shutdown(&self) {
        let Some(threads) = &self.threads else {
            return;
        };
        if let Err(err) = threads.pool.drain(self.config.drain_timeout()).await {
            warn!(error = %err, "threads still running at shutdown");
        }
        threads.pool.terminate_all();
    }

    /// `prepare`, `run_main` and `shutdown` in sequence.
    pub async fn run(&self) -> Result<TestReport, HostError> {
        let result = match self.prepare().await {
            Ok(()) => self.run_main().await,
            Err(err) => Err(err),
        };
        self.shutdown().await;
        result
    }
}

impl core::fmt::Debug for HostAdapter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostAdapter")
            .field("capability", &self.capability)
            .field("memory_import", &self.memory_import)
            .field("pool", &self.pool())
            .finish_non_exhaustive()
    }
}
