//! wasmtime guest backend
//!
//! [`WasiModule`] is compiled once and instantiated in every execution
//! context: once for the main context and once per pool worker (the readiness
//! probe, then one fresh instance per thread body). Every instance gets its
//! own `Store` and WASI context but links the same [`SharedMemory`].
//!
//! # Imports provided
//!
//! | Module                   | Name           | Provided by                    |
//! |--------------------------|----------------|--------------------------------|
//! | `wasi_snapshot_preview1` | *              | `wasmtime-wasi` preview1       |
//! | `wasi`                   | `thread-spawn` | the context's [`SpawnThread`]  |
//! | `env`                    | `memory`       | see [`LinkedMemory`]           |

use std::sync::Arc;

use tempfile::TempDir;
use tracing::{debug, info};
use wasmtime::{
    Config, Engine, Instance, Linker, Memory, MemoryType, Module, SharedMemory, Store, TypedFunc,
};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};
use wth_pool::{
    spawn_result_to_guest, GuestError, GuestInstance, GuestModule, MemoryLimits, SpawnThread,
    ThreadId,
};

use crate::capability::{MEMORY_MODULE, MEMORY_NAME};
use crate::config::HostConfig;
use crate::error::HostError;

/// Export called by the main context.
pub const MAIN_ENTRY: &str = "_start";

/// Export called by a worker for each thread body.
pub const THREAD_ENTRY: &str = "wasi_thread_start";

/// Import module of the spawn call.
pub const SPAWN_MODULE: &str = "wasi";

/// Import name of the spawn call.
pub const SPAWN_NAME: &str = "thread-spawn";

/// What a context links as `env.memory`.
#[derive(Clone)]
pub enum LinkedMemory {
    /// The module allocates its own memory
    None,
    /// The one memory shared by every context
    Shared(SharedMemory),
    /// An unshared import, created inside the context's own store
    Private(MemoryLimits),
}

/// Per-store host state.
pub struct GuestState {
    wasi: WasiP1Ctx,
}

/// Environment shared by all instances of one module.
struct GuestEnv {
    args: Vec<String>,
    /// Empty directory preopened as `/`
    root: Option<TempDir>,
}

/// A compiled wasi-threads module.
#[derive(Clone)]
pub struct WasiModule {
    engine: Engine,
    module: Module,
    env: Arc<GuestEnv>,
}

impl WasiModule {
    /// Compile `bytes` (binary or text format) with threads and epoch
    /// interruption enabled.
    pub fn compile(bytes: &[u8], config: &HostConfig) -> Result<Self, HostError> {
        let mut engine_config = Config::new();
        engine_config.wasm_threads(true).epoch_interruption(true);
        let engine =
            Engine::new(&engine_config).map_err(|e| HostError::Compile(format!("{e:#}")))?;
        let module =
            Module::new(&engine, bytes).map_err(|e| HostError::Compile(format!("{e:#}")))?;

        let root = if config.preopen_root {
            Some(tempfile::tempdir()?)
        } else {
            None
        };
        info!(
            imports = module.imports().len(),
            exports = module.exports().len(),
            "module compiled"
        );

        Ok(Self {
            engine,
            module,
            env: Arc::new(GuestEnv {
                args: config.args.clone(),
                root,
            }),
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Create the linear memory every context will link as `env.memory`.
    pub fn create_shared_memory(&self, limits: &MemoryLimits) -> Result<SharedMemory, HostError> {
        if !limits.shared {
            return Err(HostError::UnsupportedMemory(
                "unshared memory cannot be shared with workers".into(),
            ));
        }
        let maximum = limits.maximum.ok_or_else(|| {
            HostError::UnsupportedMemory("shared memory without a maximum".into())
        })?;
        let memory = SharedMemory::new(&self.engine, MemoryType::shared(limits.minimum, maximum))
            .map_err(|e| HostError::Instantiation(format!("{e:#}")))?;
        debug!(minimum = limits.minimum, maximum, "shared memory created");
        Ok(memory)
    }

    /// Instantiate for the main context and return the `_start` entry.
    pub fn instantiate_main(
        &self,
        memory: &LinkedMemory,
        spawn: Arc<dyn SpawnThread>,
    ) -> Result<MainInstance, HostError> {
        let (mut store, instance) = self
            .link(memory, spawn)
            .map_err(|e| HostError::Instantiation(format!("{e:#}")))?;
        let start = instance
            .get_typed_func::<(), ()>(&mut store, MAIN_ENTRY)
            .map_err(|e| HostError::Instantiation(format!("{e:#}")))?;
        Ok(MainInstance { store, start })
    }

    fn wasi_ctx(&self) -> wasmtime::Result<WasiP1Ctx> {
        let mut builder = WasiCtxBuilder::new();
        builder.args(self.env.args.as_slice()).inherit_stdout().inherit_stderr();
        if let Some(root) = &self.env.root {
            builder.preopened_dir(root.path(), "/", DirPerms::all(), FilePerms::all())?;
        }
        Ok(builder.build_p1())
    }

    fn link(
        &self,
        memory: &LinkedMemory,
        spawn: Arc<dyn SpawnThread>,
    ) -> wasmtime::Result<(Store<GuestState>, Instance)> {
        let mut store = Store::new(&self.engine, GuestState { wasi: self.wasi_ctx()? });
        // Any later epoch increment interrupts this store
        store.set_epoch_deadline(1);

        let mut linker: Linker<GuestState> = Linker::new(&self.engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut GuestState| &mut state.wasi)?;
        linker.func_wrap(SPAWN_MODULE, SPAWN_NAME, move |start_arg: i32| -> i32 {
            spawn_result_to_guest(spawn.spawn_thread(start_arg as u32))
        })?;
        match memory {
            LinkedMemory::None => {}
            LinkedMemory::Shared(memory) => {
                linker.define(&store, MEMORY_MODULE, MEMORY_NAME, memory.clone())?;
            }
            LinkedMemory::Private(limits) => {
                let ty = MemoryType::new(limits.minimum, limits.maximum);
                let memory = Memory::new(&mut store, ty)?;
                linker.define(&store, MEMORY_MODULE, MEMORY_NAME, memory)?;
            }
        }

        let instance = linker.instantiate(&mut store, &self.module)?;
        Ok((store, instance))
    }
}

impl GuestModule for WasiModule {
    type Memory = SharedMemory;
    type Instance = WasiInstance;

    fn instantiate(
        &self,
        memory: &SharedMemory,
        spawn: Arc<dyn SpawnThread>,
    ) -> Result<WasiInstance, GuestError> {
        let (mut store, instance) = self
            .link(&LinkedMemory::Shared(memory.clone()), spawn)
            .map_err(|e| GuestError::Instantiation(format!("{e:#}")))?;
        let entry = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, THREAD_ENTRY)
            .map_err(|e| GuestError::Instantiation(format!("{e:#}")))?;
        Ok(WasiInstance { store, entry })
    }

    fn interrupt(&self) {
        self.engine.increment_epoch();
    }
}

impl core::fmt::Debug for WasiModule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WasiModule")
            .field("args", &self.env.args)
            .field("preopen_root", &self.env.root.is_some())
            .finish_non_exhaustive()
    }
}

/// Worker-side instance: one thread body per instance.
pub struct WasiInstance {
    store: Store<GuestState>,
    entry: TypedFunc<(i32, i32), ()>,
}

impl GuestInstance for WasiInstance {
    fn thread_start(&mut self, thread_id: ThreadId, start_arg: u32) -> Result<(), GuestError> {
        self.entry
            .call(&mut self.store, (thread_id.get() as i32, start_arg as i32))
            .map_err(|e| GuestError::Trap(format!("{e:#}")))
    }
}

/// Main-context instance.
pub struct MainInstance {
    store: Store<GuestState>,
    start: TypedFunc<(), ()>,
}

impl MainInstance {
    /// Run `_start` to completion.
    pub fn run(mut self) -> wasmtime::Result<()> {
        self.start.call(&mut self.store, ())
    }
}
