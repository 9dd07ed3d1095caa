//! wasmtime host for wasi-threads guests
//!
//! Runs a WebAssembly module that may spawn threads through the
//! `wasi.thread-spawn` import. Threads run on the fixed worker pool from
//! `wth-pool`; this crate provides the wasmtime backend for that pool, the
//! threads capability negotiation, and the main execution context.
//!
//! ```no_run
//! # async fn example(bytes: &[u8]) -> Result<(), wth_host::HostError> {
//! use wth_host::{HostAdapter, HostConfig};
//!
//! let adapter = HostAdapter::load(bytes, HostConfig::default())?;
//! let report = adapter.run().await?;
//! std::process::exit(report.exit_code());
//! # }
//! ```

mod adapter;
mod capability;
mod config;
mod error;
mod module;
mod report;

pub use adapter::HostAdapter;
pub use capability::{memory_import, negotiate, MEMORY_MODULE, MEMORY_NAME};
pub use config::{HostConfig, DEFAULT_GUEST_ARG0, DEFAULT_POOL_SIZE};
pub use error::HostError;
pub use module::{
    GuestState, LinkedMemory, MainInstance, WasiInstance, WasiModule, MAIN_ENTRY, SPAWN_MODULE, SPAWN_NAME,
    THREAD_ENTRY,
};
pub use report::TestReport;
pub use wth_pool::ThreadsCapability;
