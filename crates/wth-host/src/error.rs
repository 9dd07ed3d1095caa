//! Host adapter errors.

use thiserror::Error;
use wth_pool::PoolError;

/// Fatal setup errors. Anything returned here aborts the run before (or
/// instead of) the guest's main execution.
#[derive(Debug, Error)]
pub enum HostError {
    /// Module bytes did not compile
    #[error("failed to compile module: {0}")]
    Compile(String),

    /// Imported memory has a shape this host does not support
    #[error("unsupported memory import: {0}")]
    UnsupportedMemory(String),

    /// Instantiation or memory creation failed
    #[error("instantiation failed: {0}")]
    Instantiation(String),

    /// Pool construction or warm-up failed
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
