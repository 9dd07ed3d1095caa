//! Host configuration
//!
//! Plain data; the harness fills it from CLI flags and `WTH_*` environment
//! variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of pool workers.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Default `argv` seen by the guest.
pub const DEFAULT_GUEST_ARG0: &str = "target.wasm";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Number of pool workers (threads the guest can ever spawn)
    pub pool_size: usize,
    /// Guest `argv`
    pub args: Vec<String>,
    /// Upper bound for pool warm-up; `None` waits forever
    pub warm_up_timeout_ms: Option<u64>,
    /// How long teardown waits for in-flight threads before terminating
    pub drain_timeout_ms: Option<u64>,
    /// Preopen an empty directory as `/`
    pub preopen_root: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            args: vec![DEFAULT_GUEST_ARG0.to_string()],
            warm_up_timeout_ms: Some(30_000),
            drain_timeout_ms: Some(5_000),
            preopen_root: true,
        }
    }
}

impl HostConfig {
    pub fn warm_up_timeout(&self) -> Option<Duration> {
        self.warm_up_timeout_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }
}
