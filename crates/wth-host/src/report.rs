//! Test report
//!
//! Same shape as the payload a hosted test page hands to the driver:
//! `{ "passed": bool, "error"?: string }`.

use serde::{Deserialize, Serialize};
use tracing::debug;
use wasmtime_wasi::I32Exit;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            passed: false,
            error: Some(error.into()),
        }
    }

    /// Process exit code for this report: 0 iff passed.
    pub fn exit_code(&self) -> i32 {
        if self.passed {
            0
        } else {
            1
        }
    }

    /// Map the result of the guest's `_start` to a report.
    ///
    /// `proc_exit(0)` and a normal return pass; a non-zero exit code or a
    /// trap fails.
    pub fn from_main_result(result: wasmtime::Result<()>) -> Self {
        match result {
            Ok(()) => Self::pass(),
            Err(err) => match err.downcast_ref::<I32Exit>() {
                Some(I32Exit(0)) => Self::pass(),
                Some(I32Exit(code)) => Self::fail(format!("exit code {code}")),
                None => {
                    debug!(error = ?err, "main execution failed");
                    Self::fail(format!("{err:#}"))
                }
            },
        }
    }
}
