//! Channel error types.

use thiserror::Error;

use crate::SlotState;

/// Errors from slot operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Slot index is past the end of the channel
    #[error("slot {slot} out of range (channel has {slots} slots)")]
    SlotOutOfRange { slot: usize, slots: usize },

    /// State word holds a value outside the state machine
    #[error("invalid slot state value {0}")]
    InvalidState(u32),

    /// Compare-and-swap on the state word lost against another state
    #[error("slot {slot}: expected state {expected}, found {actual}")]
    UnexpectedState {
        slot: usize,
        expected: SlotState,
        actual: SlotState,
    },

    /// Wait deadline passed while the state was unchanged
    #[error("timed out waiting on slot {slot}")]
    TimedOut { slot: usize },

    /// The waiter's cancel flag was set while the state was unchanged
    #[error("wait on slot {slot} cancelled")]
    Cancelled { slot: usize },

    /// The blocking wait task was cancelled or panicked
    #[error("wait on slot {slot} was abandoned")]
    WaitAbandoned { slot: usize },
}
