//! Slot layout and state machine
//!
//! Every pool worker owns one fixed-width slot in the channel:
//!
//! | offset | type | description                  |
//! |--------|------|------------------------------|
//! | 0      | u32  | state (see [`SlotState`])    |
//! | 4      | u32  | thread id                    |
//! | 8      | u32  | start argument               |
//!
//! Slot `i` starts at word `i * SLOT_WORDS`.

use crate::ChannelError;

/// Number of 32-bit words per slot.
pub const SLOT_WORDS: usize = 3;

/// Size of one slot in bytes.
pub const SLOT_SIZE: usize = SLOT_WORDS * core::mem::size_of::<u32>();

/// Word offset of the state field inside a slot.
pub const STATE_WORD: usize = 0;

/// Word offset of the thread id field inside a slot.
pub const THREAD_ID_WORD: usize = 1;

/// Word offset of the start argument field inside a slot.
pub const START_ARG_WORD: usize = 2;

/// Lifecycle of a single slot.
///
/// Ownership of the slot follows the state:
/// - `NotStarted`, `Started`: the worker writes next
/// - `Ready`: the coordinator writes next
/// - `Finished`: nobody writes again
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SlotState {
    /// Worker has not finished initializing
    NotStarted = 0,
    /// Worker is idle and can take a thread
    Ready = 1,
    /// Coordinator assigned a thread; worker is running it
    Started = 2,
    /// Thread body returned (or trapped); terminal
    Finished = 3,
}

impl SlotState {
    /// Raw value stored in the state word.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a raw state word.
    pub fn from_u32(value: u32) -> Result<Self, ChannelError> {
        match value {
            0 => Ok(SlotState::NotStarted),
            1 => Ok(SlotState::Ready),
            2 => Ok(SlotState::Started),
            3 => Ok(SlotState::Finished),
            other => Err(ChannelError::InvalidState(other)),
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub const fn can_transition_to(self, next: SlotState) -> bool {
        matches!(
            (self, next),
            (SlotState::NotStarted, SlotState::Ready)
                | (SlotState::Ready, SlotState::Started)
                | (SlotState::Started, SlotState::Finished)
        )
    }
}

impl core::fmt::Display for SlotState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            SlotState::NotStarted => "not-started",
            SlotState::Ready => "ready",
            SlotState::Started => "started",
            SlotState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Word index of `field` in slot `slot`.
#[inline]
pub const fn word_index(slot: usize, field: usize) -> usize {
    slot * SLOT_WORDS + field
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_layout() {
        assert_eq!(SLOT_SIZE, 12);
        assert_eq!(word_index(0, STATE_WORD), 0);
        assert_eq!(word_index(2, THREAD_ID_WORD), 7);
        assert_eq!(word_index(3, START_ARG_WORD), 11);
    }

    #[test]
    fn test_state_decoding() {
        for state in [
            SlotState::NotStarted,
            SlotState::Ready,
            SlotState::Started,
            SlotState::Finished,
        ] {
            assert_eq!(SlotState::from_u32(state.as_u32()).unwrap(), state);
        }
        assert!(matches!(
            SlotState::from_u32(7),
            Err(ChannelError::InvalidState(7))
        ));
    }

    #[test]
    fn test_only_forward_transitions_allowed() {
        assert!(SlotState::NotStarted.can_transition_to(SlotState::Ready));
        assert!(SlotState::Ready.can_transition_to(SlotState::Started));
        assert!(SlotState::Started.can_transition_to(SlotState::Finished));

        // No recycling, no skipping
        assert!(!SlotState::Finished.can_transition_to(SlotState::Ready));
        assert!(!SlotState::NotStarted.can_transition_to(SlotState::Started));
        assert!(!SlotState::Ready.can_transition_to(SlotState::Finished));
        assert!(!SlotState::Started.can_transition_to(SlotState::Ready));
    }
}
