//! Shared slot channel for the wasi-threads pool
//!
//! The channel is the only medium between the thread-pool coordinator and
//! its workers: one fixed-width slot per worker holding a state word, a
//! thread id and a start argument. Ownership of a slot moves between the
//! coordinator and its worker through atomic state transitions followed by a
//! notify; waiters block on the state word with an expected value so a
//! notify is never missed.
//!
//! # Module Organization
//!
//! - `layout` - Slot layout constants and the slot state machine
//! - `channel` - `SharedChannel`: transitions, publish, waits
//! - `futex` - Address-keyed wait/notify (all unsafe code lives here)
//! - `loom_tests` - Concurrency models of the handshake (with `loom` feature)
//!
//! # Verification
//!
//! 1. **Unit tests**: state machine, waits, cross-thread handshake
//! 2. **Loom tests** (`cargo test -p wth-channel --features loom`): publish /
//!    observe ordering and gated slot claims under all interleavings

mod channel;
mod error;
pub mod futex;
pub mod layout;


pub use channel::{SharedChannel, SlotAssignment};
pub use error::ChannelError;
pub use futex::WaitOutcome;
pub use layout::{SlotState, SLOT_SIZE, SLOT_WORDS};
