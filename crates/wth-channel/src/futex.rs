//! Address-keyed wait/notify on a 32-bit word
//!
//! This is the host-side equivalent of `Atomics.wait` / `Atomics.notify`
//! (and of wasm `memory.atomic.wait32` / `memory.atomic.notify`). It is built
//! on the global parking lot from `parking_lot_core`, keyed by the address of
//! the word.
//!
//! # Safety Design
//!
//! All unsafe code in the crate lives here. `parking_lot_core::park` and
//! `unpark_all` are unsafe because a key shared with unrelated code could
//! wake (or be woken by) the wrong waiters. The keys used here are the
//! addresses of words owned by a live `SharedChannel`, and the validate /
//! callback closures never call back into the parking lot.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot_core::{ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

/// Result of a single wait call, mirroring `"ok" | "not-equal" | "timed-out"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by a notify on the word
    Woken,
    /// The word did not hold the expected value when the wait started
    NotEqual,
    /// The timeout elapsed
    TimedOut,
}

#[inline]
fn key_of(word: &AtomicU32) -> usize {
    word as *const AtomicU32 as usize
}

/// Block the calling context while `word == expected`.
///
/// The comparison happens while holding the parking lot bucket lock, so a
/// `notify` issued between the caller's last read and going to sleep is not
/// lost.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    park_while(word, || word.load(Ordering::Acquire) == expected, timeout)
}

/// Like [`wait`], but also returns `NotEqual` without sleeping once
/// `cancel` is set.
///
/// A canceller must set the flag *before* calling [`notify_all`] on the
/// same word; the flag is checked under the same lock as the word, so the
/// wakeup cannot slip between the check and the sleep.
pub fn wait_or_cancel(
    word: &AtomicU32,
    expected: u32,
    cancel: &AtomicBool,
    timeout: Option<Duration>,
) -> WaitOutcome {
    park_while(
        word,
        || !cancel.load(Ordering::SeqCst) && word.load(Ordering::Acquire) == expected,
        timeout,
    )
}

fn park_while(
    word: &AtomicU32,
    validate: impl FnOnce() -> bool,
    timeout: Option<Duration>,
) -> WaitOutcome {
    let deadline = timeout.map(|t| Instant::now() + t);
    // SAFETY: the key is the address of `word`, which outlives this call.
    // The validate closure only performs atomic loads.
    let result = unsafe {
        parking_lot_core::park(
            key_of(word),
            validate,
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            deadline,
        )
    };
    match result {
        ParkResult::Unparked(_) => WaitOutcome::Woken,
        ParkResult::Invalid => WaitOutcome::NotEqual,
        ParkResult::TimedOut => WaitOutcome::TimedOut,
    }
}

/// Wake every context waiting on `word`. Returns the number woken.
pub fn notify_all(word: &AtomicU32) -> usize {
    // SAFETY: same key discipline as `wait`; the key is only ever used
    // for words of a channel.
    unsafe { parking_lot_core::unpark_all(key_of(word), DEFAULT_UNPARK_TOKEN) }
}
