//! The shared slot channel
//!
//! A `SharedChannel` is allocated once per pool and handed (as
//! `Arc<SharedChannel>`) to the coordinator and to every worker.
//!
//! # Ordering
//!
//! The coordinator writes `thread_id` and `start_arg` with relaxed stores and
//! then moves the state word `Ready -> Started` with release ordering. A
//! worker loads the state word with acquire ordering before reading the two
//! fields, so it always sees the values written for its assignment.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::futex::{self, WaitOutcome};
use crate::layout::{
    word_index, SlotState, SLOT_SIZE, SLOT_WORDS, START_ARG_WORD, STATE_WORD, THREAD_ID_WORD,
};
use crate::ChannelError;

/// Thread assignment read out of a `Started` slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotAssignment {
    pub thread_id: u32,
    pub start_arg: u32,
}

/// Fixed-size array of slots, one per pool worker.
pub struct SharedChannel {
    words: Box<[AtomicU32]>,
    slots: usize,
}

impl SharedChannel {
    /// Allocate a channel with `slots` slots, all `NotStarted`.
    pub fn new(slots: usize) -> Self {
        let words = (0..slots * SLOT_WORDS)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { words, slots }
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    /// Size of the channel in bytes.
    pub fn byte_len(&self) -> usize {
        self.slots * SLOT_SIZE
    }

    fn word(&self, slot: usize, field: usize) -> Result<&AtomicU32, ChannelError> {
        if slot >= self.slots {
            return Err(ChannelError::SlotOutOfRange {
                slot,
                slots: self.slots,
            });
        }
        Ok(&self.words[word_index(slot, field)])
    }

    /// Current state of a slot.
    pub fn state(&self, slot: usize) -> Result<SlotState, ChannelError> {
        SlotState::from_u32(self.word(slot, STATE_WORD)?.load(Ordering::Acquire))
    }

    /// Read the assignment of a slot.
    ///
    /// Only meaningful after the caller has observed `Started` on the slot.
    pub fn assignment(&self, slot: usize) -> Result<SlotAssignment, ChannelError> {
        Ok(SlotAssignment {
            thread_id: self.word(slot, THREAD_ID_WORD)?.load(Ordering::Relaxed),
            start_arg: self.word(slot, START_ARG_WORD)?.load(Ordering::Relaxed),
        })
    }

    /// Move a slot from `from` to `to` and notify its waiters.
    ///
    /// Fails without touching the slot if the transition is illegal or the
    /// slot is not in `from`.
    pub fn transition(
        &self,
        slot: usize,
        from: SlotState,
        to: SlotState,
    ) -> Result<(), ChannelError> {
        let word = self.word(slot, STATE_WORD)?;
        if !from.can_transition_to(to) {
            return Err(ChannelError::UnexpectedState {
                slot,
                expected: from,
                actual: SlotState::from_u32(word.load(Ordering::Acquire))?,
            });
        }
        match word.compare_exchange(
            from.as_u32(),
            to.as_u32(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                futex::notify_all(word);
                Ok(())
            }
            Err(actual) => Err(ChannelError::UnexpectedState {
                slot,
                expected: from,
                actual: SlotState::from_u32(actual)?,
            }),
        }
    }

    /// Worker: `NotStarted -> Ready`.
    pub fn mark_ready(&self, slot: usize) -> Result<(), ChannelError> {
        self.transition(slot, SlotState::NotStarted, SlotState::Ready)
    }

    /// Worker: `Started -> Finished`.
    pub fn mark_finished(&self, slot: usize) -> Result<(), ChannelError> {
        self.transition(slot, SlotState::Started, SlotState::Finished)
    }

    /// Coordinator: hand a thread to a `Ready` slot.
    ///
    /// Writes the assignment first, then flips the state to `Started`.
    /// The caller must be the only coordinator writing to `slot`.
    pub fn publish(
        &self,
        slot: usize,
        thread_id: u32,
        start_arg: u32,
    ) -> Result<(), ChannelError> {
        let current = self.state(slot)?;
        if current != SlotState::Ready {
            return Err(ChannelError::UnexpectedState {
                slot,
                expected: SlotState::Ready,
                actual: current,
            });
        }
        self.word(slot, THREAD_ID_WORD)?
            .store(thread_id, Ordering::Relaxed);
        self.word(slot, START_ARG_WORD)?
            .store(start_arg, Ordering::Relaxed);
        self.transition(slot, SlotState::Ready, SlotState::Started)
    }

    /// Index of the first slot in `state`, scanning in index order.
    pub fn find_first(&self, state: SlotState) -> Option<usize> {
        (0..self.slots).find(|&slot| matches!(self.state(slot), Ok(s) if s == state))
    }

    /// Single wait on a slot's state word (see [`futex::wait`]).
    pub fn wait(
        &self,
        slot: usize,
        expected: SlotState,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, ChannelError> {
        let word = self.word(slot, STATE_WORD)?;
        Ok(futex::wait(word, expected.as_u32(), timeout))
    }

    /// Single wait that also returns once `cancel` is set
    /// (see [`futex::wait_or_cancel`]).
    pub fn wait_or_cancel(
        &self,
        slot: usize,
        expected: SlotState,
        cancel: &AtomicBool,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, ChannelError> {
        let word = self.word(slot, STATE_WORD)?;
        Ok(futex::wait_or_cancel(word, expected.as_u32(), cancel, timeout))
    }

    /// Block until the slot leaves `expected`, absorbing spurious wakeups.
    ///
    /// Returns the state observed after the change.
    pub fn wait_while(
        &self,
        slot: usize,
        expected: SlotState,
        timeout: Option<Duration>,
    ) -> Result<SlotState, ChannelError> {
        self.wait_while_inner(slot, expected, None, timeout)
    }

    /// [`wait_while`](Self::wait_while) that gives up with
    /// [`ChannelError::Cancelled`] once `cancel` is set and the slot is
    /// woken (see [`futex::wait_or_cancel`]).
    pub fn wait_while_or_cancel(
        &self,
        slot: usize,
        expected: SlotState,
        cancel: &AtomicBool,
        timeout: Option<Duration>,
    ) -> Result<SlotState, ChannelError> {
        self.wait_while_inner(slot, expected, Some(cancel), timeout)
    }

    fn wait_while_inner(
        &self,
        slot: usize,
        expected: SlotState,
        cancel: Option<&AtomicBool>,
        timeout: Option<Duration>,
    ) -> Result<SlotState, ChannelError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let current = self.state(slot)?;
            if current != expected {
                return Ok(current);
            }
            if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
                return Err(ChannelError::Cancelled { slot });
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ChannelError::TimedOut { slot });
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            let outcome = match cancel {
                Some(cancel) => self.wait_or_cancel(slot, expected, cancel, remaining)?,
                None => self.wait(slot, expected, remaining)?,
            };
            if outcome == WaitOutcome::TimedOut {
                let current = self.state(slot)?;
                if current != expected {
                    return Ok(current);
                }
                return Err(ChannelError::TimedOut { slot });
            }
        }
    }

    /// [`wait_while_or_cancel`](Self::wait_while_or_cancel) run off the
    /// calling context.
    ///
    /// The wait itself blocks a thread from tokio's blocking pool, so the
    /// awaiting task (and the runtime it runs on) stays free to make progress.
    /// Setting `cancel` and then calling [`notify`](Self::notify) (or
    /// [`interrupt_all`](Self::interrupt_all)) releases that thread.
    pub async fn wait_async(
        self: &Arc<Self>,
        slot: usize,
        expected: SlotState,
        cancel: Arc<AtomicBool>,
        timeout: Option<Duration>,
    ) -> Result<SlotState, ChannelError> {
        let channel = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            channel.wait_while_or_cancel(slot, expected, &cancel, timeout)
        })
        .await
        .map_err(|_| ChannelError::WaitAbandoned { slot })?
    }

    /// Wake every waiter on a slot.
    pub fn notify(&self, slot: usize) -> Result<usize, ChannelError> {
        Ok(futex::notify_all(self.word(slot, STATE_WORD)?))
    }

    /// Wake every waiter on every slot.
    pub fn interrupt_all(&self) -> usize {
        (0..self.slots)
            .filter_map(|slot| self.notify(slot).ok())
            .sum()
    }
}

impl core::fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let states: Vec<_> = (0..self.slots).map(|slot| self.state(slot)).collect();
        f.debug_struct("SharedChannel")
            .field("slots", &self.slots)
            .field("states", &states)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_channel_is_not_started() {
        let channel = SharedChannel::new(4);
        assert_eq!(channel.slot_count(), 4);
        assert_eq!(channel.byte_len(), 48);
        for slot in 0..4 {
            assert_eq!(channel.state(slot).unwrap(), SlotState::NotStarted);
        }
    }

    #[test]
    fn test_out_of_range_slot() {
        let channel = SharedChannel::new(1);
        assert_eq!(
            channel.state(1),
            Err(ChannelError::SlotOutOfRange { slot: 1, slots: 1 })
        );
    }

    #[test]
    fn test_full_lifecycle() {
        let channel = SharedChannel::new(1);
        channel.mark_ready(0).unwrap();
        channel.publish(0, 7, 42).unwrap();
        assert_eq!(channel.state(0).unwrap(), SlotState::Started);
        assert_eq!(
            channel.assignment(0).unwrap(),
            SlotAssignment {
                thread_id: 7,
                start_arg: 42
            }
        );
        channel.mark_finished(0).unwrap();
        assert_eq!(channel.state(0).unwrap(), SlotState::Finished);
    }

    #[test]
    fn test_publish_requires_ready() {
        let channel = SharedChannel::new(1);
        let err = channel.publish(0, 1, 99).unwrap_err();
        assert_eq!(
            err,
            ChannelError::UnexpectedState {
                slot: 0,
                expected: SlotState::Ready,
                actual: SlotState::NotStarted,
            }
        );
        // Nothing was written
        assert_eq!(channel.assignment(0).unwrap().start_arg, 0);
        assert_eq!(channel.state(0).unwrap(), SlotState::NotStarted);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let channel = SharedChannel::new(1);
        channel.mark_ready(0).unwrap();
        assert!(channel.mark_ready(0).is_err());
        assert!(channel.mark_finished(0).is_err());
        assert!(channel
            .transition(0, SlotState::Ready, SlotState::NotStarted)
            .is_err());
        assert_eq!(channel.state(0).unwrap(), SlotState::Ready);
    }

    #[test]
    fn test_find_first_scans_in_index_order() {
        let channel = SharedChannel::new(3);
        assert_eq!(channel.find_first(SlotState::Ready), None);
        channel.mark_ready(2).unwrap();
        channel.mark_ready(1).unwrap();
        assert_eq!(channel.find_first(SlotState::Ready), Some(1));
    }

    #[test]
    fn test_wait_while_times_out() {
        let channel = SharedChannel::new(1);
        let err = channel
            .wait_while(0, SlotState::NotStarted, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err, ChannelError::TimedOut { slot: 0 });
    }

    #[test]
    fn test_wait_while_sees_transition_from_other_context() {
        let channel = Arc::new(SharedChannel::new(2));
        let worker = {
            let channel = channel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                channel.mark_ready(1).unwrap();
            })
        };
        let state = channel
            .wait_while(1, SlotState::NotStarted, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(state, SlotState::Ready);
        worker.join().unwrap();
    }

    #[test]
    fn test_assignment_visible_after_started() {
        let channel = Arc::new(SharedChannel::new(1));
        channel.mark_ready(0).unwrap();

        let worker = {
            let channel = channel.clone();
            thread::spawn(move || {
                let state = channel
                    .wait_while(0, SlotState::Ready, Some(Duration::from_secs(5)))
                    .unwrap();
                assert_eq!(state, SlotState::Started);
                channel.assignment(0).unwrap()
            })
        };

        thread::sleep(Duration::from_millis(10));
        channel.publish(0, 3, 0xdead_beef).unwrap();
        let seen = worker.join().unwrap();
        assert_eq!(seen.thread_id, 3);
        assert_eq!(seen.start_arg, 0xdead_beef);
    }

    #[tokio::test]
    async fn test_wait_async_does_not_block_runtime() {
        let channel = Arc::new(SharedChannel::new(1));
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .wait_async(
                        0,
                        SlotState::NotStarted,
                        Arc::new(AtomicBool::new(false)),
                        Some(Duration::from_secs(5)),
                    )
                    .await
            })
        };

        // The current task keeps running while the wait is pending
        tokio::task::yield_now().await;
        channel.mark_ready(0).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), SlotState::Ready);
    }

    #[tokio::test]
    async fn test_wait_async_released_by_cancel() {
        let channel = Arc::new(SharedChannel::new(2));
        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = {
            let channel = channel.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                channel
                    .wait_async(1, SlotState::NotStarted, cancel, None)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.store(true, Ordering::SeqCst);
        channel.interrupt_all();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("cancelled wait still parked")
            .unwrap();
        assert_eq!(result, Err(ChannelError::Cancelled { slot: 1 }));
    }

    #[test]
    fn test_cancel_does_not_hide_a_transition() {
        let channel = SharedChannel::new(1);
        let cancel = AtomicBool::new(true);
        channel.mark_ready(0).unwrap();
        let state = channel
            .wait_while_or_cancel(0, SlotState::NotStarted, &cancel, None)
            .unwrap();
        assert_eq!(state, SlotState::Ready);
    }
}
