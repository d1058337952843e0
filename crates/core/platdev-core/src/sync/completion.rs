//! One-shot completion signal.
//!
//! A [`CompletionSignal`] is set exactly once, either by [`complete`] (the
//! producer finished) or by [`cancel`] (the owner gave up, e.g. because the
//! device is being removed). Waiters block with a wall-clock bound and get
//! back exactly one [`WaitOutcome`].
//!
//! [`complete`]: CompletionSignal::complete
//! [`cancel`]: CompletionSignal::cancel

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Result of waiting on a [`CompletionSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The signal was completed before the deadline.
    Completed,
    /// The deadline passed while the signal was still pending.
    TimedOut,
    /// The signal was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Pending,
    Completed,
    Cancelled,
}

/// A one-shot waitable flag.
///
/// The first of `complete`/`cancel` wins; later calls are ignored until the
/// signal is [`reinit`](Self::reinit)ialized. A waiter that has already
/// returned [`WaitOutcome::TimedOut`] is not affected by a later completion.
#[derive(Debug)]
pub struct CompletionSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl CompletionSignal {
    /// Creates a pending signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Marks the signal completed and wakes every waiter.
    ///
    /// Returns `false` if the signal was already completed or cancelled.
    pub fn complete(&self) -> bool {
        self.settle(SignalState::Completed)
    }

    /// Cancels the signal and wakes every waiter with
    /// [`WaitOutcome::Cancelled`].
    ///
    /// Returns `false` if the signal was already completed or cancelled.
    pub fn cancel(&self) -> bool {
        self.settle(SignalState::Cancelled)
    }

    /// Returns the signal to the pending state so it can be reused for the
    /// next transfer.
    pub fn reinit(&self) {
        *self.state.lock() = SignalState::Pending;
    }

    /// Returns `true` if the signal has been completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        *self.state.lock() == SignalState::Completed
    }

    /// Returns `true` if neither `complete` nor `cancel` has happened yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        *self.state.lock() == SignalState::Pending
    }

    /// Non-blocking check. Returns `None` while pending.
    #[must_use]
    pub fn try_wait(&self) -> Option<WaitOutcome> {
        Self::outcome(*self.state.lock())
    }

    /// Blocks until the signal is completed or cancelled, or until `timeout`
    /// has elapsed.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = Self::outcome(*state) {
                return outcome;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return Self::outcome(*state).unwrap_or(WaitOutcome::TimedOut);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    fn settle(&self, to: SignalState) -> bool {
        let mut state = self.state.lock();
        if *state != SignalState::Pending {
            return false;
        }
        *state = to;
        drop(state);
        self.cond.notify_all();
        true
    }

    fn outcome(state: SignalState) -> Option<WaitOutcome> {
        match state {
            SignalState::Pending => None,
            SignalState::Completed => Some(WaitOutcome::Completed),
            SignalState::Cancelled => Some(WaitOutcome::Cancelled),
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn completed_before_wait() {
        let sig = CompletionSignal::new();
        assert!(sig.complete());
        assert_eq!(sig.wait(Duration::from_millis(1)), WaitOutcome::Completed);
    }

    #[test]
    fn first_settle_wins() {
        let sig = CompletionSignal::new();
        assert!(sig.cancel());
        assert!(!sig.complete());
        assert_eq!(sig.try_wait(), Some(WaitOutcome::Cancelled));
    }

    #[test]
    fn times_out_after_deadline() {
        let sig = CompletionSignal::new();
        let start = Instant::now();
        assert_eq!(sig.wait(Duration::from_millis(50)), WaitOutcome::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(60), "took {elapsed:?}");
    }

    #[test]
    fn late_completion_does_not_change_timed_out_result() {
        let sig = Arc::new(CompletionSignal::new());
        let outcome = sig.wait(Duration::from_millis(10));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        sig.complete();
        // The earlier result stands; a new wait sees the completion.
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(sig.wait(Duration::ZERO), WaitOutcome::Completed);
    }

    #[test]
    fn completion_from_another_thread() {
        let sig = Arc::new(CompletionSignal::new());
        let producer = Arc::clone(&sig);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            producer.complete();
        });
        assert_eq!(sig.wait(Duration::from_secs(5)), WaitOutcome::Completed);
        handle.join().unwrap();
    }

    #[test]
    fn cancel_unblocks_waiter() {
        let sig = Arc::new(CompletionSignal::new());
        let waiter = Arc::clone(&sig);
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(5));
        sig.cancel();
        assert_eq!(handle.join().unwrap(), WaitOutcome::Cancelled);
    }

    #[test]
    fn reinit_makes_signal_reusable() {
        let sig = CompletionSignal::new();
        sig.complete();
        sig.reinit();
        assert!(sig.is_pending());
        assert_eq!(sig.try_wait(), None);
        assert!(sig.complete());
        assert!(sig.is_completed());
    }
}
