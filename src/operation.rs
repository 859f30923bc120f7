//! Pending asynchronous operations.
//!
//! A `PendingOperation` is created when a read or write is submitted and is
//! shared by three parties: the submitting thread, the completion worker that
//! finishes the transfer, and whoever harvests the result. The outcome is
//! written exactly once, by whichever path observes completion first, and is
//! harvested exactly once.

use crate::error::{StreamError, StreamResult, UsageError};
use crate::signal::WaitSignal;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Transfer direction of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("Read"),
            Self::Write => f.write_str("Write"),
        }
    }
}

struct OperationState {
    direction: Direction,
    requested: usize,
    infinite: bool,
    completed: AtomicBool,
    completed_synchronously: AtomicBool,
    harvested: AtomicBool,
    outcome: Mutex<Option<StreamResult<usize>>>,
    data: Mutex<Vec<u8>>,
    wait: WaitSignal,
}

/// Handle to a submitted read or write.
///
/// Cloning yields another handle to the same operation. Waiting on and
/// harvesting an operation stay safe after the stream is closed.
#[derive(Clone)]
pub struct PendingOperation {
    inner: Arc<OperationState>,
}

impl PendingOperation {
    /// A read of up to `requested` bytes.
    pub(crate) fn read(requested: usize, infinite: bool) -> Self {
        Self::new(Direction::Read, requested, infinite, vec![0; requested])
    }

    /// A write of `data`.
    pub(crate) fn write(data: Vec<u8>, infinite: bool) -> Self {
        Self::new(Direction::Write, data.len(), infinite, data)
    }

    fn new(direction: Direction, requested: usize, infinite: bool, data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(OperationState {
                direction,
                requested,
                infinite,
                completed: AtomicBool::new(false),
                completed_synchronously: AtomicBool::new(false),
                harvested: AtomicBool::new(false),
                outcome: Mutex::new(None),
                data: Mutex::new(data),
                wait: WaitSignal::new(),
            }),
        }
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Number of bytes the caller asked to transfer.
    pub fn requested(&self) -> usize {
        self.inner.requested
    }

    /// Whether the operation runs without a timeout.
    pub fn is_infinite(&self) -> bool {
        self.inner.infinite
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Whether the transfer finished inline during submission.
    pub fn completed_synchronously(&self) -> bool {
        self.inner.completed_synchronously.load(Ordering::Acquire)
    }

    /// Block until the operation completes.
    pub fn wait(&self) {
        self.inner.wait.wait();
    }

    /// Block until the operation completes or `timeout` elapses.
    ///
    /// Returns `true` if the operation completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.inner.wait.wait_timeout(timeout)
    }

    /// Record the outcome. Only the first call has any effect.
    ///
    /// Returns `false` if the operation was already completed.
    pub(crate) fn complete(&self, result: StreamResult<usize>, synchronously: bool) -> bool {
        let mut outcome = self.inner.outcome.lock();
        if self.inner.completed.load(Ordering::Acquire) {
            return false;
        }
        *outcome = Some(result);
        self.inner
            .completed_synchronously
            .store(synchronously, Ordering::Release);
        self.inner.completed.store(true, Ordering::Release);
        drop(outcome);
        self.inner.wait.set();
        true
    }

    /// Claim the right to harvest this operation.
    ///
    /// The direction is checked before the one-shot guard, so passing the
    /// wrong kind of operation does not consume it.
    pub(crate) fn claim(&self, expected: Direction) -> Result<(), UsageError> {
        if self.inner.direction != expected {
            return Err(UsageError::WrongOperation { expected });
        }
        self.inner
            .harvested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| UsageError::EndCalledTwice {
                direction: self.inner.direction,
            })
    }

    /// Wait for completion and take the outcome.
    pub(crate) fn wait_outcome(&self) -> StreamResult<usize> {
        self.inner.wait.wait();
        self.inner.outcome.lock().take().unwrap_or_else(|| {
            Err(StreamError::invalid_operation(
                "operation completed without recording an outcome",
            ))
        })
    }

    /// Run `f` over the transfer buffer.
    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.inner.data.lock())
    }

    /// Take the transfer buffer, leaving it empty.
    pub(crate) fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.data.lock())
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("direction", &self.inner.direction)
            .field("requested", &self.inner.requested)
            .field("completed", &self.is_completed())
            .field("completed_synchronously", &self.completed_synchronously())
            .field("harvested", &self.inner.harvested.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_completion_wins() {
        let op = PendingOperation::read(4, false);

        assert!(op.complete(Ok(2), false));
        assert!(!op.complete(Ok(4), true));

        assert!(!op.completed_synchronously());
        assert_eq!(op.wait_outcome().unwrap(), 2);
    }

    #[test]
    fn test_claim_is_one_shot() {
        let op = PendingOperation::write(b"abc".to_vec(), false);

        assert!(op.claim(Direction::Write).is_ok());
        assert_eq!(
            op.claim(Direction::Write),
            Err(UsageError::EndCalledTwice {
                direction: Direction::Write
            })
        );
    }

    #[test]
    fn test_wrong_direction_does_not_consume_claim() {
        let op = PendingOperation::read(1, false);

        assert_eq!(
            op.claim(Direction::Write),
            Err(UsageError::WrongOperation {
                expected: Direction::Write
            })
        );
        assert!(op.claim(Direction::Read).is_ok());
    }

    #[test]
    fn test_concurrent_claims_admit_exactly_one() {
        let op = PendingOperation::read(1, false);

        let winners: usize = (0..8)
            .map(|_| {
                let op = op.clone();
                thread::spawn(move || op.claim(Direction::Read).is_ok())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_harvest_waits_for_completion_from_other_thread() {
        let op = PendingOperation::read(3, true);
        let completer = op.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.with_data(|data| data.copy_from_slice(b"xyz"));
            completer.complete(Ok(3), false);
        });

        assert_eq!(op.wait_outcome().unwrap(), 3);
        assert_eq!(op.take_data(), b"xyz");
        handle.join().unwrap();
    }
}
