//! One-shot completion cell.
//!
//! A [`Promise`] is completed at most once, with a value or an error, and
//! delivers that outcome to a single blocking [`wait`](Promise::wait).
//! Shared between a producer and a consumer through an `Arc`, it is the
//! hand-off primitive behind pool task handles, channel waiter wake-ups and
//! the prefix-sum chunk chain.

use parking_lot::{Condvar, Mutex};
use std::mem;

use crate::error::Error;

enum State<T> {
    Pending,
    Ready(Result<T, Error>),
    Taken,
}

/// A write-once cell with a blocking reader.
pub struct Promise<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Promise<T> {
    /// Create an unfulfilled promise.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            ready: Condvar::new(),
        }
    }

    /// Fulfil the promise if it is still pending.
    ///
    /// Returns true if this call supplied the outcome; later calls are
    /// no-ops and return false.
    pub fn try_complete(&self, result: Result<T, Error>) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, State::Pending) {
            *state = State::Ready(result);
            drop(state);
            self.ready.notify_all();
            true
        } else {
            false
        }
    }

    /// Fulfil the promise with a value.
    pub fn complete(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    /// Fulfil the promise with an error.
    pub fn fail(&self, error: Error) -> bool {
        self.try_complete(Err(error))
    }

    /// Whether an outcome has been supplied.
    pub fn is_complete(&self) -> bool {
        !matches!(*self.state.lock(), State::Pending)
    }

    /// Block until the promise is fulfilled and take the outcome.
    ///
    /// A promise delivers to exactly one waiter.
    pub fn wait(&self) -> Result<T, Error> {
        let mut state = self.state.lock();
        while matches!(*state, State::Pending) {
            self.ready.wait(&mut state);
        }
        match mem::replace(&mut *state, State::Taken) {
            State::Ready(result) => result,
            State::Pending | State::Taken => unreachable!("one-shot promise waited twice"),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_complete_then_wait() {
        let promise = Promise::new();
        assert!(promise.complete(5));
        assert!(promise.is_complete());
        assert_eq!(promise.wait(), Ok(5));
    }

    #[test]
    fn test_fail_then_wait() {
        let promise: Promise<i32> = Promise::new();
        assert!(promise.fail(Error::ChannelClosed));
        assert_eq!(promise.wait(), Err(Error::ChannelClosed));
    }

    #[test]
    fn test_only_first_completion_wins() {
        let promise = Promise::new();
        assert!(promise.complete(1));
        assert!(!promise.complete(2));
        assert!(!promise.fail(Error::ChannelClosed));
        assert_eq!(promise.wait(), Ok(1));
    }

    #[test]
    fn test_wait_blocks_until_complete() {
        let promise = Arc::new(Promise::new());
        let setter = promise.clone();

        let waiter = thread::spawn(move || promise.wait());
        thread::sleep(Duration::from_millis(50));
        assert!(setter.complete("done"));
        assert_eq!(waiter.join().unwrap(), Ok("done"));
    }
}
