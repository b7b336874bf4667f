//! Buffered channel with synchronous hand-off.
//!
//! A [`Channel`] couples a fixed-capacity circular buffer with two FIFO
//! queues of waiters, one for blocked producers and one for blocked
//! consumers, all guarded by a single mutex. The wake protocol hands values
//! directly between threads whenever possible: a send finding a waiting
//! consumer bypasses the buffer, and a receive that frees a slot shifts a
//! waiting producer's value in before returning.
//!
//! A waiter is either a plain blocked thread or a select participant; the
//! latter carries a shared resolved-case index that is compare-and-set
//! exactly once, so a select registered in many channels commits to exactly
//! one operation (see [`crate::select`]).
//!
//! Closing is idempotent: queued producers are failed with
//! [`Error::ChannelClosed`] and queued consumers complete empty. Every
//! channel carries a process-unique id used by select for deadlock-free
//! lock ordering.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use tracing::{debug, trace};

use crate::error::Error;
use crate::promise::Promise;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of [`Channel::try_receive`].
#[derive(Debug, PartialEq, Eq)]
pub enum TryReceive<T> {
    /// A value was taken from the channel.
    Received(T),
    /// The channel is open but currently empty.
    Empty,
    /// The channel is closed and drained.
    Closed,
}

/// Outcome of a failed [`Channel::try_send`]; the rejected value rides
/// along.
pub enum TrySendError<T> {
    /// The buffer is full and no consumer is waiting.
    Full(T),
    /// The channel is closed.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(value) | TrySendError::Closed(value) => value,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("channel buffer is full"),
            TrySendError::Closed(_) => f.write_str("channel is closed"),
        }
    }
}

impl<T> std::error::Error for TrySendError<T> {}

/// Fixed-capacity ring of value slots.
struct CircularBuffer<T> {
    slots: Box<[Option<T>]>,
    push_index: usize,
    pop_index: usize,
    len: usize,
}

impl<T> CircularBuffer<T> {
    fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be at least 1");
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            push_index: 0,
            pop_index: 0,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn push(&mut self, value: T) {
        debug_assert!(!self.is_full());
        self.slots[self.push_index] = Some(value);
        self.push_index = (self.push_index + 1) % self.slots.len();
        self.len += 1;
    }

    fn pop(&mut self) -> Option<T> {
        let value = self.slots[self.pop_index].take()?;
        self.pop_index = (self.pop_index + 1) % self.slots.len();
        self.len -= 1;
        Some(value)
    }
}

/// Select participant record shared across every channel queue one select
/// registers in.
pub(crate) struct SelectToken<T> {
    pub(crate) waker: Arc<Promise<()>>,
    pub(crate) resolved: Arc<AtomicI32>,
    pub(crate) owner: ThreadId,
    pub(crate) case_index: i32,
    pub(crate) slot: Mutex<Option<T>>,
}

impl<T> SelectToken<T> {
    /// Compare-and-set the shared resolved index from unresolved to this
    /// token's case. Exactly one token of a select ever wins.
    pub(crate) fn try_resolve(&self) -> bool {
        self.resolved
            .compare_exchange(-1, self.case_index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct ThreadWaiter<T> {
    waker: Promise<()>,
    slot: Mutex<Option<T>>,
}

enum Waiter<T> {
    Thread(Arc<ThreadWaiter<T>>),
    Select(Arc<SelectToken<T>>),
}

pub(crate) struct ChanInner<T> {
    buffer: CircularBuffer<T>,
    producers: VecDeque<Waiter<T>>,
    consumers: VecDeque<Waiter<T>>,
    closed: bool,
}

/// A buffered MPMC channel.
pub struct Channel<T> {
    inner: Mutex<ChanInner<T>>,
    id: u64,
}

impl<T> Channel<T> {
    /// Create a channel able to buffer `capacity` values.
    ///
    /// Capacity 1 degenerates to rendezvous-like hand-off once the single
    /// slot is occupied.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ChanInner {
                buffer: CircularBuffer::with_capacity(capacity),
                producers: VecDeque::new(),
                consumers: VecDeque::new(),
                closed: false,
            }),
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The channel's process-unique id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of values currently buffered.
    pub fn size(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Whether the channel has been closed.
    pub fn closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Hand `value` to the first live waiting consumer, bypassing the
    /// buffer. Returns the value back if every queued consumer turned out to
    /// be a stale select entry.
    fn hand_to_consumer(inner: &mut ChanInner<T>, value: T) -> Option<T> {
        while let Some(waiter) = inner.consumers.pop_front() {
            match waiter {
                Waiter::Thread(waiter) => {
                    *waiter.slot.lock() = Some(value);
                    waiter.waker.complete(());
                    return None;
                }
                Waiter::Select(token) => {
                    if token.try_resolve() {
                        *token.slot.lock() = Some(value);
                        token.waker.complete(());
                        return None;
                    }
                    // resolved by another channel already; drop the entry
                }
            }
        }
        Some(value)
    }

    /// Move the first live waiting producer's value into the buffer and wake
    /// it.
    fn refill_from_producer(inner: &mut ChanInner<T>) {
        while let Some(waiter) = inner.producers.pop_front() {
            match waiter {
                Waiter::Thread(waiter) => {
                    if let Some(value) = waiter.slot.lock().take() {
                        inner.buffer.push(value);
                    }
                    waiter.waker.complete(());
                    return;
                }
                Waiter::Select(token) => {
                    if token.try_resolve() {
                        if let Some(value) = token.slot.lock().take() {
                            inner.buffer.push(value);
                        }
                        token.waker.complete(());
                        return;
                    }
                }
            }
        }
    }

    pub(crate) fn try_send_locked(
        inner: &mut ChanInner<T>,
        value: T,
    ) -> Result<(), TrySendError<T>> {
        if inner.closed {
            return Err(TrySendError::Closed(value));
        }
        if inner.buffer.is_full() {
            return Err(TrySendError::Full(value));
        }
        match Self::hand_to_consumer(inner, value) {
            None => Ok(()),
            Some(value) => {
                inner.buffer.push(value);
                Ok(())
            }
        }
    }

    pub(crate) fn try_receive_locked(inner: &mut ChanInner<T>) -> TryReceive<T> {
        if inner.buffer.is_empty() {
            return if inner.closed {
                TryReceive::Closed
            } else {
                TryReceive::Empty
            };
        }
        match inner.buffer.pop() {
            Some(value) => {
                Self::refill_from_producer(inner);
                TryReceive::Received(value)
            }
            None => TryReceive::Empty,
        }
    }

    /// Send a value, blocking while the buffer is full.
    ///
    /// Fails with [`Error::ChannelClosed`] if the channel is closed before
    /// or while waiting.
    pub fn send(&self, value: T) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::ChannelClosed);
        }
        if inner.buffer.is_full() {
            let waiter = Arc::new(ThreadWaiter {
                waker: Promise::new(),
                slot: Mutex::new(Some(value)),
            });
            inner.producers.push_back(Waiter::Thread(waiter.clone()));
            drop(inner);
            // the thread that frees a slot moves our value into the buffer
            return waiter.waker.wait();
        }
        match Self::hand_to_consumer(&mut inner, value) {
            None => Ok(()),
            Some(value) => {
                inner.buffer.push(value);
                Ok(())
            }
        }
    }

    /// Receive a value, blocking while the channel is empty.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub fn receive(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        if inner.buffer.is_empty() {
            if inner.closed {
                return None;
            }
            let waiter = Arc::new(ThreadWaiter {
                waker: Promise::new(),
                slot: Mutex::new(None),
            });
            inner.consumers.push_back(Waiter::Thread(waiter.clone()));
            drop(inner);
            // completes with an empty slot when the channel closes
            let _ = waiter.waker.wait();
            return waiter.slot.lock().take();
        }
        let value = inner.buffer.pop();
        Self::refill_from_producer(&mut inner);
        value
    }

    /// Send without blocking.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.inner.lock();
        Self::try_send_locked(&mut inner, value)
    }

    /// Receive without blocking.
    pub fn try_receive(&self) -> TryReceive<T> {
        let mut inner = self.inner.lock();
        Self::try_receive_locked(&mut inner)
    }

    /// Close the channel, waking every queued waiter.
    ///
    /// Queued producers fail with [`Error::ChannelClosed`]; queued consumers
    /// complete empty. Closing twice is a no-op.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        debug!(id = self.id, "channel closed");

        while let Some(waiter) = inner.producers.pop_front() {
            match waiter {
                Waiter::Thread(waiter) => {
                    waiter.waker.fail(Error::ChannelClosed);
                }
                Waiter::Select(token) => {
                    if token.try_resolve() {
                        token.waker.fail(Error::ChannelClosed);
                    }
                }
            }
        }
        while let Some(waiter) = inner.consumers.pop_front() {
            match waiter {
                Waiter::Thread(waiter) => {
                    waiter.waker.complete(());
                }
                Waiter::Select(token) => {
                    if token.try_resolve() {
                        token.waker.complete(());
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Select support. The select locks several channels at once through the
    // raw interface below; the *_locked operations then run under a lock
    // owned by the calling thread but not represented by a live guard.
    // ------------------------------------------------------------------

    /// Lock the channel mutex and leave it locked.
    pub(crate) fn raw_lock(&self) {
        mem::forget(self.inner.lock());
    }

    /// Unlock the channel mutex.
    ///
    /// # Safety
    ///
    /// The mutex must be locked by the current thread via
    /// [`raw_lock`](Self::raw_lock).
    pub(crate) unsafe fn raw_unlock(&self) {
        self.inner.force_unlock();
    }

    /// Access the channel state.
    ///
    /// # Safety
    ///
    /// The mutex must be locked by the current thread, and the returned
    /// reference must not outlive that lock or overlap another call.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn inner_locked(&self) -> &mut ChanInner<T> {
        &mut *self.inner.data_ptr()
    }

    /// Park a select participant in the producer queue.
    pub(crate) fn register_select_producer(inner: &mut ChanInner<T>, token: Arc<SelectToken<T>>) {
        inner.producers.push_back(Waiter::Select(token));
    }

    /// Park a select participant in the consumer queue.
    pub(crate) fn register_select_consumer(inner: &mut ChanInner<T>, token: Arc<SelectToken<T>>) {
        inner.consumers.push_back(Waiter::Select(token));
    }

    /// Drop every select entry registered by `owner` from both queues.
    pub(crate) fn remove_select_entries(&self, inner: &mut ChanInner<T>, owner: ThreadId) {
        let before = inner.producers.len() + inner.consumers.len();
        let keep = |waiter: &Waiter<T>| match waiter {
            Waiter::Thread(_) => true,
            Waiter::Select(token) => token.owner != owner,
        };
        inner.producers.retain(&keep);
        inner.consumers.retain(&keep);
        let removed = before - (inner.producers.len() + inner.consumers.len());
        if removed > 0 {
            trace!(id = self.id, removed, "cleaned select registrations");
        }
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        self.close();
    }
}
