//! Two-lock blocking FIFO.
//!
//! A singly-linked queue with a trailing payload-less sentinel: the rear
//! pointer always addresses the sentinel, and the queue is empty exactly
//! when front and rear coincide. Producers take only the rear lock and
//! consumers only the front lock, so a push and a pop never contend unless
//! the queue is empty. A condition variable parks consumers; `close` wakes
//! everyone and makes blocking pops return empty from then on.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};

struct QueueNode<T> {
    data: Option<T>,
    next: *mut QueueNode<T>,
}

impl<T> QueueNode<T> {
    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            data: None,
            next: std::ptr::null_mut(),
        }))
    }
}

/// A blocking MPMC FIFO with separate front and rear locks.
pub struct TwoLockQueue<T> {
    front: Mutex<*mut QueueNode<T>>,
    rear: Mutex<*mut QueueNode<T>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl<T> TwoLockQueue<T> {
    /// Create a new empty queue.
    pub fn new() -> Self {
        let sentinel = QueueNode::sentinel();
        Self {
            front: Mutex::new(sentinel),
            rear: Mutex::new(sentinel),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a value at the rear.
    pub fn push(&self, value: T) {
        // the new sentinel is allocated outside the critical section
        let new_sentinel = QueueNode::sentinel();
        {
            let mut rear = self.rear.lock();
            unsafe {
                (**rear).data = Some(value);
                (**rear).next = new_sentinel;
            }
            *rear = new_sentinel;
        }
        // A consumer that just saw the queue empty still holds the front
        // lock until its wait begins; passing through that lock orders this
        // push after the predicate check so the notify cannot be lost.
        drop(self.front.lock());
        self.ready.notify_one();
    }

    fn is_empty_locked(&self, front: &MutexGuard<'_, *mut QueueNode<T>>) -> bool {
        let rear = self.rear.lock();
        **front == *rear
    }

    /// Remove the value at the front, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue has been closed.
    pub fn pop(&self) -> Option<T> {
        let mut front = self.front.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if !self.is_empty_locked(&front) {
                break;
            }
            self.ready.wait(&mut front);
        }
        self.unlink_front(front)
    }

    /// Remove the value at the front without blocking.
    ///
    /// Returns `None` when the queue is empty; items still drain after a
    /// close.
    pub fn try_pop(&self) -> Option<T> {
        let front = self.front.lock();
        if self.is_empty_locked(&front) {
            return None;
        }
        self.unlink_front(front)
    }

    fn unlink_front(&self, mut front: MutexGuard<'_, *mut QueueNode<T>>) -> Option<T> {
        let old = *front;
        let data = unsafe { (*old).data.take() };
        debug_assert!(data.is_some());
        *front = unsafe { (*old).next };
        drop(front);
        drop(unsafe { Box::from_raw(old) });
        data
    }

    /// Close the queue and wake every blocked consumer.
    ///
    /// Closing is idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // same ordering gate as push, or a consumer entering its wait could
        // miss the close
        drop(self.front.lock());
        self.ready.notify_all();
    }

    /// Whether the queue has been closed.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T> Default for TwoLockQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TwoLockQueue<T> {
    fn drop(&mut self) {
        let mut current = *self.front.get_mut();
        while !current.is_null() {
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
        }
    }
}

unsafe impl<T: Send> Send for TwoLockQueue<T> {}
unsafe impl<T: Send> Sync for TwoLockQueue<T> {}
