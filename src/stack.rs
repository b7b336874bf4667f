//! Lock-free stack with split reference counting.
//!
//! A Treiber-style stack whose head is a [`CountedPtr`]: acquiring a node
//! means bumping the external counter embedded in the head word, and every
//! borrower hands its reference back through the node's internal release
//! counter. When the external count merged by the winning popper and the
//! release counter cancel out, the node is unreachable from any head
//! snapshot and is freed. The counter bump on every acquisition also
//! defends the head CAS against ABA.

use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::counted::{AtomicCountedPtr, CountedPtr};

struct StackNode<T> {
    release_count: AtomicI32,
    data: UnsafeCell<Option<T>>,
    next: CountedPtr<StackNode<T>>,
}

/// A lock-free LIFO with split-reference-count reclamation.
pub struct CountedStack<T> {
    head: AtomicCountedPtr<StackNode<T>>,
}

impl<T> CountedStack<T> {
    /// Create a new empty stack.
    pub fn new() -> Self {
        Self {
            head: AtomicCountedPtr::new(CountedPtr::null()),
        }
    }

    /// Check if the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Push a value onto the stack.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(StackNode {
            release_count: AtomicI32::new(0),
            data: UnsafeCell::new(Some(value)),
            next: self.head.load(Ordering::Relaxed),
        }));

        let mut expected = unsafe { (*node).next };
        loop {
            // release on success publishes data and next before the head update
            match self.head.compare_exchange_weak(
                expected,
                CountedPtr::new(node, 0),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    unsafe { (*node).next = actual };
                    expected = actual;
                    hint::spin_loop();
                }
            }
        }
    }

    /// Pop the most recently pushed value.
    ///
    /// Returns `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.head.increment_acquire();
            let ptr = head.ptr();
            if ptr.is_null() {
                return None;
            }
            let external = i32::from(head.count());
            let next = unsafe { (*ptr).next };

            if self
                .head
                .compare_exchange(head, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                // Only the thread holding the largest external count can pass
                // this CAS: any later borrower would have changed the head
                // word, and any completed push would have replaced the node.
                let value = unsafe { (*(*ptr).data.get()).take() };

                // merge the external count into the release counter
                let addon = 1 - external;
                if unsafe { (*ptr).release_count.fetch_add(addon, Ordering::Release) } == -addon {
                    drop(unsafe { Box::from_raw(ptr) });
                }
                return value;
            }

            if unsafe { (*ptr).release_count.fetch_add(1, Ordering::Relaxed) } == -1 {
                // last borrower out frees the node; the acquire pairs with the
                // winner's release so the payload extraction is visible
                unsafe { (*ptr).release_count.load(Ordering::Acquire) };
                drop(unsafe { Box::from_raw(ptr) });
            }
            hint::spin_loop();
        }
    }
}

impl<T> Default for CountedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for CountedStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

unsafe impl<T: Send> Send for CountedStack<T> {}
unsafe impl<T: Send> Sync for CountedStack<T> {}
