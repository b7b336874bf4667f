//! Lock-free stack with hazard pointer reclamation.
//!
//! Same public surface as [`CountedStack`](crate::stack::CountedStack), but
//! poppers protect the head through a slot in a [`HazardPool`] instead of a
//! packed counter. A popped node is freed immediately when no slot protects
//! it, and parked in the stack's [`DeferredBin`] otherwise; the bin is
//! scanned on every successful pop.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::Error;
use crate::hazard::{DeferredBin, HazardPool, HazardSlot};

struct HpNode<T> {
    data: Option<T>,
    next: *mut HpNode<T>,
}

unsafe impl<T: Send> Send for HpNode<T> {}

/// A lock-free LIFO with hazard-pointer reclamation.
pub struct HpStack<T> {
    head: AtomicPtr<HpNode<T>>,
    pool: HazardPool,
    bin: DeferredBin,
}

impl<T: Send> HpStack<T> {
    /// Create a new empty stack with the default hazard pool capacity.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            pool: HazardPool::new(),
            bin: DeferredBin::new(),
        }
    }

    /// Create a new empty stack whose hazard pool has `capacity` slots.
    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            pool: HazardPool::with_capacity(capacity),
            bin: DeferredBin::new(),
        }
    }

    /// Check if the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Push a value onto the stack.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(HpNode {
            data: Some(value),
            next: self.head.load(Ordering::Relaxed),
        }));
        loop {
            let expected = unsafe { (*node).next };
            match self.head.compare_exchange_weak(
                expected,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => unsafe { (*node).next = actual },
            }
        }
    }

    /// Claim a hazard slot for pop operations.
    ///
    /// Fails with [`Error::HazardExhausted`] when the pool is full.
    pub fn register(&self) -> Result<HpStackHandle<'_, T>, Error> {
        Ok(HpStackHandle {
            stack: self,
            slot: self.pool.acquire_slot()?,
        })
    }
}

impl<T: Send> Default for HpStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for HpStack<T> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
        }
        // the bin drops after us and frees anything still parked
    }
}

unsafe impl<T: Send> Send for HpStack<T> {}
unsafe impl<T: Send> Sync for HpStack<T> {}

/// A participant handle owning one hazard slot of an [`HpStack`].
pub struct HpStackHandle<'a, T: Send> {
    stack: &'a HpStack<T>,
    slot: HazardSlot<'a>,
}

impl<T: Send> HpStackHandle<'_, T> {
    /// Push a value onto the stack.
    pub fn push(&self, value: T) {
        self.stack.push(value);
    }

    /// Pop the most recently pushed value.
    ///
    /// Returns `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        let removed = loop {
            // Optimistically publish the head we are about to dereference and
            // re-read until the published value is the real head. Skipping the
            // re-read would leave a window where another popper frees the node
            // between our load and the publication.
            let mut current = self.stack.head.load(Ordering::SeqCst);
            loop {
                if current.is_null() {
                    break;
                }
                self.slot.protect(current as *mut ());
                let reread = self.stack.head.load(Ordering::SeqCst);
                if reread == current {
                    break;
                }
                current = reread;
            }

            if current.is_null() {
                self.slot.clear();
                return None;
            }

            let next = unsafe { (*current).next };
            if self
                .stack
                .head
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break current;
            }
        };
        self.slot.clear();

        let value = unsafe { (*removed).data.take() };
        if self.stack.pool.is_protected(removed as *mut ()) {
            self.stack.bin.defer_drop(removed);
        } else {
            drop(unsafe { Box::from_raw(removed) });
        }
        self.stack.bin.try_clean(&self.stack.pool);
        value
    }
}
