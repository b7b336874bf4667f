//! Hazard pointer memory reclamation.
//!
//! A [`HazardPool`] is a fixed array of slots. A reader claims one slot,
//! publishes the pointer it is about to dereference there, and re-checks the
//! source atomic until the published value is stable; from that point the
//! node cannot be freed under it. A would-be deleter scans the whole pool:
//! if the target is absent it frees immediately, otherwise it parks the node
//! in a [`DeferredBin`] whose entries carry type-erased deleters and are
//! reclaimed by later scans.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::Error;

/// Default number of hazard slots in a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

struct Slot {
    protected: AtomicPtr<()>,
    occupied: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            protected: AtomicPtr::new(ptr::null_mut()),
            occupied: AtomicBool::new(false),
        }
    }
}

/// A fixed-capacity pool of hazard pointer slots.
pub struct HazardPool {
    slots: Box<[CachePadded<Slot>]>,
}

impl HazardPool {
    /// Create a pool with [`DEFAULT_POOL_CAPACITY`] slots.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Create a pool with `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| CachePadded::new(Slot::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    /// Number of slots in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot.
    ///
    /// The returned guard owns the slot; dropping it clears the published
    /// pointer and releases the slot. Fails with [`Error::HazardExhausted`]
    /// when every slot is occupied.
    pub fn acquire_slot(&self) -> Result<HazardSlot<'_>, Error> {
        for slot in self.slots.iter() {
            if slot
                .occupied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(HazardSlot { slot });
            }
        }
        Err(Error::HazardExhausted)
    }

    /// Whether any slot currently protects `ptr`.
    pub fn is_protected(&self, ptr: *mut ()) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.protected.load(Ordering::SeqCst) == ptr)
    }
}

impl Default for HazardPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive ownership of one slot in a [`HazardPool`].
pub struct HazardSlot<'a> {
    slot: &'a Slot,
}

impl HazardSlot<'_> {
    /// Publish `ptr` as protected.
    ///
    /// The store is sequentially consistent so that a deleter scanning the
    /// pool after removing the node from the structure cannot miss it.
    #[inline]
    pub fn protect(&self, ptr: *mut ()) {
        self.slot.protected.store(ptr, Ordering::SeqCst);
    }

    /// Clear the published pointer.
    #[inline]
    pub fn clear(&self) {
        self.slot.protected.store(ptr::null_mut(), Ordering::SeqCst);
    }
}

impl Drop for HazardSlot<'_> {
    fn drop(&mut self) {
        self.slot.protected.store(ptr::null_mut(), Ordering::SeqCst);
        self.slot.occupied.store(false, Ordering::Release);
    }
}

struct BinNode {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
    next: *mut BinNode,
}

unsafe fn drop_box<T>(ptr: *mut ()) {
    drop(Box::from_raw(ptr as *mut T));
}

/// A lock-free list of nodes awaiting reclamation.
///
/// Entries are appended by threads that lost the race to free immediately;
/// [`try_clean`](DeferredBin::try_clean) frees every entry no longer present
/// in the reference pool and splices the survivors back.
pub struct DeferredBin {
    head: AtomicPtr<BinNode>,
}

impl DeferredBin {
    /// Create an empty bin.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Whether the bin currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Park `ptr` for deferred reclamation.
    ///
    /// The entry remembers how to drop a `Box<T>`, so callers of different
    /// element types can share one bin.
    pub fn defer_drop<T: Send>(&self, ptr: *mut T) {
        let node = Box::into_raw(Box::new(BinNode {
            ptr: ptr as *mut (),
            drop_fn: drop_box::<T>,
            next: self.head.load(Ordering::Relaxed),
        }));
        loop {
            let expected = unsafe { (*node).next };
            match self
                .head
                .compare_exchange_weak(expected, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => unsafe { (*node).next = actual },
            }
        }
    }

    /// Free every parked entry absent from `pool`; survivors go back in.
    pub fn try_clean(&self, pool: &HazardPool) {
        let mut current = self.head.swap(ptr::null_mut(), Ordering::AcqRel);

        let mut survivors_head: *mut BinNode = ptr::null_mut();
        let mut survivors_tail: *mut BinNode = ptr::null_mut();

        while !current.is_null() {
            let next = unsafe { (*current).next };
            if pool.is_protected(unsafe { (*current).ptr }) {
                unsafe { (*current).next = survivors_head };
                survivors_head = current;
                if survivors_tail.is_null() {
                    survivors_tail = current;
                }
            } else {
                unsafe {
                    ((*current).drop_fn)((*current).ptr);
                    drop(Box::from_raw(current));
                }
            }
            current = next;
        }

        if !survivors_head.is_null() {
            self.splice(survivors_head, survivors_tail);
        }
    }

    fn splice(&self, head: *mut BinNode, tail: *mut BinNode) {
        loop {
            let current = self.head.load(Ordering::Relaxed);
            unsafe { (*tail).next = current };
            if self
                .head
                .compare_exchange_weak(current, head, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl Default for DeferredBin {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferredBin {
    fn drop(&mut self) {
        // no concurrent readers remain; everything parked can go
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            unsafe {
                let next = (*current).next;
                ((*current).drop_fn)((*current).ptr);
                drop(Box::from_raw(current));
                current = next;
            }
        }
    }
}

unsafe impl Send for DeferredBin {}
unsafe impl Sync for DeferredBin {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release_slot() {
        let pool = HazardPool::with_capacity(2);
        let a = pool.acquire_slot().unwrap();
        let _b = pool.acquire_slot().unwrap();
        assert!(matches!(pool.acquire_slot(), Err(Error::HazardExhausted)));

        drop(a);
        assert!(pool.acquire_slot().is_ok());
    }

    #[test]
    fn test_protect_visible_to_scans() {
        let pool = HazardPool::with_capacity(4);
        let slot = pool.acquire_slot().unwrap();

        let target = Box::into_raw(Box::new(5u32));
        slot.protect(target as *mut ());
        assert!(pool.is_protected(target as *mut ()));

        slot.clear();
        assert!(!pool.is_protected(target as *mut ()));
        unsafe { drop(Box::from_raw(target)) };
    }

    #[test]
    fn test_slot_cleared_on_drop() {
        let pool = HazardPool::with_capacity(1);
        let target = Box::into_raw(Box::new(5u32));
        {
            let slot = pool.acquire_slot().unwrap();
            slot.protect(target as *mut ());
        }
        assert!(!pool.is_protected(target as *mut ()));
        unsafe { drop(Box::from_raw(target)) };
    }

    #[test]
    fn test_bin_frees_unprotected() {
        let pool = HazardPool::with_capacity(4);
        let bin = DeferredBin::new();

        bin.defer_drop(Box::into_raw(Box::new(1i32)));
        bin.defer_drop(Box::into_raw(Box::new(2i32)));
        assert!(!bin.is_empty());

        bin.try_clean(&pool);
        assert!(bin.is_empty());
    }

    #[test]
    fn test_bin_keeps_protected() {
        let pool = HazardPool::with_capacity(4);
        let bin = DeferredBin::new();
        let slot = pool.acquire_slot().unwrap();

        let kept = Box::into_raw(Box::new(1i32));
        slot.protect(kept as *mut ());
        bin.defer_drop(kept);
        bin.defer_drop(Box::into_raw(Box::new(2i32)));

        bin.try_clean(&pool);
        assert!(!bin.is_empty());

        slot.clear();
        bin.try_clean(&pool);
        assert!(bin.is_empty());
    }
}
