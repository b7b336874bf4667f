//! Lock-free unbounded FIFO with split reference counting.
//!
//! A Michael–Scott-style queue. Head and tail are [`CountedPtr`] words and a
//! persistent dummy sentinel sits between them; the queue is empty exactly
//! when both point at the same node. A node is simultaneously reachable from
//! the head and the tail, so its internal counter tracks two phases on top
//! of the outstanding-borrow count: one phase retires when the head swings
//! past the node, the other when the tail does. The node is freed only when
//! both phases have retired and every borrow has been handed back.
//!
//! Push is cooperative: a thread that loses the payload race installs the
//! next-link on the winner's behalf and advances the tail itself, which
//! preserves lock freedom.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::counted::{AtomicCountedPtr, CountedPtr};

const COUNT_MASK: u64 = (1u64 << 32) - 1;

fn pack(count: u32, phases: i32) -> u64 {
    u64::from(count) | (u64::from(phases as u32) << 32)
}

fn unpack(state: u64) -> (u32, i32) {
    ((state & COUNT_MASK) as u32, (state >> 32) as u32 as i32)
}

/// Borrow count and phase count packed into one lock-free word.
struct TwoPhaseCounter {
    state: AtomicU64,
}

impl TwoPhaseCounter {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(pack(0, 2)),
        }
    }

    /// Retire one phase and merge the external count gathered by the thread
    /// that swung the head or tail away from this node.
    ///
    /// Returns true when the node is no longer reachable and must be freed.
    fn finish_one_phase_and_release(&self, external: u16) -> bool {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let (count, phases) = unpack(current);
            let new_count = count.wrapping_sub(u32::from(external).wrapping_sub(1));
            let new_phases = phases - 1;
            match self.state.compare_exchange_weak(
                current,
                pack(new_count, new_phases),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return new_phases == 0 && new_count == 0,
                Err(actual) => current = actual,
            }
        }
    }

    /// Hand back one borrow.
    ///
    /// Returns true when the node is no longer reachable and must be freed.
    fn release(&self) -> bool {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let (count, phases) = unpack(current);
            let new_count = count.wrapping_add(1);
            match self.state.compare_exchange_weak(
                current,
                pack(new_count, phases),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return phases == 0 && new_count == 0,
                Err(actual) => current = actual,
            }
        }
    }
}

struct FifoNode<T> {
    data: AtomicPtr<T>,
    counter: TwoPhaseCounter,
    next: AtomicCountedPtr<FifoNode<T>>,
}

impl<T> FifoNode<T> {
    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            data: AtomicPtr::new(ptr::null_mut()),
            counter: TwoPhaseCounter::new(),
            next: AtomicCountedPtr::new(CountedPtr::null()),
        }))
    }
}

impl<T> Drop for FifoNode<T> {
    fn drop(&mut self) {
        let data = *self.data.get_mut();
        if !data.is_null() {
            drop(unsafe { Box::from_raw(data) });
        }
    }
}

/// A lock-free MPMC FIFO with split-reference-count reclamation.
pub struct CountedFifo<T> {
    head: AtomicCountedPtr<FifoNode<T>>,
    tail: AtomicCountedPtr<FifoNode<T>>,
}

impl<T> CountedFifo<T> {
    /// Create a new empty queue.
    pub fn new() -> Self {
        let sentinel = CountedPtr::new(FifoNode::sentinel(), 0);
        Self {
            head: AtomicCountedPtr::new(sentinel),
            tail: AtomicCountedPtr::new(sentinel),
        }
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).ptr() == self.tail.load(Ordering::Acquire).ptr()
    }

    /// Swing the tail from `expected` to `set_to` and settle the retired
    /// sentinel's counter. Exactly one caller wins the swing and merges the
    /// final external count; every other caller hands back its borrow.
    fn set_new_tail(&self, expected: CountedPtr<FifoNode<T>>, set_to: CountedPtr<FifoNode<T>>) {
        let ptr = expected.ptr();
        let mut current = expected;
        let won = loop {
            if current.ptr() != ptr {
                break false;
            }
            match self
                .tail
                .compare_exchange_weak(current, set_to, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break true,
                Err(actual) => current = actual,
            }
        };

        let reclaim = if won {
            unsafe { (*ptr).counter.finish_one_phase_and_release(current.count()) }
        } else {
            unsafe { (*ptr).counter.release() }
        };
        if reclaim {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }

    /// Append a value at the tail.
    pub fn push(&self, value: T) {
        let data = Box::into_raw(Box::new(value));
        let mut new_tail = CountedPtr::new(FifoNode::sentinel(), 0);

        loop {
            let tail = self.tail.increment_acquire();
            let ptr = tail.ptr();

            let won_payload = unsafe {
                (*ptr)
                    .data
                    .compare_exchange(ptr::null_mut(), data, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            };

            if won_payload {
                // this sentinel is ours; link the next node, accepting help
                match unsafe {
                    (*ptr).next.compare_exchange(
                        CountedPtr::null(),
                        new_tail,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                } {
                    Ok(_) => self.set_new_tail(tail, new_tail),
                    Err(helped) => {
                        // another push linked a sentinel for us
                        drop(unsafe { Box::from_raw(new_tail.ptr()) });
                        self.set_new_tail(tail, helped);
                    }
                }
                return;
            }

            // lost the payload race: help link the next node and advance the
            // tail so the winner can never strand us
            match unsafe {
                (*ptr).next.compare_exchange(
                    CountedPtr::null(),
                    new_tail,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
            } {
                Ok(_) => {
                    self.set_new_tail(tail, new_tail);
                    new_tail = CountedPtr::new(FifoNode::sentinel(), 0);
                }
                Err(existing) => self.set_new_tail(tail, existing),
            }
        }
    }

    /// Remove the value at the head.
    ///
    /// Returns `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.head.increment_acquire();
            let ptr = head.ptr();

            if ptr == self.tail.load(Ordering::Acquire).ptr() {
                let reclaim = unsafe { (*ptr).counter.release() };
                if reclaim {
                    drop(unsafe { Box::from_raw(ptr) });
                }
                return None;
            }

            // tail has moved past this node, so its next-link is in place
            let next = unsafe { (*ptr).next.load(Ordering::Acquire) };
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let data = unsafe { (*ptr).data.swap(ptr::null_mut(), Ordering::AcqRel) };
                let reclaim = unsafe { (*ptr).counter.finish_one_phase_and_release(head.count()) };
                if reclaim {
                    drop(unsafe { Box::from_raw(ptr) });
                }
                debug_assert!(!data.is_null());
                return Some(unsafe { *Box::from_raw(data) });
            }

            let reclaim = unsafe { (*ptr).counter.release() };
            if reclaim {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl<T> Default for CountedFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for CountedFifo<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        // head and tail now share the last sentinel
        let sentinel = self.head.load(Ordering::Relaxed).ptr();
        if !sentinel.is_null() {
            drop(unsafe { Box::from_raw(sentinel) });
        }
    }
}

unsafe impl<T: Send> Send for CountedFifo<T> {}
unsafe impl<T: Send> Sync for CountedFifo<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_new_queue_is_empty() {
        let fifo: CountedFifo<i32> = CountedFifo::new();
        assert!(fifo.is_empty());
        assert!(fifo.pop().is_none());
    }

    #[test]
    fn test_fifo_order() {
        let fifo = CountedFifo::new();
        fifo.push(1);
        fifo.push(2);
        fifo.push(3);

        assert!(!fifo.is_empty());
        assert_eq!(fifo.pop(), Some(1));
        assert_eq!(fifo.pop(), Some(2));
        assert_eq!(fifo.pop(), Some(3));
        assert!(fifo.pop().is_none());
    }

    #[test]
    fn test_interleaved() {
        let fifo = CountedFifo::new();
        fifo.push("a".to_string());
        assert_eq!(fifo.pop().as_deref(), Some("a"));
        fifo.push("b".to_string());
        fifo.push("c".to_string());
        assert_eq!(fifo.pop().as_deref(), Some("b"));
        assert_eq!(fifo.pop().as_deref(), Some("c"));
        assert!(fifo.pop().is_none());
    }

    #[test]
    fn test_drop_with_leftovers() {
        let fifo = CountedFifo::new();
        for i in 0..100 {
            fifo.push(i.to_string());
        }
        drop(fifo);
    }

    #[test]
    fn test_concurrent_push_pop_conserves_values() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let fifo = CountedFifo::new();
        let popped_total = AtomicUsize::new(0);

        let collected: Vec<Vec<usize>> = thread::scope(|scope| {
            for p in 0..PRODUCERS {
                let fifo = &fifo;
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        fifo.push(p * PER_PRODUCER + i);
                    }
                });
            }

            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let fifo = &fifo;
                    let popped_total = &popped_total;
                    scope.spawn(move || {
                        let mut seen = Vec::new();
                        while popped_total.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                            if let Some(v) = fifo.pop() {
                                popped_total.fetch_add(1, Ordering::Relaxed);
                                seen.push(v);
                            } else {
                                thread::yield_now();
                            }
                        }
                        seen
                    })
                })
                .collect();

            consumers.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let all: HashSet<usize> = collected.into_iter().flatten().collect();
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_single_producer_order_preserved() {
        let fifo = CountedFifo::new();
        thread::scope(|scope| {
            let producer = scope.spawn(|| {
                for i in 0..500u32 {
                    fifo.push(i);
                }
            });
            let consumer = scope.spawn(|| {
                let mut last = None;
                let mut received = 0;
                while received < 500 {
                    if let Some(v) = fifo.pop() {
                        if let Some(prev) = last {
                            assert!(v > prev);
                        }
                        last = Some(v);
                        received += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            });
            producer.join().unwrap();
            consumer.join().unwrap();
        });
    }
}
