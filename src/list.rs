//! Fine-grained-locked singly-linked list.
//!
//! Every node carries its own mutex guarding the node's payload and
//! next-link. Traversal is hand-over-hand: the child's lock is taken before
//! the parent's is released, so a traversal can never be overtaken by an
//! unlink. The head is a payload-less sentinel.
//!
//! Unlinked nodes are destroyed only after both involved locks have been
//! released; destroying a node while its own mutex is still held would free
//! a locked mutex.

use parking_lot::Mutex;
use std::ptr;

struct NodeBody<T> {
    data: Option<T>,
    next: *mut ListNode<T>,
}

struct ListNode<T> {
    inner: Mutex<NodeBody<T>>,
}

impl<T> ListNode<T> {
    fn alloc(data: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            inner: Mutex::new(NodeBody {
                data: Some(data),
                next: ptr::null_mut(),
            }),
        }))
    }
}

/// A thread-safe singly-linked list with per-node locking.
pub struct SyncList<T> {
    head: ListNode<T>,
}

impl<T> SyncList<T> {
    /// Create a new empty list.
    pub fn new() -> Self {
        Self {
            head: ListNode {
                inner: Mutex::new(NodeBody {
                    data: None,
                    next: ptr::null_mut(),
                }),
            },
        }
    }

    /// Insert a value at the front.
    pub fn push_front(&self, data: T) {
        // allocate before taking the lock
        let node = ListNode::alloc(data);
        let mut head = self.head.inner.lock();
        unsafe { (*node).inner.get_mut().next = head.next };
        head.next = node;
    }

    /// Remove the first value matching `pred`.
    ///
    /// Returns true if a value was removed.
    pub fn remove_first_if<P>(&self, pred: P) -> bool
    where
        P: Fn(&T) -> bool,
    {
        let mut prev = self.head.inner.lock();
        loop {
            let curr_ptr = prev.next;
            if curr_ptr.is_null() {
                return false;
            }
            let curr = unsafe { (*curr_ptr).inner.lock() };
            let matched = curr.data.as_ref().map_or(false, &pred);
            if matched {
                prev.next = curr.next;
                drop(curr);
                drop(prev);
                // both locks released; now the node may die
                drop(unsafe { Box::from_raw(curr_ptr) });
                return true;
            }
            prev = curr;
        }
    }

    /// Return a copy of the first value matching `pred`.
    pub fn find_first_if<P>(&self, pred: P) -> Option<T>
    where
        T: Clone,
        P: Fn(&T) -> bool,
    {
        let mut found = None;
        self.for_each_until(|data| {
            if pred(data) {
                found = Some(data.clone());
                false
            } else {
                true
            }
        });
        found
    }

    /// Run `func` on every value, front to back.
    ///
    /// The callback runs while the current node's lock is held, so the node
    /// cannot be removed mid-callback. Callbacks must not re-enter the list.
    pub fn for_each<F>(&self, mut func: F)
    where
        F: FnMut(&T),
    {
        self.for_each_until(|data| {
            func(data);
            true
        });
    }

    /// Run `func` on every value, front to back, stopping when it returns
    /// false.
    ///
    /// Same locking contract as [`for_each`](Self::for_each).
    pub fn for_each_until<F>(&self, mut func: F)
    where
        F: FnMut(&T) -> bool,
    {
        let mut guard = self.head.inner.lock();
        loop {
            let curr_ptr = guard.next;
            if curr_ptr.is_null() {
                return;
            }
            // child lock first, then the parent's is released by the move
            guard = unsafe { (*curr_ptr).inner.lock() };
            if let Some(data) = guard.data.as_ref() {
                if !func(data) {
                    return;
                }
            }
        }
    }

    /// Update the first value matching `pred`, or append the value at the
    /// tail if none matches.
    ///
    /// Returns true for an insert and false for an update. Insertion happens
    /// at the tail, under the last node's lock, so two concurrent inserters
    /// for the same key converge: the loser walks over the winner's node and
    /// updates it instead.
    pub fn insert_or_update<P>(&self, pred: P, value: T) -> bool
    where
        P: Fn(&T) -> bool,
    {
        let mut guard = self.head.inner.lock();
        loop {
            let curr_ptr = guard.next;
            if curr_ptr.is_null() {
                guard.next = ListNode::alloc(value);
                return true;
            }
            guard = unsafe { (*curr_ptr).inner.lock() };
            let matched = guard.data.as_ref().map_or(false, &pred);
            if matched {
                let old = guard.data.replace(value);
                drop(guard);
                // old value destroyed after the node lock is released
                drop(old);
                return false;
            }
        }
    }
}

impl<T> Default for SyncList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SyncList<T> {
    fn drop(&mut self) {
        let mut current = self.head.inner.get_mut().next;
        while !current.is_null() {
            let mut node = unsafe { Box::from_raw(current) };
            current = node.inner.get_mut().next;
        }
    }
}

unsafe impl<T: Send> Send for SyncList<T> {}
unsafe impl<T: Send> Sync for SyncList<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn collect(list: &SyncList<i32>) -> Vec<i32> {
        let mut out = Vec::new();
        list.for_each(|v| out.push(*v));
        out
    }

    #[test]
    fn test_push_front_order() {
        let list = SyncList::new();
        list.push_front(1);
        list.push_front(2);
        list.push_front(3);
        assert_eq!(collect(&list), vec![3, 2, 1]);
    }

    #[test]
    fn test_find_first_if() {
        let list = SyncList::new();
        list.push_front(10);
        list.push_front(20);

        assert_eq!(list.find_first_if(|v| *v > 15), Some(20));
        assert_eq!(list.find_first_if(|v| *v > 25), None);
    }

    #[test]
    fn test_remove_first_if() {
        let list = SyncList::new();
        list.push_front(1);
        list.push_front(2);
        list.push_front(3);

        assert!(list.remove_first_if(|v| *v == 2));
        assert_eq!(collect(&list), vec![3, 1]);
        assert!(!list.remove_first_if(|v| *v == 2));
    }

    #[test]
    fn test_for_each_until_stops() {
        let list = SyncList::new();
        for i in 0..5 {
            list.push_front(i);
        }
        let mut visited = 0;
        list.for_each_until(|_| {
            visited += 1;
            visited < 3
        });
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_insert_or_update() {
        let list = SyncList::new();
        assert!(list.insert_or_update(|v| *v == 7, 7));
        assert!(!list.insert_or_update(|v| *v == 7, 7));
        assert_eq!(collect(&list).len(), 1);
    }

    #[test]
    fn test_insert_appends_at_tail() {
        let list = SyncList::new();
        list.push_front(1);
        list.push_front(2);
        list.insert_or_update(|v| *v == 99, 99);
        assert_eq!(collect(&list), vec![2, 1, 99]);
    }

    #[test]
    fn test_concurrent_insert_or_update_single_node() {
        let list = SyncList::new();
        thread::scope(|scope| {
            for t in 0..8 {
                let list = &list;
                scope.spawn(move || {
                    for _ in 0..100 {
                        list.insert_or_update(|v: &(i32, i32)| v.0 == 42, (42, t));
                    }
                });
            }
        });

        let mut matching = 0;
        list.for_each(|v| {
            if v.0 == 42 {
                matching += 1;
            }
        });
        assert_eq!(matching, 1);
    }

    #[test]
    fn test_concurrent_mixed_operations() {
        let list = SyncList::new();
        thread::scope(|scope| {
            for t in 0..4 {
                let list = &list;
                scope.spawn(move || {
                    for i in 0..200 {
                        match i % 3 {
                            0 => list.push_front(t * 1000 + i),
                            1 => {
                                list.remove_first_if(|v| v % 2 == 0);
                            }
                            _ => {
                                list.find_first_if(|v| *v == t * 1000);
                            }
                        }
                    }
                });
            }
        });
        // the list survives and is still traversable
        let mut len = 0;
        list.for_each(|_| len += 1);
        assert!(len > 0);
    }
}
