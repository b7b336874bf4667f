//! Scope-exit guard.
//!
//! [`Defer`] binds a callable to the end of the enclosing scope and invokes
//! it on every exit path, including unwinds. Single-owner and non-copyable;
//! drop order is the usual reverse declaration order.

/// Runs the wrapped callable when dropped.
pub struct Defer<F: FnOnce()> {
    func: Option<F>,
}

impl<F: FnOnce()> Defer<F> {
    /// Bind `func` to the end of the current scope.
    pub fn new(func: F) -> Self {
        Self { func: Some(func) }
    }

    /// Disarm the guard; the callable will not run.
    pub fn cancel(mut self) {
        self.func = None;
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(func) = self.func.take() {
            func();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_on_scope_exit() {
        let count = AtomicUsize::new(0);
        {
            let _guard = Defer::new(|| {
                count.fetch_add(1, Ordering::Relaxed);
            });
            assert_eq!(count.load(Ordering::Relaxed), 0);
        }
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_runs_on_unwind() {
        let count = AtomicUsize::new(0);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = Defer::new(|| {
                count.fetch_add(1, Ordering::Relaxed);
            });
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cancel() {
        let count = AtomicUsize::new(0);
        {
            let guard = Defer::new(|| {
                count.fetch_add(1, Ordering::Relaxed);
            });
            guard.cancel();
        }
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_reverse_drop_order() {
        let order = std::sync::Mutex::new(Vec::new());
        {
            let _first = Defer::new(|| order.lock().unwrap().push(1));
            let _second = Defer::new(|| order.lock().unwrap().push(2));
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }
}
