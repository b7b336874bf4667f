//! Cooperative thread interruption.
//!
//! An [`InterruptFlag`] is a stop request shared between a thread and its
//! controller. Code that wants to be interruptible calls
//! [`interrupt_point`] at safe places; once the flag is raised, the next
//! interrupt point fails with [`Error::Interrupted`].
//!
//! [`InterruptibleThread`] spawns a thread with its flag pre-registered and
//! does not return until the registration is visible, so `interrupt` never
//! races with thread start-up.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::Error;
use crate::promise::Promise;

/// A shared stop-request flag.
#[derive(Clone, Default)]
pub struct InterruptFlag {
    state: Arc<AtomicBool>,
}

impl InterruptFlag {
    /// Create an unraised flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    pub fn request_stop(&self) {
        self.state.store(true, Ordering::Release);
    }

    /// Whether a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }
}

thread_local! {
    static CURRENT_FLAG: RefCell<Option<InterruptFlag>> = const { RefCell::new(None) };
}

/// Install `flag` as the current thread's interrupt flag.
pub fn register_interrupt_flag(flag: InterruptFlag) {
    CURRENT_FLAG.with(|current| *current.borrow_mut() = Some(flag));
}

/// A registered interrupt point.
///
/// Fails with [`Error::Interrupted`] if the current thread's flag has been
/// raised; threads without a registered flag are never interrupted.
pub fn interrupt_point() -> Result<(), Error> {
    CURRENT_FLAG.with(|current| match current.borrow().as_ref() {
        Some(flag) if flag.stop_requested() => Err(Error::Interrupted),
        _ => Ok(()),
    })
}

/// A thread with an attached interrupt flag, joined on drop.
pub struct InterruptibleThread {
    flag: InterruptFlag,
    handle: Option<JoinHandle<()>>,
}

impl InterruptibleThread {
    /// Spawn `func` on a new thread with a fresh interrupt flag.
    ///
    /// Returns once the thread has registered its flag.
    pub fn spawn<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let flag = InterruptFlag::new();
        let registered = Arc::new(Promise::new());

        let thread_flag = flag.clone();
        let announce = registered.clone();
        let handle = thread::spawn(move || {
            register_interrupt_flag(thread_flag);
            announce.complete(());
            func();
        });

        let _ = registered.wait();
        Self {
            flag,
            handle: Some(handle),
        }
    }

    /// Raise the thread's interrupt flag.
    pub fn interrupt(&self) {
        self.flag.request_stop();
    }

    /// Whether the thread's flag has been raised.
    pub fn is_interrupted(&self) -> bool {
        self.flag.stop_requested()
    }

    /// Wait for the thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InterruptibleThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
