//! Multi-way select over channel operations.
//!
//! A [`Select`] waits on several channel operations, commits to exactly one,
//! and runs the action bound to it. Cases are tried eagerly in declaration
//! order; if none is ready and no default clause exists, the select
//! registers a shared participant record in every involved channel and
//! sleeps. The first channel operation (or close) to compare-and-set the
//! shared resolved-index from −1 to its case index owns the wake-up; later
//! contenders observe a non-negative index and skip.
//!
//! All involved channels are locked in ascending channel-id order, both
//! before registration and again for cleanup after the wake-up, so two
//! selects sharing channels can never deadlock. Cleanup removes every queue
//! entry tagged with this select's owning thread, including stale entries in
//! the channels that lost the race.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::trace;

use crate::channel::{Channel, SelectToken, TryReceive, TrySendError};
use crate::error::Error;
use crate::promise::Promise;

/// Raw lock interface a select uses to hold several channels at once.
///
/// The locked channel is owned by the calling thread but not represented by
/// a live guard, which is what lets one thread hold an arbitrary set of
/// channel mutexes across the try/register/cleanup phases.
trait ChannelLock {
    fn raw_lock(&self);
    /// # Safety
    ///
    /// The channel mutex must be locked by the current thread.
    unsafe fn raw_unlock(&self);
}

impl<T> ChannelLock for Channel<T> {
    fn raw_lock(&self) {
        Channel::raw_lock(self);
    }

    unsafe fn raw_unlock(&self) {
        Channel::raw_unlock(self);
    }
}

/// An ordered set of channel locks, released on every exit path.
struct LockSet<'s> {
    handles: Vec<&'s dyn ChannelLock>,
    locked: bool,
}

impl<'s> LockSet<'s> {
    fn new(handles: Vec<&'s dyn ChannelLock>) -> Self {
        Self {
            handles,
            locked: false,
        }
    }

    /// Acquire every channel, in ascending id order.
    fn lock_all(&mut self) {
        for handle in &self.handles {
            handle.raw_lock();
        }
        self.locked = true;
    }

    /// Release every channel, in reverse order.
    fn unlock_all(&mut self) {
        if !self.locked {
            return;
        }
        for handle in self.handles.iter().rev() {
            unsafe { handle.raw_unlock() };
        }
        self.locked = false;
    }
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        self.unlock_all();
    }
}

/// One registered case, type-erased over the channel's element type.
trait CaseArm<'a> {
    fn channel_id(&self) -> u64;
    fn lock_handle(&self) -> &'a dyn ChannelLock;
    /// Attempt the operation. Ok(true) means the case fired and any received
    /// value has been delivered to the caller's slot.
    ///
    /// # Safety
    ///
    /// The case's channel must be locked by the current thread.
    unsafe fn try_op(&mut self) -> Result<bool, Error>;
    /// Park this case's participant record in its channel.
    ///
    /// # Safety
    ///
    /// The case's channel must be locked by the current thread.
    unsafe fn register(&self);
    /// Remove every registration owned by this select from its channel.
    ///
    /// # Safety
    ///
    /// The case's channel must be locked by the current thread.
    unsafe fn cleanup(&self);
    /// Run the bound action after an eager hit.
    fn run_eager(&mut self);
    /// Deliver the resolver's hand-off and run the bound action.
    fn run_resolved(&mut self);
}

struct ReceiveCase<'a, T> {
    channel: &'a Channel<T>,
    token: Arc<SelectToken<T>>,
    out: Arc<Mutex<Option<T>>>,
    action: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a, T> ReceiveCase<'a, T> {
    fn run_action(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl<'a, T: Default + Send + 'a> CaseArm<'a> for ReceiveCase<'a, T> {
    fn channel_id(&self) -> u64 {
        self.channel.id()
    }

    fn lock_handle(&self) -> &'a dyn ChannelLock {
        self.channel
    }

    unsafe fn try_op(&mut self) -> Result<bool, Error> {
        let inner = self.channel.inner_locked();
        match Channel::try_receive_locked(inner) {
            TryReceive::Received(value) => {
                *self.out.lock() = Some(value);
                Ok(true)
            }
            TryReceive::Closed => {
                // closed channels deliver a placeholder through this case
                *self.out.lock() = Some(T::default());
                Ok(true)
            }
            TryReceive::Empty => Ok(false),
        }
    }

    unsafe fn register(&self) {
        let inner = self.channel.inner_locked();
        Channel::register_select_consumer(inner, self.token.clone());
    }

    unsafe fn cleanup(&self) {
        let inner = self.channel.inner_locked();
        self.channel.remove_select_entries(inner, self.token.owner);
    }

    fn run_eager(&mut self) {
        self.run_action();
    }

    fn run_resolved(&mut self) {
        let delivered = self.token.slot.lock().take();
        *self.out.lock() = Some(delivered.unwrap_or_default());
        self.run_action();
    }
}

struct SendCase<'a, T> {
    channel: &'a Channel<T>,
    token: Arc<SelectToken<T>>,
    action: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a, T> SendCase<'a, T> {
    fn run_action(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl<'a, T: Send + 'a> CaseArm<'a> for SendCase<'a, T> {
    fn channel_id(&self) -> u64 {
        self.channel.id()
    }

    fn lock_handle(&self) -> &'a dyn ChannelLock {
        self.channel
    }

    unsafe fn try_op(&mut self) -> Result<bool, Error> {
        let value = match self.token.slot.lock().take() {
            Some(value) => value,
            None => return Ok(false),
        };
        let inner = self.channel.inner_locked();
        match Channel::try_send_locked(inner, value) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(value)) => {
                // keep the value for registration or a later retry
                *self.token.slot.lock() = Some(value);
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Err(Error::ChannelClosed),
        }
    }

    unsafe fn register(&self) {
        let inner = self.channel.inner_locked();
        Channel::register_select_producer(inner, self.token.clone());
    }

    unsafe fn cleanup(&self) {
        let inner = self.channel.inner_locked();
        self.channel.remove_select_entries(inner, self.token.owner);
    }

    fn run_eager(&mut self) {
        self.run_action();
    }

    fn run_resolved(&mut self) {
        // the resolver moved the value into the channel
        self.run_action();
    }
}

/// A one-shot multi-way wait over heterogeneous channel operations.
pub struct Select<'a> {
    cases: Vec<Box<dyn CaseArm<'a> + 'a>>,
    default_action: Option<Box<dyn FnOnce() + 'a>>,
    waker: Arc<Promise<()>>,
    resolved: Arc<AtomicI32>,
    waited: bool,
}

impl<'a> Select<'a> {
    /// Create a select with no cases.
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            default_action: None,
            waker: Arc::new(Promise::new()),
            resolved: Arc::new(AtomicI32::new(-1)),
            waited: false,
        }
    }

    fn make_token<T>(&self, value: Option<T>) -> Arc<SelectToken<T>> {
        Arc::new(SelectToken {
            waker: self.waker.clone(),
            resolved: self.resolved.clone(),
            owner: thread::current().id(),
            case_index: self.cases.len() as i32,
            slot: Mutex::new(value),
        })
    }

    /// Add a case that receives from `channel` into `slot`.
    ///
    /// When the case fires because the channel closed, `slot` receives
    /// `T::default()` as a placeholder.
    pub fn add_receive_case<T>(
        &mut self,
        channel: &'a Channel<T>,
        slot: Arc<Mutex<Option<T>>>,
        action: impl FnOnce() + 'a,
    ) -> Result<(), Error>
    where
        T: Default + Send + 'a,
    {
        if self.waited {
            return Err(Error::RegisterAfterWait);
        }
        let token = self.make_token(None);
        self.cases.push(Box::new(ReceiveCase {
            channel,
            token,
            out: slot,
            action: Some(Box::new(action)),
        }));
        Ok(())
    }

    /// Add a case that sends `value` to `channel`.
    pub fn add_send_case<T>(
        &mut self,
        channel: &'a Channel<T>,
        value: T,
        action: impl FnOnce() + 'a,
    ) -> Result<(), Error>
    where
        T: Send + 'a,
    {
        if self.waited {
            return Err(Error::RegisterAfterWait);
        }
        let token = self.make_token(Some(value));
        self.cases.push(Box::new(SendCase {
            channel,
            token,
            action: Some(Box::new(action)),
        }));
        Ok(())
    }

    /// Add the default clause, run when no case is immediately ready.
    pub fn add_default(&mut self, action: impl FnOnce() + 'a) -> Result<(), Error> {
        if self.waited {
            return Err(Error::RegisterAfterWait);
        }
        if self.default_action.is_some() {
            return Err(Error::DuplicateDefault);
        }
        self.default_action = Some(Box::new(action));
        Ok(())
    }

    /// Wait until exactly one case fires and run its action.
    ///
    /// A select that finds a case immediately ready never sleeps and never
    /// registers. A send case resolved by a channel close surfaces
    /// [`Error::ChannelClosed`] after cleanup.
    pub fn wait(&mut self) -> Result<(), Error> {
        if self.waited {
            return Err(Error::RegisterAfterWait);
        }
        self.waited = true;

        if self.cases.is_empty() {
            if let Some(action) = self.default_action.take() {
                action();
            }
            return Ok(());
        }

        // deduplicate shared channels and fix the global lock order
        let mut by_id: BTreeMap<u64, &'a dyn ChannelLock> = BTreeMap::new();
        for case in &self.cases {
            by_id.insert(case.channel_id(), case.lock_handle());
        }
        let mut locks = LockSet::new(by_id.into_values().collect());
        locks.lock_all();

        // eager pass, in declaration order
        for index in 0..self.cases.len() {
            match unsafe { self.cases[index].try_op() } {
                Ok(true) => {
                    locks.unlock_all();
                    self.cases[index].run_eager();
                    return Ok(());
                }
                Ok(false) => {}
                Err(error) => return Err(error),
            }
        }

        if let Some(action) = self.default_action.take() {
            locks.unlock_all();
            action();
            return Ok(());
        }

        // park a participant record in every channel, then sleep
        for case in &self.cases {
            unsafe { case.register() };
        }
        trace!(cases = self.cases.len(), "select parked");
        locks.unlock_all();

        let wait_result = self.waker.wait();

        let resolved = self.resolved.load(Ordering::Acquire);
        debug_assert!(resolved >= 0);

        // sweep our registrations out of every channel, including the ones
        // that lost the race
        locks.lock_all();
        for case in &self.cases {
            unsafe { case.cleanup() };
        }
        locks.unlock_all();

        // a close that resolved a send case surfaces here
        wait_result?;

        self.cases[resolved as usize].run_resolved();
        Ok(())
    }
}

impl Default for Select<'_> {
    fn default() -> Self {
        Self::new()
    }
}
