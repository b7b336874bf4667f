//! Library error kinds.
//!
//! Every fallible operation in the crate reports one of the variants below.
//! Errors surface to the immediate caller of the failing operation; failures
//! inside pool-submitted tasks are captured and surface at the wait handle.

use thiserror::Error;

/// Errors reported by the containers, channels and executors in this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A send hit a closed channel, or a close resolved a pending send.
    #[error("channel is closed")]
    ChannelClosed,

    /// The current thread was asked to stop and reached an interrupt point.
    #[error("thread has been interrupted")]
    Interrupted,

    /// A task was submitted after the pool had been stopped.
    #[error("thread pool has been stopped")]
    PoolStopped,

    /// A task or worker chunk panicked before producing its result.
    #[error("task panicked before completing")]
    TaskPanicked,

    /// Every slot in the hazard pointer pool is occupied.
    #[error("hazard pointer pool is out of slots")]
    HazardExhausted,

    /// A second default clause was added to a select.
    #[error("select already has a default clause")]
    DuplicateDefault,

    /// A case was added to (or `wait` re-invoked on) a select whose `wait`
    /// has already begun.
    #[error("select cases cannot change once wait has begun")]
    RegisterAfterWait,
}
