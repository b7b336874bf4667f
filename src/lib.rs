//! # synckit
//!
//! Concurrent data structures and coordination primitives for native
//! threads: lock-free containers with two contrasting memory-reclamation
//! schemes, fine-grained-locked containers, a work-stealing thread pool,
//! and a synchronous message-passing layer of buffered channels with a
//! multi-way `select`.
//!
//! ## Module Organization
//!
//! ### Foundation
//! - [`error`] - Library error kinds
//! - [`defer`] - Scope-exit guard
//!
//! ### Memory Reclamation
//! - [`counted`] - Packed counted pointers for ABA-safe CAS
//! - [`hazard`] - Hazard pointer pool and deferred-reclamation bin
//!
//! ### Lock-Free Containers
//! - [`stack`] - LIFO with split reference counting
//! - [`hp_stack`] - LIFO with hazard-pointer reclamation
//! - [`fifo`] - Unbounded MPMC queue with two-phase counters
//!
//! ### Locked Containers
//! - [`list`] - Hand-over-hand locked singly-linked list
//! - [`ht`] - Hash map over fine-grained-locked buckets
//! - [`two_lock_queue`] - Blocking FIFO with separate front/rear locks
//!
//! ### Coordination
//! - [`promise`] - One-shot completion cell
//! - [`interrupt`] - Cooperative thread interruption
//!
//! ### Execution
//! - [`pool`] - Work-stealing thread pool
//! - [`parallel`] - Partitioned find and parallel prefix sum
//!
//! ### Message Passing
//! - [`channel`] - Buffered channel with direct hand-off
//! - [`select`] - Atomic commitment across channel operations

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// =============================================================================
// Tier 0: Foundation (No Internal Dependencies)
// =============================================================================

/// Library error kinds.
pub mod error;

/// Scope-exit guard with guaranteed invocation.
pub mod defer;

// =============================================================================
// Tier 1: Memory Reclamation (Depends on Tier 0)
// =============================================================================

/// Packed counted pointers for ABA-safe compare-and-swap.
pub mod counted;

/// Hazard pointer pool and deferred-reclamation bin.
pub mod hazard;

// =============================================================================
// Tier 2: Lock-Free Containers (Depends on Tiers 0-1)
// =============================================================================

/// Lock-free stack with split reference counting.
pub mod stack;

/// Lock-free stack with hazard-pointer reclamation.
pub mod hp_stack;

/// Lock-free unbounded FIFO queue.
pub mod fifo;

// =============================================================================
// Tier 3: Locked Containers (Depends on Tier 0)
// =============================================================================

/// Fine-grained-locked singly-linked list.
pub mod list;

/// Thread-safe hash map over locked buckets.
pub mod ht;

/// Two-lock blocking FIFO.
pub mod two_lock_queue;

// =============================================================================
// Tier 4: Coordination (Depends on Tier 0)
// =============================================================================

/// One-shot completion cell with a blocking reader.
pub mod promise;

/// Cooperative thread interruption.
pub mod interrupt;

// =============================================================================
// Tier 5: Execution (Depends on Tiers 0-4)
// =============================================================================

/// Work-stealing thread pool.
pub mod pool;

/// Parallel algorithm primitives.
pub mod parallel;

// =============================================================================
// Tier 6: Message Passing (Depends on Tiers 0-4)
// =============================================================================

/// Buffered channel with synchronous hand-off.
pub mod channel;

/// Multi-way select over channel operations.
pub mod select;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use channel::{Channel, TryReceive, TrySendError};
pub use defer::Defer;
pub use error::Error;
pub use fifo::CountedFifo;
pub use hp_stack::HpStack;
pub use ht::SyncHashMap;
pub use interrupt::{interrupt_point, InterruptFlag, InterruptibleThread};
pub use list::SyncList;
pub use parallel::{parallel_find, parallel_prefix_sum};
pub use pool::{TaskHandle, WorkStealingPool};
pub use promise::Promise;
pub use select::Select;
pub use stack::CountedStack;
pub use two_lock_queue::TwoLockQueue;
