//! Parallel algorithm primitives.
//!
//! Both algorithms partition their input into chunks of at least
//! [`MIN_CHUNK`] elements, run one worker per chunk under
//! `std::thread::scope` (which joins on every exit path), and hand results
//! between workers through [`Promise`]s.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::defer::Defer;
use crate::error::Error;
use crate::promise::Promise;

/// Smallest amount of work a chunk may carry.
pub const MIN_CHUNK: usize = 25;

/// Number of workers for an input of `len` elements.
fn worker_count(len: usize) -> usize {
    let parallelism = num_cpus::get();
    if parallelism <= 1 {
        1
    } else if parallelism * MIN_CHUNK >= len {
        len.div_ceil(MIN_CHUNK).max(1)
    } else {
        parallelism
    }
}

fn find_in_chunk<T: PartialEq>(
    chunk: &[T],
    base: usize,
    target: &T,
    stop: &AtomicBool,
    found: &Promise<usize>,
) {
    for (offset, item) in chunk.iter().enumerate() {
        // poll the stop flag on every element so a hit elsewhere ends the
        // scan quickly
        if stop.load(Ordering::Relaxed) {
            return;
        }
        if item == target {
            if found.try_complete(Ok(base + offset)) {
                stop.store(true, Ordering::Relaxed);
            }
            return;
        }
    }
}

/// Find the position of `target` in `data`, scanning chunks in parallel.
///
/// Returns the index of a matching element, or `None` if the value is
/// absent. When several chunks contain matches, the first chunk to publish
/// wins.
pub fn parallel_find<T>(data: &[T], target: &T) -> Option<usize>
where
    T: PartialEq + Sync,
{
    if data.is_empty() {
        return None;
    }

    let workers = worker_count(data.len());
    let workload = data.len().div_ceil(workers);
    let stop = AtomicBool::new(false);
    let found = Promise::new();

    thread::scope(|scope| {
        for (index, chunk) in data.chunks(workload).enumerate() {
            let stop = &stop;
            let found = &found;
            scope.spawn(move || find_in_chunk(chunk, index * workload, target, stop, found));
        }
    });

    if found.is_complete() {
        found.wait().ok()
    } else {
        None
    }
}

fn prefix_sum_chunk<T>(
    chunk: &mut [T],
    wait_for: Option<Arc<Promise<T>>>,
    publish: Option<Arc<Promise<T>>>,
) -> Result<(), Error>
where
    T: Clone + std::ops::AddAssign,
{
    // whatever happens below, the successor must not wait forever
    let release_successor = publish.clone();
    let _guard = Defer::new(move || {
        if let Some(promise) = release_successor {
            promise.try_complete(Err(Error::TaskPanicked));
        }
    });

    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(), Error> {
        for i in 1..chunk.len() {
            let prev = chunk[i - 1].clone();
            chunk[i] += prev;
        }

        let last = chunk.len() - 1;
        if let Some(predecessor) = wait_for {
            let addon = predecessor.wait()?;

            // publish the bumped tail before rewriting the body, so the
            // successor starts as early as possible
            let mut new_tail = chunk[last].clone();
            new_tail += addon.clone();
            if let Some(promise) = &publish {
                promise.complete(new_tail.clone());
            }

            for item in &mut chunk[..last] {
                *item += addon.clone();
            }
            chunk[last] = new_tail;
        } else if let Some(promise) = &publish {
            promise.complete(chunk[last].clone());
        }
        Ok(())
    }));

    match outcome {
        Ok(result) => result,
        Err(_) => Err(Error::TaskPanicked),
    }
}

/// Replace every element with the sum of itself and all elements before it.
///
/// `data[i]` becomes `data[0] + ... + data[i]`. Chunks are summed locally in
/// parallel; each chunk then waits for its predecessor's tail, publishes its
/// own bumped tail, and rewrites its body. A failing chunk propagates its
/// error down the chain and out of the driver.
pub fn parallel_prefix_sum<T>(data: &mut [T]) -> Result<(), Error>
where
    T: Clone + std::ops::AddAssign + Send,
{
    if data.len() <= 1 {
        return Ok(());
    }

    let workers = worker_count(data.len());
    let workload = data.len().div_ceil(workers);

    let mut chunks: Vec<&mut [T]> = data.chunks_mut(workload).collect();
    let tail_chunk = match chunks.pop() {
        Some(chunk) => chunk,
        None => return Ok(()),
    };

    let hand_offs: Vec<Arc<Promise<T>>> =
        (0..chunks.len()).map(|_| Arc::new(Promise::new())).collect();

    thread::scope(|scope| {
        for (index, chunk) in chunks.into_iter().enumerate() {
            let wait_for = index.checked_sub(1).map(|i| hand_offs[i].clone());
            let publish = Some(hand_offs[index].clone());
            scope.spawn(move || {
                let _ = prefix_sum_chunk(chunk, wait_for, publish);
            });
        }

        // the driver runs the final chunk itself; its result carries any
        // error that travelled down the hand-off chain
        let wait_for = hand_offs.last().cloned();
        prefix_sum_chunk(tail_chunk, wait_for, None)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_present() {
        let data: Vec<u32> = (0..1000).collect();
        assert_eq!(parallel_find(&data, &737), Some(737));
    }

    #[test]
    fn test_find_absent() {
        let data: Vec<u32> = (0..1000).collect();
        assert_eq!(parallel_find(&data, &5000), None);
    }

    #[test]
    fn test_find_empty_input() {
        let data: Vec<u32> = Vec::new();
        assert_eq!(parallel_find(&data, &1), None);
    }

    #[test]
    fn test_find_small_input() {
        let data = vec![3, 1, 4];
        assert_eq!(parallel_find(&data, &4), Some(2));
    }

    #[test]
    fn test_find_first_element() {
        let data: Vec<u32> = (0..10_000).collect();
        assert_eq!(parallel_find(&data, &0), Some(0));
    }

    #[test]
    fn test_prefix_sum_of_ones() {
        let mut data = vec![1u64; 1000];
        parallel_prefix_sum(&mut data).unwrap();
        let expected: Vec<u64> = (1..=1000).collect();
        assert_eq!(data, expected);
    }

    #[test]
    fn test_prefix_sum_general() {
        let mut data: Vec<i64> = (1..=500).collect();
        parallel_prefix_sum(&mut data).unwrap();
        for (i, value) in data.iter().enumerate() {
            let n = i as i64 + 1;
            assert_eq!(*value, n * (n + 1) / 2);
        }
    }

    #[test]
    fn test_prefix_sum_chunk_failure_propagates() {
        #[derive(Clone, PartialEq, Debug)]
        struct Bomb(u64);

        impl std::ops::AddAssign for Bomb {
            fn add_assign(&mut self, rhs: Self) {
                self.0 += rhs.0;
                if self.0 >= 40 {
                    panic!("overflowed the fuse");
                }
            }
        }

        let mut data: Vec<Bomb> = (0..200).map(|_| Bomb(1)).collect();
        assert_eq!(parallel_prefix_sum(&mut data), Err(Error::TaskPanicked));
    }

    #[test]
    fn test_prefix_sum_short_inputs() {
        let mut empty: Vec<u32> = Vec::new();
        parallel_prefix_sum(&mut empty).unwrap();
        assert!(empty.is_empty());

        let mut single = vec![9u32];
        parallel_prefix_sum(&mut single).unwrap();
        assert_eq!(single, vec![9]);

        let mut pair = vec![2u32, 3];
        parallel_prefix_sum(&mut pair).unwrap();
        assert_eq!(pair, vec![2, 5]);
    }
}
