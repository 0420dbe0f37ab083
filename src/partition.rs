//! The partitioned key space shared by insert workers and the workers
//! which read or update what they inserted.
//!
//! Each insert worker owns a fixed, disjoint range of keys, so keys are
//! globally unique without any shared counter. The worker publishes how many
//! keys it has produced through a single-writer atomic cell; readers pick
//! keys below that mark. A stale read only narrows the range a reader
//! picks from, it never yields a key which does not exist yet.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::workers::RngGen;

/// Size of the key range owned by a single insert worker.
pub const KEYS_PER_WORKER: i64 = 100_000_000_000;

/// The highest global worker index whose key range still fits in an `i64`.
pub const MAX_WORKER_INDEX: u64 = (i64::MAX / KEYS_PER_WORKER - 1) as u64;

/// Progress of a single insert worker, readable by any task.
#[derive(Debug)]
pub struct WorkerState {
    worker_index: u64,
    highest_key_produced: AtomicU64,
}

impl WorkerState {
    pub fn new(worker_index: u64) -> Self {
        assert!(
            worker_index <= MAX_WORKER_INDEX,
            "worker index {worker_index} out of the key space",
        );
        Self {
            worker_index,
            highest_key_produced: AtomicU64::new(0),
        }
    }

    /// The global index of the worker, which determines its key range.
    pub fn worker_index(&self) -> u64 {
        self.worker_index
    }

    /// How many keys the worker has produced so far. Every key up to
    /// `key_base() + highest_key_produced()` has been acknowledged by the store.
    pub fn highest_key_produced(&self) -> u64 {
        self.highest_key_produced.load(Ordering::Acquire)
    }

    /// The first key of the range is `key_base() + 1`.
    pub fn key_base(&self) -> i64 {
        self.worker_index as i64 * KEYS_PER_WORKER
    }

    /// Keys which are known to exist in the store.
    pub fn valid_keys(&self) -> RangeInclusive<i64> {
        let base = self.key_base();
        base + 1..=base + self.highest_key_produced() as i64
    }

    /// Whether the key falls into this worker's partition at all.
    pub fn owns(&self, key: i64) -> bool {
        let base = self.key_base();
        key > base && key < base + KEYS_PER_WORKER
    }

    fn publish(&self, produced: u64) {
        debug_assert!(produced >= self.highest_key_produced.load(Ordering::Relaxed));
        self.highest_key_produced.store(produced, Ordering::Release);
    }
}

/// Hands out the keys of one insert worker. There must be only one
/// allocator per [`WorkerState`]: it is the only writer of the state.
pub struct KeyAllocator {
    state: Arc<WorkerState>,
    produced: u64,
}

impl KeyAllocator {
    pub fn new(state: Arc<WorkerState>) -> Self {
        let produced = state.highest_key_produced();
        Self { state, produced }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// The key the next insert should use, or `None` when the partition
    /// is exhausted.
    pub fn next_key(&self) -> Option<i64> {
        let next = self.produced + 1;
        (next < KEYS_PER_WORKER as u64).then(|| self.state.key_base() + next as i64)
    }

    /// Marks `key` as acknowledged by the store and makes it visible to
    /// readers. Must be called with the key most recently returned by
    /// `next_key`, after the insert succeeded.
    pub fn commit(&mut self, key: i64) {
        debug_assert_eq!(Some(key), self.next_key());
        self.produced += 1;
        self.state.publish(self.produced);
    }
}

/// The insert workers of one harness instance.
#[derive(Debug)]
pub struct KeySpace {
    workers: Vec<Arc<WorkerState>>,
}

impl KeySpace {
    /// Creates the key space from the global indexes claimed by the local
    /// insert workers.
    pub fn new(worker_indexes: impl IntoIterator<Item = u64>) -> Self {
        let workers = worker_indexes
            .into_iter()
            .map(|idx| Arc::new(WorkerState::new(idx)))
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Returns the state of the local insert worker `local_index`.
    pub fn worker(&self, local_index: usize) -> &Arc<WorkerState> {
        &self.workers[local_index]
    }

    pub fn workers(&self) -> impl Iterator<Item = &Arc<WorkerState>> {
        self.workers.iter()
    }

    /// Creates a picker of existing keys, or `None` if there are
    /// no insert workers to pick from.
    pub fn picker(self: &Arc<Self>) -> Option<KeyPicker> {
        if self.is_empty() {
            return None;
        }
        Some(KeyPicker {
            space: Arc::clone(self),
            worker_dist: Uniform::new(0, self.workers.len()),
        })
    }
}

/// Picks keys which readers and updaters may expect to exist.
#[derive(Clone)]
pub struct KeyPicker {
    space: Arc<KeySpace>,
    worker_dist: Uniform<usize>,
}

impl KeyPicker {
    /// Picks a uniformly random insert worker, then a uniformly random
    /// key among those it has already produced.
    ///
    /// Returns `None` if the chosen worker has not produced anything yet.
    pub fn pick(&self, gen: &mut RngGen) -> Option<PickedKey> {
        let worker = self.space.worker(self.worker_dist.sample(gen));
        let produced = worker.highest_key_produced();
        if produced == 0 {
            return None;
        }
        let key = worker.key_base() + gen.gen_range(1..=produced) as i64;
        Some(PickedKey {
            worker_index: worker.worker_index(),
            key,
            highest_key_produced: produced,
        })
    }
}

/// A key picked from an insert worker's published range, along with
/// the observation it was derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PickedKey {
    pub worker_index: u64,
    pub key: i64,
    pub highest_key_produced: u64,
}
