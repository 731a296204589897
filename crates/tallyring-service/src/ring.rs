//! Fixed ring of counting buckets with a rotating "current" cursor.
//!
//! Only the current bucket receives writes. Rotation advances the cursor by
//! one slot and hands the vacated slot back to the caller, which harvests or
//! clears it before the cursor wraps around to it again.
//!
//! Writers read the cursor and then lock the bucket it names. A writer that
//! read the cursor just before a rotation still lands in the vacated bucket.
//! Harvest swaps the whole map out under the bucket's write lock, so such a
//! late write is never lost: it shows up in the vacated bucket's next
//! lifetime instead. Counts at rotation boundaries are therefore approximate
//! by at most the writes in flight during the swap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::error::ServiceError;

/// Smallest ring that still separates the current bucket from the one
/// being harvested.
pub const MIN_RING_SIZE: usize = 2;

type Bucket = HashMap<String, u64>;

/// Drained contents of one bucket.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Harvest {
    /// Ring slot the entries were taken from.
    pub index: usize,
    /// One `(key, count)` pair per distinct key; order is unspecified.
    pub entries: Vec<(String, u64)>,
    /// Sum of all counts.
    pub total: u64,
}

impl Harvest {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ring of `key -> count` buckets guarded by per-bucket reader/writer locks.
pub struct RotatingCounter {
    buckets: Box<[RwLock<Bucket>]>,
    cursor: AtomicUsize,
    rotations: AtomicU64,
}

impl RotatingCounter {
    /// Creates a ring of `ring_size` empty buckets with the cursor at 0.
    pub fn new(ring_size: usize) -> Result<Self, ServiceError> {
        if ring_size < MIN_RING_SIZE {
            return Err(ServiceError::InvalidConfig(format!(
                "ring size must be at least {MIN_RING_SIZE}, got {ring_size}"
            )));
        }

        Ok(Self {
            buckets: (0..ring_size).map(|_| RwLock::new(Bucket::new())).collect(),
            cursor: AtomicUsize::new(0),
            rotations: AtomicU64::new(0),
        })
    }

    pub fn ring_size(&self) -> usize {
        self.buckets.len()
    }

    /// Index of the bucket currently absorbing writes.
    pub fn current_index(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Number of rotations performed since construction.
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Records one occurrence of `key` and returns its new count.
    pub fn increment(&self, key: &str) -> u64 {
        self.lock_current().bump(key)
    }

    /// Increments `key` only while its count is below `max`.
    ///
    /// Returns the new count, or `None` when the key already reached `max`.
    /// The check and the increment happen under one lock, so the count never
    /// exceeds `max`.
    pub fn increment_below(&self, key: &str, max: u64) -> Option<u64> {
        let mut bucket = self.lock_current();
        (bucket.count(key) < max).then(|| bucket.bump(key))
    }

    /// Count of `key` in the current bucket.
    pub fn count(&self, key: &str) -> u64 {
        self.buckets[self.current_index()]
            .read()
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Advances the cursor by one slot, wrapping at the end of the ring, and
    /// returns the index that stopped being current.
    ///
    /// Meant to be driven by a single rotation task.
    pub fn rotate(&self) -> usize {
        let len = self.buckets.len();
        let vacated = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % len))
        {
            Ok(prev) | Err(prev) => prev,
        };
        self.rotations.fetch_add(1, Ordering::Relaxed);
        vacated
    }

    /// Drains bucket `index`, leaving it empty for reuse.
    pub fn harvest(&self, index: usize) -> Harvest {
        let drained = std::mem::take(&mut *self.buckets[index].write());
        let total = drained.values().sum();
        Harvest {
            index,
            entries: drained.into_iter().collect(),
            total,
        }
    }

    /// Replaces bucket `index` with a fresh map, discarding keys and counts.
    pub fn clear(&self, index: usize) {
        *self.buckets[index].write() = Bucket::new();
    }

    /// Copies bucket `index` without modifying it.
    pub fn snapshot(&self, index: usize) -> Vec<(String, u64)> {
        self.buckets[index]
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Write-locks the current bucket.
    pub(crate) fn lock_current(&self) -> BucketGuard<'_> {
        BucketGuard(self.buckets[self.current_index()].write())
    }
}

/// Exclusive access to the bucket that was current when the lock was taken.
pub(crate) struct BucketGuard<'a>(RwLockWriteGuard<'a, Bucket>);

impl BucketGuard<'_> {
    pub(crate) fn count(&self, key: &str) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub(crate) fn bump(&mut self, key: &str) -> u64 {
        if let Some(count) = self.0.get_mut(key) {
            *count += 1;
            *count
        } else {
            self.0.insert(key.to_owned(), 1);
            1
        }
    }
}
