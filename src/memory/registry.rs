//! Registry of externally owned buffers
//!
//! Maps buffer identity to a small stable index with two structures:
//!
//! ```text
//! buckets (identity hash & range)      entries (dense, by index)
//!   [0] ─→ 5 ─→ 2 ─→ ∅                  [0] Entry{weak, next}
//!   [1] ─→ ∅                            [1] ∅
//!   [2] ─→ 0 ─→ ∅                       [2] Entry{weak, next}
//!   [3] ─→ 3 ─→ ∅                       ...
//! ```
//!
//! Entries hold `Weak` references, so registering a buffer never keeps it
//! alive. An entry whose buffer has been dropped by its owner is "hollow";
//! hollow entries are swept when the table would otherwise have to grow.

use super::buffer::{NativeBuffer, SharedBuffer};
use super::handle::REGISTERED_MAX_CAPACITY;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

struct Entry {
    buffer: Weak<RwLock<NativeBuffer>>,
    /// Address of the shared allocation. Stays unique while the `Weak` lives.
    identity: usize,
    /// Next entry index in the same bucket
    next: Option<usize>,
}

impl Entry {
    fn is_hollow(&self) -> bool {
        self.buffer.strong_count() == 0
    }
}

/// Bucket chain step: what a scan needs from one entry
struct Visit {
    matches: bool,
    hollow: bool,
    next: Option<usize>,
}

/// Index assignment for externally owned buffers
///
/// Capacity is a power of two and doubles or halves with the load, up to a
/// fixed maximum.
pub struct BufferRegistry {
    /// Upper bound for the table capacity
    max_capacity: usize,
    /// Head entry index per bucket
    buckets: Vec<Option<usize>>,
    /// Entries by assigned index
    entries: Vec<Option<Entry>>,
    hash_range: usize,
    lowest_free_index: usize,
    size: usize,
    /// Times a hollow entry was run into, not the number of hollow entries.
    /// Every encounter is wasted work, repeated ones on the same entry included.
    hollow_encounters: u64,
}

fn identity_of(buffer: &SharedBuffer) -> usize {
    Arc::as_ptr(buffer) as usize
}

fn bucket_of(identity: usize, hash_range: usize) -> usize {
    // allocation addresses are aligned, fold the high bits in
    let mixed = (identity as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed >> 32) as usize & hash_range
}

fn pad_hash_length(capacity: usize) -> usize {
    capacity.max(1).next_power_of_two()
}

fn empty_entries(capacity: usize) -> Vec<Option<Entry>> {
    (0..capacity).map(|_| None).collect()
}

impl BufferRegistry {
    /// Create a registry of capacity one
    pub fn new(max_capacity: usize) -> Self {
        Self::with_capacity(max_capacity, 1)
    }

    /// Create a registry with room for `initial_capacity` buffers
    ///
    /// Both capacities are powers of two; a maximum in between is rounded down.
    pub fn with_capacity(max_capacity: usize, initial_capacity: usize) -> Self {
        let max_capacity = max_capacity.clamp(1, REGISTERED_MAX_CAPACITY);
        // capacity only ever doubles, so the bound has to be reachable that way
        let max_capacity = if max_capacity.is_power_of_two() {
            max_capacity
        } else {
            max_capacity.next_power_of_two() / 2
        };
        let capacity = pad_hash_length(initial_capacity).min(max_capacity);

        let mut registry = Self {
            max_capacity,
            buckets: Vec::new(),
            entries: Vec::new(),
            hash_range: 0,
            lowest_free_index: 0,
            size: 0,
            hollow_encounters: 0,
        };
        registry.update_state(vec![None; capacity], empty_entries(capacity), 0);
        registry
    }

    fn update_state(&mut self, buckets: Vec<Option<usize>>, entries: Vec<Option<Entry>>, size: usize) {
        self.hash_range = buckets.len() - 1;
        self.buckets = buckets;
        self.entries = entries;
        self.size = size;
        self.update_lowest_free_index();
    }

    fn update_lowest_free_index(&mut self) {
        // past the end when full
        self.lowest_free_index = self
            .entries
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.entries.len());
    }

    /// Number of indices the tables currently hold
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Registered buffers, hollow ones included
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Hollow entries run into since the last sweep or rebuild
    pub fn hollow_encounters(&self) -> u64 {
        self.hollow_encounters
    }

    fn visit(&self, index: usize, identity: usize) -> Result<Visit> {
        let entry = self.entries.get(index).and_then(Option::as_ref).ok_or_else(|| {
            error!(index, "Bucket chain points at an unassigned index");
            Error::InconsistentState(format!(
                "Buffer registry chain references unassigned index {}",
                index
            ))
        })?;

        let hollow = entry.is_hollow();
        Ok(Visit {
            matches: entry.identity == identity && !hollow,
            hollow,
            next: entry.next,
        })
    }

    /// Index of `buffer`, registering it first if needed
    pub fn ensure_registered(&mut self, buffer: &SharedBuffer) -> Result<usize> {
        let identity = identity_of(buffer);

        let mut cursor = self.buckets[bucket_of(identity, self.hash_range)];
        while let Some(index) = cursor {
            let visit = self.visit(index, identity)?;
            if visit.matches {
                return Ok(index);
            }
            if visit.hollow {
                self.hollow_encounters += 1;
            }
            cursor = visit.next;
        }

        self.size += 1;
        if self.size > self.capacity() {
            self.check_for_incrementing_rebuild()?;
        }

        let index = self.determine_free_index()?;
        // the tables may have been rebuilt above
        let bucket = bucket_of(identity, self.hash_range);
        self.entries[index] = Some(Entry {
            buffer: Arc::downgrade(buffer),
            identity,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(index);

        debug!(index, size = self.size, "Registered buffer");
        Ok(index)
    }

    /// Buffer registered under `index`, if it is still alive
    pub fn lookup(&mut self, index: usize) -> Option<SharedBuffer> {
        let entry = self.entries.get(index)?.as_ref()?;
        let buffer = entry.buffer.upgrade();
        if buffer.is_none() {
            self.hollow_encounters += 1;
        }
        buffer
    }

    fn check_for_incrementing_rebuild(&mut self) -> Result<()> {
        if self.hollow_encounters > 0 {
            // clearing out garbage makes room without growing the tables
            self.clean_up();
            if self.size <= self.capacity() {
                return Ok(());
            }
        }

        self.incrementing_rebuild()
    }

    fn incrementing_rebuild(&mut self) -> Result<()> {
        let capacity = self.capacity();

        if capacity >= self.max_capacity {
            // roll back the preliminary increment
            self.size -= 1;
            warn!(capacity, "Buffer registry at maximum capacity");
            return Err(Error::CapacityExceeded(format!(
                "Buffer registry cannot be increased beyond the configured maximum capacity of {}",
                self.max_capacity
            )));
        }
        if capacity >= REGISTERED_MAX_CAPACITY {
            self.size -= 1;
            warn!(capacity, "Buffer registry at technical capacity");
            return Err(Error::CapacityExceeded(format!(
                "Buffer registry cannot be increased beyond the technical maximum capacity of {}",
                REGISTERED_MAX_CAPACITY
            )));
        }

        self.rebuild(capacity * 2);
        Ok(())
    }

    /// Unlink every hollow entry
    ///
    /// The lowest free index is not maintained per removed entry; it is
    /// determined from scratch once the pass is done.
    fn clean_up(&mut self) {
        let mut size = self.size;
        let mut removed = 0usize;

        for bucket in 0..self.buckets.len() {
            let mut last: Option<usize> = None;
            let mut cursor = self.buckets[bucket];

            while let Some(index) = cursor {
                let Some(entry) = self.entries[index].as_ref() else {
                    break;
                };
                let next = entry.next;

                if entry.is_hollow() {
                    self.entries[index] = None;
                    match last {
                        None => self.buckets[bucket] = next,
                        Some(last) => {
                            if let Some(last_entry) = self.entries[last].as_mut() {
                                last_entry.next = next;
                            }
                        }
                    }
                    size -= 1;
                    removed += 1;
                } else {
                    // only survivors can be predecessors
                    last = Some(index);
                }

                cursor = next;
            }
        }

        self.update_lowest_free_index();
        self.size = size;
        self.hollow_encounters = 0;

        metrics::counter!("handlemem_registry_sweeps_total").increment(1);
        debug!(removed, size, "Swept hollow registry entries");
    }

    fn rebuild(&mut self, new_capacity: usize) {
        let old_capacity = self.capacity();
        let new_range = new_capacity - 1;
        let mut buckets: Vec<Option<usize>> = vec![None; new_capacity];
        let mut entries = empty_entries(new_capacity);
        let mut size = self.size;

        for (index, entry) in std::mem::take(&mut self.entries).into_iter().enumerate() {
            let Some(entry) = entry else { continue };
            if entry.is_hollow() {
                size -= 1;
                continue;
            }

            let bucket = bucket_of(entry.identity, new_range);
            entries[index] = Some(Entry {
                next: buckets[bucket],
                ..entry
            });
            buckets[bucket] = Some(index);
        }

        debug!(old_capacity, new_capacity, size, "Rebuilt buffer registry");
        self.update_state(buckets, entries, size);
        self.hollow_encounters = 0;
    }

    fn determine_free_index(&mut self) -> Result<usize> {
        let index = self.lowest_free_index;

        // registration has ensured room for one more entry
        if index >= self.entries.len() || self.entries[index].is_some() {
            error!(
                lowest_free_index = index,
                capacity = self.entries.len(),
                size = self.size,
                "No free registry index"
            );
            return Err(Error::InconsistentState(format!(
                "Inconsistent buffer registry: lowest free index = {}, capacity = {}, size = {}",
                index,
                self.entries.len(),
                self.size
            )));
        }

        self.lowest_free_index = self.entries[index + 1..]
            .iter()
            .position(Option::is_none)
            .map_or(self.entries.len(), |i| index + 1 + i);

        Ok(index)
    }

    /// Deregister `buffer`, returning the index it had. Unknown buffers are ignored.
    pub fn ensure_removed(&mut self, buffer: &SharedBuffer) -> Result<Option<usize>> {
        let identity = identity_of(buffer);
        let bucket = bucket_of(identity, self.hash_range);

        let mut last = None;
        let mut cursor = self.buckets[bucket];
        while let Some(index) = cursor {
            let visit = self.visit(index, identity)?;
            if visit.matches {
                self.remove_entry(bucket, index, last, visit.next);
                return Ok(Some(index));
            }
            if visit.hollow {
                self.hollow_encounters += 1;
            }
            last = Some(index);
            cursor = visit.next;
        }

        Ok(None)
    }

    /// Deregister whatever is registered under `index`, hollow or not
    pub fn remove_index(&mut self, index: usize) -> Result<()> {
        let identity = self
            .entries
            .get(index)
            .and_then(Option::as_ref)
            .map(|entry| entry.identity)
            .ok_or_else(|| {
                Error::InvalidAddress(format!("No buffer registered under index {}", index))
            })?;
        let bucket = bucket_of(identity, self.hash_range);

        let mut last = None;
        let mut cursor = self.buckets[bucket];
        while let Some(current) = cursor {
            let visit = self.visit(current, identity)?;
            if current == index {
                self.remove_entry(bucket, index, last, visit.next);
                return Ok(());
            }
            last = Some(current);
            cursor = visit.next;
        }

        error!(index, bucket, "Registered index missing from its bucket");
        Err(Error::InconsistentState(format!(
            "Registry index {} not linked in bucket {}",
            index, bucket
        )))
    }

    fn remove_entry(&mut self, bucket: usize, index: usize, last: Option<usize>, next: Option<usize>) {
        match last {
            None => self.buckets[bucket] = next,
            Some(last) => {
                if let Some(last_entry) = self.entries[last].as_mut() {
                    last_entry.next = next;
                }
            }
        }

        self.entries[index] = None;
        if index < self.lowest_free_index {
            self.lowest_free_index = index;
        }

        self.size -= 1;
        debug!(index, size = self.size, "Deregistered buffer");

        if self.size < self.capacity() / 2 {
            self.check_shrink();
        }
    }

    /// Halve both tables if the load allows it and no live index sits in the
    /// upper half of the dense vector.
    fn check_shrink(&mut self) {
        let half = self.capacity() / 2;
        if self.entries[half..].iter().any(Option::is_some) {
            return;
        }

        self.rebuild(half);
    }
}
