//! Size class management for the small-chunk slab allocator

use super::buffer::{BufferProvider, NativeBuffer};
use crate::error::{Error, Result};
use tracing::{debug, error};

/// Footprint ceiling of one slab buffer (bytes)
pub const SLAB_MAX_BUFFER_SIZE: usize = 4096;

/// Slots per slab never exceed this, regardless of chunk size
pub const SLAB_MAX_SLOT_COUNT: usize = 127;

/// Chain positions added or removed at a time
pub const CHAIN_INCREMENT: usize = 8;

const SIZE_4_SLOTS: usize = 1 + SLAB_MAX_BUFFER_SIZE / 5;
const SIZE_5_SLOTS: usize = 1 + SLAB_MAX_BUFFER_SIZE / 6;
const SIZE_6_SLOTS: usize = 1 + SLAB_MAX_BUFFER_SIZE / 7;
const SIZE_7_SLOTS: usize = 1 + SLAB_MAX_BUFFER_SIZE / 8;
const SIZE_8_SLOTS: usize = 1 + SLAB_MAX_BUFFER_SIZE / 9;
const SIZE_MAX_SLOTS: usize = 1 + SLAB_MAX_BUFFER_SIZE / SLAB_MAX_SLOT_COUNT;

/// Number of slots per slab buffer for the given chunk size
///
/// Small chunks get the maximum slot count, larger ones as many as fit
/// into the footprint ceiling.
pub fn calculate_slot_count(chunk_size: usize) -> usize {
    if chunk_size >= SIZE_8_SLOTS {
        return match chunk_size {
            s if s >= SIZE_4_SLOTS => 4,
            s if s >= SIZE_5_SLOTS => 5,
            s if s >= SIZE_6_SLOTS => 6,
            s if s >= SIZE_7_SLOTS => 7,
            _ => 8,
        };
    }
    if chunk_size < SIZE_MAX_SLOTS {
        return SLAB_MAX_SLOT_COUNT;
    }

    SLAB_MAX_BUFFER_SIZE / chunk_size
}

/// All slabs of one chunk size
///
/// The chain vectors run in parallel: position `i` has an optional backing
/// buffer, its occupied slot count and its slot bitmap.
#[derive(Debug)]
pub struct SizeClass {
    /// Size of slots in this class (bytes)
    chunk_size: usize,
    /// Slots per backing buffer
    slot_count: usize,
    /// Backing buffer per chain position
    buffers: Vec<Option<NativeBuffer>>,
    /// Occupied slots per chain position
    occupancy: Vec<u8>,
    /// Slot bitmap per chain position, bit `n` set = slot `n` occupied
    slots: Vec<u128>,
}

impl SizeClass {
    /// Create a size class with one initial chain segment and nothing allocated
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            slot_count: calculate_slot_count(chunk_size),
            buffers: (0..CHAIN_INCREMENT).map(|_| None).collect(),
            occupancy: vec![0; CHAIN_INCREMENT],
            slots: vec![0; CHAIN_INCREMENT],
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn chain_length(&self) -> usize {
        self.buffers.len()
    }

    /// Number of chain positions currently backed by a buffer
    pub fn buffer_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    /// Total occupied slots across the chain
    pub fn occupied_slots(&self) -> usize {
        self.occupancy.iter().map(|&c| c as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy.iter().all(|&c| c == 0)
    }

    /// First chain position with a free slot
    pub fn find_free_position(&self) -> Option<usize> {
        let slot_count = self.slot_count;
        self.occupancy
            .iter()
            .position(|&count| (count as usize) < slot_count)
    }

    /// Grow the chain by one increment, or up to `max_chain_length` if that
    /// is closer. Returns the first new position.
    pub fn enlarge(&mut self, max_chain_length: usize) -> Result<usize> {
        let old_length = self.chain_length();

        // chain indices must fit into the identifier part of a handle
        if old_length >= max_chain_length {
            return Err(Error::CapacityExceeded(format!(
                "Slab chain for chunk size {} cannot grow beyond {} buffers",
                self.chunk_size, max_chain_length
            )));
        }
        let new_length = (old_length + CHAIN_INCREMENT).min(max_chain_length);

        self.buffers.resize_with(new_length, || None);
        self.occupancy.resize(new_length, 0);
        self.slots.resize(new_length, 0);

        debug!(
            chunk_size = self.chunk_size,
            chain_length = new_length,
            "Enlarged slab chain"
        );
        Ok(old_length)
    }

    /// Occupy the first free slot at `position`, creating its buffer if needed.
    ///
    /// Only called for positions known to have a free slot.
    pub fn occupy(&mut self, position: usize, provider: &dyn BufferProvider) -> Result<usize> {
        if self.occupancy[position] == 0 {
            self.buffers[position] = Some(provider.allocate_native(self.slot_count * self.chunk_size)?);
            self.slots[position] = 0;
        }

        let slot_index = (!self.slots[position]).trailing_zeros() as usize;
        if slot_index >= self.slot_count {
            error!(
                chunk_size = self.chunk_size,
                position,
                occupancy = self.occupancy[position],
                "No free slot in slab buffer"
            );
            return Err(Error::InconsistentState(format!(
                "No free slot found for chunk size {} at chain position {} (occupancy {})",
                self.chunk_size, position, self.occupancy[position]
            )));
        }

        self.slots[position] |= 1 << slot_index;
        self.occupancy[position] += 1;

        Ok(slot_index)
    }

    /// Release an occupied slot
    ///
    /// Returns the backing buffer when the slot was the last one occupied at
    /// that position. The caller hands it back to its provider.
    pub fn release(&mut self, position: usize, slot_index: usize) -> Result<Option<NativeBuffer>> {
        let occupied = position < self.chain_length()
            && slot_index < self.slot_count
            && self.slots[position] & (1 << slot_index) != 0;
        if !occupied {
            return Err(Error::InvalidAddress(format!(
                "No allocation of chunk size {} at chain position {} slot {}",
                self.chunk_size, position, slot_index
            )));
        }
        if self.occupancy[position] == 0 {
            error!(chunk_size = self.chunk_size, position, "Slot bitmap and occupancy disagree");
            return Err(Error::InconsistentState(format!(
                "Occupied slot in empty slab buffer for chunk size {} at chain position {}",
                self.chunk_size, position
            )));
        }

        self.slots[position] &= !(1 << slot_index);
        self.occupancy[position] -= 1;

        if self.occupancy[position] > 0 {
            return Ok(None);
        }

        Ok(self.buffers[position].take())
    }

    /// Shrink the chain after `position` became empty
    ///
    /// Nothing happens if any position from `position` to the end is still
    /// occupied. Otherwise the chain is cut to the smallest multiple of the
    /// increment that keeps every occupied position. Returns the new length.
    pub fn shrink_from(&mut self, position: usize) -> usize {
        if self.buffers[position..].iter().any(Option::is_some) {
            return self.chain_length();
        }

        let used = self.buffers[..position]
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |i| i + 1);
        let new_length = used.div_ceil(CHAIN_INCREMENT) * CHAIN_INCREMENT;

        if new_length < self.chain_length() {
            self.buffers.truncate(new_length);
            self.occupancy.truncate(new_length);
            self.slots.truncate(new_length);
            debug!(
                chunk_size = self.chunk_size,
                chain_length = new_length,
                "Shrunk slab chain"
            );
        }

        new_length
    }

    /// Backing buffer holding an occupied slot
    pub fn buffer(&self, position: usize, slot_index: usize) -> Option<&NativeBuffer> {
        self.occupied(position, slot_index)?;
        self.buffers[position].as_ref()
    }

    pub fn buffer_mut(&mut self, position: usize, slot_index: usize) -> Option<&mut NativeBuffer> {
        self.occupied(position, slot_index)?;
        self.buffers[position].as_mut()
    }

    fn occupied(&self, position: usize, slot_index: usize) -> Option<()> {
        let bits = *self.slots.get(position)?;
        (slot_index < self.slot_count && bits & (1 << slot_index) != 0).then_some(())
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for position in 0..self.chain_length() {
            assert_eq!(
                self.occupancy[position] as u32,
                self.slots[position].count_ones(),
                "count/bitmap mismatch at {}",
                position
            );
            assert_eq!(self.occupancy[position] == 0, self.buffers[position].is_none());
        }
    }
}
