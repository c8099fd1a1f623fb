//! Big-chunk table: one dedicated backing buffer per allocation

use super::buffer::{BufferProvider, NativeBuffer};
use super::handle::{Handle, BIG_CHUNK_MAX_TABLE_LENGTH};
use crate::error::{Error, Result};
use tracing::{debug, warn};

/// Table positions added or removed at a time
pub const TABLE_INCREMENT: usize = 64;

/// Marker for "no free position known"
const NO_FREE_INDEX: usize = usize::MAX;

/// Table of big chunks, one backing buffer per allocation
///
/// Indices are handed out lowest first. The table grows and shrinks in
/// steps of [`TABLE_INCREMENT`] and never holds more than `max_length`
/// chunks.
pub struct BigChunkTable {
    buffers: Vec<Option<NativeBuffer>>,
    /// Lowest free index, or anything at or past the end when unknown
    first_free: usize,
    max_length: usize,
}

impl BigChunkTable {
    /// Create an empty table of one increment
    pub fn new(max_length: usize) -> Self {
        Self {
            buffers: (0..TABLE_INCREMENT).map(|_| None).collect(),
            first_free: 0,
            max_length: max_length.min(BIG_CHUNK_MAX_TABLE_LENGTH),
        }
    }

    /// Allocate a dedicated buffer of `size` bytes at the lowest free index
    pub fn allocate(&mut self, size: usize, provider: &dyn BufferProvider) -> Result<Handle> {
        if self.first_free < self.buffers.len() && self.first_free < self.max_length {
            let index = self.first_free;
            self.buffers[index] = Some(provider.allocate_native(size)?);
            self.seek_next_free(index);
            return Ok(Handle::pack_big(index));
        }

        self.enlarge_and_allocate(size, provider)
    }

    /// The table is not grown eagerly when it becomes full; a free before the
    /// next allocation may make room again.
    fn seek_next_free(&mut self, used_index: usize) {
        self.first_free = self.buffers[used_index + 1..]
            .iter()
            .position(Option::is_none)
            .map_or(NO_FREE_INDEX, |i| used_index + 1 + i);
    }

    fn enlarge_and_allocate(&mut self, size: usize, provider: &dyn BufferProvider) -> Result<Handle> {
        let index = self.buffers.len();

        // every index below the limit is taken
        if index >= self.max_length {
            warn!(max_length = self.max_length, "Big chunk table full");
            return Err(Error::CapacityExceeded(format!(
                "Big chunk table cannot hold more than {} entries",
                self.max_length
            )));
        }
        let new_length = (index + TABLE_INCREMENT).min(self.max_length);

        let buffer = provider.allocate_native(size)?;
        self.buffers.resize_with(new_length, || None);
        self.buffers[index] = Some(buffer);
        self.first_free = index + 1;

        debug!(table_length = new_length, "Enlarged big chunk table");
        Ok(Handle::pack_big(index))
    }

    /// Release the chunk at `index` and hand its buffer back to `provider`
    pub fn free(&mut self, index: usize, provider: &dyn BufferProvider) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| Error::InvalidAddress(format!("No big chunk at index {}", index)))?;

        provider.deallocate_native(buffer);

        if index < self.first_free {
            self.first_free = index;
        }

        self.check_for_decrease(index);
        Ok(())
    }

    fn check_for_decrease(&mut self, index: usize) {
        if self.buffers[index..].iter().any(Option::is_some) {
            return;
        }

        // keep every used index, in whole increments
        let used = self.buffers[..index].iter().rposition(Option::is_some).map_or(0, |i| i + 1);
        let new_length = (used.div_ceil(TABLE_INCREMENT) * TABLE_INCREMENT).max(TABLE_INCREMENT);

        if new_length < self.buffers.len() {
            self.buffers.truncate(new_length);
            debug!(table_length = new_length, "Shrunk big chunk table");
        }
    }

    /// Buffer of the chunk at `index`, if allocated
    pub fn buffer(&self, index: usize) -> Option<&NativeBuffer> {
        self.buffers.get(index)?.as_ref()
    }

    pub fn buffer_mut(&mut self, index: usize) -> Option<&mut NativeBuffer> {
        self.buffers.get_mut(index)?.as_mut()
    }

    /// Number of allocated chunks
    pub fn len(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(Option::is_none)
    }

    /// Current number of table positions, free or not
    pub fn table_length(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::buffer::testing::CountingProvider;
    use crate::memory::handle::Location;

    fn index_of(handle: Handle) -> usize {
        match handle.decode().unwrap() {
            Location::Big { index, .. } => index,
            other => panic!("Expected big location, got {}", other),
        }
    }

    #[test]
    fn test_index_reuse() {
        let provider = CountingProvider::default();
        let mut table = BigChunkTable::new(BIG_CHUNK_MAX_TABLE_LENGTH);

        let handle = table.allocate(5000, &provider).unwrap();
        assert_eq!(index_of(handle), 0);
        table.free(0, &provider).unwrap();

        let again = table.allocate(5000, &provider).unwrap();
        assert_eq!(index_of(again), 0);
        assert_eq!(table.buffer(0).unwrap().capacity(), 5000);
    }

    #[test]
    fn test_lowest_free_index_first() {
        let provider = CountingProvider::default();
        let mut table = BigChunkTable::new(BIG_CHUNK_MAX_TABLE_LENGTH);

        for _ in 0..4 {
            table.allocate(2000, &provider).unwrap();
        }
        table.free(2, &provider).unwrap();
        table.free(1, &provider).unwrap();

        assert_eq!(index_of(table.allocate(2000, &provider).unwrap()), 1);
        assert_eq!(index_of(table.allocate(2000, &provider).unwrap()), 2);
        assert_eq!(index_of(table.allocate(2000, &provider).unwrap()), 4);
    }

    #[test]
    fn test_grow_and_shrink() {
        let provider = CountingProvider::default();
        let mut table = BigChunkTable::new(BIG_CHUNK_MAX_TABLE_LENGTH);

        for _ in 0..TABLE_INCREMENT {
            table.allocate(1100, &provider).unwrap();
        }
        assert_eq!(table.table_length(), TABLE_INCREMENT);

        let overflow = table.allocate(1100, &provider).unwrap();
        assert_eq!(index_of(overflow), TABLE_INCREMENT);
        assert_eq!(table.table_length(), 2 * TABLE_INCREMENT);

        table.free(TABLE_INCREMENT, &provider).unwrap();
        assert_eq!(table.table_length(), TABLE_INCREMENT);

        for index in 0..TABLE_INCREMENT {
            table.free(index, &provider).unwrap();
        }
        // never below one increment
        assert_eq!(table.table_length(), TABLE_INCREMENT);
        assert!(table.is_empty());
        assert_eq!(provider.live(), 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let provider = CountingProvider::default();
        let mut table = BigChunkTable::new(BIG_CHUNK_MAX_TABLE_LENGTH);

        table.allocate(4096, &provider).unwrap();
        table.free(0, &provider).unwrap();
        assert!(matches!(table.free(0, &provider), Err(Error::InvalidAddress(_))));
        assert!(matches!(table.free(10_000, &provider), Err(Error::InvalidAddress(_))));
        assert_eq!(provider.released.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_table_limit() {
        let provider = CountingProvider::default();
        let mut table = BigChunkTable::new(TABLE_INCREMENT);

        for _ in 0..TABLE_INCREMENT {
            table.allocate(2048, &provider).unwrap();
        }
        assert!(matches!(
            table.allocate(2048, &provider),
            Err(Error::CapacityExceeded(_))
        ));
        assert_eq!(table.len(), TABLE_INCREMENT);
        assert_eq!(provider.live(), TABLE_INCREMENT);

        table.free(7, &provider).unwrap();
        assert_eq!(index_of(table.allocate(2048, &provider).unwrap()), 7);
    }

    #[test]
    fn test_limit_below_one_increment() {
        let provider = CountingProvider::default();
        let mut table = BigChunkTable::new(10);

        for index in 0..10 {
            assert_eq!(index_of(table.allocate(5000, &provider).unwrap()), index);
        }
        assert!(matches!(
            table.allocate(5000, &provider),
            Err(Error::CapacityExceeded(_))
        ));
        assert_eq!(table.len(), 10);
        assert_eq!(provider.live(), 10);

        table.free(3, &provider).unwrap();
        assert_eq!(index_of(table.allocate(5000, &provider).unwrap()), 3);
    }

    #[test]
    fn test_limit_between_increments() {
        let provider = CountingProvider::default();
        let mut table = BigChunkTable::new(100);

        for _ in 0..100 {
            table.allocate(1500, &provider).unwrap();
        }
        assert_eq!(table.table_length(), 100);
        assert!(matches!(
            table.allocate(1500, &provider),
            Err(Error::CapacityExceeded(_))
        ));

        for index in (64..100).rev() {
            table.free(index, &provider).unwrap();
        }
        assert_eq!(table.table_length(), TABLE_INCREMENT);
    }
}
