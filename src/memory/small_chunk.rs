//! Small-chunk slab allocator
//!
//! One [`SizeClass`] per byte size 1..=1024, created on first use and
//! dropped again once its chain has shrunk to nothing.

use super::buffer::{BufferProvider, NativeBuffer};
use super::handle::{Handle, SMALL_CHUNK_MAX_CHAIN_LENGTH, SMALL_CHUNK_MAX_SIZE};
use super::size_class::SizeClass;
use crate::error::{Error, Result};
use tracing::debug;

/// Slab allocator for chunks of 1 to 1024 bytes
///
/// Each chunk size has its own [`SizeClass`], so a handle's identifier
/// names both the size and the chain position of its slab buffer.
pub struct SmallChunkAllocator {
    /// Size class per chunk size index (chunk size - 1)
    classes: Vec<Option<SizeClass>>,
    max_chain_length: usize,
}

impl SmallChunkAllocator {
    /// Create an allocator whose chains hold at most `max_chain_length` buffers
    pub fn new(max_chain_length: usize) -> Self {
        Self {
            classes: (0..SMALL_CHUNK_MAX_SIZE).map(|_| None).collect(),
            max_chain_length: max_chain_length.min(SMALL_CHUNK_MAX_CHAIN_LENGTH),
        }
    }

    /// Occupy a slot of exactly `chunk_size` bytes
    ///
    /// Lower chain positions are filled first; the chain grows only when
    /// every buffer in it is full.
    pub fn allocate(&mut self, chunk_size: usize, provider: &dyn BufferProvider) -> Result<Handle> {
        if chunk_size == 0 || chunk_size > SMALL_CHUNK_MAX_SIZE {
            return Err(Error::Usage(format!(
                "Chunk size {} outside small chunk range 1..={}",
                chunk_size, SMALL_CHUNK_MAX_SIZE
            )));
        }

        let size_index = chunk_size - 1;
        let max_chain_length = self.max_chain_length;

        let class = match &mut self.classes[size_index] {
            Some(class) => class,
            empty => {
                if max_chain_length < super::size_class::CHAIN_INCREMENT {
                    return Err(Error::CapacityExceeded(format!(
                        "Slab chain limit {} is below one chain segment",
                        max_chain_length
                    )));
                }
                debug!(chunk_size, "Creating size class");
                empty.insert(SizeClass::new(chunk_size))
            }
        };

        let position = match class.find_free_position() {
            Some(position) => position,
            None => class.enlarge(max_chain_length)?,
        };

        let slot_index = class.occupy(position, provider)?;
        Ok(Handle::pack_small(size_index, position, slot_index))
    }

    /// Free an occupied slot, releasing its buffer when it was the last one in it
    pub fn free(
        &mut self,
        size_index: usize,
        chain_index: usize,
        slot_index: usize,
        provider: &dyn BufferProvider,
    ) -> Result<()> {
        let class = self.classes[size_index].as_mut().ok_or_else(|| {
            Error::InvalidAddress(format!("No allocations of chunk size {}", size_index + 1))
        })?;

        if let Some(buffer) = class.release(chain_index, slot_index)? {
            provider.deallocate_native(buffer);

            if class.shrink_from(chain_index) == 0 {
                debug!(chunk_size = size_index + 1, "Dropping empty size class");
                self.classes[size_index] = None;
            }
        }

        Ok(())
    }

    /// Slab buffer holding an occupied slot
    pub fn buffer(&self, size_index: usize, chain_index: usize, slot_index: usize) -> Option<&NativeBuffer> {
        self.classes.get(size_index)?.as_ref()?.buffer(chain_index, slot_index)
    }

    /// Mutable slab buffer holding an occupied slot
    pub fn buffer_mut(
        &mut self,
        size_index: usize,
        chain_index: usize,
        slot_index: usize,
    ) -> Option<&mut NativeBuffer> {
        self.classes
            .get_mut(size_index)?
            .as_mut()?
            .buffer_mut(chain_index, slot_index)
    }

    /// Size class for `chunk_size`, if any slot of that size is in use
    pub fn class(&self, chunk_size: usize) -> Option<&SizeClass> {
        self.classes.get(chunk_size.checked_sub(1)?)?.as_ref()
    }

    /// All live size classes
    pub fn classes(&self) -> impl Iterator<Item = &SizeClass> {
        self.classes.iter().flatten()
    }
}
