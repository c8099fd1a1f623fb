//! Handle allocator facade

use super::big_chunk::BigChunkTable;
use super::buffer::{BufferProvider, HeapBufferProvider, SharedBuffer};
use super::handle::{Handle, Location, SMALL_CHUNK_MAX_SIZE};
use super::primitive::Primitive;
use super::registry::BufferRegistry;
use super::small_chunk::SmallChunkAllocator;
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest single allocation or access length
pub const MAX_ALLOCATION_SIZE: usize = i32::MAX as usize;

/// Handle-addressed allocator
///
/// Routes each request to one of three regimes:
/// - sizes 1..=1024 to slab-backed small chunks
/// - larger sizes to a dedicated big chunk each
/// - externally owned buffers to the registry
///
/// Every public operation holds one lock for its whole duration.
pub struct HandleAllocator {
    heap: Mutex<Heap>,
    provider: Arc<dyn BufferProvider>,
}

struct Heap {
    small: SmallChunkAllocator,
    big: BigChunkTable,
    registry: BufferRegistry,
}

/// Point-in-time view of allocator occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub size_classes: usize,
    pub small_buffers: usize,
    pub small_slots_used: usize,
    pub big_chunks: usize,
    pub big_table_length: usize,
    pub registered_buffers: usize,
    pub registry_capacity: usize,
    pub hollow_encounters: u64,
}

fn regime(handle: Handle) -> &'static str {
    if handle.is_small() {
        "small"
    } else if handle.is_registered() {
        "registered"
    } else {
        "big"
    }
}

fn check_length(length: usize) -> Result<()> {
    if length > MAX_ALLOCATION_SIZE {
        return Err(Error::Usage(format!(
            "Length {} exceeds technical limit of {}",
            length, MAX_ALLOCATION_SIZE
        )));
    }
    Ok(())
}

fn unallocated(handle: Handle) -> Error {
    Error::InvalidAddress(format!("{} is not allocated", handle))
}

/// Byte range `[start, start + length)` if it stays within `limit`
fn checked_range(
    handle: Handle,
    start: usize,
    length: usize,
    limit: usize,
) -> Result<std::ops::Range<usize>> {
    match start.checked_add(length) {
        Some(end) if end <= limit => Ok(start..end),
        _ => Err(Error::InvalidAddress(format!(
            "Access of {} bytes at {} exceeds the {} byte allocation",
            length, handle, limit
        ))),
    }
}

impl Heap {
    fn read_range<R>(
        &mut self,
        handle: Handle,
        length: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        match handle.decode()? {
            Location::Small {
                size_index,
                chain_index,
                slot_index,
                ..
            } => {
                let buffer = self
                    .small
                    .buffer(size_index, chain_index, slot_index)
                    .ok_or_else(|| unallocated(handle))?;
                let limit = handle.limit().unwrap_or_default() as usize;
                let range = checked_range(handle, handle.position() as usize, length, limit)?;
                Ok(f(&buffer.as_slice()[range]))
            }
            Location::Big { index, position } => {
                let buffer = self.big.buffer(index).ok_or_else(|| unallocated(handle))?;
                let range = checked_range(handle, position, length, buffer.capacity())?;
                Ok(f(&buffer.as_slice()[range]))
            }
            Location::Registered { index, position } => {
                let shared = self.registry.lookup(index).ok_or_else(|| unallocated(handle))?;
                let buffer = shared.read();
                let range = checked_range(handle, position, length, buffer.capacity())?;
                Ok(f(&buffer.as_slice()[range]))
            }
        }
    }

    fn write_range<R>(
        &mut self,
        handle: Handle,
        length: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        match handle.decode()? {
            Location::Small {
                size_index,
                chain_index,
                slot_index,
                ..
            } => {
                let buffer = self
                    .small
                    .buffer_mut(size_index, chain_index, slot_index)
                    .ok_or_else(|| unallocated(handle))?;
                let limit = handle.limit().unwrap_or_default() as usize;
                let range = checked_range(handle, handle.position() as usize, length, limit)?;
                Ok(f(&mut buffer.as_mut_slice()[range]))
            }
            Location::Big { index, position } => {
                let buffer = self.big.buffer_mut(index).ok_or_else(|| unallocated(handle))?;
                let range = checked_range(handle, position, length, buffer.capacity())?;
                Ok(f(&mut buffer.as_mut_slice()[range]))
            }
            Location::Registered { index, position } => {
                let shared = self.registry.lookup(index).ok_or_else(|| unallocated(handle))?;
                let mut buffer = shared.write();
                let range = checked_range(handle, position, length, buffer.capacity())?;
                Ok(f(&mut buffer.as_mut_slice()[range]))
            }
        }
    }

    fn allocate(&mut self, bytes: usize, provider: &dyn BufferProvider) -> Result<Handle> {
        if bytes == 0 {
            return Ok(Handle::NULL);
        }
        check_length(bytes)?;

        let result = if bytes <= SMALL_CHUNK_MAX_SIZE {
            self.small.allocate(bytes, provider)
        } else {
            self.big.allocate(bytes, provider)
        };

        match &result {
            Ok(handle) => {
                metrics::counter!("handlemem_allocations_total", "regime" => regime(*handle))
                    .increment(1);
                debug!(bytes, handle = %handle, "Allocated");
            }
            Err(Error::CapacityExceeded(reason)) => {
                warn!(bytes, "Allocation failed: {}", reason);
            }
            Err(_) => {}
        }

        result
    }

    fn free(&mut self, handle: Handle, provider: &dyn BufferProvider) -> Result<()> {
        if handle.is_null() {
            return Ok(());
        }

        match handle.decode()? {
            Location::Small {
                size_index,
                chain_index,
                slot_index,
                offset,
            } => {
                if offset != 0 {
                    return Err(Error::Usage(format!(
                        "{} does not point at the start of a small chunk",
                        handle
                    )));
                }
                self.small.free(size_index, chain_index, slot_index, provider)?;
            }
            Location::Big { index, position } => {
                if position != 0 {
                    return Err(Error::Usage(format!(
                        "{} does not point at the start of a big chunk",
                        handle
                    )));
                }
                self.big.free(index, provider)?;
            }
            Location::Registered { index, position } => {
                if position != 0 {
                    return Err(Error::Usage(format!(
                        "{} does not point at the start of a registered buffer",
                        handle
                    )));
                }
                // the external owner keeps the buffer
                self.registry.remove_index(index)?;
            }
        }

        metrics::counter!("handlemem_frees_total", "regime" => regime(handle)).increment(1);
        debug!(handle = %handle, "Freed");
        Ok(())
    }
}

macro_rules! primitive_accessors {
    ($($get:ident, $set:ident => $ty:ty;)*) => {
        $(
            pub fn $get(&self, handle: Handle) -> Result<$ty> {
                self.get::<$ty>(handle)
            }

            pub fn $set(&self, handle: Handle, value: $ty) -> Result<()> {
                self.set::<$ty>(handle, value)
            }
        )*
    };
}

impl HandleAllocator {
    /// Allocator with default limits over the process heap
    pub fn new() -> Self {
        Self::build(&MemoryConfig::default(), Arc::new(HeapBufferProvider))
    }

    pub fn with_config(config: &MemoryConfig) -> Result<Self> {
        Self::with_provider(config, Arc::new(HeapBufferProvider))
    }

    pub fn with_provider(config: &MemoryConfig, provider: Arc<dyn BufferProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, provider))
    }

    fn build(config: &MemoryConfig, provider: Arc<dyn BufferProvider>) -> Self {
        info!(
            small_chunk_max_chain_length = config.small_chunk_max_chain_length,
            big_chunk_max_table_length = config.big_chunk_max_table_length,
            registry_max_capacity = config.registry_max_capacity,
            "Initializing handle allocator"
        );

        Self {
            heap: Mutex::new(Heap {
                small: SmallChunkAllocator::new(config.small_chunk_max_chain_length),
                big: BigChunkTable::new(config.big_chunk_max_table_length),
                registry: BufferRegistry::with_capacity(
                    config.registry_max_capacity,
                    config.registry_initial_capacity,
                ),
            }),
            provider,
        }
    }

    /// Allocate `bytes` zeroed bytes. Zero bytes yields the null handle.
    pub fn allocate(&self, bytes: usize) -> Result<Handle> {
        self.heap.lock().allocate(bytes, self.provider.as_ref())
    }

    /// Free `handle` and allocate `bytes` anew. Contents are not carried over.
    pub fn reallocate(&self, handle: Handle, bytes: usize) -> Result<Handle> {
        let mut heap = self.heap.lock();
        heap.free(handle, self.provider.as_ref())?;
        heap.allocate(bytes, self.provider.as_ref())
    }

    /// Release an allocation. The null handle is ignored; a registered
    /// handle only drops the registration.
    pub fn free(&self, handle: Handle) -> Result<()> {
        self.heap.lock().free(handle, self.provider.as_ref())
    }

    pub fn fill(&self, handle: Handle, length: usize, value: u8) -> Result<()> {
        check_length(length)?;
        self.heap
            .lock()
            .write_range(handle, length, |bytes| bytes.fill(value))
    }

    /// Copy `length` bytes between two handles. Overlapping ranges are allowed.
    pub fn copy(&self, source: Handle, destination: Handle, length: usize) -> Result<()> {
        check_length(length)?;
        let mut heap = self.heap.lock();
        let staged = heap.read_range(source, length, <[u8]>::to_vec)?;
        heap.write_range(destination, length, |bytes| bytes.copy_from_slice(&staged))
    }

    pub fn copy_to_external(&self, source: Handle, destination: &mut [u8]) -> Result<()> {
        check_length(destination.len())?;
        self.heap
            .lock()
            .read_range(source, destination.len(), |bytes| destination.copy_from_slice(bytes))
    }

    pub fn copy_from_external(&self, source: &[u8], destination: Handle) -> Result<()> {
        check_length(source.len())?;
        self.heap
            .lock()
            .write_range(destination, source.len(), |bytes| bytes.copy_from_slice(source))
    }

    /// Read consecutive values starting at `source` into `destination`
    pub fn copy_range_to_array<T: Primitive>(&self, source: Handle, destination: &mut [T]) -> Result<()> {
        let length = array_length::<T>(destination.len())?;
        self.heap.lock().read_range(source, length, |bytes| {
            for (value, raw) in destination.iter_mut().zip(bytes.chunks_exact(T::SIZE)) {
                *value = T::read_ne(raw);
            }
        })
    }

    /// Write `source` as consecutive values starting at `destination`
    pub fn copy_array_to_address<T: Primitive>(&self, source: &[T], destination: Handle) -> Result<()> {
        let length = array_length::<T>(source.len())?;
        self.heap.lock().write_range(destination, length, |bytes| {
            for (value, raw) in source.iter().zip(bytes.chunks_exact_mut(T::SIZE)) {
                value.write_ne(raw);
            }
        })
    }

    pub fn get<T: Primitive>(&self, handle: Handle) -> Result<T> {
        self.heap.lock().read_range(handle, T::SIZE, T::read_ne)
    }

    pub fn set<T: Primitive>(&self, handle: Handle, value: T) -> Result<()> {
        self.heap
            .lock()
            .write_range(handle, T::SIZE, |bytes| value.write_ne(bytes))
    }

    primitive_accessors! {
        get_byte, set_byte => i8;
        get_short, set_short => i16;
        get_char, set_char => u16;
        get_int, set_int => i32;
        get_float, set_float => f32;
        get_long, set_long => i64;
        get_double, set_double => f64;
        get_boolean, set_boolean => bool;
    }

    /// Register an externally owned buffer, returning the handle of its
    /// first byte. Registering the same buffer again yields the same handle.
    pub fn register_external_buffer(&self, buffer: &SharedBuffer) -> Result<Handle> {
        let index = self.heap.lock().registry.ensure_registered(buffer)?;
        Ok(Handle::pack_registered(index))
    }

    /// Drop a registration. Returns whether the buffer was registered.
    pub fn deregister_external_buffer(&self, buffer: &SharedBuffer) -> Result<bool> {
        let removed = self.heap.lock().registry.ensure_removed(buffer)?;
        Ok(removed.is_some())
    }

    /// Deregister `buffer` and hand its storage back to the provider if this
    /// was the last reference. Returns whether the storage was released.
    pub fn deallocate_external_buffer(&self, buffer: SharedBuffer) -> Result<bool> {
        let mut heap = self.heap.lock();
        heap.registry.ensure_removed(&buffer)?;

        let released = match Arc::try_unwrap(buffer) {
            Ok(lock) => self.provider.deallocate_native(lock.into_inner()),
            Err(_) => false,
        };
        drop(heap);

        Ok(released)
    }

    /// Bytes addressable from `handle` to the end of its allocation
    pub fn size_of_allocation(&self, handle: Handle) -> Result<usize> {
        let mut heap = self.heap.lock();
        let limit = match handle.decode()? {
            Location::Small {
                size_index,
                chain_index,
                slot_index,
                ..
            } => {
                heap.small
                    .buffer(size_index, chain_index, slot_index)
                    .ok_or_else(|| unallocated(handle))?;
                handle.limit().unwrap_or_default() as usize
            }
            Location::Big { index, .. } => heap
                .big
                .buffer(index)
                .ok_or_else(|| unallocated(handle))?
                .capacity(),
            Location::Registered { index, .. } => heap
                .registry
                .lookup(index)
                .ok_or_else(|| unallocated(handle))?
                .read()
                .capacity(),
        };

        Ok(limit.saturating_sub(handle.position() as usize))
    }

    pub fn stats(&self) -> MemoryStats {
        let heap = self.heap.lock();
        let mut stats = MemoryStats::default();

        for class in heap.small.classes() {
            stats.size_classes += 1;
            stats.small_buffers += class.buffer_count();
            stats.small_slots_used += class.occupied_slots();
        }

        stats.big_chunks = heap.big.len();
        stats.big_table_length = heap.big.table_length();
        stats.registered_buffers = heap.registry.len();
        stats.registry_capacity = heap.registry.capacity();
        stats.hollow_encounters = heap.registry.hollow_encounters();
        stats
    }
}

fn array_length<T: Primitive>(count: usize) -> Result<usize> {
    let length = count.checked_mul(T::SIZE).ok_or_else(|| {
        Error::Usage(format!("Array of {} elements is too large", count))
    })?;
    check_length(length)?;
    Ok(length)
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleAllocator")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::buffer::testing::CountingProvider;
    use crate::memory::buffer::NativeBuffer;

    fn counting() -> (Arc<CountingProvider>, HandleAllocator) {
        let provider = Arc::new(CountingProvider::default());
        let allocator =
            HandleAllocator::with_provider(&MemoryConfig::default(), provider.clone()).unwrap();
        (provider, allocator)
    }

    #[test]
    fn test_zero_size_yields_null() {
        let allocator = HandleAllocator::new();
        let handle = allocator.allocate(0).unwrap();
        assert!(handle.is_null());
        allocator.free(handle).unwrap();
    }

    #[test]
    fn test_regime_dispatch() {
        let allocator = HandleAllocator::new();
        assert!(allocator.allocate(1).unwrap().is_small());
        assert!(allocator.allocate(1024).unwrap().is_small());
        assert!(allocator.allocate(1025).unwrap().is_big());
        assert!(matches!(
            allocator.allocate(MAX_ALLOCATION_SIZE + 1),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_primitive_accessors() -> Result<()> {
        let allocator = HandleAllocator::new();
        let handle = allocator.allocate(64)?;

        allocator.set_long(handle, -42)?;
        assert_eq!(allocator.get_long(handle)?, -42);

        let at = |offset: u32| handle.checked_add(offset).unwrap();
        allocator.set_double(at(8), 2.5)?;
        allocator.set_char(at(16), 0x263A)?;
        allocator.set_boolean(at(18), true)?;
        allocator.set_byte(at(19), -1)?;
        allocator.set_float(at(20), 1.25)?;
        allocator.set_short(at(24), -300)?;
        allocator.set_int(at(28), 123_456)?;

        assert_eq!(allocator.get_double(at(8))?, 2.5);
        assert_eq!(allocator.get_char(at(16))?, 0x263A);
        assert!(allocator.get_boolean(at(18))?);
        assert_eq!(allocator.get_byte(at(19))?, -1);
        assert_eq!(allocator.get_float(at(20))?, 1.25);
        assert_eq!(allocator.get_short(at(24))?, -300);
        assert_eq!(allocator.get_int(at(28))?, 123_456);
        Ok(())
    }

    #[test]
    fn test_access_beyond_slot_rejected() -> Result<()> {
        let allocator = HandleAllocator::new();
        let handle = allocator.allocate(8)?;
        let neighbour = allocator.allocate(8)?;
        allocator.set_long(neighbour, 7)?;

        assert!(matches!(
            allocator.set_int(handle.checked_add(6).unwrap(), 1),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(allocator.fill(handle, 9, 0xFF), Err(Error::InvalidAddress(_))));
        assert_eq!(allocator.get_long(neighbour)?, 7);
        Ok(())
    }

    #[test]
    fn test_null_and_freed_handles_rejected() -> Result<()> {
        let allocator = HandleAllocator::new();
        assert!(matches!(allocator.get_int(Handle::NULL), Err(Error::InvalidAddress(_))));

        let handle = allocator.allocate(5000)?;
        allocator.free(handle)?;
        assert!(matches!(allocator.get_int(handle), Err(Error::InvalidAddress(_))));
        assert!(matches!(allocator.free(handle), Err(Error::InvalidAddress(_))));
        Ok(())
    }

    #[test]
    fn test_free_requires_chunk_start() -> Result<()> {
        let allocator = HandleAllocator::new();
        let small = allocator.allocate(16)?;
        let big = allocator.allocate(2000)?;

        assert!(matches!(allocator.free(small.checked_add(1).unwrap()), Err(Error::Usage(_))));
        assert!(matches!(allocator.free(big.checked_add(1).unwrap()), Err(Error::Usage(_))));

        allocator.free(small)?;
        allocator.free(big)?;
        Ok(())
    }

    #[test]
    fn test_reallocate() -> Result<()> {
        let (provider, allocator) = counting();
        let handle = allocator.allocate(100)?;
        let moved = allocator.reallocate(handle, 3000)?;
        assert!(moved.is_big());
        assert_eq!(allocator.size_of_allocation(moved)?, 3000);
        assert_eq!(provider.live(), 1);
        Ok(())
    }

    #[test]
    fn test_copy_across_regimes() -> Result<()> {
        let allocator = HandleAllocator::new();
        let small = allocator.allocate(32)?;
        let big = allocator.allocate(4000)?;

        let data: Vec<u8> = (0..32).collect();
        allocator.copy_from_external(&data, small)?;
        allocator.copy(small, big.checked_add(100).unwrap(), 32)?;

        let mut out = [0u8; 32];
        allocator.copy_to_external(big.checked_add(100).unwrap(), &mut out)?;
        assert_eq!(&out[..], &data[..]);
        Ok(())
    }

    #[test]
    fn test_overlapping_copy() -> Result<()> {
        let allocator = HandleAllocator::new();
        let handle = allocator.allocate(16)?;
        allocator.copy_from_external(&[1, 2, 3, 4, 5, 6, 7, 8], handle)?;
        allocator.copy(handle, handle.checked_add(2).unwrap(), 8)?;

        let mut out = [0u8; 10];
        allocator.copy_to_external(handle, &mut out)?;
        assert_eq!(out, [1, 2, 1, 2, 3, 4, 5, 6, 7, 8]);
        Ok(())
    }

    #[test]
    fn test_typed_arrays() -> Result<()> {
        let allocator = HandleAllocator::new();
        let handle = allocator.allocate(40)?;

        let values = [1.5f64, -2.0, 3.25, 0.0, 1e9];
        allocator.copy_array_to_address(&values, handle)?;
        assert_eq!(allocator.get_double(handle.checked_add(16).unwrap())?, 3.25);

        let mut back = [0f64; 5];
        allocator.copy_range_to_array(handle, &mut back)?;
        assert_eq!(back, values);

        let mut too_many = [0f64; 6];
        assert!(matches!(
            allocator.copy_range_to_array(handle, &mut too_many),
            Err(Error::InvalidAddress(_))
        ));
        Ok(())
    }

    #[test]
    fn test_registered_buffer_access() -> Result<()> {
        let allocator = HandleAllocator::new();
        let buffer = NativeBuffer::zeroed(64).into_shared();

        let handle = allocator.register_external_buffer(&buffer)?;
        assert!(handle.is_registered());
        assert_eq!(allocator.register_external_buffer(&buffer)?, handle);

        allocator.set_int(handle.checked_add(4).unwrap(), 99)?;
        assert_eq!(&buffer.read().as_slice()[4..8], &99i32.to_ne_bytes());
        assert_eq!(allocator.size_of_allocation(handle)?, 64);

        // copy within the same registered buffer
        allocator.copy(handle.checked_add(4).unwrap(), handle.checked_add(40).unwrap(), 4)?;
        assert_eq!(allocator.get_int(handle.checked_add(40).unwrap())?, 99);

        assert!(allocator.deregister_external_buffer(&buffer)?);
        assert!(!allocator.deregister_external_buffer(&buffer)?);
        assert!(matches!(allocator.get_int(handle), Err(Error::InvalidAddress(_))));
        Ok(())
    }

    #[test]
    fn test_free_registered_handle_deregisters() -> Result<()> {
        let allocator = HandleAllocator::new();
        let buffer = NativeBuffer::zeroed(16).into_shared();
        let handle = allocator.register_external_buffer(&buffer)?;

        allocator.free(handle)?;
        assert_eq!(allocator.stats().registered_buffers, 0);
        // the owner still has its buffer
        assert_eq!(buffer.read().capacity(), 16);
        Ok(())
    }

    #[test]
    fn test_deallocate_external_buffer() -> Result<()> {
        let (provider, allocator) = counting();
        let buffer = provider.allocate_native(128)?.into_shared();
        let extra = buffer.clone();
        allocator.register_external_buffer(&buffer)?;

        assert!(!allocator.deallocate_external_buffer(buffer)?);
        assert_eq!(provider.live(), 1);

        assert!(allocator.deallocate_external_buffer(extra)?);
        assert_eq!(provider.live(), 0);
        assert_eq!(allocator.stats().registered_buffers, 0);
        Ok(())
    }

    #[test]
    fn test_deallocate_unregistered_last_reference() -> Result<()> {
        let (provider, allocator) = counting();
        let buffer = provider.allocate_native(64)?.into_shared();

        assert!(allocator.deallocate_external_buffer(buffer)?);
        assert_eq!(provider.live(), 0);
        Ok(())
    }

    #[test]
    fn test_handle_at_top_of_position_range() -> Result<()> {
        let allocator = HandleAllocator::new();
        let handle = allocator.allocate(1)?;
        let top = handle.checked_add(u32::MAX).unwrap();

        assert!(matches!(allocator.get_byte(top), Err(Error::InvalidAddress(_))));
        assert!(matches!(allocator.size_of_allocation(top), Err(Error::InvalidAddress(_))));
        assert_eq!(allocator.size_of_allocation(handle)?, 1);
        Ok(())
    }

    #[test]
    fn test_configured_limits_are_exact() -> Result<()> {
        let config = MemoryConfig {
            small_chunk_max_chain_length: 12,
            big_chunk_max_table_length: 10,
            ..Default::default()
        };
        let allocator = HandleAllocator::with_config(&config)?;

        for _ in 0..10 {
            allocator.allocate(5000)?;
        }
        assert!(matches!(allocator.allocate(5000), Err(Error::CapacityExceeded(_))));

        // 4 chunks of 1024 bytes per buffer
        for _ in 0..48 {
            allocator.allocate(1024)?;
        }
        assert!(matches!(allocator.allocate(1024), Err(Error::CapacityExceeded(_))));

        let stats = allocator.stats();
        assert_eq!(stats.big_chunks, 10);
        assert_eq!(stats.small_buffers, 12);
        Ok(())
    }

    #[test]
    fn test_stats() -> Result<()> {
        let allocator = HandleAllocator::new();
        allocator.allocate(10)?;
        allocator.allocate(10)?;
        allocator.allocate(20)?;
        allocator.allocate(70_000)?;
        let buffer = NativeBuffer::zeroed(8).into_shared();
        allocator.register_external_buffer(&buffer)?;

        let stats = allocator.stats();
        assert_eq!(stats.size_classes, 2);
        assert_eq!(stats.small_buffers, 2);
        assert_eq!(stats.small_slots_used, 3);
        assert_eq!(stats.big_chunks, 1);
        assert_eq!(stats.registered_buffers, 1);
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MemoryConfig {
            registry_max_capacity: 3,
            ..Default::default()
        };
        assert!(matches!(HandleAllocator::with_config(&config), Err(Error::Config(_))));
    }
}
