//! Backing buffers and the provider that creates and releases them

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Contiguous, zero-initialized byte region addressed in native byte order
pub struct NativeBuffer {
    bytes: Box<[u8]>,
}

/// A buffer owned outside the allocator and shared with it by registration
pub type SharedBuffer = Arc<RwLock<NativeBuffer>>;

impl NativeBuffer {
    /// Create a zeroed buffer of `capacity` bytes
    pub fn zeroed(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// Wrap the buffer for registration with an allocator
    pub fn into_shared(self) -> SharedBuffer {
        Arc::new(RwLock::new(self))
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl From<Vec<u8>> for NativeBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }
}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Source of backing buffers
///
/// Buffers handed out by `allocate_native` are returned through
/// `deallocate_native` exactly once, when their last occupant is freed.
pub trait BufferProvider: Send + Sync {
    fn allocate_native(&self, capacity: usize) -> Result<NativeBuffer>;

    /// Release a buffer. Returns whether the provider actually reclaimed it.
    fn deallocate_native(&self, buffer: NativeBuffer) -> bool;
}

/// Provider backed by the process heap
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBufferProvider;

impl BufferProvider for HeapBufferProvider {
    fn allocate_native(&self, capacity: usize) -> Result<NativeBuffer> {
        if capacity > i32::MAX as usize {
            return Err(Error::Usage(format!(
                "Buffer capacity {} exceeds technical limit of {}",
                capacity,
                i32::MAX
            )));
        }

        Ok(NativeBuffer::zeroed(capacity))
    }

    fn deallocate_native(&self, buffer: NativeBuffer) -> bool {
        drop(buffer);
        true
    }
}
