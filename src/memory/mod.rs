//! Handle-based memory
//!
//! Allocations are addressed by 64-bit handles instead of pointers. The two
//! top bits of a handle select the regime that owns the bytes.
//!
//! # Architecture
//!
//! ```text
//! HandleAllocator (one Mutex)
//!   ├─→ SmallChunkAllocator   1..=1024 bytes
//!   │     └─→ SizeClass(n)    → chain: [buf|buf|  |buf|  |  |  |  ] step 8
//!   │                              slots per buf: 4..=127, bitmap u128
//!   ├─→ BigChunkTable         > 1024 bytes
//!   │     └─→ [buf|  |buf|buf|  |  ...] step 64, first-free cache
//!   └─→ BufferRegistry        externally owned buffers
//!         ├─→ buckets: hash(identity) → chain of entries
//!         └─→ entries: index → Weak<buffer> (hollow once the owner drops it)
//!
//! Handle
//!   63 SMALL │ 62 REGISTERED │ 61..32 identifier │ 31..0 byte position
//! ```

pub mod allocator;
pub mod big_chunk;
pub mod buffer;
pub mod handle;
pub mod primitive;
pub mod registry;
pub mod size_class;
pub mod small_chunk;

pub use allocator::{HandleAllocator, MemoryStats, MAX_ALLOCATION_SIZE};
pub use big_chunk::BigChunkTable;
pub use buffer::{BufferProvider, HeapBufferProvider, NativeBuffer, SharedBuffer};
pub use handle::{Handle, Location};
pub use primitive::Primitive;
pub use registry::BufferRegistry;
pub use size_class::SizeClass;
pub use small_chunk::SmallChunkAllocator;
