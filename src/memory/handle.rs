//! Handle packing for the three allocation regimes
//!
//! ```text
//!  63   62   61 ............. 32   31 .............. 0
//! [S ] [R ] [   identifier     ]  [ buffer position  ]
//!
//! small:      S=1  identifier = size_index(10) << 20 | chain_index(20)
//! big:        S=0 R=0  identifier = table index + 1
//! registered: S=0 R=1  identifier = registry index
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const IDENTIFIER_SHIFT: u32 = 32;

pub const SMALL_FLAG: u64 = 1 << 63;
pub const REGISTERED_FLAG: u64 = 1 << 62;

const FLAG_MASK: u64 = SMALL_FLAG | REGISTERED_FLAG;
const POSITION_MASK: u64 = u32::MAX as u64;

pub const SMALL_CHUNK_SIZE_BITS: u32 = 10;
pub const SMALL_CHUNK_CHAIN_BITS: u32 = 20;
const SMALL_CHUNK_CHAIN_MASK: u32 = (1 << SMALL_CHUNK_CHAIN_BITS) - 1;

/// Largest byte size served by slabs.
pub const SMALL_CHUNK_MAX_SIZE: usize = 1 << SMALL_CHUNK_SIZE_BITS;

/// Number of chain positions addressable by a small handle.
pub const SMALL_CHUNK_MAX_CHAIN_LENGTH: usize = 1 << SMALL_CHUNK_CHAIN_BITS;

/// Identifier bits left between the flags and the position.
const IDENTIFIER_BITS: u32 = 62 - IDENTIFIER_SHIFT;

/// Big chunk identifiers are `index + 1`, so the highest identifier is reserved.
pub const BIG_CHUNK_MAX_TABLE_LENGTH: usize = (1 << IDENTIFIER_BITS) - 1;

pub const REGISTERED_MAX_CAPACITY: usize = 1 << IDENTIFIER_BITS;

/// Opaque 64-bit address of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u64);

/// A handle decoded into its regime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Small {
        size_index: usize,
        chain_index: usize,
        slot_index: usize,
        /// Byte offset inside the slot
        offset: usize,
    },
    Big {
        index: usize,
        position: usize,
    },
    Registered {
        index: usize,
        position: usize,
    },
}

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn is_small(self) -> bool {
        self.0 & SMALL_FLAG != 0
    }

    /// Only meaningful when the small flag is clear.
    pub const fn is_registered(self) -> bool {
        !self.is_small() && self.0 & REGISTERED_FLAG != 0
    }

    pub const fn is_big(self) -> bool {
        self.0 & FLAG_MASK == 0
    }

    /// Byte position inside the backing buffer.
    pub const fn position(self) -> u32 {
        self.0 as u32
    }

    /// Address of the first byte of slot `slot_index` in chain position `chain_index`
    /// of the size class `size_index` (chunk size minus one).
    pub fn pack_small(size_index: usize, chain_index: usize, slot_index: usize) -> Self {
        debug_assert!(size_index < SMALL_CHUNK_MAX_SIZE);
        debug_assert!(chain_index < SMALL_CHUNK_MAX_CHAIN_LENGTH);

        let identifier = (size_index as u64) << SMALL_CHUNK_CHAIN_BITS | chain_index as u64;
        let position = (slot_index * (size_index + 1)) as u64;

        Self(SMALL_FLAG | identifier << IDENTIFIER_SHIFT | position)
    }

    pub fn pack_big(index: usize) -> Self {
        debug_assert!(index < BIG_CHUNK_MAX_TABLE_LENGTH);
        // +1 keeps index 0 away from the null handle
        Self(((index as u64) + 1) << IDENTIFIER_SHIFT)
    }

    pub fn pack_registered(index: usize) -> Self {
        debug_assert!(index < REGISTERED_MAX_CAPACITY);
        Self(REGISTERED_FLAG | (index as u64) << IDENTIFIER_SHIFT)
    }

    fn identifier(self) -> u32 {
        ((self.0 & !FLAG_MASK) >> IDENTIFIER_SHIFT) as u32
    }

    fn chunk_size(self) -> usize {
        (self.identifier() >> SMALL_CHUNK_CHAIN_BITS) as usize + 1
    }

    /// Exclusive upper bound of the addressable range.
    ///
    /// Only small handles know their bound; for big and registered handles the
    /// bound is the capacity of the backing buffer and `None` is returned.
    /// Slot ends past the position range saturate at `u32::MAX`.
    pub fn limit(self) -> Option<u32> {
        if !self.is_small() {
            return None;
        }

        let chunk_size = self.chunk_size() as u64;
        let slot_index = self.position() as u64 / chunk_size;
        let end = (slot_index + 1) * chunk_size;
        Some(end.min(u32::MAX as u64) as u32)
    }

    /// Decode into a tagged location. Fails on the null handle.
    pub fn decode(self) -> Result<Location> {
        if self.is_null() {
            return Err(Error::InvalidAddress("null handle".to_string()));
        }

        let position = self.position() as usize;

        if self.is_small() {
            let identifier = self.identifier();
            let chunk_size = self.chunk_size();
            let slot_index = position / chunk_size;

            return Ok(Location::Small {
                size_index: chunk_size - 1,
                chain_index: (identifier & SMALL_CHUNK_CHAIN_MASK) as usize,
                slot_index,
                offset: position - slot_index * chunk_size,
            });
        }

        if self.is_registered() {
            return Ok(Location::Registered {
                index: self.identifier() as usize,
                position,
            });
        }

        match self.identifier() {
            0 => Err(Error::InvalidAddress(format!(
                "{} has no buffer identifier",
                self
            ))),
            identifier => Ok(Location::Big {
                index: identifier as usize - 1,
                position,
            }),
        }
    }

    /// Handle `bytes` further into the same buffer, if the position does not overflow.
    pub fn checked_add(self, bytes: u32) -> Option<Handle> {
        let position = self.position().checked_add(bytes)?;
        Some(Self(self.0 & !POSITION_MASK | position as u64))
    }
}

impl From<Handle> for u64 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#018x})", self.0)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Small {
                size_index,
                chain_index,
                slot_index,
                offset,
            } => write!(
                f,
                "Small(size={}, chain={}, slot={}, offset={})",
                size_index + 1,
                chain_index,
                slot_index,
                offset
            ),
            Location::Big { index, position } => {
                write!(f, "Big(index={}, position={})", index, position)
            }
            Location::Registered { index, position } => {
                write!(f, "Registered(index={}, position={})", index, position)
            }
        }
    }
}
