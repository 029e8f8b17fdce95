//! Virtual block addressing.
//!
//! A [`VirtualBlock`] packs a tablespace index and a physical byte offset into
//! a single 64-bit number.  The top [`TABLESPACE_BITS`] bits select the
//! tablespace and the remaining bits hold the offset of the block within that
//! tablespace's file.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of high-order bits that select a tablespace.
pub const TABLESPACE_BITS: u32 = 3;

/// Maximum number of tablespaces in a database.
pub const MAX_TABLESPACES: usize = 1 << TABLESPACE_BITS;

/// Number of low-order bits that hold the physical offset.
pub const OFFSET_BITS: u32 = u64::BITS - TABLESPACE_BITS;

/// Largest physical offset that can be encoded, plus one.
pub const MAX_OFFSET: u64 = 1 << OFFSET_BITS;

const OFFSET_MASK: u64 = MAX_OFFSET - 1;

/// An error building a [`VirtualBlock`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("tablespace {0} is out of range (at most {MAX_TABLESPACES} tablespaces)")]
    TablespaceOutOfRange(usize),

    #[error("offset {0:#x} does not fit in {OFFSET_BITS} bits")]
    OffsetOutOfRange(u64),
}

/// A block address that encodes both tablespace and physical offset.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VirtualBlock(u64);

impl VirtualBlock {
    /// Encodes `offset` within `tablespace`.
    pub fn new(tablespace: usize, offset: u64) -> Result<Self, AddressError> {
        if tablespace >= MAX_TABLESPACES {
            return Err(AddressError::TablespaceOutOfRange(tablespace));
        }
        if offset >= MAX_OFFSET {
            return Err(AddressError::OffsetOutOfRange(offset));
        }
        Ok(Self(((tablespace as u64) << OFFSET_BITS) | offset))
    }

    /// Reinterprets a raw 64-bit address.  Every raw value decodes to some
    /// valid (tablespace, offset) pair.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn tablespace(self) -> usize {
        (self.0 >> OFFSET_BITS) as usize
    }

    pub const fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// Returns `(tablespace, offset)`.
    pub const fn decode(self) -> (usize, u64) {
        (self.tablespace(), self.offset())
    }
}

impl Display for VirtualBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.tablespace(), self.offset())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{AddressError, VirtualBlock, MAX_OFFSET, MAX_TABLESPACES};

    proptest! {
        #[test]
        fn decode_inverts_encode(tablespace in 0..MAX_TABLESPACES, offset in 0..MAX_OFFSET) {
            let block = VirtualBlock::new(tablespace, offset).unwrap();
            prop_assert_eq!(block.decode(), (tablespace, offset));
            prop_assert_eq!(VirtualBlock::from_raw(block.raw()), block);
        }
    }

    #[test]
    fn top_bits_select_tablespace() {
        let block = VirtualBlock::new(7, 4096).unwrap();
        assert_eq!(block.raw() >> 61, 7);
        assert_eq!(block.raw() & 0xffff, 4096);
        assert_eq!(VirtualBlock::new(0, 0).unwrap().raw(), 0);
    }

    #[test]
    fn out_of_range() {
        assert_eq!(
            VirtualBlock::new(MAX_TABLESPACES, 0),
            Err(AddressError::TablespaceOutOfRange(8))
        );
        assert_eq!(
            VirtualBlock::new(0, MAX_OFFSET),
            Err(AddressError::OffsetOutOfRange(MAX_OFFSET))
        );
    }
}
