//! # Block format
//!
//! Every tablespace file is a sequence of fixed-size blocks.  Each block
//! begins with a 24-byte [`BlockHeader`], serialized little-endian with
//! [`mod@binrw`], followed by the payload, zero-padded to the block size.
//!
//! Blocks form chains through their `prev_block`/`next_block` pointers, which
//! hold virtual block numbers or [`NO_BLOCK`].  A block with no chain pointers
//! and no bytes in use is free: the allocator may hand it out.

use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Chain pointer value meaning "no block".
pub const NO_BLOCK: i64 = -1;

/// Size of the serialized [`BlockHeader`].
pub const HEADER_SIZE: usize = 24;

/// Header at the beginning of each block.
///
/// Serialized and deserialized automatically with [`mod@binrw`].
#[binrw]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub prev_block: i64,
    pub next_block: i64,
    pub bytes_in_use: u32,
    pub bytes_used: u32,
}

impl BlockHeader {
    /// Header of a block that has never been used.
    pub const FREE: BlockHeader = BlockHeader {
        prev_block: NO_BLOCK,
        next_block: NO_BLOCK,
        bytes_in_use: 0,
        bytes_used: 0,
    };

    pub fn is_free(&self) -> bool {
        *self == Self::FREE
    }

    /// Parses the header at the start of `raw`.
    pub fn parse(raw: &[u8]) -> Result<Self, StorageError> {
        if raw.len() < HEADER_SIZE {
            return Err(StorageError::Corrupt(format!(
                "{} bytes is too short for a block header",
                raw.len()
            )));
        }
        BlockHeader::read_le(&mut Cursor::new(&raw[..HEADER_SIZE]))
            .map_err(|e| StorageError::Corrupt(e.to_string()))
    }
}

/// One physical page of a tablespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub prev_block: i64,
    pub next_block: i64,
    pub bytes_in_use: u32,
    pub bytes_used: u32,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Block {
    /// Number of payload bytes in a block of `block_size` bytes.
    pub const fn capacity(block_size: usize) -> usize {
        block_size - HEADER_SIZE
    }

    /// A free block of `block_size` bytes.
    pub fn free(block_size: usize) -> Self {
        Self::from_parts(BlockHeader::FREE, vec![0; Self::capacity(block_size)])
    }

    /// An unchained block holding `payload`.
    pub fn with_payload(block_size: usize, payload: &[u8]) -> Result<Self, StorageError> {
        let capacity = Self::capacity(block_size);
        if payload.len() > capacity {
            return Err(StorageError::BadBlockLength {
                len: payload.len() + HEADER_SIZE,
                block_size,
            });
        }
        let mut data = vec![0; capacity];
        data[..payload.len()].copy_from_slice(payload);
        let used = payload.len() as u32;
        Ok(Self::from_parts(
            BlockHeader {
                prev_block: NO_BLOCK,
                next_block: NO_BLOCK,
                bytes_in_use: used,
                bytes_used: used,
            },
            data,
        ))
    }

    fn from_parts(header: BlockHeader, data: Vec<u8>) -> Self {
        Self {
            prev_block: header.prev_block,
            next_block: header.next_block,
            bytes_in_use: header.bytes_in_use,
            bytes_used: header.bytes_used,
            data,
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            prev_block: self.prev_block,
            next_block: self.next_block,
            bytes_in_use: self.bytes_in_use,
            bytes_used: self.bytes_used,
        }
    }

    /// The first `bytes_used` bytes of the payload.
    pub fn payload(&self) -> &[u8] {
        let used = (self.bytes_used as usize).min(self.data.len());
        &self.data[..used]
    }

    pub fn is_free(&self) -> bool {
        self.header().is_free()
    }

    /// Serializes the block into exactly `block_size` bytes.
    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, StorageError> {
        if self.data.len() > Self::capacity(block_size) {
            return Err(StorageError::BadBlockLength {
                len: self.data.len() + HEADER_SIZE,
                block_size,
            });
        }
        let mut raw = Vec::with_capacity(block_size);
        self.header()
            .write_le(&mut Cursor::new(&mut raw))
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        raw.extend_from_slice(&self.data);
        raw.resize(block_size, 0);
        Ok(raw)
    }

    /// Parses a whole block.
    pub fn decode(raw: &[u8]) -> Result<Self, StorageError> {
        let header = BlockHeader::parse(raw)?;
        Ok(Self::from_parts(header, raw[HEADER_SIZE..].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::{Block, BlockHeader, HEADER_SIZE, NO_BLOCK};
    use crate::error::StorageError;

    #[test]
    fn header_layout() {
        let mut block = Block::with_payload(512, b"hello").unwrap();
        block.prev_block = 0x0102;
        let raw = block.encode(512).unwrap();
        assert_eq!(raw.len(), 512);
        assert_eq!(&raw[..8], &0x0102i64.to_le_bytes());
        assert_eq!(&raw[8..16], &NO_BLOCK.to_le_bytes());
        assert_eq!(&raw[16..20], &5u32.to_le_bytes());
        assert_eq!(&raw[HEADER_SIZE..HEADER_SIZE + 5], b"hello");
        assert_eq!(Block::decode(&raw).unwrap(), block);
    }

    #[test]
    fn free_blocks() {
        let free = Block::free(512);
        assert!(free.is_free());
        assert!(BlockHeader::parse(&free.encode(512).unwrap()).unwrap().is_free());

        // All-zero pages have chain pointers at block 0, which is not free.
        assert!(!BlockHeader::parse(&[0; 512]).unwrap().is_free());
        assert!(!Block::with_payload(512, b"x").unwrap().is_free());
    }

    #[test]
    fn oversized_payload() {
        assert_eq!(
            Block::with_payload(512, &[1; 500]),
            Err(StorageError::BadBlockLength {
                len: 524,
                block_size: 512
            })
        );
        assert!(BlockHeader::parse(&[0; 10]).is_err());
    }
}
