//! Free block allocation within one tablespace.

use std::sync::Mutex;

use blockio_types::Geometry;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::block::{Block, BlockHeader, HEADER_SIZE};
use crate::error::Error;
use crate::metrics::{BLOCKS_ALLOCATED, TABLESPACE_EXTENSIONS};
use crate::storage::BlockStorage;

/// Finds free blocks in a tablespace file, growing the file when it has
/// none.
///
/// Offsets below the tablespace's reserved offset are never returned.  For
/// tablespace 0 that protects the root page.
#[derive(Debug)]
pub struct FreeBlockAllocator {
    tablespace: usize,
    geometry: Geometry,

    /// The block most recently handed out.  Holding the lock for a whole
    /// call keeps two allocations from racing on the same candidate.
    last_free: Mutex<Option<u64>>,
}

impl FreeBlockAllocator {
    pub fn new(tablespace: usize, geometry: Geometry) -> Self {
        Self {
            tablespace,
            geometry,
            last_free: Mutex::new(None),
        }
    }

    pub fn reserved_offset(&self) -> u64 {
        self.geometry.reserved_offset(self.tablespace)
    }

    /// The block most recently handed out, if any.
    pub fn last_free(&self) -> Option<u64> {
        *self.last_free.lock().unwrap()
    }

    fn usable(&self, offset: u64) -> bool {
        offset % self.geometry.block_bytes() == 0 && offset >= self.reserved_offset()
    }

    /// Returns the physical offset of a free block and remembers it as the
    /// block handed out last.
    ///
    /// If `known_free` (or else the block handed out last) is a usable block
    /// and the block after it lies inside the file, that block is returned
    /// without touching storage.  Otherwise the file is scanned backward from
    /// its end for a run of free blocks above the block handed out last, and
    /// if there is none it is extended by one pool of free blocks.
    pub fn next_free_block(
        &self,
        storage: &mut dyn BlockStorage,
        known_free: Option<u64>,
    ) -> Result<u64, Error> {
        let mut last_free = self.last_free.lock().unwrap();
        let free = self.find(storage, known_free, *last_free)?;
        debug!("tablespace {}: next free block at {free:#x}", self.tablespace);
        *last_free = Some(free);
        counter!(BLOCKS_ALLOCATED).increment(1);
        Ok(free)
    }

    /// Returns the block the next [`next_free_block`](Self::next_free_block)
    /// without `known_free` would hand out, without handing it out.  The
    /// file is still extended if it has no free block.
    pub fn peek(&self, storage: &mut dyn BlockStorage) -> Result<u64, Error> {
        let last_free = self.last_free.lock().unwrap();
        self.find(storage, None, *last_free)
    }

    fn find(
        &self,
        storage: &mut dyn BlockStorage,
        known_free: Option<u64>,
        last_free: Option<u64>,
    ) -> Result<u64, Error> {
        let block_size = self.geometry.block_bytes();
        let size = storage.size()?;

        if let Some(known) = known_free.or(last_free).filter(|&b| self.usable(b)) {
            let next = known + block_size;
            if next < size {
                return Ok(next);
            }
        }

        // Blocks up to the one handed out last may be free on disk but are
        // taken.
        let floor = last_free
            .map(|b| b + block_size)
            .unwrap_or(0)
            .max(self.reserved_offset());
        match self.scan_backward(storage, size, floor)? {
            Some(free) => Ok(free),
            None => self.extend(storage, size),
        }
    }

    /// Returns the lowest block of the run of free blocks at the end of the
    /// file, looking no lower than `floor`.
    fn scan_backward(
        &self,
        storage: &mut dyn BlockStorage,
        size: u64,
        floor: u64,
    ) -> Result<Option<u64>, Error> {
        let block_size = self.geometry.block_bytes();
        let mut end = size - size % block_size;
        let mut lowest = None;
        while end >= floor + block_size {
            let offset = end - block_size;
            let header = BlockHeader::parse(&storage.seek_and_read(offset, HEADER_SIZE)?)?;
            if !header.is_free() {
                break;
            }
            lowest = Some(offset);
            end = offset;
        }
        Ok(lowest)
    }

    /// Grows the file by one pool of free blocks and returns the first new
    /// block at or above the reserved offset.  On failure the file is cut
    /// back to `size`.
    fn extend(&self, storage: &mut dyn BlockStorage, size: u64) -> Result<u64, Error> {
        let block_size = self.geometry.block_size;
        let start = size.next_multiple_of(self.geometry.block_bytes());
        let pool_size = self.geometry.pool_size();

        let result = Block::free(block_size).encode(block_size).and_then(|free| {
            let pool = free.repeat(self.geometry.bucket_count);
            storage.seek_and_write(start, &pool)?;
            storage.force()
        });
        if let Err(source) = result {
            warn!(
                "tablespace {}: extending {} by {pool_size} bytes failed: {source}",
                self.tablespace,
                storage.path().display()
            );
            if let Err(e) = storage.set_length(size) {
                warn!("tablespace {}: truncating back to {size} failed: {e}", self.tablespace);
            }
            return Err(Error::Allocation {
                tablespace: self.tablespace,
                source,
            });
        }

        info!(
            "tablespace {}: extended {} from {size} to {} bytes",
            self.tablespace,
            storage.path().display(),
            start + pool_size
        );
        counter!(TABLESPACE_EXTENSIONS).increment(1);
        Ok(start.max(self.reserved_offset()))
    }
}

#[cfg(test)]
mod tests {
    use blockio_types::Geometry;

    use super::FreeBlockAllocator;
    use crate::block::Block;
    use crate::error::Error;
    use crate::storage::{BlockStorage, MemoryStorage};

    const BS: usize = 512;

    fn used_blocks(n: usize) -> Vec<u8> {
        let used = Block::with_payload(BS, b"used").unwrap().encode(BS).unwrap();
        used.repeat(n)
    }

    #[test]
    fn forward_path_reads_nothing() {
        // All-zero blocks are not free, so a scan would find nothing.
        let mut storage = MemoryStorage::with_contents("ts", vec![0; 8 * BS]);
        let allocator = FreeBlockAllocator::new(2, Geometry::new(BS, 4));
        let contents = storage.contents();
        assert_eq!(
            allocator
                .next_free_block(&mut storage, Some(3 * BS as u64))
                .unwrap(),
            4 * BS as u64
        );
        // Continues from the block it handed out last.
        assert_eq!(
            allocator.next_free_block(&mut storage, None).unwrap(),
            5 * BS as u64
        );
        assert_eq!(contents.lock().unwrap().data.len(), 8 * BS);
        assert_eq!(contents.lock().unwrap().forces, 0);
    }

    #[test]
    fn backward_scan_finds_trailing_run() {
        let mut data = used_blocks(2);
        data.extend(Block::free(BS).encode(BS).unwrap().repeat(3));
        let mut storage = MemoryStorage::with_contents("ts", data);
        let allocator = FreeBlockAllocator::new(1, Geometry::new(BS, 4));
        assert_eq!(
            allocator.next_free_block(&mut storage, None).unwrap(),
            2 * BS as u64
        );
        assert_eq!(storage.size().unwrap(), 5 * BS as u64);
    }

    #[test]
    fn extension_of_a_full_file() {
        let mut storage = MemoryStorage::with_contents("ts", used_blocks(2));
        let allocator = FreeBlockAllocator::new(1, Geometry::new(BS, 4));
        assert_eq!(
            allocator.next_free_block(&mut storage, None).unwrap(),
            2 * BS as u64
        );
        assert_eq!(storage.size().unwrap(), 6 * BS as u64);
        let new_block = storage.seek_and_read(3 * BS as u64, BS).unwrap();
        assert!(Block::decode(&new_block).unwrap().is_free());

        // A known free block at the very end of the file cannot be advanced,
        // and the scan skips the block handed out already.
        assert_eq!(
            allocator
                .next_free_block(&mut storage, Some(5 * BS as u64))
                .unwrap(),
            3 * BS as u64
        );
    }

    #[test]
    fn unwritten_blocks_are_handed_out_once() {
        let mut storage = MemoryStorage::new("ts");
        let allocator = FreeBlockAllocator::new(1, Geometry::new(BS, 4));
        let blocks = (0..9)
            .map(|_| allocator.next_free_block(&mut storage, None).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            blocks,
            (0..9).map(|i| i * BS as u64).collect::<Vec<_>>()
        );
        assert_eq!(storage.size().unwrap(), 12 * BS as u64);
    }

    #[test]
    fn peeking_allocates_nothing() {
        let mut storage = MemoryStorage::new("ts0");
        let allocator = FreeBlockAllocator::new(0, Geometry::new(BS, 4));
        assert_eq!(allocator.peek(&mut storage).unwrap(), BS as u64);
        assert_eq!(storage.size().unwrap(), 4 * BS as u64);
        assert_eq!(allocator.last_free(), None);
        assert_eq!(allocator.peek(&mut storage).unwrap(), BS as u64);
        assert_eq!(
            allocator.next_free_block(&mut storage, None).unwrap(),
            BS as u64
        );
        assert_eq!(allocator.peek(&mut storage).unwrap(), 2 * BS as u64);
        assert_eq!(storage.size().unwrap(), 4 * BS as u64);
    }

    #[test]
    fn root_block_is_reserved() {
        // The root page is free on disk but still off limits.
        let mut storage = MemoryStorage::with_contents("ts0", Block::free(BS).encode(BS).unwrap());
        let allocator = FreeBlockAllocator::new(0, Geometry::new(BS, 4));
        assert_eq!(
            allocator.next_free_block(&mut storage, Some(0)).unwrap(),
            BS as u64
        );
        assert_eq!(storage.size().unwrap(), 5 * BS as u64);

        let mut storage = MemoryStorage::new("ts0");
        let allocator = FreeBlockAllocator::new(0, Geometry::new(BS, 4));
        assert_eq!(
            allocator.next_free_block(&mut storage, None).unwrap(),
            BS as u64
        );
    }

    #[test]
    fn failed_extension_is_rolled_back() {
        let mut storage =
            MemoryStorage::with_contents("ts", used_blocks(2)).with_quota(3 * BS as u64);
        let allocator = FreeBlockAllocator::new(1, Geometry::new(BS, 4));
        assert!(matches!(
            allocator.next_free_block(&mut storage, None),
            Err(Error::Allocation { tablespace: 1, .. })
        ));
        assert_eq!(storage.size().unwrap(), 2 * BS as u64);
        assert_eq!(allocator.last_free(), None);
    }
}
