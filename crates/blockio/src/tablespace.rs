//! The state a worker owns for one tablespace.

use std::path::Path;
use std::sync::Arc;

use blockio_types::{Geometry, VirtualBlock};
use metrics::counter;
use tracing::{debug, error, info};

use crate::allocator::FreeBlockAllocator;
use crate::block::Block;
use crate::buffer::{BufferedBlock, NodeBlockBuffer};
use crate::error::{Error, InvariantViolation, StorageError};
use crate::log::RecoveryLog;
use crate::metrics::{BUFFER_HIT, BUFFER_MISS};
use crate::request::FreeExtent;
use crate::storage::BlockStorage;

/// One tablespace: its file, block buffer, allocator, and recovery log.
///
/// A tablespace is only ever used by its worker's dispatch thread.
pub struct Tablespace {
    index: usize,
    geometry: Geometry,
    storage: Box<dyn BlockStorage>,
    buffer: Arc<NodeBlockBuffer>,
    allocator: FreeBlockAllocator,
    log: Box<dyn RecoveryLog>,
}

impl Tablespace {
    /// Opens tablespace `index` on `storage`.
    ///
    /// A new tablespace 0 gets its root page written, so that it starts out
    /// one block long.  An existing tablespace replays its recovery log.
    pub fn open(
        index: usize,
        geometry: Geometry,
        mut storage: Box<dyn BlockStorage>,
        buffer: Arc<NodeBlockBuffer>,
        mut log: Box<dyn RecoveryLog>,
    ) -> Result<Self, Error> {
        geometry.validate()?;
        if storage.is_new() {
            if index == 0 {
                let root = Block::free(geometry.block_size).encode(geometry.block_size)?;
                storage.seek_and_write(0, &root)?;
                storage.force()?;
            }
        } else {
            log.recover()?;
        }
        info!(
            "tablespace {index}: opened {} ({} bytes{})",
            storage.path().display(),
            storage.size()?,
            if storage.is_new() { ", new" } else { "" }
        );
        Ok(Self {
            index,
            geometry,
            storage,
            buffer,
            allocator: FreeBlockAllocator::new(index, geometry),
            log,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    pub fn buffer(&self) -> &Arc<NodeBlockBuffer> {
        &self.buffer
    }

    /// Returns the physical offset of `block`, which must belong to this
    /// tablespace.
    fn offset(&self, block: VirtualBlock) -> Result<u64, Error> {
        if block.tablespace() != self.index {
            return Err(Error::Misrouted {
                block,
                tablespace: self.index,
            });
        }
        Ok(block.offset())
    }

    /// Fails if a write of `block` is in flight.
    fn cached(&self, block: VirtualBlock) -> Result<Option<Arc<BufferedBlock>>, Error> {
        match self.buffer.get(block) {
            Some(entry) if entry.is_in_core() => {
                let violation = InvariantViolation::InCoreRead(block);
                error!("tablespace {}: {violation}", self.index);
                Err(violation.into())
            }
            entry => Ok(entry),
        }
    }

    /// Reads and decodes `block`, serving it from the buffer if possible.
    pub fn seek_read(&mut self, block: VirtualBlock) -> Result<Block, Error> {
        let offset = self.offset(block)?;
        if let Some(entry) = self.cached(block)? {
            counter!(BUFFER_HIT).increment(1);
            return Ok(entry.block().clone());
        }
        counter!(BUFFER_MISS).increment(1);

        let raw = self
            .storage
            .seek_and_read(offset, self.geometry.block_size)?;
        let decoded = Block::decode(&raw)?;
        self.buffer.put(block, BufferedBlock::clean(decoded.clone()))?;
        Ok(decoded)
    }

    /// Reads the raw page of `block` from storage.
    pub fn seek_read_fully(&mut self, block: VirtualBlock) -> Result<Vec<u8>, Error> {
        let offset = self.offset(block)?;
        self.cached(block)?;
        Ok(self
            .storage
            .seek_and_read(offset, self.geometry.block_size)?)
    }

    /// Writes `data` to `block`.  Returns the number of bytes written.
    pub fn seek_write(&mut self, block: VirtualBlock, data: &Block) -> Result<usize, Error> {
        let raw = data.encode(self.geometry.block_size)?;
        self.write_page(block, data.clone(), &raw)
    }

    /// Writes one raw page to `block`.  `bytes` must be exactly one block
    /// long.
    pub fn seek_write_fully(&mut self, block: VirtualBlock, bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() != self.geometry.block_size {
            return Err(StorageError::BadBlockLength {
                len: bytes.len(),
                block_size: self.geometry.block_size,
            }
            .into());
        }
        self.write_page(block, Block::decode(bytes)?, bytes)
    }

    /// The buffered copy of `block` is in-core from before it enters the
    /// buffer until the physical write returns.
    fn write_page(&mut self, block: VirtualBlock, data: Block, raw: &[u8]) -> Result<usize, Error> {
        let offset = self.offset(block)?;
        let entry = BufferedBlock::in_core(data);
        self.buffer.put(block, entry.clone())?;
        match self.storage.seek_and_write(offset, raw) {
            Ok(()) => {
                entry.clear_in_core();
                debug!("tablespace {}: wrote {block}", self.index);
                Ok(raw.len())
            }
            Err(e) => {
                self.buffer.remove(block);
                Err(e.into())
            }
        }
    }

    pub fn size(&self) -> Result<u64, Error> {
        Ok(self.storage.size()?)
    }

    /// Allocates a free block.  `known_free`, if given, must belong to this
    /// tablespace.
    pub fn next_free_block(
        &mut self,
        known_free: Option<VirtualBlock>,
    ) -> Result<VirtualBlock, Error> {
        let known_free = known_free.map(|b| self.offset(b)).transpose()?;
        let offset = self
            .allocator
            .next_free_block(&mut *self.storage, known_free)?;
        Ok(VirtualBlock::new(self.index, offset)?)
    }

    /// Reports the block the next allocation will hand out, and the file
    /// size from before finding it, which may have extended the file.
    /// Nothing is allocated.
    pub fn free_extent(&mut self) -> Result<FreeExtent, Error> {
        let file_size = self.size()?;
        let offset = self.allocator.peek(&mut *self.storage)?;
        let next_free = VirtualBlock::new(self.index, offset)?;
        Ok(FreeExtent {
            next_free,
            file_size,
        })
    }

    pub fn fsync(&mut self) -> Result<(), Error> {
        Ok(self.storage.force()?)
    }

    pub fn commit(&mut self) -> Result<(), Error> {
        self.log.flush()?;
        self.storage.force()?;
        debug!("tablespace {}: committed", self.index);
        Ok(())
    }

    pub fn checkpoint(&mut self) -> Result<(), Error> {
        self.storage.force()?;
        self.log.checkpoint()?;
        debug!("tablespace {}: checkpointed", self.index);
        Ok(())
    }

    pub fn is_new(&self) -> bool {
        self.storage.is_new()
    }

    pub fn is_open(&self) -> bool {
        self.storage.is_open()
    }

    pub fn close(&mut self) -> Result<(), Error> {
        if self.storage.is_open() {
            self.storage.close()?;
            info!("tablespace {}: closed {}", self.index, self.path().display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use blockio_types::{Geometry, VirtualBlock};
    use pretty_assertions::assert_eq;

    use super::Tablespace;
    use crate::block::Block;
    use crate::buffer::{BufferedBlock, NodeBlockBuffer};
    use crate::error::{Error, InvariantViolation, StorageError};
    use crate::log::NullRecoveryLog;
    use crate::storage::MemoryStorage;

    const BS: usize = 512;

    fn open(index: usize, storage: MemoryStorage) -> Tablespace {
        Tablespace::open(
            index,
            Geometry::new(BS, 4),
            Box::new(storage),
            Arc::new(NodeBlockBuffer::new(8)),
            Box::new(NullRecoveryLog),
        )
        .unwrap()
    }

    #[test]
    fn new_root_tablespace() {
        let mut ts = open(0, MemoryStorage::new("ts0"));
        assert!(ts.is_new());
        assert_eq!(ts.size().unwrap(), BS as u64);
        assert_eq!(
            ts.next_free_block(None).unwrap(),
            VirtualBlock::new(0, BS as u64).unwrap()
        );

        let ts = open(3, MemoryStorage::new("ts3"));
        assert_eq!(ts.size().unwrap(), 0);
    }

    #[test]
    fn write_then_read() {
        let storage = MemoryStorage::new("ts1");
        let contents = storage.contents();
        let mut ts = open(1, storage);
        let vb = VirtualBlock::new(1, 2 * BS as u64).unwrap();
        let block = Block::with_payload(BS, b"payload").unwrap();

        assert_eq!(ts.seek_write(vb, &block).unwrap(), BS);
        assert!(!ts.buffer().get(vb).unwrap().is_in_core());
        assert_eq!(ts.seek_read(vb).unwrap().payload(), b"payload");

        // The raw page bypasses the buffer and matches what was written.
        contents.lock().unwrap().data[2 * BS + 24] = b'P';
        assert_eq!(ts.seek_read(vb).unwrap().payload(), b"payload");
        assert_eq!(ts.seek_read_fully(vb).unwrap()[24..31], *b"Payload");
    }

    #[test]
    fn raw_writes_must_be_one_block() {
        let mut ts = open(1, MemoryStorage::new("ts1"));
        let vb = VirtualBlock::new(1, 0).unwrap();
        assert!(matches!(
            ts.seek_write_fully(vb, &[0; 100]),
            Err(Error::Storage(StorageError::BadBlockLength { len: 100, .. }))
        ));
        let page = Block::with_payload(BS, b"raw").unwrap().encode(BS).unwrap();
        assert_eq!(ts.seek_write_fully(vb, &page).unwrap(), BS);
        assert_eq!(ts.seek_read(vb).unwrap().payload(), b"raw");
    }

    #[test]
    fn reading_an_in_core_block_is_fatal() {
        let mut ts = open(1, MemoryStorage::new("ts1"));
        let vb = VirtualBlock::new(1, 0).unwrap();
        ts.buffer()
            .put(vb, BufferedBlock::in_core(Block::free(BS)))
            .unwrap();
        let error = ts.seek_read(vb).unwrap_err();
        assert!(error.is_fatal());
        assert!(matches!(
            error,
            Error::Invariant(InvariantViolation::InCoreRead(b)) if b == vb
        ));
    }

    #[test]
    fn failed_write_leaves_nothing_buffered() {
        let mut ts = open(1, MemoryStorage::new("ts1").with_quota(BS as u64));
        let vb = VirtualBlock::new(1, BS as u64).unwrap();
        assert!(ts.seek_write(vb, &Block::free(BS)).is_err());
        assert!(ts.buffer().get(vb).is_none());
    }

    #[test]
    fn free_extent_reserves_nothing() {
        let mut ts = open(2, MemoryStorage::new("ts2"));
        let first = ts.free_extent().unwrap();
        assert_eq!(first.next_free, VirtualBlock::new(2, 0).unwrap());
        assert_eq!(first.file_size, 0);
        assert_eq!(ts.size().unwrap(), 4 * BS as u64);

        let second = ts.free_extent().unwrap();
        assert_eq!(second.next_free, first.next_free);
        assert_eq!(second.file_size, 4 * BS as u64);
        assert_eq!(ts.next_free_block(None).unwrap(), first.next_free);
        assert_eq!(
            ts.free_extent().unwrap().next_free,
            VirtualBlock::new(2, BS as u64).unwrap()
        );
    }

    #[test]
    fn misrouted_blocks() {
        let mut ts = open(1, MemoryStorage::new("ts1"));
        let vb = VirtualBlock::new(2, 0).unwrap();
        assert!(matches!(
            ts.seek_read(vb),
            Err(Error::Misrouted { tablespace: 1, .. })
        ));
        assert!(ts.next_free_block(Some(vb)).is_err());
    }
}
