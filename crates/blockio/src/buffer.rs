//! The node block buffer.
//!
//! Each tablespace worker keeps recently read and written blocks in a bounded
//! map with LRU eviction.  A block whose write is still in flight is
//! *in-core*: it is never evicted, and reading it is an invariant violation
//! because the reader could observe a half-written page.
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use blockio_types::VirtualBlock;
use metrics::counter;
use tracing::error;

use crate::block::Block;
use crate::error::InvariantViolation;
use crate::metrics::BUFFER_EVICTIONS;

/// A buffer-resident copy of a block.
#[derive(Debug)]
pub struct BufferedBlock {
    block: Block,
    in_core: AtomicBool,
}

impl BufferedBlock {
    /// A clean copy of `block`.
    pub fn clean(block: Block) -> Arc<Self> {
        Arc::new(Self {
            block,
            in_core: AtomicBool::new(false),
        })
    }

    /// A copy of `block` that is about to be written.
    pub fn in_core(block: Block) -> Arc<Self> {
        Arc::new(Self {
            block,
            in_core: AtomicBool::new(true),
        })
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn is_in_core(&self) -> bool {
        self.in_core.load(Ordering::Acquire)
    }

    /// Marks the write of this block as complete.
    pub fn clear_in_core(&self) {
        self.in_core.store(false, Ordering::Release);
    }
}

/// A value in the buffer.
struct BufferValue {
    entry: Arc<BufferedBlock>,

    /// Serial number for LRU purposes.  Entries with higher serial numbers
    /// have been used more recently.
    serial: u64,
}

struct BufferInner {
    blocks: BTreeMap<VirtualBlock, BufferValue>,

    /// Map from LRU serial number to block.  The element with the smallest
    /// serial number was least recently used.
    lru: BTreeMap<u64, VirtualBlock>,

    /// Serial number to use the next time we touch a block.
    next_serial: u64,

    capacity: usize,
}

impl BufferInner {
    fn new(capacity: usize) -> Self {
        Self {
            blocks: BTreeMap::new(),
            lru: BTreeMap::new(),
            next_serial: 0,
            capacity: capacity.max(1),
        }
    }

    #[allow(dead_code)]
    fn check_invariants(&self) {
        assert_eq!(self.blocks.len(), self.lru.len());
        assert!(self.blocks.len() <= self.capacity);
        for (key, value) in self.blocks.iter() {
            assert_eq!(self.lru.get(&value.serial), Some(key));
        }
    }

    fn debug_check_invariants(&self) {
        #[cfg(debug_assertions)]
        self.check_invariants()
    }

    fn touch(&mut self, key: VirtualBlock) -> Option<Arc<BufferedBlock>> {
        let value = self.blocks.get_mut(&key)?;
        self.lru.remove(&value.serial);
        value.serial = self.next_serial;
        self.lru.insert(value.serial, key);
        self.next_serial += 1;
        Some(value.entry.clone())
    }

    /// Evicts the least recently used entry that is not in-core.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .lru
            .iter()
            .find(|(_, key)| !self.blocks[*key].entry.is_in_core())
            .map(|(serial, key)| (*serial, *key));
        match victim {
            Some((serial, key)) => {
                self.lru.remove(&serial);
                self.blocks.remove(&key);
                counter!(BUFFER_EVICTIONS).increment(1);
                true
            }
            None => false,
        }
    }

    fn insert(
        &mut self,
        key: VirtualBlock,
        entry: Arc<BufferedBlock>,
    ) -> Result<(), InvariantViolation> {
        if !self.blocks.contains_key(&key) && self.blocks.len() >= self.capacity && !self.evict_one()
        {
            return Err(InvariantViolation::BufferExhausted(self.blocks.len()));
        }
        if let Some(old_value) = self.blocks.insert(
            key,
            BufferValue {
                entry,
                serial: self.next_serial,
            },
        ) {
            self.lru.remove(&old_value.serial);
        }
        self.lru.insert(self.next_serial, key);
        self.next_serial += 1;
        self.debug_check_invariants();
        Ok(())
    }

    fn remove(&mut self, key: VirtualBlock) -> Option<Arc<BufferedBlock>> {
        let value = self.blocks.remove(&key)?;
        self.lru.remove(&value.serial);
        Some(value.entry)
    }
}

/// A bounded, LRU-ordered map from virtual block to buffered block.
pub struct NodeBlockBuffer {
    inner: Mutex<BufferInner>,
}

impl Debug for NodeBlockBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeBlockBuffer").finish()
    }
}

impl NodeBlockBuffer {
    /// Creates a buffer that holds at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner::new(capacity)),
        }
    }

    /// Inserts `entry`, replacing any entry for `key`.  A full buffer first
    /// evicts its least recently used block that is not in-core; if every
    /// block is in-core, nothing is inserted.
    pub fn put(
        &self,
        key: VirtualBlock,
        entry: Arc<BufferedBlock>,
    ) -> Result<(), InvariantViolation> {
        self.inner
            .lock()
            .unwrap()
            .insert(key, entry)
            .inspect_err(|e| error!("{e}"))
    }

    /// Looks up `key`, marking it most recently used.
    pub fn get(&self, key: VirtualBlock) -> Option<Arc<BufferedBlock>> {
        self.inner.lock().unwrap().touch(key)
    }

    pub fn remove(&self, key: VirtualBlock) -> Option<Arc<BufferedBlock>> {
        self.inner.lock().unwrap().remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }
}
