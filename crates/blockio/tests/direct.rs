//! Databases whose tablespaces are all served in-process.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use blockio::error::{Error, StorageError};
use blockio::test::init_test_logger;
use blockio::{
    Block, ClusterIoManager, Geometry, IoConfig, RecoveryLog, RecoveryLogFactory, VirtualBlock,
};
use pretty_assertions::assert_eq;
use rand::{thread_rng, Rng};

const BLOCK_SIZE: usize = 512;
const BUCKETS: usize = 4;

fn config(tablespaces: usize) -> IoConfig {
    IoConfig::local(tablespaces).with_geometry(Geometry::new(BLOCK_SIZE, BUCKETS))
}

#[derive(Default)]
struct Counts {
    flushes: AtomicUsize,
    checkpoints: AtomicUsize,
    recoveries: AtomicUsize,
}

struct CountingLog(Arc<Counts>);

impl RecoveryLog for CountingLog {
    fn flush(&mut self) -> Result<(), StorageError> {
        self.0.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), StorageError> {
        self.0.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn recover(&mut self) -> Result<(), StorageError> {
        self.0.recoveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct CountingLogs(Arc<Counts>);

impl RecoveryLogFactory for CountingLogs {
    fn create(&self, _tablespace: usize, _path: &Path) -> Result<Box<dyn RecoveryLog>, StorageError> {
        Ok(Box::new(CountingLog(self.0.clone())))
    }
}

#[test]
fn root_page_round_trip() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let manager = ClusterIoManager::open(dir.path().join("test.db"), true, config(1)).unwrap();
    assert!(manager.is_new().unwrap());
    assert_eq!(manager.size(0).unwrap(), BLOCK_SIZE as u64);

    let root = VirtualBlock::new(0, 0).unwrap();
    let page = Block::with_payload(BLOCK_SIZE, b"root page").unwrap();
    manager.write_block(root, &page).unwrap();
    assert_eq!(manager.read_block(root).unwrap(), page);

    // The root page is never handed out.
    let first = manager.next_free_block(0, None).unwrap();
    assert_eq!(first, VirtualBlock::new(0, BLOCK_SIZE as u64).unwrap());
    assert_eq!(
        manager.size(0).unwrap(),
        (BLOCK_SIZE + BLOCK_SIZE * BUCKETS) as u64
    );
    let second = manager.next_free_block(0, Some(first)).unwrap();
    assert_eq!(second.offset(), 2 * BLOCK_SIZE as u64);
    manager.close().unwrap();
}

#[test]
fn raw_pages() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let manager = ClusterIoManager::open(dir.path().join("test.db"), true, config(2)).unwrap();
    let block = manager.next_free_block(1, None).unwrap();
    assert_eq!(block, VirtualBlock::new(1, 0).unwrap());

    let page = Block::with_payload(BLOCK_SIZE, &[7; 100])
        .unwrap()
        .encode(BLOCK_SIZE)
        .unwrap();
    manager.write_block_fully(block, &page).unwrap();
    assert_eq!(manager.read_block_fully(block).unwrap(), page);
    assert_eq!(manager.read_block(block).unwrap().payload(), &[7; 100][..]);

    match manager.write_block_fully(block, &page[..100]) {
        Err(Error::Storage(StorageError::BadBlockLength { len, block_size })) => {
            assert_eq!((len, block_size), (100, BLOCK_SIZE))
        }
        other => panic!("expected a length error, got {other:?}"),
    }
}

#[test]
fn commit_reaches_every_tablespace() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let logs = CountingLogs::default();
    let manager = ClusterIoManager::open_with_log(
        dir.path().join("test.db"),
        true,
        config(8),
        Arc::new(logs.clone()),
    )
    .unwrap();

    manager.commit().unwrap();
    assert_eq!(logs.0.flushes.load(Ordering::SeqCst), 8);
    manager.checkpoint().unwrap();
    assert_eq!(logs.0.checkpoints.load(Ordering::SeqCst), 8);
    manager.force_sync().unwrap();
    assert_eq!(manager.barrier_generation(), 3);
    assert_eq!(logs.0.recoveries.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_commits_do_not_interleave() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let logs = CountingLogs::default();
    let manager = Arc::new(
        ClusterIoManager::open_with_log(
            dir.path().join("test.db"),
            true,
            config(4),
            Arc::new(logs.clone()),
        )
        .unwrap(),
    );
    let threads = (0..4)
        .map(|i| {
            let manager = manager.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    manager.commit().unwrap();
                    let block = manager.next_free_block(i, None).unwrap();
                    assert_eq!(block.tablespace(), i);
                }
            })
        })
        .collect::<Vec<_>>();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(manager.barrier_generation(), 20);
    assert_eq!(logs.0.flushes.load(Ordering::SeqCst), 80);
}

#[test]
fn smallest_tablespace() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let manager = ClusterIoManager::open(dir.path().join("test.db"), true, config(3)).unwrap();

    // Tablespace 0 starts with its root page, the others are empty, so they
    // tie on offset 0 and size 0 and the lower index wins.
    assert_eq!(manager.find_smallest_tablespace().unwrap(), 1);

    let extents = manager.next_free_blocks_scan().unwrap();
    assert_eq!(extents.len(), 3);
    assert_eq!(extents[0].next_free.tablespace(), 0);
    assert!(extents[0].next_free.offset() >= BLOCK_SIZE as u64);
    for (index, extent) in extents.iter().enumerate() {
        assert_eq!(extent.next_free.tablespace(), index);
    }
}

#[test]
fn scans_hand_out_the_reported_block() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let manager = ClusterIoManager::open(dir.path().join("test.db"), true, config(3)).unwrap();

    let smallest = manager.find_smallest_tablespace().unwrap();
    assert_eq!(smallest, 1);
    let extents = manager.next_free_blocks_scan().unwrap();
    assert_eq!(extents[1].next_free, VirtualBlock::new(1, 0).unwrap());
    assert_eq!(manager.next_free_block(smallest, None).unwrap(), extents[1].next_free);
    assert_eq!(
        manager.next_free_block(0, None).unwrap(),
        VirtualBlock::new(0, BLOCK_SIZE as u64).unwrap()
    );

    // Scanning again moves on past the blocks handed out since.
    let extents = manager.next_free_blocks_scan().unwrap();
    assert_eq!(extents[0].next_free.offset(), 2 * BLOCK_SIZE as u64);
    assert_eq!(extents[1].next_free.offset(), BLOCK_SIZE as u64);
    assert_eq!(extents[2].next_free.offset(), 0);
}

#[test]
fn allocations_past_one_pool_are_distinct() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let manager = ClusterIoManager::open(dir.path().join("test.db"), true, config(2)).unwrap();
    let mut blocks = (0..=BUCKETS)
        .map(|_| manager.next_free_block(1, None).unwrap())
        .collect::<Vec<_>>();
    blocks.sort();
    blocks.dedup();
    assert_eq!(blocks.len(), BUCKETS + 1);
    assert_eq!(manager.size(1).unwrap(), (2 * BUCKETS * BLOCK_SIZE) as u64);
}

#[test]
fn reopen_recovers() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let block = VirtualBlock::new(1, 0).unwrap();
    let page = Block::with_payload(BLOCK_SIZE, b"survives").unwrap();
    {
        let manager = ClusterIoManager::open(&path, true, config(2)).unwrap();
        manager.next_free_block(1, None).unwrap();
        manager.write_block(block, &page).unwrap();
        manager.commit().unwrap();
        manager.close().unwrap();
    }

    let logs = CountingLogs::default();
    let manager =
        ClusterIoManager::open_with_log(&path, false, config(2), Arc::new(logs.clone())).unwrap();
    assert_eq!(logs.0.recoveries.load(Ordering::SeqCst), 2);
    assert!(!manager.is_new().unwrap());
    assert_eq!(manager.read_block(block).unwrap(), page);
}

#[test]
fn missing_files_are_not_created() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let result = ClusterIoManager::open(dir.path().join("missing.db"), false, config(2));
    assert!(matches!(result, Err(Error::Storage(_))));
}

#[test]
fn random_pages_across_tablespaces() {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    let manager = ClusterIoManager::open(dir.path().join("test.db"), true, config(8)).unwrap();
    let mut rng = thread_rng();

    let mut written = Vec::new();
    for _ in 0..64 {
        let tablespace = rng.gen_range(0..8);
        let block = manager.next_free_block(tablespace, None).unwrap();
        assert_eq!(block.tablespace(), tablespace);
        let len = rng.gen_range(1..=Block::capacity(BLOCK_SIZE));
        let payload = (0..len).map(|_| rng.gen()).collect::<Vec<u8>>();
        let page = Block::with_payload(BLOCK_SIZE, &payload).unwrap();
        manager.write_block(block, &page).unwrap();
        written.push((block, page));
    }
    manager.commit().unwrap();

    // Every block was handed out once, and holds what was written to it.
    let mut blocks = written.iter().map(|(block, _)| *block).collect::<Vec<_>>();
    blocks.sort();
    blocks.dedup();
    assert_eq!(blocks.len(), written.len());
    for (block, page) in &written {
        assert_eq!(&manager.read_block(*block).unwrap(), page);
        assert_eq!(
            manager.read_block_fully(*block).unwrap(),
            page.encode(BLOCK_SIZE).unwrap()
        );
    }
}
