//! The coordinator of one open database.
//!
//! A [`ClusterIoManager`] owns one link per tablespace.  Every block
//! operation is routed to the tablespace encoded in its virtual block
//! address; the caller blocks on a completion gate until the worker's result
//! is in.  Commit, checkpoint and sync are split across all tablespaces and
//! rendezvous on the database's barrier.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use blockio_types::{
    tablespace_path, Geometry, IoConfig, TablespaceConfig, TransportKind, VirtualBlock,
};
use metrics::histogram;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::block::Block;
use crate::bootstrap::Deployment;
use crate::buffer::NodeBlockBuffer;
use crate::correlation::{ClusterUnit, Completion, CorrelationIds, CorrelationTable};
use crate::error::Error;
use crate::log::{NullRecoveryLog, RecoveryLogFactory};
use crate::metrics::{describe_metrics, REQUEST_LATENCY};
use crate::request::{FreeExtent, IoRequest, Operation, Outcome};
use crate::storage::PosixStorage;
use crate::sync::{BarrierTicket, CompletionGate, RendezvousBarrier};
use crate::tablespace::Tablespace;
use crate::transport::{connect_master, DirectTransport, MasterTransport, RemoteLink};
use crate::worker::Dispatcher;

struct WorkerHandle {
    tablespace: usize,
    transport: Arc<dyn MasterTransport>,
    table: Arc<CorrelationTable>,
    remote: bool,
}

/// Block I/O for one database whose tablespaces may be spread over several
/// nodes.
pub struct ClusterIoManager {
    path: PathBuf,
    geometry: Geometry,
    session: Uuid,
    ids: CorrelationIds,
    workers: Vec<WorkerHandle>,
    barrier: Arc<RendezvousBarrier>,

    /// Held by split operations, so that barrier generations never
    /// interleave.
    split_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ClusterIoManager {
    /// Opens the database at `path`.  Local tablespace files are created if
    /// `create` is set; remote workers always create theirs.
    pub fn open<P: AsRef<Path>>(path: P, create: bool, config: IoConfig) -> Result<Self, Error> {
        Self::open_with_log(path, create, config, Arc::new(NullRecoveryLog))
    }

    /// Like [`open`](Self::open), with the recovery logs of local
    /// tablespaces created by `log_factory`.
    pub fn open_with_log<P: AsRef<Path>>(
        path: P,
        create: bool,
        config: IoConfig,
        log_factory: Arc<dyn RecoveryLogFactory>,
    ) -> Result<Self, Error> {
        describe_metrics();
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let session = Uuid::now_v7();
        let mut workers = Vec::with_capacity(config.n_tablespaces());
        for (index, placement) in config.tablespaces.iter().enumerate() {
            let table = CorrelationTable::new(index);
            let (transport, remote): (Arc<dyn MasterTransport>, bool) = match placement {
                TablespaceConfig::Local => {
                    let file = tablespace_path(&path, None, index);
                    let storage = PosixStorage::open(&file, create)?;
                    let log = log_factory.create(index, &file)?;
                    let tablespace = Tablespace::open(
                        index,
                        config.geometry,
                        Box::new(storage),
                        Arc::new(NodeBlockBuffer::new(config.buffer_capacity)),
                        log,
                    )?;
                    let dispatcher = Arc::new(Dispatcher::spawn(tablespace)?);
                    (Arc::new(DirectTransport::new(dispatcher)), false)
                }
                TablespaceConfig::Remote(remote) => {
                    let link = RemoteLink {
                        tablespace: index,
                        table: table.clone(),
                        deployment: Deployment {
                            database: path.clone(),
                            tablespace: index,
                            remote: remote.clone(),
                            geometry: config.geometry,
                            session,
                            timeout: config.bootstrap_timeout(),
                        },
                        reconnect_interval: config.reconnect_interval(),
                        udp: config.udp,
                    };
                    (connect_master(link)?, true)
                }
            };
            workers.push(WorkerHandle {
                tablespace: index,
                transport,
                table,
                remote,
            });
        }
        info!(
            "opened {} (session {session}) with {} tablespaces",
            path.display(),
            workers.len()
        );
        Ok(Self {
            path,
            geometry: config.geometry,
            session,
            ids: CorrelationIds::new(),
            barrier: Arc::new(RendezvousBarrier::new(workers.len())),
            workers,
            split_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn n_tablespaces(&self) -> usize {
        self.workers.len()
    }

    /// The kind of link to `tablespace`.
    pub fn transport(&self, tablespace: usize) -> Result<TransportKind, Error> {
        Ok(self.worker(tablespace)?.transport.kind())
    }

    /// Number of split operations completed so far.
    pub fn barrier_generation(&self) -> u64 {
        self.barrier.generation()
    }

    fn worker(&self, tablespace: usize) -> Result<&WorkerHandle, Error> {
        self.workers
            .get(tablespace)
            .ok_or(Error::NoSuchTablespace(tablespace))
    }

    /// Submits one request per entry of `operations` and waits for all of
    /// them.  With `barrier` set, the workers rendezvous before any caller
    /// is released.
    fn run(&self, operations: Vec<(usize, Operation)>, barrier: bool) -> Vec<Result<Outcome, Error>> {
        let started = Instant::now();
        let (gate, tickets) = CompletionGate::arm(operations.len());
        let mut units = Vec::with_capacity(operations.len());
        let mut registrations = Vec::with_capacity(operations.len());
        let mut unsent = Vec::new();
        for ((tablespace, operation), ticket) in operations.into_iter().zip(tickets) {
            let worker = &self.workers[tablespace];
            let completion = if barrier {
                Completion::Barrier(BarrierTicket::new(self.barrier.clone(), ticket))
            } else {
                Completion::Gate(ticket)
            };
            let unit = ClusterUnit::new(
                &self.ids,
                IoRequest::new(tablespace, operation, worker.remote),
                completion,
            );
            registrations.push(worker.table.register(&unit));
            if let Err(error) = worker.transport.send(&unit) {
                warn!("tablespace {tablespace}: submitting {} failed: {error}", unit.id());
                unit.fail(error);
                unsent.push(unit.clone());
            }
            units.push(unit);
        }

        // Only now that every other party has its request may the parties
        // that never got one be accounted for at the barrier.
        for unit in unsent {
            unit.abandon();
        }
        gate.wait();
        histogram!(REQUEST_LATENCY).record(started.elapsed().as_secs_f64());

        let outcomes = units.iter().map(|unit| unit.take_outcome()).collect();
        drop(registrations);
        outcomes
    }

    fn execute(&self, tablespace: usize, operation: Operation) -> Result<Outcome, Error> {
        self.worker(tablespace)?;
        self.run(vec![(tablespace, operation)], false)
            .pop()
            .unwrap_or(Err(Error::WorkerUnavailable(tablespace)))
    }

    fn split<F>(&self, operation: F) -> Result<(), Error>
    where
        F: Fn(&WorkerHandle) -> Operation,
    {
        let _guard = self.split_lock.lock().unwrap();
        let operations = self
            .workers
            .iter()
            .map(|worker| (worker.tablespace, operation(worker)))
            .collect();
        let outcomes = self.run(operations, true);
        debug!(
            "{}: split operation passed barrier generation {}",
            self.path.display(),
            self.barrier.generation()
        );
        outcomes.into_iter().try_for_each(|outcome| outcome.map(|_| ()))
    }

    /// Reads the block at `block`, through its node's block buffer.
    pub fn read_block(&self, block: VirtualBlock) -> Result<Block, Error> {
        self.execute(block.tablespace(), Operation::SeekRead { block })?
            .into_block()
    }

    /// Reads the raw page at `block`, bypassing the block buffer.
    pub fn read_block_fully(&self, block: VirtualBlock) -> Result<Vec<u8>, Error> {
        self.execute(block.tablespace(), Operation::SeekReadFully { block })?
            .into_bytes()
    }

    pub fn write_block(&self, block: VirtualBlock, data: &Block) -> Result<(), Error> {
        self.execute(
            block.tablespace(),
            Operation::SeekWrite {
                block,
                data: data.clone(),
            },
        )?;
        Ok(())
    }

    /// Writes a raw page, which must be exactly one block long.
    pub fn write_block_fully(&self, block: VirtualBlock, bytes: &[u8]) -> Result<(), Error> {
        self.execute(
            block.tablespace(),
            Operation::SeekWriteFully {
                block,
                bytes: bytes.to_vec(),
            },
        )?;
        Ok(())
    }

    /// Size of the file of `tablespace`, in bytes.
    pub fn size(&self, tablespace: usize) -> Result<u64, Error> {
        self.execute(tablespace, Operation::Size)?.unsigned()
    }

    /// Allocates a free block in `tablespace`.  `known_free` is a block known
    /// to be free, from which the search starts.
    pub fn next_free_block(
        &self,
        tablespace: usize,
        known_free: Option<VirtualBlock>,
    ) -> Result<VirtualBlock, Error> {
        Ok(self
            .execute(tablespace, Operation::NextFreeBlock { known_free })?
            .virtual_block())
    }

    /// Reports the next free block of every tablespace at once.  The blocks
    /// are not allocated: a following [`next_free_block`](Self::next_free_block)
    /// without `known_free` returns the block reported for its tablespace.
    pub fn next_free_blocks_scan(&self) -> Result<Vec<FreeExtent>, Error> {
        let operations = self
            .workers
            .iter()
            .map(|worker| (worker.tablespace, Operation::NextFreeBlocksScan))
            .collect();
        self.run(operations, false)
            .into_iter()
            .map(|outcome| outcome?.into_free_extent())
            .collect()
    }

    /// Returns the tablespace whose next free block has the lowest offset.
    /// Ties go to the smaller file, then to the lower index.
    pub fn find_smallest_tablespace(&self) -> Result<usize, Error> {
        let extents = self.next_free_blocks_scan()?;
        let smallest = extents
            .iter()
            .enumerate()
            .min_by_key(|(index, extent)| (extent.next_free.offset(), extent.file_size, *index))
            .map(|(index, _)| index)
            .unwrap_or(0);
        debug!("smallest tablespace is {smallest} ({extents:?})");
        Ok(smallest)
    }

    /// Forces every tablespace file to stable storage.
    pub fn force_sync(&self) -> Result<(), Error> {
        self.split(|_| Operation::Fsync)
    }

    /// Flushes every tablespace's recovery log and forces its file.
    pub fn commit(&self) -> Result<(), Error> {
        self.split(|worker| {
            if worker.remote {
                Operation::RemoteCommit
            } else {
                Operation::Commit
            }
        })
    }

    /// Forces every tablespace file and checkpoints its recovery log.
    pub fn checkpoint(&self) -> Result<(), Error> {
        self.split(|_| Operation::Checkpoint)
    }

    /// Whether tablespace 0 was created when the database was opened.
    pub fn is_new(&self) -> Result<bool, Error> {
        Ok(self.execute(0, Operation::IsNew)?.long_return != 0)
    }

    /// Syncs every tablespace, then shuts every link down and stops the
    /// remote workers.  Later operations fail with
    /// [`Error::WorkerUnavailable`].
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.force_sync();
        for worker in &self.workers {
            worker.transport.shutdown();
        }
        info!("closed {}", self.path.display());
        result
    }
}

impl Drop for ClusterIoManager {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!("closing {} failed: {error}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use blockio_types::{Geometry, IoConfig, VirtualBlock};

    use super::ClusterIoManager;
    use crate::block::Block;
    use crate::error::Error;
    use crate::test::init_test_logger;

    fn open(dir: &tempfile::TempDir, tablespaces: usize) -> ClusterIoManager {
        init_test_logger();
        let config = IoConfig::local(tablespaces).with_geometry(Geometry::new(512, 4));
        ClusterIoManager::open(dir.path().join("test.db"), true, config).unwrap()
    }

    #[test]
    fn unknown_tablespaces_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open(&dir, 2);
        assert!(matches!(manager.size(5), Err(Error::NoSuchTablespace(5))));
        let block = VirtualBlock::new(3, 0).unwrap();
        assert!(matches!(
            manager.read_block(block),
            Err(Error::NoSuchTablespace(3))
        ));
    }

    #[test]
    fn closed_manager_refuses_requests() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open(&dir, 2);
        assert!(manager.is_new().unwrap());
        manager.close().unwrap();
        manager.close().unwrap();
        assert!(matches!(
            manager.write_block(VirtualBlock::new(1, 0).unwrap(), &Block::free(512)),
            Err(Error::WorkerUnavailable(1))
        ));
        assert!(matches!(
            manager.commit(),
            Err(Error::WorkerUnavailable(0))
        ));
    }

    #[test]
    fn split_operations_advance_the_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let manager = open(&dir, 3);
        assert_eq!(manager.barrier_generation(), 0);
        manager.force_sync().unwrap();
        manager.commit().unwrap();
        manager.checkpoint().unwrap();
        assert_eq!(manager.barrier_generation(), 3);
    }
}
