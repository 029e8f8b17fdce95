//! The closed catalog of block operations and their result slots.
//!
//! An [`IoRequest`] is created by the manager for one tablespace, carried to
//! that tablespace's worker (in process or as a [`Frame`](crate::wire::Frame)),
//! and [processed](IoRequest::process) there.  The worker fills in a 64-bit
//! result and an optional object result.  Remote results come back as a
//! [`Response`] and are copied into the master's copy of the request.

use blockio_types::VirtualBlock;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::correlation::CorrelationId;
use crate::error::{Error, FailureKind};
use crate::tablespace::Tablespace;

/// One operation on a tablespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Reads and decodes one block, through the node block buffer.
    SeekRead { block: VirtualBlock },

    /// Reads one whole page, bypassing the buffer.
    SeekReadFully { block: VirtualBlock },

    /// Writes one block.
    SeekWrite { block: VirtualBlock, data: Block },

    /// Writes one whole page given as raw bytes.
    SeekWriteFully {
        block: VirtualBlock,
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    },

    /// Returns the tablespace file size.
    Size,

    /// Allocates a free block, advancing from `known_free` if it is given.
    NextFreeBlock { known_free: Option<VirtualBlock> },

    /// Reports the next free block without allocating it, and the file size
    /// beforehand.
    NextFreeBlocksScan,

    /// Forces the tablespace file.
    Fsync,

    /// Whether the tablespace file was new when it was opened.
    IsNew,

    /// Flushes the recovery log, then forces the file.
    Commit,

    /// [`Operation::Commit`] on a remote worker.
    RemoteCommit,

    /// Forces the file, then checkpoints the recovery log.
    Checkpoint,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::SeekRead { .. } => "seek_read",
            Operation::SeekReadFully { .. } => "seek_read_fully",
            Operation::SeekWrite { .. } => "seek_write",
            Operation::SeekWriteFully { .. } => "seek_write_fully",
            Operation::Size => "size",
            Operation::NextFreeBlock { .. } => "next_free_block",
            Operation::NextFreeBlocksScan => "next_free_blocks_scan",
            Operation::Fsync => "fsync",
            Operation::IsNew => "is_new",
            Operation::Commit => "commit",
            Operation::RemoteCommit => "remote_commit",
            Operation::Checkpoint => "checkpoint",
        }
    }

    /// Whether the operation is one share of a split operation that passes
    /// the rendezvous barrier.
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            Operation::Fsync | Operation::Commit | Operation::RemoteCommit | Operation::Checkpoint
        )
    }
}

/// Result of [`Operation::NextFreeBlocksScan`] for one tablespace.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeExtent {
    /// The block the next allocation will hand out.
    pub next_free: VirtualBlock,

    /// Size of the file before the scan, which is smaller than the size
    /// after it if the scan had to extend the file.
    pub file_size: u64,
}

/// A failed operation, in a form that can cross the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,

    /// The original error, when the failure never left the process.
    #[serde(skip)]
    source: Option<Box<Error>>,
}

impl Failure {
    /// Converts back to an [`Error`], reconstructing a
    /// [`Error::Remote`] if the typed error did not survive the trip.
    pub fn into_error(self, tablespace: usize) -> Error {
        match self.source {
            Some(source) => *source,
            None => Error::Remote {
                tablespace,
                kind: self.kind,
                message: self.message,
            },
        }
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self {
            kind: error.failure_kind(),
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}

/// Object result of a request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ObjectReturn {
    Block(Block),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    FreeExtent(FreeExtent),
    Failure(Failure),
}

/// The part of a processed request that travels back to the master.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: CorrelationId,
    pub long_return: i64,
    pub object_return: Option<ObjectReturn>,
}

/// Results of a successful request.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub tablespace: usize,
    pub operation: &'static str,
    pub long_return: i64,
    pub object_return: Option<ObjectReturn>,
}

impl Outcome {
    fn protocol_error(&self) -> Error {
        Error::Protocol {
            tablespace: self.tablespace,
            operation: self.operation,
        }
    }

    pub fn into_block(self) -> Result<Block, Error> {
        match self.object_return {
            Some(ObjectReturn::Block(block)) => Ok(block),
            _ => Err(self.protocol_error()),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, Error> {
        match self.object_return {
            Some(ObjectReturn::Bytes(bytes)) => Ok(bytes),
            _ => Err(self.protocol_error()),
        }
    }

    pub fn into_free_extent(self) -> Result<FreeExtent, Error> {
        match self.object_return {
            Some(ObjectReturn::FreeExtent(extent)) => Ok(extent),
            _ => Err(self.protocol_error()),
        }
    }

    /// The 64-bit result, which must not be negative.
    pub fn unsigned(&self) -> Result<u64, Error> {
        u64::try_from(self.long_return).map_err(|_| self.protocol_error())
    }

    /// The 64-bit result as a virtual block address.  Addresses in the upper
    /// tablespaces have the sign bit set.
    pub fn virtual_block(&self) -> VirtualBlock {
        VirtualBlock::from_raw(self.long_return as u64)
    }
}

/// A request for one tablespace with its result slots.
#[derive(Debug)]
pub struct IoRequest {
    tablespace: usize,
    propagate: bool,
    operation: Operation,
    long_return: i64,
    object_return: Option<ObjectReturn>,
    processed: bool,
}

impl IoRequest {
    /// `propagate` tells whether the request has to travel to a remote
    /// worker.
    pub fn new(tablespace: usize, operation: Operation, propagate: bool) -> Self {
        Self {
            tablespace,
            propagate,
            operation,
            long_return: 0,
            object_return: None,
            processed: false,
        }
    }

    pub fn tablespace(&self) -> usize {
        self.tablespace
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn do_propagate(&self) -> bool {
        self.propagate
    }

    pub fn is_barrier(&self) -> bool {
        self.operation.is_barrier()
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn long_return(&self) -> i64 {
        self.long_return
    }

    pub fn object_return(&self) -> Option<&ObjectReturn> {
        self.object_return.as_ref()
    }

    pub fn set_long_return(&mut self, long_return: i64) {
        self.long_return = long_return;
    }

    pub fn set_object_return(&mut self, object_return: Option<ObjectReturn>) {
        self.object_return = object_return;
    }

    /// Executes the operation against `tablespace`.  An error becomes the
    /// request's [`ObjectReturn::Failure`].  Executing a request again
    /// overwrites its earlier results.
    pub fn process(&mut self, tablespace: &mut Tablespace) {
        match self.execute(tablespace) {
            Ok((long_return, object_return)) => {
                self.long_return = long_return;
                self.object_return = object_return;
            }
            Err(error) => self.fail(error),
        }
        self.processed = true;
    }

    fn execute(
        &self,
        tablespace: &mut Tablespace,
    ) -> Result<(i64, Option<ObjectReturn>), Error> {
        let block_size = tablespace.geometry().block_size as i64;
        Ok(match &self.operation {
            Operation::SeekRead { block } => {
                let block = tablespace.seek_read(*block)?;
                (block_size, Some(ObjectReturn::Block(block)))
            }
            Operation::SeekReadFully { block } => {
                let bytes = tablespace.seek_read_fully(*block)?;
                (bytes.len() as i64, Some(ObjectReturn::Bytes(bytes)))
            }
            Operation::SeekWrite { block, data } => {
                (tablespace.seek_write(*block, data)? as i64, None)
            }
            Operation::SeekWriteFully { block, bytes } => {
                (tablespace.seek_write_fully(*block, bytes)? as i64, None)
            }
            Operation::Size => (tablespace.size()? as i64, None),
            Operation::NextFreeBlock { known_free } => {
                (tablespace.next_free_block(*known_free)?.raw() as i64, None)
            }
            Operation::NextFreeBlocksScan => {
                let extent = tablespace.free_extent()?;
                (
                    extent.next_free.raw() as i64,
                    Some(ObjectReturn::FreeExtent(extent)),
                )
            }
            Operation::Fsync => {
                tablespace.fsync()?;
                (0, None)
            }
            Operation::IsNew => (tablespace.is_new() as i64, None),
            Operation::Commit | Operation::RemoteCommit => {
                tablespace.commit()?;
                (0, None)
            }
            Operation::Checkpoint => {
                tablespace.checkpoint()?;
                (0, None)
            }
        })
    }

    /// Records `error` as the request's result.
    pub fn fail(&mut self, error: Error) {
        self.long_return = -1;
        self.object_return = Some(ObjectReturn::Failure(error.into()));
        self.processed = true;
    }

    /// The wire form of the request's results.
    pub fn response(&self, id: CorrelationId) -> Response {
        Response {
            id,
            long_return: self.long_return,
            object_return: self.object_return.clone(),
        }
    }

    /// Copies the results of a remote execution into this request.
    pub fn rehydrate(&mut self, response: Response) {
        self.set_long_return(response.long_return);
        self.set_object_return(response.object_return);
        self.processed = true;
    }

    /// Moves the results out of the request.  A request that was never
    /// processed failed because its worker went away.
    pub fn take_outcome(&mut self) -> Result<Outcome, Error> {
        if !self.processed {
            return Err(Error::WorkerUnavailable(self.tablespace));
        }
        match self.object_return.take() {
            Some(ObjectReturn::Failure(failure)) => Err(failure.into_error(self.tablespace)),
            object_return => Ok(Outcome {
                tablespace: self.tablespace,
                operation: self.operation.name(),
                long_return: self.long_return,
                object_return,
            }),
        }
    }
}
