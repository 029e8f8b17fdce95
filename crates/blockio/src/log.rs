//! The write-ahead recovery log, as seen by the block layer.
//!
//! The log itself lives above this crate.  A tablespace only needs to flush
//! it before a commit is made durable, mark a checkpoint after one, and
//! replay it when an existing file is reopened.

use std::path::Path;

use crate::error::StorageError;

/// Recovery log of one tablespace.
pub trait RecoveryLog: Send {
    /// Makes every logged record durable.  Called before the tablespace file
    /// is forced on commit.
    fn flush(&mut self) -> Result<(), StorageError>;

    /// Records that every change up to now is in the tablespace file.  Called
    /// after the file is forced on checkpoint.
    fn checkpoint(&mut self) -> Result<(), StorageError>;

    /// Replays outstanding records after an existing tablespace was reopened.
    fn recover(&mut self) -> Result<(), StorageError>;
}

/// Creates the [`RecoveryLog`] for each tablespace a database opens.
pub trait RecoveryLogFactory: Send + Sync {
    fn create(&self, tablespace: usize, path: &Path) -> Result<Box<dyn RecoveryLog>, StorageError>;
}

/// A log with nothing in it.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullRecoveryLog;

impl RecoveryLog for NullRecoveryLog {
    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn recover(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl RecoveryLogFactory for NullRecoveryLog {
    fn create(
        &self,
        _tablespace: usize,
        _path: &Path,
    ) -> Result<Box<dyn RecoveryLog>, StorageError> {
        Ok(Box::new(NullRecoveryLog))
    }
}
