//! The storage primitive underneath a tablespace.
//!
//! A [`BlockStorage`] is a seekable, growable byte file.  It is owned by the
//! dispatch thread of the tablespace that uses it, so implementations need to
//! be [`Send`] but never [`Sync`].

use std::path::Path;

use crate::error::StorageError;

pub mod memory;
pub mod posix;

pub use memory::MemoryStorage;
pub use posix::PosixStorage;

/// A file holding the blocks of one tablespace.
pub trait BlockStorage: Send {
    /// Path of the file, for diagnostics.
    fn path(&self) -> &Path;

    /// Moves the cursor to `offset`.  Seeking past the end is allowed; reads
    /// there fail and writes extend the file.
    fn seek(&mut self, offset: u64) -> Result<(), StorageError>;

    /// Current cursor position.
    fn position(&self) -> u64;

    /// Fills `buf` from the cursor and advances it.  Fails with
    /// [`StorageError::ShortRead`] if the file ends first.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Writes all of `data` at the cursor and advances it.
    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Current file length in bytes.
    fn size(&self) -> Result<u64, StorageError>;

    /// Truncates or zero-extends the file to `len` bytes.
    fn set_length(&mut self, len: u64) -> Result<(), StorageError>;

    /// Makes every completed write durable.
    fn force(&mut self) -> Result<(), StorageError>;

    /// Whether the file was missing or empty when it was opened.
    fn is_new(&self) -> bool;

    fn is_open(&self) -> bool;

    /// Releases the file.  Every later call except [`Self::is_open`] and
    /// [`Self::close`] fails with [`StorageError::Closed`].
    fn close(&mut self) -> Result<(), StorageError>;

    /// Reads `len` bytes at `offset`.
    fn seek_and_read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        self.seek(offset)?;
        let mut buf = vec![0; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes `data` at `offset`.
    fn seek_and_write(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.seek(offset)?;
        self.write_all(data)
    }
}

impl<S> BlockStorage for Box<S>
where
    S: BlockStorage + ?Sized,
{
    fn path(&self) -> &Path {
        (**self).path()
    }
    fn seek(&mut self, offset: u64) -> Result<(), StorageError> {
        (**self).seek(offset)
    }
    fn position(&self) -> u64 {
        (**self).position()
    }
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        (**self).read_exact(buf)
    }
    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        (**self).write_all(data)
    }
    fn size(&self) -> Result<u64, StorageError> {
        (**self).size()
    }
    fn set_length(&mut self, len: u64) -> Result<(), StorageError> {
        (**self).set_length(len)
    }
    fn force(&mut self) -> Result<(), StorageError> {
        (**self).force()
    }
    fn is_new(&self) -> bool {
        (**self).is_new()
    }
    fn is_open(&self) -> bool {
        (**self).is_open()
    }
    fn close(&mut self) -> Result<(), StorageError> {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockStorage, MemoryStorage, PosixStorage};
    use crate::error::StorageError;

    fn exercise(storage: &mut dyn BlockStorage) {
        assert!(storage.is_open());
        assert_eq!(storage.size().unwrap(), 0);

        storage.seek_and_write(8, b"abcd").unwrap();
        assert_eq!(storage.size().unwrap(), 12);
        assert_eq!(storage.position(), 12);
        assert_eq!(storage.seek_and_read(0, 8).unwrap(), vec![0; 8]);
        assert_eq!(storage.seek_and_read(9, 2).unwrap(), b"bc");
        assert!(matches!(
            storage.seek_and_read(10, 4),
            Err(StorageError::ShortRead { offset: 10, .. })
        ));

        storage.set_length(4).unwrap();
        assert_eq!(storage.size().unwrap(), 4);
        storage.force().unwrap();

        storage.close().unwrap();
        assert!(!storage.is_open());
        assert_eq!(storage.size(), Err(StorageError::Closed));
    }

    #[test]
    fn posix() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = PosixStorage::open(dir.path().join("nested/ts"), true).unwrap();
        assert!(storage.is_new());
        exercise(&mut storage);

        let reopened = PosixStorage::open(dir.path().join("nested/ts"), false).unwrap();
        assert!(!reopened.is_new());
        assert!(PosixStorage::open(dir.path().join("missing"), false).is_err());
    }

    #[test]
    fn memory() {
        let mut storage = MemoryStorage::new("ts");
        assert!(storage.is_new());
        exercise(&mut storage);
    }
}
