//! [BlockStorage] implementation using memory.
//!
//! This is useful for testing, not as part of a production system.  A quota
//! makes growth fail the way a full disk would.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::BlockStorage;
use crate::error::StorageError;

/// Contents of a [`MemoryStorage`], shared with whoever holds a
/// [`MemoryStorage::contents`] handle.
#[derive(Default, Debug)]
pub struct MemoryFile {
    pub data: Vec<u8>,

    /// Number of times the file was forced.
    pub forces: usize,
}

pub struct MemoryStorage {
    path: PathBuf,
    file: Arc<Mutex<MemoryFile>>,
    position: u64,
    quota: Option<u64>,
    is_new: bool,
    open: bool,
}

impl MemoryStorage {
    /// An empty file.  `path` is only used in diagnostics.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_contents(path, Vec::new())
    }

    /// A file that initially holds `data`.
    pub fn with_contents<P: AsRef<Path>>(path: P, data: Vec<u8>) -> Self {
        let is_new = data.is_empty();
        Self {
            path: path.as_ref().to_path_buf(),
            file: Arc::new(Mutex::new(MemoryFile { data, forces: 0 })),
            position: 0,
            quota: None,
            is_new,
            open: true,
        }
    }

    /// Limits the file to `quota` bytes.  Writes and length changes beyond
    /// it fail with [`StorageError::QuotaExceeded`].
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    /// A handle on the file's contents that stays valid after the storage
    /// is moved into a tablespace.
    pub fn contents(&self) -> Arc<Mutex<MemoryFile>> {
        self.file.clone()
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::Closed)
        }
    }

    fn check_quota(&self, requested: u64) -> Result<(), StorageError> {
        match self.quota {
            Some(quota) if requested > quota => {
                Err(StorageError::QuotaExceeded { requested, quota })
            }
            _ => Ok(()),
        }
    }
}

impl BlockStorage for MemoryStorage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn seek(&mut self, offset: u64) -> Result<(), StorageError> {
        self.check_open()?;
        self.position = offset;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_open()?;
        let file = self.file.lock().unwrap();
        let start = self.position as usize;
        let end = start + buf.len();
        if end > file.data.len() {
            return Err(StorageError::ShortRead {
                offset: self.position,
                wanted: buf.len(),
            });
        }
        buf.copy_from_slice(&file.data[start..end]);
        drop(file);
        self.position = end as u64;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.check_open()?;
        let end = self.position + data.len() as u64;
        self.check_quota(end)?;
        let mut file = self.file.lock().unwrap();
        let start = self.position as usize;
        if file.data.len() < end as usize {
            file.data.resize(end as usize, 0);
        }
        file.data[start..end as usize].copy_from_slice(data);
        drop(file);
        self.position = end;
        Ok(())
    }

    fn size(&self) -> Result<u64, StorageError> {
        self.check_open()?;
        Ok(self.file.lock().unwrap().data.len() as u64)
    }

    fn set_length(&mut self, len: u64) -> Result<(), StorageError> {
        self.check_open()?;
        self.check_quota(len)?;
        self.file.lock().unwrap().data.resize(len as usize, 0);
        Ok(())
    }

    fn force(&mut self) -> Result<(), StorageError> {
        self.check_open()?;
        self.file.lock().unwrap().forces += 1;
        Ok(())
    }

    fn is_new(&self) -> bool {
        self.is_new
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStorage;
    use crate::error::StorageError;
    use crate::storage::BlockStorage;

    #[test]
    fn quota() {
        let mut storage = MemoryStorage::new("ts").with_quota(16);
        storage.seek_and_write(0, &[1; 16]).unwrap();
        assert_eq!(
            storage.seek_and_write(12, &[2; 8]),
            Err(StorageError::QuotaExceeded {
                requested: 20,
                quota: 16
            })
        );
        assert_eq!(storage.size().unwrap(), 16);
        assert!(storage.set_length(17).is_err());
        storage.set_length(8).unwrap();

        let contents = storage.contents();
        storage.force().unwrap();
        assert_eq!(contents.lock().unwrap().data, vec![1; 8]);
        assert_eq!(contents.lock().unwrap().forces, 1);
    }
}
