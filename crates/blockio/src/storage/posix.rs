//! [BlockStorage] implementation using POSIX I/O.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::BlockStorage;
use crate::error::StorageError;

/// A tablespace file on the local file system.
pub struct PosixStorage {
    path: PathBuf,
    file: Option<File>,
    position: u64,
    is_new: bool,
}

impl PosixStorage {
    /// Opens the file at `path`.  With `create`, a missing file and any
    /// missing parent directories are created.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if create {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)?;
        let is_new = file.metadata()?.len() == 0;
        debug!("opened {} (new: {is_new})", path.display());
        Ok(Self {
            path,
            file: Some(file),
            position: 0,
            is_new,
        })
    }

    fn file(&self) -> Result<&File, StorageError> {
        self.file.as_ref().ok_or(StorageError::Closed)
    }
}

impl BlockStorage for PosixStorage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn seek(&mut self, offset: u64) -> Result<(), StorageError> {
        self.file()?;
        self.position = offset;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        let offset = self.position;
        match self.file()?.read_exact_at(buf, offset) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(StorageError::ShortRead {
                offset,
                wanted: buf.len(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.file()?.write_all_at(data, self.position)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(self.file()?.metadata()?.len())
    }

    fn set_length(&mut self, len: u64) -> Result<(), StorageError> {
        Ok(self.file()?.set_len(len)?)
    }

    fn force(&mut self) -> Result<(), StorageError> {
        Ok(self.file()?.sync_data()?)
    }

    fn is_new(&self) -> bool {
        self.is_new
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            debug!("closed {}", self.path.display());
        }
        Ok(())
    }
}
