//! The command a coordinator sends to a node's bootstrap controller.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{Geometry, TransportKind};

/// Starts (or restarts) the worker for one tablespace of one database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartWorker {
    /// Database path as known to the coordinator.
    pub database: PathBuf,

    /// Tablespace the worker serves.
    pub tablespace: usize,

    /// Link the worker must speak.
    pub transport: TransportKind,

    /// Address at which the coordinator listens for this worker.
    pub master: SocketAddr,

    /// Address the worker must bind.
    pub slave: SocketAddr,

    /// Block layout of the tablespace file.
    pub geometry: Geometry,

    /// Identity of the coordinator's open database, for diagnostics.
    pub session: Uuid,
}

impl StartWorker {
    /// Path of the worker's tablespace file on the node.
    ///
    /// See [`tablespace_path`].
    pub fn storage_path(&self, remote_directory: Option<&Path>) -> PathBuf {
        tablespace_path(&self.database, remote_directory, self.tablespace)
    }
}

/// Returns `<dir>/tablespace<N>/<database file name>`, where `<dir>` is
/// `remote_directory` if given and otherwise the parent of `database`.
pub fn tablespace_path(
    database: &Path,
    remote_directory: Option<&Path>,
    tablespace: usize,
) -> PathBuf {
    let parent = remote_directory
        .or_else(|| database.parent())
        .unwrap_or_else(|| Path::new(""));
    let file_name = database
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("database"));
    parent.join(format!("tablespace{tablespace}")).join(file_name)
}
