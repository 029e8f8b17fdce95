//! Coordinator and node configuration.
//!
//! Every structure here deserializes from YAML or JSON with defaults for
//! omitted fields, so the smallest useful configuration is an empty document,
//! which describes eight local tablespaces with the default [`Geometry`].

use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::MAX_TABLESPACES;

/// Default size of a block, in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default number of blocks added each time a tablespace file grows.
pub const DEFAULT_BUCKET_COUNT: usize = 1024;

/// Default capacity of a worker's node block buffer, in blocks.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Default delay between reconnection attempts.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3000;

/// Largest block that still fits, with framing, in one UDP datagram.
pub const MAX_DATAGRAM_BLOCK_SIZE: usize = 60 * 1024;

/// An invalid configuration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("block size {0} must be a multiple of 512 and at least 512")]
    InvalidBlockSize(usize),

    #[error("bucket count must be positive")]
    InvalidBucketCount,

    #[error("a database needs between 1 and {MAX_TABLESPACES} tablespaces, not {0}")]
    TablespaceCount(usize),

    #[error("tablespace {0} is remote but asks for the direct transport")]
    DirectRemote(usize),

    #[error("tablespace {tablespace} uses UDP, which cannot carry blocks of {block_size} bytes")]
    DatagramTooSmall { tablespace: usize, block_size: usize },

    #[error("node block buffer capacity must be positive")]
    BufferCapacity,

    #[error("unknown transport {0:?}")]
    UnknownTransport(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// The link between the coordinator and a tablespace worker.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process hand-off to a local worker thread.
    #[default]
    Direct,

    /// A pair of persistent TCP streams.
    Tcp,

    /// One datagram per request and per response.
    Udp,

    /// A rank-addressed connect/accept intercommunicator.
    Mpi,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
            TransportKind::Mpi => write!(f, "mpi"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" | "local" => Ok(TransportKind::Direct),
            "tcp" => Ok(TransportKind::Tcp),
            "udp" => Ok(TransportKind::Udp),
            "mpi" => Ok(TransportKind::Mpi),
            _ => Err(ConfigError::UnknownTransport(s.to_string())),
        }
    }
}

/// Physical layout of every tablespace file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Geometry {
    /// Size of one block, in bytes.
    pub block_size: usize,

    /// Number of blocks a tablespace file grows by when it runs out of free
    /// blocks.
    pub bucket_count: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            bucket_count: DEFAULT_BUCKET_COUNT,
        }
    }
}

impl Geometry {
    pub const fn new(block_size: usize, bucket_count: usize) -> Self {
        Self {
            block_size,
            bucket_count,
        }
    }

    /// Block size as a file offset increment.
    pub const fn block_bytes(&self) -> u64 {
        self.block_size as u64
    }

    /// Number of bytes a tablespace file grows by on extension.
    pub const fn pool_size(&self) -> u64 {
        self.block_size as u64 * self.bucket_count as u64
    }

    /// First offset the allocator may hand out in `tablespace`.  Tablespace 0
    /// keeps its first block for the root page.
    pub const fn reserved_offset(&self, tablespace: usize) -> u64 {
        if tablespace == 0 {
            self.block_size as u64
        } else {
            0
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size < 512 || self.block_size % 512 != 0 {
            return Err(ConfigError::InvalidBlockSize(self.block_size));
        }
        if self.bucket_count == 0 {
            return Err(ConfigError::InvalidBucketCount);
        }
        Ok(())
    }
}

/// Where a remote tablespace worker runs and how to reach it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTablespace {
    /// Link to use; must not be [`TransportKind::Direct`].
    pub transport: TransportKind,

    /// Control address of the node's bootstrap controller.
    pub bootstrap: SocketAddr,

    /// Address the coordinator binds for this worker.  Port 0 lets the
    /// kernel choose.
    pub master: SocketAddr,

    /// Address the worker binds on its node.  Port 0 lets the kernel choose;
    /// the bootstrap controller reports the port actually bound.
    pub slave: SocketAddr,
}

/// Placement of one tablespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "location", rename_all = "snake_case")]
pub enum TablespaceConfig {
    /// Served by a worker thread inside the coordinator process.
    #[default]
    Local,

    /// Served by a worker deployed on another node.
    Remote(RemoteTablespace),
}

impl TablespaceConfig {
    pub fn transport(&self) -> TransportKind {
        match self {
            TablespaceConfig::Local => TransportKind::Direct,
            TablespaceConfig::Remote(remote) => remote.transport,
        }
    }
}

/// Datagram retransmission settings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Resend a request that has not been answered after this many
    /// milliseconds.  `None` disables retransmission: a lost datagram then
    /// stalls its caller indefinitely.
    pub retry_timeout_ms: Option<u64>,

    /// Give up on a request after this many retransmissions.
    pub max_retries: u32,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            retry_timeout_ms: Some(2000),
            max_retries: 5,
        }
    }
}

impl UdpConfig {
    pub fn retry_timeout(&self) -> Option<Duration> {
        self.retry_timeout_ms.map(Duration::from_millis)
    }
}

/// Configuration of one open database, as seen by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Block layout shared by all tablespaces.
    pub geometry: Geometry,

    /// Capacity of each local worker's node block buffer, in blocks.
    pub buffer_capacity: usize,

    /// One entry per tablespace, in index order.
    pub tablespaces: Vec<TablespaceConfig>,

    /// Delay between attempts to redeploy a lost remote worker.
    pub reconnect_interval_ms: u64,

    /// Deadline for a single bootstrap controller call.
    pub bootstrap_timeout_ms: u64,

    pub udp: UdpConfig,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self::local(MAX_TABLESPACES)
    }
}

impl IoConfig {
    /// A configuration with `tablespaces` local tablespaces.
    pub fn local(tablespaces: usize) -> Self {
        Self {
            geometry: Geometry::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            tablespaces: vec![TablespaceConfig::Local; tablespaces],
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            bootstrap_timeout_ms: 10_000,
            udp: UdpConfig::default(),
        }
    }

    pub fn with_geometry(self, geometry: Geometry) -> Self {
        Self { geometry, ..self }
    }

    /// Parses a YAML (or JSON) document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn n_tablespaces(&self) -> usize {
        self.tablespaces.len()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.geometry.validate()?;
        if self.buffer_capacity == 0 {
            return Err(ConfigError::BufferCapacity);
        }
        let n = self.tablespaces.len();
        if n == 0 || n > MAX_TABLESPACES {
            return Err(ConfigError::TablespaceCount(n));
        }
        for (index, tablespace) in self.tablespaces.iter().enumerate() {
            match tablespace.transport() {
                TransportKind::Direct if matches!(tablespace, TablespaceConfig::Remote(_)) => {
                    return Err(ConfigError::DirectRemote(index));
                }
                TransportKind::Udp if self.geometry.block_size > MAX_DATAGRAM_BLOCK_SIZE => {
                    return Err(ConfigError::DatagramTooSmall {
                        tablespace: index,
                        block_size: self.geometry.block_size,
                    });
                }
                _ => (),
            }
        }
        Ok(())
    }
}

/// Configuration of a node that hosts remote tablespace workers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address of the bootstrap controller's control port.
    pub control_address: SocketAddr,

    /// Directory under which worker files are kept.  If unset, workers use
    /// the parent directory of the database path they are given.
    #[serde(default)]
    pub remote_directory: Option<PathBuf>,

    /// Capacity of each worker's node block buffer, in blocks.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::{
        ConfigError, Geometry, IoConfig, TablespaceConfig, TransportKind, UdpConfig,
    };

    #[test]
    fn empty_document_uses_defaults() {
        let config = IoConfig::from_yaml("{}").unwrap();
        assert_eq!(config, IoConfig::default());
        assert_eq!(config.n_tablespaces(), 8);
        assert_eq!(config.geometry.pool_size(), 4096 * 1024);
    }

    #[test]
    fn remote_tablespaces() {
        let config = IoConfig::from_yaml(
            r#"
geometry:
  block_size: 1024
  bucket_count: 4
tablespaces:
  - location: local
  - location: remote
    transport: tcp
    bootstrap: 10.0.0.2:9000
    master: 10.0.0.1:9101
    slave: 10.0.0.2:9201
udp:
  retry_timeout_ms: null
"#,
        )
        .unwrap();
        assert_eq!(config.geometry, Geometry::new(1024, 4));
        assert_eq!(config.tablespaces[0], TablespaceConfig::Local);
        assert_eq!(config.tablespaces[1].transport(), TransportKind::Tcp);
        assert_eq!(config.udp.retry_timeout(), None);
        assert_eq!(config.udp.max_retries, UdpConfig::default().max_retries);
    }

    #[test]
    fn rejects_bad_layouts() {
        let mut config = IoConfig::local(0);
        assert_eq!(config.validate(), Err(ConfigError::TablespaceCount(0)));
        config = IoConfig::local(9);
        assert_eq!(config.validate(), Err(ConfigError::TablespaceCount(9)));
        config = IoConfig::local(1).with_geometry(Geometry::new(1000, 1));
        assert_eq!(config.validate(), Err(ConfigError::InvalidBlockSize(1000)));
        config = IoConfig::local(1).with_geometry(Geometry::new(512, 0));
        assert_eq!(config.validate(), Err(ConfigError::InvalidBucketCount));
    }

    #[test]
    fn reserved_root_block() {
        let geometry = Geometry::new(512, 8);
        assert_eq!(geometry.reserved_offset(0), 512);
        assert_eq!(geometry.reserved_offset(3), 0);
    }

    #[test]
    fn transport_names() {
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!(TransportKind::Mpi.to_string(), "mpi");
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
