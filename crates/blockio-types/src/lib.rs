//! Types shared by the blockio coordinator and the nodes that host remote
//! tablespace workers.

pub mod address;
pub mod bootstrap;
pub mod config;

pub use address::{AddressError, VirtualBlock, MAX_TABLESPACES};
pub use bootstrap::{tablespace_path, StartWorker};
pub use config::{
    ConfigError, Geometry, IoConfig, NodeConfig, RemoteTablespace, TablespaceConfig,
    TransportKind, UdpConfig,
};
