//! Block I/O for paged key-value stores whose pages are spread over up to
//! eight tablespaces.
//!
//! A [`ClusterIoManager`] routes each page operation to the worker of the
//! tablespace encoded in the page's [`VirtualBlock`] address.  Workers run
//! in-process or on other nodes, where a [`BootstrapController`] deploys
//! them on request.

pub mod allocator;
pub mod block;
pub mod bootstrap;
pub mod buffer;
pub mod correlation;
pub mod error;
pub mod log;
pub mod manager;
pub mod metrics;
pub mod request;
pub mod storage;
pub mod sync;
pub mod tablespace;
pub mod test;
pub mod tokio;
pub mod transport;
pub mod wire;
pub mod worker;

pub use blockio_types::{
    Geometry, IoConfig, NodeConfig, RemoteTablespace, TablespaceConfig, TransportKind,
    VirtualBlock,
};

pub use block::Block;
pub use bootstrap::{BootstrapController, ControllerHandle};
pub use error::{Error, StorageError, TransportError};
pub use log::{RecoveryLog, RecoveryLogFactory};
pub use manager::ClusterIoManager;
pub use request::FreeExtent;
