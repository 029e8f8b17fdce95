//! Links between the master and tablespace workers.
//!
//! The master side of a link implements [`MasterTransport`]: it takes a
//! registered [`ClusterUnit`] and gets it executed by the tablespace's
//! worker, signaling the unit's completion once its result is in.  The
//! worker side of a remote link is a [`WorkerEndpoint`] started by the
//! node's bootstrap controller; it feeds the requests it receives to the
//! worker's [`Dispatcher`] and sends each result back through a
//! [`ResponseSink`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use blockio_types::{ConfigError, StartWorker, TransportKind, UdpConfig};
use tracing::debug;

use crate::bootstrap::Deployment;
use crate::correlation::{ClusterUnit, Completion, CorrelationId, CorrelationTable};
use crate::error::Error;
use crate::request::{IoRequest, Operation, Response};
use crate::worker::Dispatcher;

pub mod direct;
pub mod mpi;
pub mod stream;
pub mod tcp;
pub mod udp;

pub use direct::DirectTransport;

/// Master side of a link to one tablespace worker.
pub trait MasterTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Gets `unit` executed.  The unit must already be registered in the
    /// tablespace's correlation table.  If the link is down, the unit stays
    /// registered and is sent once the link is back.
    ///
    /// An error means the unit will never be executed; its completion has
    /// not been signaled.
    fn send(&self, unit: &Arc<ClusterUnit>) -> Result<(), Error>;

    /// Tears the link down.  Units still outstanding fail with
    /// [`Error::WorkerUnavailable`].
    fn shutdown(&self);
}

/// Worker side of a remote link.
pub trait WorkerEndpoint: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Address the endpoint accepts requests on.
    fn local_address(&self) -> SocketAddr;

    fn shutdown(&self);
}

/// Where a worker sends its results.
pub trait ResponseSink: Send + Sync {
    fn send_response(&self, response: Response);
}

/// Everything a master transport needs to know about its remote worker.
pub struct RemoteLink {
    pub tablespace: usize,
    pub table: Arc<CorrelationTable>,
    pub deployment: Deployment,
    pub reconnect_interval: Duration,
    pub udp: UdpConfig,
}

/// Deploys the remote worker described by `link` and connects to it.
pub fn connect_master(link: RemoteLink) -> Result<Arc<dyn MasterTransport>, Error> {
    match link.deployment.remote.transport {
        TransportKind::Direct => Err(ConfigError::DirectRemote(link.tablespace).into()),
        TransportKind::Tcp => Ok(stream::StreamMaster::connect(tcp::TcpLink, link)?),
        TransportKind::Mpi => Ok(stream::StreamMaster::connect(mpi::MpiLink::new(), link)?),
        TransportKind::Udp => Ok(udp::UdpMaster::connect(link)?),
    }
}

/// Starts the worker side of the link `command` asks for, serving requests
/// with `dispatcher`.
pub fn start_worker_endpoint(
    command: &StartWorker,
    dispatcher: Arc<Dispatcher>,
) -> Result<Box<dyn WorkerEndpoint>, Error> {
    match command.transport {
        TransportKind::Direct => Err(ConfigError::DirectRemote(command.tablespace).into()),
        TransportKind::Tcp => Ok(Box::new(tcp::TcpWorker::start(command, dispatcher)?)),
        TransportKind::Mpi => Ok(Box::new(mpi::MpiWorker::start(command, dispatcher)?)),
        TransportKind::Udp => Ok(Box::new(udp::UdpWorker::start(command, dispatcher)?)),
    }
}

/// Hands a request received by a worker endpoint to its dispatcher.  If the
/// dispatcher refuses it, the failure is sent back right away.
pub(crate) fn dispatch_remote(
    dispatcher: &Dispatcher,
    id: CorrelationId,
    operation: Operation,
    sink: Arc<dyn ResponseSink>,
) {
    let tablespace = dispatcher.tablespace();
    debug!("tablespace {tablespace}: received {id} {}", operation.name());
    let unit = ClusterUnit::with_id(
        id,
        IoRequest::new(tablespace, operation, false),
        Completion::Reply(sink),
    );
    if let Err(error) = dispatcher.enqueue(unit.clone()) {
        unit.fail(error);
        unit.complete();
    }
}
