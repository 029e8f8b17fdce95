//! Deploying remote tablespace workers.
//!
//! Every node that hosts remote tablespaces runs a [`BootstrapController`]
//! on its control port.  A coordinator that opens a database sends each
//! node a [`StartWorker`] command per remote tablespace; the controller
//! opens the tablespace file, starts a worker for it and reports the address
//! the worker's endpoint is bound to.  The same command is sent again to
//! redeploy a worker after its link failed.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use blockio_types::{Geometry, NodeConfig, RemoteTablespace, StartWorker};
use futures::{
    future::{self, Ready},
    prelude::*,
};
use tarpc::{
    client::{self, RpcError},
    context,
    serde_transport::tcp::{connect, listen},
    server::{self, Channel},
    tokio_serde::formats::Bincode,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::buffer::NodeBlockBuffer;
use crate::error::{Error, TransportError};
use crate::log::{NullRecoveryLog, RecoveryLogFactory};
use crate::storage::PosixStorage;
use crate::tablespace::Tablespace;
use crate::tokio::TOKIO;
use crate::transport::{start_worker_endpoint, WorkerEndpoint};
use crate::worker::Dispatcher;

#[tarpc::service]
pub trait Bootstrap {
    /// Starts the worker `command` describes, replacing any worker already
    /// running on the same file.  Returns the worker's bound address.
    async fn start_worker(command: StartWorker) -> Result<SocketAddr, String>;

    /// Stops the worker for `tablespace` of `database`.  Returns whether one
    /// was running.
    async fn stop_worker(database: PathBuf, tablespace: usize) -> bool;
}

/// The coordinator's view of one remote worker: where its controller is and
/// what to ask it.
#[derive(Clone, Debug)]
pub struct Deployment {
    pub database: PathBuf,
    pub tablespace: usize,
    pub remote: RemoteTablespace,
    pub geometry: Geometry,
    pub session: Uuid,

    /// Limit on each call to the controller, connection included.
    pub timeout: Duration,
}

impl Deployment {
    /// Asks the controller to (re)start the worker, telling it that the
    /// master is at `master`.  Returns the worker's address.
    pub fn deploy(&self, master: SocketAddr) -> Result<SocketAddr, TransportError> {
        let command = StartWorker {
            database: self.database.clone(),
            tablespace: self.tablespace,
            transport: self.remote.transport,
            master,
            slave: self.remote.slave,
            geometry: self.geometry,
            session: self.session,
        };
        info!(
            "tablespace {}: deploying {} worker through {}",
            self.tablespace, self.remote.transport, self.remote.bootstrap
        );
        self.call(|client, ctx| async move { client.start_worker(ctx, command).await })?
            .map_err(|message| self.error(message))
    }

    /// Asks the controller to stop the worker.  Returns whether it was
    /// running.
    pub fn stop(&self) -> Result<bool, TransportError> {
        let database = self.database.clone();
        let tablespace = self.tablespace;
        self.call(|client, ctx| async move { client.stop_worker(ctx, database, tablespace).await })
    }

    fn error(&self, message: String) -> TransportError {
        TransportError::Bootstrap {
            address: self.remote.bootstrap,
            message,
        }
    }

    fn call<F, Fut, T>(&self, request: F) -> Result<T, TransportError>
    where
        F: FnOnce(BootstrapClient, context::Context) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let address = self.remote.bootstrap;
        let timeout = self.timeout;
        TOKIO.block_on(async move {
            let mut transport = connect(address, Bincode::default);
            transport.config_mut().max_frame_length(usize::MAX);
            let transport = tokio::time::timeout(timeout, transport)
                .await
                .map_err(|_| self.error(format!("no connection after {timeout:?}")))?
                .map_err(|error| self.error(error.to_string()))?;
            let client = BootstrapClient::new(client::Config::default(), transport).spawn();
            let mut ctx = context::current();
            ctx.deadline = SystemTime::now() + timeout;
            request(client, ctx)
                .await
                .map_err(|error| self.error(error.to_string()))
        })
    }
}

struct RunningWorker {
    session: Uuid,
    dispatcher: Arc<Dispatcher>,
    endpoint: Box<dyn WorkerEndpoint>,
}

impl RunningWorker {
    fn stop(self) {
        self.endpoint.shutdown();
        self.dispatcher.shutdown();
    }
}

/// Starts and stops the tablespace workers of one node.
#[derive(Clone)]
pub struct BootstrapController {
    config: Arc<NodeConfig>,
    workers: Arc<Mutex<HashMap<PathBuf, RunningWorker>>>,
    log_factory: Arc<dyn RecoveryLogFactory>,
}

impl BootstrapController {
    pub fn new(config: NodeConfig) -> Self {
        Self::with_log(config, Arc::new(NullRecoveryLog))
    }

    /// Like [`new`](Self::new), with the recovery logs of the workers' files
    /// created by `log_factory`.
    pub fn with_log(config: NodeConfig, log_factory: Arc<dyn RecoveryLogFactory>) -> Self {
        Self {
            config: Arc::new(config),
            workers: Arc::new(Mutex::new(HashMap::new())),
            log_factory,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn storage_path(&self, database: &Path, tablespace: usize) -> PathBuf {
        blockio_types::tablespace_path(
            database,
            self.config.remote_directory.as_deref(),
            tablespace,
        )
    }

    /// Number of workers running.
    pub fn running(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Starts the worker `command` describes.  See [`Bootstrap::start_worker`].
    pub fn start(&self, command: &StartWorker) -> Result<SocketAddr, Error> {
        let path = command.storage_path(self.config.remote_directory.as_deref());

        // Stop the old worker before opening the file again and binding its
        // address.
        let previous = self.workers.lock().unwrap().remove(&path);
        if let Some(previous) = previous {
            info!(
                "tablespace {}: replacing worker of session {} for {}",
                command.tablespace,
                previous.session,
                path.display()
            );
            previous.stop();
        }

        let storage = PosixStorage::open(&path, true)?;
        let log = self.log_factory.create(command.tablespace, &path)?;
        let tablespace = Tablespace::open(
            command.tablespace,
            command.geometry,
            Box::new(storage),
            Arc::new(NodeBlockBuffer::new(self.config.buffer_capacity)),
            log,
        )?;
        let dispatcher = Arc::new(Dispatcher::spawn(tablespace)?);
        let endpoint = start_worker_endpoint(command, dispatcher.clone())?;
        let address = endpoint.local_address();
        info!(
            "tablespace {}: {} worker for session {} serving {} on {address}",
            command.tablespace,
            command.transport,
            command.session,
            path.display()
        );
        self.workers.lock().unwrap().insert(
            path,
            RunningWorker {
                session: command.session,
                dispatcher,
                endpoint,
            },
        );
        Ok(address)
    }

    /// Stops the worker for `tablespace` of `database`, if one is running.
    pub fn stop(&self, database: &Path, tablespace: usize) -> bool {
        let path = self.storage_path(database, tablespace);
        let worker = self.workers.lock().unwrap().remove(&path);
        match worker {
            Some(worker) => {
                worker.stop();
                info!("tablespace {tablespace}: stopped worker for {}", path.display());
                true
            }
            None => false,
        }
    }

    /// Stops every worker.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for (_, worker) in workers {
            worker.stop();
        }
    }

    /// Runs the control service on the node's control address in the
    /// background.  If its port is 0, the kernel picks one; see
    /// [`ControllerHandle::local_address`].
    pub fn listen(&self) -> Result<ControllerHandle, Error> {
        let address = self.config.control_address;
        let controller = self.clone();
        let (address, task) = TOKIO.block_on(async move {
            let mut listener = listen(address, Bincode::default).await?;
            listener.config_mut().max_frame_length(usize::MAX);
            let address = listener.local_addr();
            let task = tokio::spawn(
                listener
                    .filter_map(|r| future::ready(r.ok()))
                    .map(server::BaseChannel::with_defaults)
                    .map(move |channel| channel.execute(Bootstrap::serve(controller.clone())))
                    .buffer_unordered(10)
                    .for_each(|_| async {}),
            );
            Ok::<_, std::io::Error>((address, task))
        })
        .map_err(TransportError::from)?;
        info!("bootstrap controller listening on {address}");
        Ok(ControllerHandle {
            address,
            task,
            controller: self.clone(),
        })
    }
}

impl Bootstrap for BootstrapController {
    type StartWorkerFut = Ready<Result<SocketAddr, String>>;
    fn start_worker(self, _: context::Context, command: StartWorker) -> Self::StartWorkerFut {
        future::ready(self.start(&command).map_err(|error| {
            warn!(
                "tablespace {}: starting worker failed: {error}",
                command.tablespace
            );
            error.to_string()
        }))
    }

    type StopWorkerFut = Ready<bool>;
    fn stop_worker(
        self,
        _: context::Context,
        database: PathBuf,
        tablespace: usize,
    ) -> Self::StopWorkerFut {
        future::ready(self.stop(&database, tablespace))
    }
}

/// A running control service.  Dropping it stops the service and every
/// worker it started.
pub struct ControllerHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    controller: BootstrapController,
}

impl ControllerHandle {
    pub fn local_address(&self) -> SocketAddr {
        self.address
    }

    pub fn controller(&self) -> &BootstrapController {
        &self.controller
    }

    pub fn shutdown(&self) {
        self.task.abort();
        self.controller.shutdown();
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use blockio_types::{Geometry, NodeConfig, StartWorker, TransportKind};
    use uuid::Uuid;

    use super::{BootstrapClient, BootstrapController};
    use crate::test::init_test_logger;
    use crate::tokio::TOKIO;

    fn command(database: &std::path::Path, tablespace: usize) -> StartWorker {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        StartWorker {
            database: database.to_path_buf(),
            tablespace,
            transport: TransportKind::Mpi,
            master: any,
            slave: any,
            geometry: Geometry::new(512, 4),
            session: Uuid::now_v7(),
        }
    }

    #[test]
    fn start_replaces_and_stop_removes() {
        init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        let controller = BootstrapController::new(NodeConfig {
            control_address: "127.0.0.1:0".parse().unwrap(),
            remote_directory: Some(dir.path().to_path_buf()),
            buffer_capacity: 16,
        });
        let database = dir.path().join("db").join("accounts.db");

        let first = controller.start(&command(&database, 2)).unwrap();
        assert_ne!(first.port(), 0);
        assert!(dir.path().join("tablespace2").join("accounts.db").exists());

        controller.start(&command(&database, 2)).unwrap();
        assert_eq!(controller.running(), 1);

        controller.start(&command(&database, 3)).unwrap();
        assert_eq!(controller.running(), 2);

        assert!(controller.stop(&database, 2));
        assert!(!controller.stop(&database, 2));
        controller.shutdown();
        assert_eq!(controller.running(), 0);
    }

    #[test]
    fn listens_on_the_control_address() {
        init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        let handle = BootstrapController::new(NodeConfig {
            control_address: "127.0.0.1:0".parse().unwrap(),
            remote_directory: Some(dir.path().to_path_buf()),
            buffer_capacity: 16,
        })
        .listen()
        .unwrap();
        let address = handle.local_address();
        assert_eq!(address.ip().to_string(), "127.0.0.1");
        assert_ne!(address.port(), 0);

        // The service answers on that address.
        let database = dir.path().join("accounts.db");
        let stopped = TOKIO.block_on(async move {
            let transport = tarpc::serde_transport::tcp::connect(
                address,
                tarpc::tokio_serde::formats::Bincode::default,
            )
            .await
            .unwrap();
            let client =
                BootstrapClient::new(tarpc::client::Config::default(), transport).spawn();
            client
                .stop_worker(tarpc::context::current(), database, 0)
                .await
                .unwrap()
        });
        assert!(!stopped);
        handle.shutdown();
    }
}
