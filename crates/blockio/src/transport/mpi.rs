//! MPI-style links.
//!
//! The worker opens a port and accepts; the master connects.  Both
//! directions share one stream, and every message travels in an
//! [`Envelope`] addressed by rank and tag, the way point-to-point messages
//! travel on an intercommunicator.  The master is rank
//! [`MASTER_RANK`] and the worker is rank [`WORKER_RANK`].

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};

use blockio_types::{StartWorker, TransportKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::stream::{accept_until, shut, StreamLink};
use super::{dispatch_remote, RemoteLink, ResponseSink, WorkerEndpoint};
use crate::error::TransportError;
use crate::request::Response;
use crate::wire::{read_frame, write_frame, Frame};
use crate::worker::Dispatcher;

pub const MASTER_RANK: u32 = 0;
pub const WORKER_RANK: u32 = 1;

/// Tag of messages carrying requests.
pub const REQUEST_TAG: u32 = 1;

/// Tag of messages carrying responses.
pub const RESPONSE_TAG: u32 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub source: u32,
    pub dest: u32,
    pub tag: u32,
    pub frame: Frame,
}

impl Envelope {
    fn request(frame: Frame) -> Self {
        Self {
            source: MASTER_RANK,
            dest: WORKER_RANK,
            tag: REQUEST_TAG,
            frame,
        }
    }

    fn response(response: Response) -> Self {
        Self {
            source: WORKER_RANK,
            dest: MASTER_RANK,
            tag: RESPONSE_TAG,
            frame: Frame::Response(response),
        }
    }

    /// Returns the frame if the envelope is addressed to `rank` with `tag`.
    fn open(self, rank: u32, tag: u32) -> Option<Frame> {
        if self.dest == rank && self.tag == tag {
            Some(self.frame)
        } else {
            warn!(
                "dropping message from rank {} to rank {} with tag {} (expected rank {rank}, tag {tag})",
                self.source, self.dest, self.tag
            );
            None
        }
    }
}

/// State of the master's channel runtime.  Each initialization starts a new
/// generation.
#[derive(Debug, Default)]
pub struct ChannelRuntime {
    generation: AtomicU64,
    initialized: AtomicBool,
}

impl ChannelRuntime {
    pub fn init(&self) -> u64 {
        self.initialized.store(true, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn finalize(&self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            debug!("channel runtime generation {} finalized", self.generation());
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

/// Connection setup and framing of the master side of an MPI-style link.
#[derive(Debug, Default)]
pub struct MpiLink {
    runtime: ChannelRuntime,
}

impl MpiLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runtime(&self) -> &ChannelRuntime {
        &self.runtime
    }
}

impl StreamLink for MpiLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Mpi
    }

    fn establish(&self, link: &RemoteLink) -> Result<(TcpStream, TcpStream), TransportError> {
        let generation = self.runtime.init();
        let deployment = &link.deployment;
        let port = deployment.deploy(deployment.remote.master)?;
        let stream = TcpStream::connect(port)?;
        stream.set_nodelay(true)?;
        debug!(
            "tablespace {}: connected to port {port} (runtime generation {generation})",
            link.tablespace
        );
        Ok((stream.try_clone()?, stream))
    }

    fn write_request(&self, stream: &mut TcpStream, frame: Frame) -> Result<(), TransportError> {
        write_frame(stream, &Envelope::request(frame))
    }

    fn read_response(&self, stream: &mut TcpStream) -> Result<Option<Response>, TransportError> {
        let envelope: Envelope = read_frame(stream)?;
        match envelope.open(MASTER_RANK, RESPONSE_TAG) {
            Some(Frame::Response(response)) => Ok(Some(response)),
            Some(Frame::Request { id, .. }) => {
                warn!("dropping request frame {id} tagged as a response");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn reset(&self) {
        self.runtime.finalize();
    }
}

struct MpiSink {
    tablespace: usize,
    stream: Mutex<TcpStream>,
}

impl ResponseSink for MpiSink {
    fn send_response(&self, response: Response) {
        let id = response.id;
        let mut stream = self.stream.lock().unwrap();
        if let Err(error) = write_frame(&mut *stream, &Envelope::response(response)) {
            warn!(
                "tablespace {}: sending response {id} failed: {error}",
                self.tablespace
            );
        }
    }
}

/// Worker side of an MPI-style link.
pub struct MpiWorker {
    tablespace: usize,
    address: SocketAddr,
    closed: Arc<AtomicBool>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MpiWorker {
    /// Opens the worker's port.  The master's connection is accepted in the
    /// background.
    pub fn start(command: &StartWorker, dispatcher: Arc<Dispatcher>) -> Result<Self, TransportError> {
        let tablespace = command.tablespace;
        let listener = TcpListener::bind(command.slave)?;
        let address = listener.local_addr()?;
        let closed = Arc::new(AtomicBool::new(false));
        let stream = Arc::new(Mutex::new(None));
        let thread = Builder::new()
            .name(format!("tablespace-{tablespace}-mpi-worker"))
            .spawn({
                let closed = closed.clone();
                let handle = stream.clone();
                move || {
                    let mut stream = match accept_until(&listener, None, &closed) {
                        Ok(stream) => stream,
                        Err(error) => {
                            if !closed.load(Ordering::Acquire) {
                                warn!("tablespace {tablespace}: accepting the master failed: {error}");
                            }
                            return;
                        }
                    };
                    let sink: Arc<dyn ResponseSink> = match stream.try_clone() {
                        Ok(writer) => Arc::new(MpiSink {
                            tablespace,
                            stream: Mutex::new(writer),
                        }),
                        Err(error) => {
                            warn!("tablespace {tablespace}: cloning the stream failed: {error}");
                            return;
                        }
                    };
                    *handle.lock().unwrap() = stream.try_clone().ok();
                    if closed.load(Ordering::Acquire) {
                        shut(&stream);
                    }
                    loop {
                        let envelope: Envelope = match read_frame(&mut stream) {
                            Ok(envelope) => envelope,
                            Err(error) => {
                                if !closed.load(Ordering::Acquire) {
                                    info!("tablespace {tablespace}: master disconnected ({error})");
                                }
                                break;
                            }
                        };
                        match envelope.open(WORKER_RANK, REQUEST_TAG) {
                            Some(Frame::Request { id, operation, .. }) => {
                                dispatch_remote(&dispatcher, id, operation, sink.clone())
                            }
                            Some(Frame::Response(response)) => warn!(
                                "tablespace {tablespace}: dropping response frame {} tagged as a request",
                                response.id
                            ),
                            None => (),
                        }
                    }
                }
            })?;
        info!("tablespace {tablespace}: mpi worker port open on {address}");
        Ok(Self {
            tablespace,
            address,
            closed,
            stream,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl WorkerEndpoint for MpiWorker {
    fn kind(&self) -> TransportKind {
        TransportKind::Mpi
    }

    fn local_address(&self) -> SocketAddr {
        self.address
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stream) = self.stream.lock().unwrap().as_ref() {
            shut(stream);
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                warn!("tablespace {}: mpi worker thread panicked", self.tablespace);
            }
        }
        info!("tablespace {}: mpi worker on {} stopped", self.tablespace, self.address);
    }
}

impl Drop for MpiWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
