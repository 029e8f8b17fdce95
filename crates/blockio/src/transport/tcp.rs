//! TCP links.
//!
//! A TCP link is a pair of streams.  The master listens, asks the node's
//! bootstrap controller to start the worker, and accepts the worker's
//! connection back; responses flow on that stream.  Requests flow on a
//! second stream that the master opens to the worker's listener.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::Instant;

use blockio_types::{StartWorker, TransportKind};
use tracing::{debug, info, warn};

use super::stream::{accept_until, shut, StreamLink};
use super::{dispatch_remote, RemoteLink, ResponseSink, WorkerEndpoint};
use crate::error::TransportError;
use crate::request::Response;
use crate::wire::{read_frame, write_frame, Frame};
use crate::worker::Dispatcher;

/// Connection setup and framing of the master side of a TCP link.
pub struct TcpLink;

impl StreamLink for TcpLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn establish(&self, link: &RemoteLink) -> Result<(TcpStream, TcpStream), TransportError> {
        let deployment = &link.deployment;
        let listener = TcpListener::bind(deployment.remote.master)?;
        let master = listener.local_addr()?;
        let slave = deployment.deploy(master)?;
        let deadline = Instant::now() + deployment.timeout;
        let responses = accept_until(&listener, Some(deadline), &AtomicBool::new(false))?;
        let requests = TcpStream::connect(slave)?;
        requests.set_nodelay(true)?;
        debug!(
            "tablespace {}: tcp link {master} <-> {slave} established",
            link.tablespace
        );
        Ok((requests, responses))
    }

    fn write_request(&self, stream: &mut TcpStream, frame: Frame) -> Result<(), TransportError> {
        write_frame(stream, &frame)
    }

    fn read_response(&self, stream: &mut TcpStream) -> Result<Option<Response>, TransportError> {
        match read_frame(stream)? {
            Frame::Response(response) => Ok(Some(response)),
            Frame::Request { id, .. } => {
                warn!("dropping request frame {id} received by a master");
                Ok(None)
            }
        }
    }
}

/// Writes responses to the stream the worker opened to its master.
struct TcpSink {
    tablespace: usize,
    stream: Mutex<TcpStream>,
}

impl ResponseSink for TcpSink {
    fn send_response(&self, response: Response) {
        let id = response.id;
        let mut stream = self.stream.lock().unwrap();
        if let Err(error) = write_frame(&mut *stream, &Frame::Response(response)) {
            // The master resends the request once it has reconnected.
            warn!(
                "tablespace {}: sending response {id} failed: {error}",
                self.tablespace
            );
        }
    }
}

/// Worker side of a TCP link.
pub struct TcpWorker {
    tablespace: usize,
    address: SocketAddr,
    closed: Arc<AtomicBool>,

    /// Handles on every socket of the link, to wake the receive thread.
    streams: Arc<Mutex<Vec<TcpStream>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpWorker {
    /// Binds the worker's listener and connects back to the master.  The
    /// master's request stream is accepted in the background.
    pub fn start(command: &StartWorker, dispatcher: Arc<Dispatcher>) -> Result<Self, TransportError> {
        let tablespace = command.tablespace;
        let listener = TcpListener::bind(command.slave)?;
        let address = listener.local_addr()?;
        let responses = TcpStream::connect(command.master)?;
        responses.set_nodelay(true)?;

        let closed = Arc::new(AtomicBool::new(false));
        let streams = Arc::new(Mutex::new(vec![responses.try_clone()?]));
        let sink: Arc<dyn ResponseSink> = Arc::new(TcpSink {
            tablespace,
            stream: Mutex::new(responses),
        });
        let thread = Builder::new()
            .name(format!("tablespace-{tablespace}-tcp-worker"))
            .spawn({
                let closed = closed.clone();
                let streams = streams.clone();
                move || {
                    let mut requests = match accept_until(&listener, None, &closed) {
                        Ok(stream) => stream,
                        Err(error) => {
                            if !closed.load(Ordering::Acquire) {
                                warn!("tablespace {tablespace}: accepting the master failed: {error}");
                            }
                            return;
                        }
                    };
                    if let Ok(handle) = requests.try_clone() {
                        streams.lock().unwrap().push(handle);
                    }
                    if closed.load(Ordering::Acquire) {
                        shut(&requests);
                    }
                    loop {
                        match read_frame(&mut requests) {
                            Ok(Frame::Request { id, operation, .. }) => {
                                dispatch_remote(&dispatcher, id, operation, sink.clone())
                            }
                            Ok(Frame::Response(response)) => {
                                warn!("tablespace {tablespace}: dropping response frame {} received by a worker", response.id)
                            }
                            Err(error) => {
                                if !closed.load(Ordering::Acquire) {
                                    info!("tablespace {tablespace}: master disconnected ({error})");
                                }
                                break;
                            }
                        }
                    }
                }
            })?;
        info!("tablespace {tablespace}: tcp worker listening on {address}");
        Ok(Self {
            tablespace,
            address,
            closed,
            streams,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl WorkerEndpoint for TcpWorker {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn local_address(&self) -> SocketAddr {
        self.address
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for stream in self.streams.lock().unwrap().iter() {
            shut(stream);
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                warn!("tablespace {}: tcp worker thread panicked", self.tablespace);
            }
        }
        info!("tablespace {}: tcp worker on {} stopped", self.tablespace, self.address);
    }
}

impl Drop for TcpWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
