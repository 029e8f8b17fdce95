//! The master side of stream-based links, with reconnection.
//!
//! TCP and MPI-style links differ only in how a connection is established
//! and how frames are wrapped; both are driven by a [`StreamMaster`].  Its
//! receive thread delivers responses to the correlation table.  When the
//! link fails, the thread tears both directions down and retries
//! establishing the link every reconnect interval, redeploying the worker
//! through its bootstrap controller each time.  Once the link is back, every
//! unit still outstanding is sent again.

use std::io::ErrorKind;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Builder, JoinHandle};
use std::time::{Duration, Instant};

use blockio_types::TransportKind;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use metrics::counter;
use tracing::{debug, info, warn};

use super::{MasterTransport, RemoteLink};
use crate::correlation::ClusterUnit;
use crate::error::{Error, TransportError};
use crate::metrics::{describe_metrics, RECONNECTS};
use crate::request::Response;
use crate::wire::Frame;

/// How often a non-blocking accept loop checks for a connection.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Framing and connection setup of one kind of stream link.
pub trait StreamLink: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Deploys the remote worker and connects to it.  Returns the stream to
    /// write requests to and the stream to read responses from, which may be
    /// two handles on one socket.
    fn establish(&self, link: &RemoteLink) -> Result<(TcpStream, TcpStream), TransportError>;

    fn write_request(&self, stream: &mut TcpStream, frame: Frame) -> Result<(), TransportError>;

    /// Reads the next message.  Returns `None` for a message that was
    /// dropped because it was not a response addressed to the master.
    fn read_response(&self, stream: &mut TcpStream) -> Result<Option<Response>, TransportError>;

    /// Releases per-connection state after the link failed.
    fn reset(&self) {}
}

/// Accepts one connection on `listener`, giving up at `deadline` or once
/// `cancel` is set.
pub(crate) fn accept_until(
    listener: &TcpListener,
    deadline: Option<Instant>,
    cancel: &AtomicBool,
) -> Result<TcpStream, TransportError> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted connection from {peer}");
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => {
                if cancel.load(Ordering::Acquire) {
                    return Err(std::io::Error::from(ErrorKind::Interrupted).into());
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Err(std::io::Error::from(ErrorKind::TimedOut).into());
                }
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(error) => return Err(error.into()),
        }
    }
}

/// Shuts down both directions of `stream`, ignoring errors from a socket
/// that is already closed.
pub(crate) fn shut(stream: &TcpStream) {
    let _ = stream.shutdown(Shutdown::Both);
}

struct Connection {
    /// Incremented each time the link is established.
    epoch: u64,
    writer: Option<TcpStream>,

    /// A handle on the socket the receive thread reads from, used to wake it.
    reader: Option<TcpStream>,
}

impl Connection {
    fn disconnect(&mut self) {
        if let Some(writer) = self.writer.take() {
            shut(&writer);
        }
        if let Some(reader) = self.reader.take() {
            shut(&reader);
        }
    }
}

struct Shared<L> {
    protocol: L,
    link: RemoteLink,
    connection: Mutex<Connection>,
    closed: AtomicBool,
}

impl<L: StreamLink> Shared<L> {
    fn describe(&self) -> String {
        format!(
            "tablespace {} {} link",
            self.link.tablespace,
            self.protocol.kind()
        )
    }

    /// Writes `unit` on the current connection unless it was already written
    /// there.  A failed write takes the connection down; the unit is resent
    /// after the reconnect.
    fn write_unit(&self, connection: &mut Connection, unit: &ClusterUnit) {
        let Some(writer) = connection.writer.as_mut() else {
            debug!("{}: link down, holding {}", self.describe(), unit.id());
            return;
        };
        if !unit.claim_send(connection.epoch) {
            return;
        }
        let frame = Frame::Request {
            id: unit.id(),
            tablespace: unit.tablespace(),
            operation: unit.operation(),
        };
        if let Err(error) = self.protocol.write_request(writer, frame) {
            warn!("{}: sending {} failed: {error}", self.describe(), unit.id());
            connection.disconnect();
        }
    }

    /// Installs a newly established connection and resends everything that
    /// is still outstanding on it.
    fn install(&self, writer: TcpStream, reader: &TcpStream) {
        let mut connection = self.connection.lock().unwrap();
        connection.epoch += 1;
        connection.writer = Some(writer);
        connection.reader = reader.try_clone().ok();
        let outstanding = self.link.table.outstanding();
        if !outstanding.is_empty() {
            info!(
                "{}: resending {} outstanding requests",
                self.describe(),
                outstanding.len()
            );
        }
        for unit in outstanding {
            self.write_unit(&mut connection, &unit);
        }
    }

    /// Retries establishing the link until it succeeds or the transport is
    /// shut down.  Returns the new stream to read from.
    fn reconnect(&self, stop: &Receiver<()>) -> Option<TcpStream> {
        loop {
            match stop.recv_timeout(self.link.reconnect_interval) {
                Err(RecvTimeoutError::Timeout) => (),
                _ => return None,
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            match self.protocol.establish(&self.link) {
                Ok((writer, reader)) => {
                    counter!(RECONNECTS).increment(1);
                    info!("{}: reconnected", self.describe());
                    self.install(writer, &reader);
                    return Some(reader);
                }
                Err(error) => warn!(
                    "{}: reconnecting failed ({error}), retrying in {:?}",
                    self.describe(),
                    self.link.reconnect_interval
                ),
            }
        }
    }

    fn receive(&self, mut reader: TcpStream, stop: Receiver<()>) {
        loop {
            match self.protocol.read_response(&mut reader) {
                Ok(Some(response)) => {
                    self.link.table.resolve(response);
                }
                Ok(None) => (),
                Err(error) => {
                    if self.closed.load(Ordering::Acquire) {
                        break;
                    }
                    warn!("{}: lost ({error})", self.describe());
                    self.connection.lock().unwrap().disconnect();
                    self.protocol.reset();
                    match self.reconnect(&stop) {
                        Some(new_reader) => reader = new_reader,
                        None => break,
                    }
                }
            }
        }
        debug!("{}: receive thread exiting", self.describe());
    }
}

/// Master side of a TCP or MPI-style link.
pub struct StreamMaster<L: StreamLink> {
    shared: Arc<Shared<L>>,
    stop: Sender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<L: StreamLink> StreamMaster<L> {
    /// Establishes the link once, failing if that does not work, and starts
    /// its receive thread.
    pub fn connect(protocol: L, link: RemoteLink) -> Result<Arc<Self>, TransportError> {
        describe_metrics();
        let (writer, reader) = protocol.establish(&link)?;
        let name = format!("tablespace-{}-{}-master", link.tablespace, protocol.kind());
        let shared = Arc::new(Shared {
            protocol,
            link,
            connection: Mutex::new(Connection {
                epoch: 1,
                reader: reader.try_clone().ok(),
                writer: Some(writer),
            }),
            closed: AtomicBool::new(false),
        });
        info!("{}: connected", shared.describe());

        let (stop, stop_receiver) = bounded(1);
        let thread = Builder::new().name(name).spawn({
            let shared = shared.clone();
            move || shared.receive(reader, stop_receiver)
        })?;
        Ok(Arc::new(Self {
            shared,
            stop,
            thread: Mutex::new(Some(thread)),
        }))
    }
}

impl<L: StreamLink> MasterTransport for StreamMaster<L> {
    fn kind(&self) -> TransportKind {
        self.shared.protocol.kind()
    }

    fn send(&self, unit: &Arc<ClusterUnit>) -> Result<(), Error> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::WorkerUnavailable(self.shared.link.tablespace));
        }
        let mut connection = self.shared.connection.lock().unwrap();
        self.shared.write_unit(&mut connection, unit);
        Ok(())
    }

    fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.connection.lock().unwrap().disconnect();
        let _ = self.stop.try_send(());
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                warn!("{}: receive thread panicked", self.shared.describe());
            }
        }
        self.shared.protocol.reset();
        let link = &self.shared.link;
        link.table
            .fail_outstanding(&Error::WorkerUnavailable(link.tablespace));
        if let Err(error) = link.deployment.stop() {
            warn!("{}: stopping the remote worker failed: {error}", self.shared.describe());
        }
        info!("{}: shut down", self.shared.describe());
    }
}

impl<L: StreamLink> Drop for StreamMaster<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
