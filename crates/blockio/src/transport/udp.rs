//! UDP links.
//!
//! Each request and each response is one datagram.  Datagrams get lost, so
//! the master retransmits requests that stay unanswered and gives up after
//! a configured number of attempts.  The worker remembers its recent
//! responses and answers a retransmitted request from memory instead of
//! executing it twice.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use blockio_types::{StartWorker, TransportKind};
use metrics::counter;
use tracing::{debug, info, warn};

use super::{dispatch_remote, MasterTransport, RemoteLink, ResponseSink, WorkerEndpoint};
use crate::correlation::{ClusterUnit, CorrelationId};
use crate::error::{Error, TransportError};
use crate::metrics::{describe_metrics, UDP_RETRANSMITS};
use crate::request::Response;
use crate::wire::{decode, encode, Frame};
use crate::worker::Dispatcher;

/// Largest datagram either side accepts.
const MAX_DATAGRAM: usize = 65_536;

/// How long a receive thread blocks before checking for shutdown and
/// retransmission deadlines.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Number of responses a worker remembers.
pub const REPLAY_CAPACITY: usize = 1024;

/// Returns true for the errors a socket read timeout produces.
fn is_timeout(error: &std::io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

struct Pending {
    unit: Arc<ClusterUnit>,
    attempts: u32,
    deadline: Option<Instant>,
}

struct Shared {
    link: RemoteLink,
    socket: UdpSocket,
    peer: SocketAddr,
    pending: Mutex<HashMap<CorrelationId, Pending>>,
    closed: AtomicBool,
}

impl Shared {
    fn deadline(&self) -> Option<Instant> {
        self.link
            .udp
            .retry_timeout()
            .map(|timeout| Instant::now() + timeout)
    }

    fn transmit(&self, unit: &ClusterUnit) -> Result<(), TransportError> {
        let bytes = encode(&Frame::Request {
            id: unit.id(),
            tablespace: unit.tablespace(),
            operation: unit.operation(),
        })?;
        self.socket.send_to(&bytes, self.peer)?;
        Ok(())
    }

    fn receive(&self) {
        let tablespace = self.link.tablespace;
        let mut buffer = vec![0; MAX_DATAGRAM];
        while !self.closed.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, from)) => match decode::<Frame>(&buffer[..len]) {
                    Ok(Frame::Response(response)) => {
                        self.pending.lock().unwrap().remove(&response.id);
                        self.link.table.resolve(response);
                    }
                    Ok(Frame::Request { id, .. }) => {
                        warn!("tablespace {tablespace}: dropping request datagram {id} from {from}")
                    }
                    Err(error) => {
                        warn!("tablespace {tablespace}: dropping datagram from {from}: {error}")
                    }
                },
                Err(error) if is_timeout(&error) => (),
                Err(error) => {
                    if !self.closed.load(Ordering::Acquire) {
                        warn!("tablespace {tablespace}: receiving failed: {error}");
                    }
                }
            }
            self.retransmit();
        }
        debug!("tablespace {tablespace}: udp receive thread exiting");
    }

    /// Resends every request whose deadline has passed, and gives up on the
    /// ones that ran out of retries.
    fn retransmit(&self) {
        let tablespace = self.link.tablespace;
        let now = Instant::now();
        let mut unanswered = Vec::new();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.retain(|_, entry| !entry.unit.is_resolved());
            for (id, entry) in pending.iter_mut() {
                if !entry.deadline.is_some_and(|deadline| now >= deadline) {
                    continue;
                }
                if entry.attempts > self.link.udp.max_retries {
                    unanswered.push(*id);
                    continue;
                }
                entry.attempts += 1;
                entry.deadline = self.deadline();
                counter!(UDP_RETRANSMITS).increment(1);
                debug!("tablespace {tablespace}: retransmitting {id} (attempt {})", entry.attempts);
                if let Err(error) = self.transmit(&entry.unit) {
                    warn!("tablespace {tablespace}: retransmitting {id} failed: {error}");
                }
            }
        }
        for id in unanswered {
            let Some(entry) = self.pending.lock().unwrap().remove(&id) else {
                continue;
            };
            let error = TransportError::Unanswered {
                tablespace,
                attempts: entry.attempts,
            };
            warn!("{error}, failing {id}");
            if entry.unit.fail(error.into()) {
                entry.unit.abandon();
            }
        }
    }
}

/// Master side of a UDP link.
pub struct UdpMaster {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UdpMaster {
    /// Binds the master's socket, deploys the worker and starts the receive
    /// thread.
    pub fn connect(link: RemoteLink) -> Result<Arc<Self>, TransportError> {
        describe_metrics();
        let socket = UdpSocket::bind(link.deployment.remote.master)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let master = socket.local_addr()?;
        let peer = link.deployment.deploy(master)?;
        info!("tablespace {}: udp link {master} <-> {peer}", link.tablespace);

        let name = format!("tablespace-{}-udp-master", link.tablespace);
        let shared = Arc::new(Shared {
            link,
            socket,
            peer,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let thread = Builder::new().name(name).spawn({
            let shared = shared.clone();
            move || shared.receive()
        })?;
        Ok(Arc::new(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }
}

impl MasterTransport for UdpMaster {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn send(&self, unit: &Arc<ClusterUnit>) -> Result<(), Error> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::WorkerUnavailable(shared.link.tablespace));
        }
        let deadline = shared.deadline();
        shared.pending.lock().unwrap().insert(
            unit.id(),
            Pending {
                unit: unit.clone(),
                attempts: 1,
                deadline,
            },
        );
        if let Err(error) = shared.transmit(unit) {
            if deadline.is_none() {
                shared.pending.lock().unwrap().remove(&unit.id());
                return Err(error.into());
            }
            warn!(
                "tablespace {}: sending {} failed ({error}), will retransmit",
                shared.link.tablespace,
                unit.id()
            );
        }
        Ok(())
    }

    fn shutdown(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                warn!("tablespace {}: udp receive thread panicked", shared.link.tablespace);
            }
        }
        shared.pending.lock().unwrap().clear();
        shared
            .link
            .table
            .fail_outstanding(&Error::WorkerUnavailable(shared.link.tablespace));
        if let Err(error) = shared.link.deployment.stop() {
            warn!(
                "tablespace {}: stopping the remote worker failed: {error}",
                shared.link.tablespace
            );
        }
        info!("tablespace {} udp link: shut down", shared.link.tablespace);
    }
}

impl Drop for UdpMaster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// What a worker knows about a request id it receives.
#[derive(Clone, Debug)]
pub enum Replay {
    /// First sighting: execute it.
    New,

    /// Being executed; the response goes out when it is done.
    InFlight,

    /// Already answered with this response.
    Done(Response),
}

/// Bounded memory of the request ids a worker received recently, with their
/// responses once known.  The oldest id is forgotten first.
#[derive(Debug)]
pub struct ReplayCache {
    capacity: usize,
    order: VecDeque<CorrelationId>,
    entries: HashMap<CorrelationId, Option<Response>>,
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remember(&mut self, id: CorrelationId, response: Option<Response>) {
        if self.entries.insert(id, response).is_none() {
            self.order.push_back(id);
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    /// Looks `id` up, remembering it as in flight if it is new.
    pub fn begin(&mut self, id: CorrelationId) -> Replay {
        match self.entries.get(&id) {
            Some(Some(response)) => Replay::Done(response.clone()),
            Some(None) => Replay::InFlight,
            None => {
                self.remember(id, None);
                Replay::New
            }
        }
    }

    /// Remembers the response to a request.
    pub fn record(&mut self, response: &Response) {
        self.remember(response.id, Some(response.clone()));
    }
}

struct UdpSink {
    tablespace: usize,
    socket: UdpSocket,
    peer: SocketAddr,
    cache: Arc<Mutex<ReplayCache>>,
}

fn send_datagram(socket: &UdpSocket, peer: SocketAddr, response: &Response) -> Result<(), TransportError> {
    let bytes = encode(&Frame::Response(response.clone()))?;
    socket.send_to(&bytes, peer)?;
    Ok(())
}

impl ResponseSink for UdpSink {
    fn send_response(&self, response: Response) {
        self.cache.lock().unwrap().record(&response);
        if let Err(error) = send_datagram(&self.socket, self.peer, &response) {
            // The master retransmits and gets the response from the cache.
            warn!(
                "tablespace {}: sending response {} failed: {error}",
                self.tablespace, response.id
            );
        }
    }
}

/// Worker side of a UDP link.
pub struct UdpWorker {
    tablespace: usize,
    address: SocketAddr,
    closed: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UdpWorker {
    pub fn start(command: &StartWorker, dispatcher: Arc<Dispatcher>) -> Result<Self, TransportError> {
        let tablespace = command.tablespace;
        let socket = UdpSocket::bind(command.slave)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let address = socket.local_addr()?;
        let closed = Arc::new(AtomicBool::new(false));
        let cache = Arc::new(Mutex::new(ReplayCache::new(REPLAY_CAPACITY)));
        let thread = Builder::new()
            .name(format!("tablespace-{tablespace}-udp-worker"))
            .spawn({
                let closed = closed.clone();
                move || {
                    let mut buffer = vec![0; MAX_DATAGRAM];
                    while !closed.load(Ordering::Acquire) {
                        let (len, from) = match socket.recv_from(&mut buffer) {
                            Ok(received) => received,
                            Err(error) if is_timeout(&error) => continue,
                            Err(error) => {
                                warn!("tablespace {tablespace}: receiving failed: {error}");
                                continue;
                            }
                        };
                        let (id, operation) = match decode::<Frame>(&buffer[..len]) {
                            Ok(Frame::Request { id, operation, .. }) => (id, operation),
                            Ok(Frame::Response(response)) => {
                                warn!("tablespace {tablespace}: dropping response datagram {} from {from}", response.id);
                                continue;
                            }
                            Err(error) => {
                                warn!("tablespace {tablespace}: dropping datagram from {from}: {error}");
                                continue;
                            }
                        };
                        let replay = cache.lock().unwrap().begin(id);
                        match replay {
                            Replay::New => {
                                let sink = match socket.try_clone() {
                                    Ok(socket) => Arc::new(UdpSink {
                                        tablespace,
                                        socket,
                                        peer: from,
                                        cache: cache.clone(),
                                    }),
                                    Err(error) => {
                                        warn!("tablespace {tablespace}: cloning the socket failed: {error}");
                                        continue;
                                    }
                                };
                                dispatch_remote(&dispatcher, id, operation, sink);
                            }
                            Replay::InFlight => debug!("tablespace {tablespace}: {id} is still in flight"),
                            Replay::Done(response) => {
                                debug!("tablespace {tablespace}: replaying response {id}");
                                if let Err(error) = send_datagram(&socket, from, &response) {
                                    warn!("tablespace {tablespace}: replaying {id} failed: {error}");
                                }
                            }
                        }
                    }
                }
            })?;
        info!("tablespace {tablespace}: udp worker listening on {address}");
        Ok(Self {
            tablespace,
            address,
            closed,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl WorkerEndpoint for UdpWorker {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn local_address(&self) -> SocketAddr {
        self.address
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                warn!("tablespace {}: udp worker thread panicked", self.tablespace);
            }
        }
        info!("tablespace {}: udp worker on {} stopped", self.tablespace, self.address);
    }
}

impl Drop for UdpWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
