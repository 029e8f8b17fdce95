//! Correlating requests with their completions.
//!
//! Every request in flight is wrapped in a [`ClusterUnit`] that carries a
//! [`CorrelationId`] and the [`Completion`] to signal once the request has a
//! result.  Remote responses find their unit again through the
//! [`CorrelationTable`] of the tablespace they came from.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;
use crate::metrics::RESPONSES_UNMATCHED;
use crate::request::{IoRequest, ObjectReturn, Operation, Outcome, Response};
use crate::sync::{BarrierTicket, GateTicket};
use crate::tablespace::Tablespace;
use crate::transport::ResponseSink;

/// Identifies one request among those of an open database.
///
/// Ids are unique only within the [`CorrelationIds`] that issued them.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Issues [`CorrelationId`]s for one open database.
#[derive(Debug, Default)]
pub struct CorrelationIds(AtomicU64);

impl CorrelationIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> CorrelationId {
        CorrelationId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// What to do once a request has its result.
pub enum Completion {
    /// Release one count of the caller's gate.
    Gate(GateTicket),

    /// Pass the database's rendezvous barrier, then release the gate.
    Barrier(BarrierTicket),

    /// Send the result back to a remote master.
    Reply(Arc<dyn ResponseSink>),
}

impl Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Gate(_) => write!(f, "Gate"),
            Completion::Barrier(_) => write!(f, "Barrier"),
            Completion::Reply(_) => write!(f, "Reply"),
        }
    }
}

/// A request in flight together with its correlation id and completion.
pub struct ClusterUnit {
    id: CorrelationId,
    tablespace: usize,
    request: Mutex<IoRequest>,
    completion: Mutex<Option<Completion>>,

    /// Set once a remote response or a local failure has been recorded, so
    /// that a late duplicate cannot overwrite it.
    resolved: AtomicBool,

    /// Connection epoch the request was last sent on, 0 if never.
    sent_epoch: AtomicU64,
}

impl ClusterUnit {
    /// Wraps `request` with a fresh id from `ids`.
    pub fn new(ids: &CorrelationIds, request: IoRequest, completion: Completion) -> Arc<Self> {
        Self::with_id(ids.next(), request, completion)
    }

    /// Wraps `request` with an id assigned elsewhere, as a worker does for
    /// requests that arrive from its master.
    pub fn with_id(id: CorrelationId, request: IoRequest, completion: Completion) -> Arc<Self> {
        Arc::new(Self {
            id,
            tablespace: request.tablespace(),
            request: Mutex::new(request),
            completion: Mutex::new(Some(completion)),
            resolved: AtomicBool::new(false),
            sent_epoch: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn tablespace(&self) -> usize {
        self.tablespace
    }

    pub fn operation(&self) -> Operation {
        self.request.lock().unwrap().operation().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Records that the request is being sent on connection `epoch`.
    /// Returns `false` if it was already sent on that connection.
    pub fn claim_send(&self, epoch: u64) -> bool {
        self.sent_epoch.swap(epoch, Ordering::AcqRel) != epoch
    }

    /// Executes the request against `tablespace`.
    pub fn process(&self, tablespace: &mut Tablespace) {
        self.request.lock().unwrap().process(tablespace);
    }

    /// Whether the request has a result and that result is a failure.
    pub fn has_failed(&self) -> bool {
        let request = self.request.lock().unwrap();
        request.is_processed()
            && matches!(request.object_return(), Some(ObjectReturn::Failure(_)))
    }

    /// Records `error` as the result unless one was recorded already.
    /// Returns whether `error` was recorded.
    pub fn fail(&self, error: Error) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.request.lock().unwrap().fail(error);
        true
    }

    /// Copies a remote result into the request, unless a result was recorded
    /// already.  Returns whether `response` was used.
    pub fn rehydrate(&self, response: Response) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.request.lock().unwrap().rehydrate(response);
        true
    }

    pub fn response(&self) -> Response {
        self.request.lock().unwrap().response(self.id)
    }

    /// Signals the completion.  Only the first call has an effect.
    pub fn complete(&self) {
        let completion = self.completion.lock().unwrap().take();
        if let Some(Completion::Reply(sink)) = completion {
            sink.send_response(self.response());
        }
    }

    /// Signals the completion of a request that never reached its worker,
    /// without blocking on the rendezvous barrier.
    pub fn abandon(&self) {
        let completion = self.completion.lock().unwrap().take();
        match completion {
            Some(Completion::Barrier(ticket)) => ticket.abandon(),
            Some(Completion::Reply(sink)) => sink.send_response(self.response()),
            _ => (),
        }
    }

    /// Moves the result out of the request.
    pub fn take_outcome(&self) -> Result<Outcome, Error> {
        self.request.lock().unwrap().take_outcome()
    }
}

impl PartialEq for ClusterUnit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClusterUnit {}

impl Hash for ClusterUnit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for ClusterUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterUnit")
            .field("id", &self.id)
            .field("tablespace", &self.tablespace)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// The units outstanding on one tablespace.
#[derive(Debug)]
pub struct CorrelationTable {
    tablespace: usize,
    units: Mutex<HashMap<CorrelationId, Arc<ClusterUnit>>>,
}

impl CorrelationTable {
    pub fn new(tablespace: usize) -> Arc<Self> {
        Arc::new(Self {
            tablespace,
            units: Mutex::new(HashMap::new()),
        })
    }

    pub fn tablespace(&self) -> usize {
        self.tablespace
    }

    /// Adds `unit`.  It stays in the table until the returned guard is
    /// dropped.
    pub fn register(self: &Arc<Self>, unit: &Arc<ClusterUnit>) -> Registration {
        self.units.lock().unwrap().insert(unit.id(), unit.clone());
        Registration {
            table: self.clone(),
            id: unit.id(),
        }
    }

    pub fn lookup(&self, id: CorrelationId) -> Option<Arc<ClusterUnit>> {
        self.units.lock().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: CorrelationId) -> Option<Arc<ClusterUnit>> {
        self.units.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.units.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Units that are still waiting for a result, in id order.
    pub fn outstanding(&self) -> Vec<Arc<ClusterUnit>> {
        let mut units = self
            .units
            .lock()
            .unwrap()
            .values()
            .filter(|unit| !unit.is_resolved())
            .cloned()
            .collect::<Vec<_>>();
        units.sort_by_key(|unit| unit.id());
        units
    }

    /// Delivers `response` to its unit and signals the unit's completion.
    /// Returns `false`, after logging, if no unit is waiting for it.
    pub fn resolve(&self, response: Response) -> bool {
        let id = response.id;
        match self.lookup(id) {
            Some(unit) if unit.rehydrate(response) => {
                unit.complete();
                true
            }
            Some(_) => {
                warn!(
                    "tablespace {}: dropping duplicate response {id}",
                    self.tablespace
                );
                counter!(RESPONSES_UNMATCHED).increment(1);
                false
            }
            None => {
                warn!(
                    "tablespace {}: dropping response {id}, which matches no outstanding request",
                    self.tablespace
                );
                counter!(RESPONSES_UNMATCHED).increment(1);
                false
            }
        }
    }

    /// Fails every outstanding unit and signals its completion without
    /// blocking on the rendezvous barrier.
    pub fn fail_outstanding(&self, error: &Error) {
        for unit in self.outstanding() {
            unit.fail(error.clone());
            unit.abandon();
        }
    }
}

/// Keeps a unit in its [`CorrelationTable`] while alive.
#[derive(Debug)]
pub struct Registration {
    table: Arc<CorrelationTable>,
    id: CorrelationId,
}

impl Registration {
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}
