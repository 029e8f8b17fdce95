//! In-process link to a local worker.

use std::sync::Arc;

use blockio_types::TransportKind;

use super::MasterTransport;
use crate::correlation::ClusterUnit;
use crate::error::Error;
use crate::worker::Dispatcher;

/// Enqueues units straight into a local [`Dispatcher`], whose thread
/// signals their completions.
pub struct DirectTransport {
    dispatcher: Arc<Dispatcher>,
}

impl DirectTransport {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl MasterTransport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn send(&self, unit: &Arc<ClusterUnit>) -> Result<(), Error> {
        self.dispatcher.enqueue(unit.clone())
    }

    fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
