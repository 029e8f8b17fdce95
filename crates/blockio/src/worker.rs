//! The dispatch loop of a tablespace worker.
//!
//! A [`Dispatcher`] owns a [`Tablespace`] on a dedicated thread and executes
//! the units enqueued to it strictly in order.

use std::sync::{Arc, Mutex, RwLock};
use std::thread::{Builder, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{bounded, select, unbounded, Receiver, Sender};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::correlation::ClusterUnit;
use crate::error::{Error, StorageError};
use crate::metrics::{describe_metrics, REQUESTS_DISPATCHED, REQUESTS_FAILED};
use crate::tablespace::Tablespace;

/// Handle to a tablespace worker thread.
pub struct Dispatcher {
    tablespace: usize,
    jobs: Sender<Arc<ClusterUnit>>,

    /// Kept to discard units that were enqueued after the thread exited.
    leftovers: Receiver<Arc<ClusterUnit>>,
    wakeup: Sender<()>,

    /// Set by [`Dispatcher::shutdown`].  Enqueueing holds the read lock, so
    /// once the write lock has set it no unit can enter the queue.
    closed: RwLock<bool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Starts a thread named `tablespace-worker-<N>` that serves
    /// `tablespace`.
    pub fn spawn(tablespace: Tablespace) -> Result<Self, Error> {
        describe_metrics();
        let index = tablespace.index();
        let (jobs, receiver) = unbounded();
        let (wakeup, wakeup_receiver) = bounded(1);
        let leftovers = receiver.clone();
        let thread = Builder::new()
            .name(format!("tablespace-worker-{index}"))
            .spawn(move || run(tablespace, receiver, wakeup_receiver))
            .map_err(StorageError::from)?;
        info!("tablespace {index}: worker started");
        Ok(Self {
            tablespace: index,
            jobs,
            leftovers,
            wakeup,
            closed: RwLock::new(false),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn tablespace(&self) -> usize {
        self.tablespace
    }

    /// Appends `unit` to the queue.  Fails once the worker is shutting down,
    /// in which case the unit was not enqueued.
    pub fn enqueue(&self, unit: Arc<ClusterUnit>) -> Result<(), Error> {
        let closed = self.closed.read().unwrap();
        if *closed {
            return Err(Error::WorkerUnavailable(self.tablespace));
        }
        self.jobs
            .send(unit)
            .map_err(|_| Error::WorkerUnavailable(self.tablespace))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap()
    }

    /// Stops accepting units, wakes the worker, and waits for it to close its
    /// tablespace.  The unit being executed finishes; units still queued fail
    /// with [`Error::WorkerUnavailable`].
    pub fn shutdown(&self) {
        {
            let mut closed = self.closed.write().unwrap();
            if *closed {
                return;
            }
            *closed = true;
        }
        let _ = self.wakeup.try_send(());
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                warn!("tablespace {}: worker thread panicked", self.tablespace);
            }
        }
        discard(self.tablespace, &self.leftovers);
        info!("tablespace {}: worker stopped", self.tablespace);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mut tablespace: Tablespace, jobs: Receiver<Arc<ClusterUnit>>, wakeup: Receiver<()>) {
    loop {
        select! {
            recv(jobs) -> unit => match unit {
                Ok(unit) => dispatch(&mut tablespace, &unit),
                Err(_) => break,
            },
            recv(wakeup) -> _ => break,
        }
    }
    discard(tablespace.index(), &jobs);
    if let Err(error) = tablespace.close() {
        warn!("tablespace {}: close failed: {error}", tablespace.index());
    }
}

fn dispatch(tablespace: &mut Tablespace, unit: &ClusterUnit) {
    let start = Instant::now();
    unit.process(tablespace);
    counter!(REQUESTS_DISPATCHED).increment(1);
    if unit.has_failed() {
        counter!(REQUESTS_FAILED).increment(1);
    }
    debug!(
        "tablespace {}: {} {} in {:?}",
        tablespace.index(),
        unit.id(),
        unit.operation().name(),
        start.elapsed()
    );
    unit.complete();
}

/// Fails every unit left in `jobs`.
fn discard(tablespace: usize, jobs: &Receiver<Arc<ClusterUnit>>) {
    for unit in jobs.try_iter() {
        debug!("tablespace {tablespace}: discarding {}", unit.id());
        unit.fail(Error::WorkerUnavailable(tablespace));
        unit.abandon();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use blockio_types::{Geometry, VirtualBlock};

    use super::Dispatcher;
    use crate::block::Block;
    use crate::buffer::NodeBlockBuffer;
    use crate::correlation::{ClusterUnit, Completion, CorrelationIds};
    use crate::error::{Error, StorageError};
    use crate::log::NullRecoveryLog;
    use crate::request::{IoRequest, Operation};
    use crate::storage::MemoryStorage;
    use crate::sync::CompletionGate;
    use crate::tablespace::Tablespace;
    use crate::test::init_test_logger;

    const BS: usize = 512;

    fn dispatcher(storage: MemoryStorage) -> Dispatcher {
        let tablespace = Tablespace::open(
            1,
            Geometry::new(BS, 4),
            Box::new(storage),
            Arc::new(NodeBlockBuffer::new(16)),
            Box::new(NullRecoveryLog),
        )
        .unwrap();
        Dispatcher::spawn(tablespace).unwrap()
    }

    fn submit(
        dispatcher: &Dispatcher,
        ids: &CorrelationIds,
        operations: Vec<Operation>,
    ) -> Vec<Arc<ClusterUnit>> {
        let (gate, tickets) = CompletionGate::arm(operations.len());
        let units = operations
            .into_iter()
            .zip(tickets)
            .map(|(operation, ticket)| {
                let unit = ClusterUnit::new(
                    ids,
                    IoRequest::new(1, operation, false),
                    Completion::Gate(ticket),
                );
                if let Err(error) = dispatcher.enqueue(unit.clone()) {
                    unit.fail(error);
                    unit.complete();
                }
                unit
            })
            .collect();
        gate.wait();
        units
    }

    #[test]
    fn units_run_in_enqueue_order() {
        init_test_logger();
        let dispatcher = dispatcher(MemoryStorage::new("ts1"));
        let ids = CorrelationIds::new();
        let mut operations = Vec::new();
        for i in 0..32u64 {
            operations.push(Operation::SeekWrite {
                block: VirtualBlock::new(1, i * BS as u64).unwrap(),
                data: Block::with_payload(BS, &i.to_le_bytes()).unwrap(),
            });
            operations.push(Operation::Size);
        }
        let units = submit(&dispatcher, &ids, operations);

        // Each size observes exactly the writes enqueued before it.
        for (i, pair) in units.chunks(2).enumerate() {
            assert_eq!(pair[0].take_outcome().unwrap().long_return, BS as i64);
            assert_eq!(
                pair[1].take_outcome().unwrap().long_return,
                ((i + 1) * BS) as i64
            );
        }
    }

    #[test]
    fn failures_do_not_stop_the_loop() {
        init_test_logger();
        let dispatcher = dispatcher(MemoryStorage::new("ts1").with_quota(BS as u64));
        let ids = CorrelationIds::new();
        let units = submit(
            &dispatcher,
            &ids,
            vec![
                Operation::SeekRead {
                    block: VirtualBlock::new(1, 8 * BS as u64).unwrap(),
                },
                Operation::SeekWrite {
                    block: VirtualBlock::new(1, 4 * BS as u64).unwrap(),
                    data: Block::free(BS),
                },
                Operation::IsNew,
            ],
        );
        assert!(matches!(
            units[0].take_outcome(),
            Err(Error::Storage(StorageError::ShortRead { .. }))
        ));
        assert!(matches!(
            units[1].take_outcome(),
            Err(Error::Storage(StorageError::QuotaExceeded { .. }))
        ));
        assert_eq!(units[2].take_outcome().unwrap().long_return, 1);
    }

    #[test]
    fn shutdown_refuses_new_units() {
        init_test_logger();
        let storage = MemoryStorage::new("ts1");
        let dispatcher = dispatcher(storage);
        let ids = CorrelationIds::new();
        dispatcher.shutdown();
        assert!(dispatcher.is_closed());

        let units = submit(&dispatcher, &ids, vec![Operation::Size]);
        assert!(matches!(
            units[0].take_outcome(),
            Err(Error::WorkerUnavailable(1))
        ));
        dispatcher.shutdown();
    }
}
