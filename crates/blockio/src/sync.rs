//! Completion gates and the cyclic rendezvous barrier.
//!
//! A caller that submits `n` requests arms a [`CompletionGate`] with `n`
//! [`GateTicket`]s, hands one ticket to each request, and blocks in
//! [`CompletionGate::wait`] until every ticket has been dropped.  Dropping
//! is the only way to release a ticket, so a request that fails, or that is
//! discarded by a shutting-down worker, still opens the gate.
//!
//! Split operations additionally wrap each ticket in a [`BarrierTicket`] on
//! the database's [`RendezvousBarrier`].  The barrier is arrived at before
//! the gate ticket is released.

use std::fmt::{self, Debug};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam::sync::WaitGroup;

/// A one-shot countdown that releases one waiter.
pub struct CompletionGate(WaitGroup);

/// One count of a [`CompletionGate`], released on drop.
pub struct GateTicket(WaitGroup);

impl CompletionGate {
    /// Returns a gate that opens once all `n` of the returned tickets are
    /// dropped.
    pub fn arm(n: usize) -> (Self, Vec<GateTicket>) {
        let group = WaitGroup::new();
        let tickets = (0..n).map(|_| GateTicket(group.clone())).collect();
        (Self(group), tickets)
    }

    /// Blocks until every ticket has been released.
    pub fn wait(self) {
        self.0.wait()
    }
}

impl Debug for GateTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateTicket").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// A reusable barrier for a fixed number of parties.
///
/// Unlike [`std::sync::Barrier`], a party may [`arrive`](Self::arrive)
/// without waiting, which lets a caller complete the share of a party that
/// never got its request.
#[derive(Debug)]
pub struct RendezvousBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl RendezvousBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Number of times the barrier has opened.
    pub fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    /// Arrives and returns the generation that was arrived at, opening the
    /// barrier if this was the last party.
    fn arrive_inner(&self) -> (u64, bool) {
        let mut state = self.state.lock().unwrap();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
            (generation, true)
        } else {
            (generation, false)
        }
    }

    /// Arrives and blocks until all parties of the current generation have
    /// arrived.  Returns `true` in exactly one party per generation, the one
    /// that opened the barrier.
    pub fn wait(&self) -> bool {
        let (generation, leader) = self.arrive_inner();
        if !leader {
            let mut state = self.state.lock().unwrap();
            while state.generation == generation {
                state = self.cond.wait(state).unwrap();
            }
        }
        leader
    }

    /// Arrives without waiting for the other parties.
    pub fn arrive(&self) {
        self.arrive_inner();
    }
}

/// A gate ticket that must pass a [`RendezvousBarrier`] before it is
/// released.
pub struct BarrierTicket {
    barrier: Arc<RendezvousBarrier>,
    ticket: Option<GateTicket>,
    abandoned: bool,
}

impl BarrierTicket {
    pub fn new(barrier: Arc<RendezvousBarrier>, ticket: GateTicket) -> Self {
        Self {
            barrier,
            ticket: Some(ticket),
            abandoned: false,
        }
    }

    /// Arrives at the barrier without waiting for the other parties, then
    /// releases the gate ticket.  Used for a party whose request never
    /// reached its worker, on a thread that must not block on the barrier.
    pub fn abandon(mut self) {
        self.abandoned = true;
    }
}

impl Drop for BarrierTicket {
    fn drop(&mut self) {
        if self.abandoned {
            self.barrier.arrive();
        } else {
            self.barrier.wait();
        }
        self.ticket.take();
    }
}

impl Debug for BarrierTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierTicket")
            .field("parties", &self.barrier.parties)
            .finish_non_exhaustive()
    }
}
