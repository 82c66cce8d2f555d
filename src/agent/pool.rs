//! Socket pool bookkeeping
//!
//! Tracks reserved and live connections per [`SlotId`] plus the FIFO queue of
//! requests waiting for capacity. Pure synchronous state; the agent holds it
//! behind a mutex and never across an await point.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::agent::request::RequestHandle;
use crate::models::Destination;

/// Stable identity of one pool entry, from reservation until removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PoolEntry {
    /// Connection being created
    Reserved(Destination),
    /// Connection handed to a request
    Live(Destination),
}

impl PoolEntry {
    pub(crate) fn destination(&self) -> &Destination {
        match self {
            PoolEntry::Reserved(dest) | PoolEntry::Live(dest) => dest,
        }
    }
}

/// A request waiting for pool capacity
pub(crate) struct PendingRequest {
    pub request: Arc<dyn RequestHandle>,
    pub destination: Destination,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct SocketPool {
    max_sockets: usize,
    next_id: u64,
    entries: HashMap<SlotId, PoolEntry>,
    pending: VecDeque<PendingRequest>,
}

impl SocketPool {
    pub(crate) fn new(max_sockets: usize) -> Self {
        Self {
            max_sockets: max_sockets.max(1),
            next_id: 0,
            entries: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Reserved plus live entries
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn contains(&self, slot: SlotId) -> bool {
        self.entries.contains_key(&slot)
    }

    pub(crate) fn entry(&self, slot: SlotId) -> Option<&PoolEntry> {
        self.entries.get(&slot)
    }

    /// Reserve a slot, or queue the request when the pool is full
    pub(crate) fn admit(&mut self, pending: PendingRequest) -> Option<(SlotId, PendingRequest)> {
        if self.entries.len() < self.max_sockets {
            let slot = self.reserve(pending.destination.clone());
            Some((slot, pending))
        } else {
            self.pending.push_back(pending);
            None
        }
    }

    fn reserve(&mut self, destination: Destination) -> SlotId {
        let slot = SlotId(self.next_id);
        self.next_id += 1;
        self.entries.insert(slot, PoolEntry::Reserved(destination));
        slot
    }

    /// Turn a reservation into a live entry in place; `false` if the slot is gone
    pub(crate) fn activate(&mut self, slot: SlotId) -> bool {
        match self.entries.get_mut(&slot) {
            Some(entry) => {
                *entry = PoolEntry::Live(entry.destination().clone());
                true
            }
            None => false,
        }
    }

    /// Remove a slot and, if that freed capacity, reserve a slot for the
    /// oldest waiting request
    pub(crate) fn release(&mut self, slot: SlotId) -> Option<(SlotId, PendingRequest)> {
        self.entries.remove(&slot)?;
        if self.entries.len() >= self.max_sockets {
            return None;
        }
        let next = self.pending.pop_front()?;
        let slot = self.reserve(next.destination.clone());
        Some((slot, next))
    }

    /// Take the first waiting request for the same host and port
    pub(crate) fn take_matching(&mut self, destination: &Destination) -> Option<PendingRequest> {
        let index = self
            .pending
            .iter()
            .position(|p| p.destination.same_origin(destination))?;
        self.pending.remove(index)
    }
}
