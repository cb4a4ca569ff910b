use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    ticket::TicketRecord,
    types::{RoutingKey, TicketId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    DuplicateTicket(TicketId),
    NotFound(TicketId),
}

/// Waiting tickets of one routing key, exported in physical queue order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub key: RoutingKey,
    pub tickets: Vec<TicketRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshotV1 {
    pub queues: Vec<QueueSnapshot>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<TicketRecord>,
}

/// Per-routing-key FIFO queues of waiting tickets.
///
/// Each key's queue is an independently lockable unit: operations on
/// different keys proceed in parallel, operations on the same key are
/// serialized. Whenever more than one queue must be locked, locks are taken
/// in ascending [`RoutingKey`] order; the ticket-id index lock is always
/// taken after any queue lock. The registry lock is only held to fetch or
/// create a queue cell, never across another lock.
#[derive(Debug, Default)]
pub struct QueueStore {
    queues: RwLock<HashMap<RoutingKey, Arc<Mutex<QueueState>>>>,
    index: Mutex<HashMap<TicketId, RoutingKey>>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts at the queue position given by (arrival, id) ordering.
    ///
    /// Normal registrations arrive with non-decreasing timestamps, so this
    /// is a tail push in practice; late-stamped inserts still land in
    /// arrival order. Fails with [`StoreError::DuplicateTicket`] if the id
    /// exists anywhere in the store.
    pub fn enqueue(&self, ticket: TicketRecord) -> Result<(), StoreError> {
        self.insert_at(ticket, false)
    }

    /// Inserts at the physical tail regardless of arrival timestamp.
    ///
    /// Used by requeue and reassign: no queue-jumping, while the preserved
    /// arrival timestamp keeps fairness accounting intact.
    pub fn enqueue_tail(&self, ticket: TicketRecord) -> Result<(), StoreError> {
        self.insert_at(ticket, true)
    }

    fn insert_at(&self, ticket: TicketRecord, force_tail: bool) -> Result<(), StoreError> {
        let key = ticket.routing_key();
        let cell = self.cell(key);
        let mut queue = cell.lock();
        let mut index = self.index.lock();
        if index.contains_key(&ticket.id) {
            return Err(StoreError::DuplicateTicket(ticket.id));
        }
        index.insert(ticket.id, key);
        drop(index);

        let mut pos = queue.entries.len();
        if !force_tail {
            while pos > 0 {
                let prev = &queue.entries[pos - 1];
                if (prev.arrival_ms, prev.id) <= (ticket.arrival_ms, ticket.id) {
                    break;
                }
                pos -= 1;
            }
        }
        queue.entries.insert(pos, ticket);
        Ok(())
    }

    /// Read-only view of the queue head; does not mutate order.
    pub fn peek_next(&self, key: RoutingKey) -> Option<TicketRecord> {
        let cell = self.existing_cell(key)?;
        let queue = cell.lock();
        queue.entries.front().cloned()
    }

    /// Atomically pops and returns the head of one queue.
    pub fn remove_head(&self, key: RoutingKey) -> Option<TicketRecord> {
        let cell = self.existing_cell(key)?;
        let mut queue = cell.lock();
        let ticket = queue.entries.pop_front()?;
        self.index.lock().remove(&ticket.id);
        Some(ticket)
    }

    /// Pops the globally oldest head across the candidate keys.
    ///
    /// All candidate queue locks are held together, in ascending key order,
    /// so the selection and the pop are one atomic step with respect to any
    /// concurrent claim or removal.
    pub fn claim_oldest(&self, keys: &[RoutingKey]) -> Option<TicketRecord> {
        let mut sorted: Vec<RoutingKey> = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let cells: Vec<Arc<Mutex<QueueState>>> = sorted
            .iter()
            .filter_map(|&key| self.existing_cell(key))
            .collect();
        let mut guards: Vec<MutexGuard<'_, QueueState>> =
            cells.iter().map(|cell| cell.lock()).collect();

        let chosen = guards
            .iter()
            .enumerate()
            .filter_map(|(i, guard)| {
                guard.entries.front().map(|t| (t.arrival_ms, t.id, i))
            })
            .min()?;

        let ticket = guards[chosen.2].entries.pop_front()?;
        self.index.lock().remove(&ticket.id);
        Some(ticket)
    }

    /// Removes a ticket from its queue regardless of position.
    pub fn remove(&self, id: TicketId) -> Result<TicketRecord, StoreError> {
        loop {
            let key = { self.index.lock().get(&id).copied() };
            let Some(key) = key else {
                return Err(StoreError::NotFound(id));
            };

            let cell = self.cell(key);
            let mut queue = cell.lock();
            let mut index = self.index.lock();
            match index.get(&id).copied() {
                Some(current) if current == key => {
                    index.remove(&id);
                    drop(index);
                    let Some(pos) = queue.entries.iter().position(|t| t.id == id) else {
                        return Err(StoreError::NotFound(id));
                    };
                    let Some(ticket) = queue.entries.remove(pos) else {
                        return Err(StoreError::NotFound(id));
                    };
                    return Ok(ticket);
                }
                // Moved to another queue between lookup and lock; retry.
                Some(_) => continue,
                None => return Err(StoreError::NotFound(id)),
            }
        }
    }

    /// Moves a waiting ticket to the tail of `new_key`'s queue.
    ///
    /// Both queue locks are held for the move, so the ticket is never
    /// observably absent from the store. The original arrival timestamp is
    /// kept; only the routing fields change.
    pub fn reassign(
        &self,
        id: TicketId,
        new_key: RoutingKey,
    ) -> Result<TicketRecord, StoreError> {
        loop {
            let old_key = { self.index.lock().get(&id).copied() };
            let Some(old_key) = old_key else {
                return Err(StoreError::NotFound(id));
            };

            let old_cell = self.cell(old_key);
            let new_cell = self.cell(new_key);

            // Ascending key order; a single lock when the key is unchanged.
            let (mut old_guard, mut new_guard) = if old_key == new_key {
                (old_cell.lock(), None)
            } else if old_key < new_key {
                let og = old_cell.lock();
                let ng = new_cell.lock();
                (og, Some(ng))
            } else {
                let ng = new_cell.lock();
                let og = old_cell.lock();
                (og, Some(ng))
            };

            let mut index = self.index.lock();
            match index.get(&id).copied() {
                Some(current) if current == old_key => {
                    index.insert(id, new_key);
                    drop(index);
                    let Some(pos) = old_guard.entries.iter().position(|t| t.id == id) else {
                        return Err(StoreError::NotFound(id));
                    };
                    let Some(mut ticket) = old_guard.entries.remove(pos) else {
                        return Err(StoreError::NotFound(id));
                    };
                    ticket.department = new_key.department;
                    ticket.professional = new_key.professional;
                    let out = ticket.clone();
                    match new_guard.as_mut() {
                        Some(guard) => guard.entries.push_back(ticket),
                        None => old_guard.entries.push_back(ticket),
                    }
                    return Ok(out);
                }
                Some(_) => continue,
                None => return Err(StoreError::NotFound(id)),
            }
        }
    }

    /// Looks up a waiting ticket by id.
    pub fn get(&self, id: TicketId) -> Option<TicketRecord> {
        loop {
            let key = { self.index.lock().get(&id).copied() }?;
            let cell = self.existing_cell(key)?;
            let queue = cell.lock();
            match queue.entries.iter().find(|t| t.id == id) {
                Some(ticket) => return Some(ticket.clone()),
                None => {
                    // Either claimed meanwhile or moved by a reassign.
                    let still_here =
                        self.index.lock().get(&id).copied() == Some(key);
                    if still_here {
                        return None;
                    }
                }
            }
        }
    }

    /// Returns true while the ticket is waiting in some queue.
    pub fn contains(&self, id: TicketId) -> bool {
        self.index.lock().contains_key(&id)
    }

    /// Number of waiting tickets under one key.
    pub fn len(&self, key: RoutingKey) -> usize {
        self.existing_cell(key)
            .map(|cell| cell.lock().entries.len())
            .unwrap_or(0)
    }

    /// Returns true when no ticket is waiting anywhere.
    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Total waiting tickets across all keys.
    pub fn waiting_count(&self) -> usize {
        self.index.lock().len()
    }

    /// Ids under one key in queue order.
    pub fn waiting_ids(&self, key: RoutingKey) -> Vec<TicketId> {
        self.existing_cell(key)
            .map(|cell| cell.lock().entries.iter().map(|t| t.id).collect())
            .unwrap_or_default()
    }

    /// Exports all queues, keys ascending, each in physical order.
    ///
    /// Queues are locked one at a time; concurrent mutations linearize
    /// before or after the snapshot of their own key.
    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        let mut keys: Vec<RoutingKey> = self.queues.read().keys().copied().collect();
        keys.sort();

        let mut queues = Vec::new();
        for key in keys {
            let Some(cell) = self.existing_cell(key) else {
                continue;
            };
            let tickets: Vec<TicketRecord> = cell.lock().entries.iter().cloned().collect();
            if !tickets.is_empty() {
                queues.push(QueueSnapshot { key, tickets });
            }
        }
        StoreSnapshotV1 { queues }
    }

    /// Rebuilds a store from an exported snapshot, preserving queue order.
    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> Result<Self, StoreError> {
        let store = Self::new();
        for queue in snapshot.queues {
            for ticket in queue.tickets {
                store.enqueue_tail(ticket)?;
            }
        }
        Ok(store)
    }

    fn cell(&self, key: RoutingKey) -> Arc<Mutex<QueueState>> {
        if let Some(cell) = self.queues.read().get(&key) {
            return Arc::clone(cell);
        }
        let mut queues = self.queues.write();
        Arc::clone(queues.entry(key).or_default())
    }

    fn existing_cell(&self, key: RoutingKey) -> Option<Arc<Mutex<QueueState>>> {
        self.queues.read().get(&key).map(Arc::clone)
    }
}
