use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    core::{
        sequencer::{CounterEntry, SequenceError, SequencerConfig, TicketSequencer},
        store::{QueueStore, StoreError, StoreSnapshotV1},
    },
    ticket::{TicketDraft, TicketRecord},
    transition::{StoredTransition, Transition, TransitionKind},
    types::{
        DayStamp, DepartmentId, ProfessionalId, RoutingKey, TicketId, TicketStatus,
        TransitionSeq,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Store(StoreError),
    Sequence(SequenceError),
    QueueEmpty,
    ProfessionalBusy(ProfessionalId),
    InvalidTransition {
        ticket_id: TicketId,
        from: TicketStatus,
    },
}

impl From<StoreError> for DispatchError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<SequenceError> for DispatchError {
    fn from(value: SequenceError) -> Self {
        Self::Sequence(value)
    }
}

/// Engine state exported for checkpointing and recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshotV1 {
    pub next_ticket_id: TicketId,
    pub next_transition_seq: TransitionSeq,
    pub counters: Vec<CounterEntry>,
    pub store: StoreSnapshotV1,
    pub active: Vec<TicketRecord>,
    pub terminal: Vec<(TicketId, TicketStatus)>,
}

#[derive(Debug, Default)]
struct ActiveTable {
    by_professional: HashMap<ProfessionalId, TicketRecord>,
    by_ticket: HashMap<TicketId, ProfessionalId>,
}

impl ActiveTable {
    fn insert(&mut self, ticket: TicketRecord) {
        if let Some(professional) = ticket.served_by {
            self.by_ticket.insert(ticket.id, professional);
            self.by_professional.insert(professional, ticket);
        }
    }

    fn owner_of(&self, id: TicketId) -> Option<ProfessionalId> {
        self.by_ticket.get(&id).copied()
    }

    fn remove_by_ticket(&mut self, id: TicketId) -> Option<TicketRecord> {
        let professional = self.by_ticket.remove(&id)?;
        self.by_professional.remove(&professional)
    }

    fn ticket_of(&self, professional: ProfessionalId) -> Option<&TicketRecord> {
        self.by_professional.get(&professional)
    }

    fn get(&self, id: TicketId) -> Option<&TicketRecord> {
        let professional = self.by_ticket.get(&id)?;
        self.by_professional.get(professional)
    }

    fn tickets(&self) -> impl Iterator<Item = &TicketRecord> {
        self.by_professional.values()
    }

    fn is_busy(&self, professional: ProfessionalId) -> bool {
        self.by_professional.contains_key(&professional)
    }
}

/// Orchestrates the ticket state machine over the queue store.
///
/// Lock hierarchy, outer to inner: active table, queue locks in ascending
/// [`RoutingKey`] order, ticket-id index, terminal map. The sequencer's
/// counter lock is independent of all of them.
///
/// Every successful mutation returns a [`StoredTransition`] carrying a
/// monotonic sequence number and the post-transition record; the runtime
/// forwards these to the notifier and the history sink. No operation
/// blocks indefinitely and none is retried internally.
#[derive(Debug)]
pub struct DispatchEngine {
    store: QueueStore,
    sequencer: TicketSequencer,
    active: Mutex<ActiveTable>,
    terminal: Mutex<HashMap<TicketId, TicketStatus>>,
    next_ticket_id: AtomicU64,
    next_transition_seq: AtomicU64,
}

impl Default for DispatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchEngine {
    pub fn new() -> Self {
        Self::with_sequencer_config(SequencerConfig::default())
    }

    pub fn with_sequencer_config(config: SequencerConfig) -> Self {
        Self {
            store: QueueStore::new(),
            sequencer: TicketSequencer::with_config(config),
            active: Mutex::new(ActiveTable::default()),
            terminal: Mutex::new(HashMap::new()),
            next_ticket_id: AtomicU64::new(1),
            next_transition_seq: AtomicU64::new(1),
        }
    }

    /// Issues a sequence code, assigns a ticket id, and enqueues the ticket
    /// under its routing key.
    pub fn register(
        &self,
        draft: TicketDraft,
        day: DayStamp,
    ) -> Result<(TicketId, StoredTransition), DispatchError> {
        let seq_code = self.sequencer.issue(draft.department, day)?;
        let id = self.next_ticket_id.fetch_add(1, Ordering::Relaxed);

        let ticket = TicketRecord {
            id,
            seq_code,
            patient_id: draft.patient_id,
            department: draft.department,
            professional: draft.professional,
            served_by: None,
            arrival_ms: draft.arrival_ms,
            called_ms: None,
            finished_ms: None,
            status: TicketStatus::Waiting,
            cancel_reason: None,
        };

        self.store.enqueue(ticket.clone())?;
        tracing::debug!(
            ticket = id,
            department = draft.department,
            code = %ticket.seq_code,
            "ticket registered"
        );
        Ok((id, self.stored(TransitionKind::Created, None, ticket)))
    }

    /// Claims the oldest waiting ticket this professional may serve.
    ///
    /// Candidates are the fixed (department, professional) queue and the
    /// department's unassigned queue; the globally oldest-arrived head wins.
    /// Fails with [`DispatchError::ProfessionalBusy`] while the professional
    /// still serves a ticket and [`DispatchError::QueueEmpty`] when no
    /// eligible ticket exists.
    pub fn call_next(
        &self,
        professional: ProfessionalId,
        department: DepartmentId,
    ) -> Result<(TicketRecord, StoredTransition), DispatchError> {
        let mut active = self.active.lock();
        if active.is_busy(professional) {
            return Err(DispatchError::ProfessionalBusy(professional));
        }

        let candidates = [
            RoutingKey::assigned(department, professional),
            RoutingKey::unassigned(department),
        ];
        let Some(mut ticket) = self.store.claim_oldest(&candidates) else {
            return Err(DispatchError::QueueEmpty);
        };

        ticket.status = TicketStatus::InService;
        ticket.called_ms = Some(now_ms());
        ticket.served_by = Some(professional);
        active.insert(ticket.clone());
        drop(active);

        tracing::debug!(ticket = ticket.id, professional, "ticket called");
        let stored = self.stored(
            TransitionKind::Called,
            Some(TicketStatus::Waiting),
            ticket.clone(),
        );
        Ok((ticket, stored))
    }

    /// Completes an in-service ticket owned by `professional`.
    pub fn finish(
        &self,
        id: TicketId,
        professional: ProfessionalId,
    ) -> Result<StoredTransition, DispatchError> {
        let mut active = self.active.lock();
        match active.owner_of(id) {
            Some(owner) if owner == professional => {
                let Some(mut ticket) = active.remove_by_ticket(id) else {
                    return Err(StoreError::NotFound(id).into());
                };
                ticket.status = TicketStatus::Finished;
                ticket.finished_ms = Some(now_ms());
                // Terminal insert happens under the active guard so a
                // concurrent cancel sees the ticket in exactly one place.
                self.terminal.lock().insert(id, TicketStatus::Finished);
                drop(active);

                tracing::debug!(ticket = id, professional, "ticket finished");
                Ok(self.stored(
                    TransitionKind::Finished,
                    Some(TicketStatus::InService),
                    ticket,
                ))
            }
            Some(_) => Err(DispatchError::InvalidTransition {
                ticket_id: id,
                from: TicketStatus::InService,
            }),
            None => {
                drop(active);
                Err(self.transition_error(id))
            }
        }
    }

    /// Cancels a waiting or in-service ticket.
    ///
    /// Idempotent: cancelling an already-cancelled ticket returns
    /// `Ok(None)` with no event re-emitted, so retried network calls are
    /// harmless. Cancelling a finished ticket is an `InvalidTransition`.
    pub fn cancel(
        &self,
        id: TicketId,
        reason: impl Into<String>,
    ) -> Result<Option<StoredTransition>, DispatchError> {
        let reason = reason.into();

        {
            let mut active = self.active.lock();
            if active.owner_of(id).is_some() {
                let Some(ticket) = active.remove_by_ticket(id) else {
                    return Err(StoreError::NotFound(id).into());
                };
                return Ok(Some(self.cancel_ticket(
                    ticket,
                    TicketStatus::InService,
                    reason,
                )));
            }
        }

        match self.store.remove(id) {
            Ok(ticket) => Ok(Some(self.cancel_ticket(
                ticket,
                TicketStatus::Waiting,
                reason,
            ))),
            Err(StoreError::NotFound(_)) => {
                // Lost the queue race to a concurrent claim, or the ticket
                // is already terminal. Re-check the active table once: if a
                // claim won, the ticket is now in service and may still be
                // cancelled there.
                {
                    let mut active = self.active.lock();
                    if active.owner_of(id).is_some() {
                        let Some(ticket) = active.remove_by_ticket(id) else {
                            return Err(StoreError::NotFound(id).into());
                        };
                        return Ok(Some(self.cancel_ticket(
                            ticket,
                            TicketStatus::InService,
                            reason,
                        )));
                    }
                }
                match self.terminal.lock().get(&id).copied() {
                    Some(TicketStatus::Cancelled) => Ok(None),
                    Some(status) => Err(DispatchError::InvalidTransition {
                        ticket_id: id,
                        from: status,
                    }),
                    None => Err(StoreError::NotFound(id).into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns an in-service ticket to the tail of its routing key's queue.
    ///
    /// The original arrival timestamp is preserved for reporting; the
    /// called timestamp and serving professional are cleared.
    pub fn requeue(&self, id: TicketId) -> Result<StoredTransition, DispatchError> {
        let mut active = self.active.lock();
        let Some(mut ticket) = active.remove_by_ticket(id) else {
            drop(active);
            return Err(self.transition_error(id));
        };

        ticket.status = TicketStatus::Waiting;
        ticket.called_ms = None;
        ticket.served_by = None;
        self.store.enqueue_tail(ticket.clone())?;
        drop(active);

        tracing::debug!(ticket = id, "ticket requeued");
        Ok(self.stored(
            TransitionKind::Requeued,
            Some(TicketStatus::InService),
            ticket,
        ))
    }

    /// Moves a waiting ticket to the tail of another routing key's queue.
    pub fn reassign(
        &self,
        id: TicketId,
        new_key: RoutingKey,
    ) -> Result<StoredTransition, DispatchError> {
        {
            let active = self.active.lock();
            if active.owner_of(id).is_some() {
                return Err(DispatchError::InvalidTransition {
                    ticket_id: id,
                    from: TicketStatus::InService,
                });
            }
        }

        match self.store.reassign(id, new_key) {
            Ok(ticket) => Ok(self.stored(
                TransitionKind::Reassigned,
                Some(TicketStatus::Waiting),
                ticket,
            )),
            Err(StoreError::NotFound(_)) => Err(self.transition_error(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Looks up a live (waiting or in-service) ticket.
    pub fn lookup(&self, id: TicketId) -> Option<TicketRecord> {
        let from_active = self.active.lock().get(id).cloned();
        if let Some(ticket) = from_active {
            return Some(ticket);
        }
        self.store.get(id)
    }

    /// The ticket a professional is currently serving, if any.
    pub fn active_ticket(&self, professional: ProfessionalId) -> Option<TicketRecord> {
        self.active.lock().ticket_of(professional).cloned()
    }

    /// Terminal status of an archived ticket, if it reached one.
    pub fn terminal_status(&self, id: TicketId) -> Option<TicketStatus> {
        self.terminal.lock().get(&id).copied()
    }

    /// Number of tickets waiting under one routing key.
    pub fn waiting_count(&self, key: RoutingKey) -> usize {
        self.store.len(key)
    }

    /// The underlying queue store, for read-side collaborators.
    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// The sequence-code sequencer.
    pub fn sequencer(&self) -> &TicketSequencer {
        &self.sequencer
    }

    /// Highest transition sequence issued so far.
    pub fn latest_seq(&self) -> TransitionSeq {
        self.next_transition_seq
            .load(Ordering::Relaxed)
            .saturating_sub(1)
    }

    /// Exports all live state for checkpointing.
    ///
    /// The active table lock is held throughout, so no claim or completion
    /// interleaves; queue snapshots are taken key by key.
    pub fn export_snapshot(&self) -> EngineSnapshotV1 {
        let active_guard = self.active.lock();
        let mut active: Vec<TicketRecord> = active_guard.tickets().cloned().collect();
        active.sort_by_key(|t| t.id);
        let store = self.store.export_snapshot();
        drop(active_guard);

        let mut terminal: Vec<(TicketId, TicketStatus)> = self
            .terminal
            .lock()
            .iter()
            .map(|(&id, &status)| (id, status))
            .collect();
        terminal.sort_by_key(|&(id, _)| id);

        EngineSnapshotV1 {
            next_ticket_id: self.next_ticket_id.load(Ordering::Relaxed),
            next_transition_seq: self.next_transition_seq.load(Ordering::Relaxed),
            counters: self.sequencer.export_counters(),
            store,
            active,
            terminal,
        }
    }

    /// Rebuilds an engine from an exported snapshot.
    pub fn from_snapshot(
        snapshot: EngineSnapshotV1,
        config: SequencerConfig,
    ) -> Result<Self, DispatchError> {
        let store = QueueStore::from_snapshot(snapshot.store)?;
        let sequencer = TicketSequencer::with_config(config);
        sequencer.restore_counters(&snapshot.counters);

        let mut active = ActiveTable::default();
        for ticket in snapshot.active {
            active.insert(ticket);
        }

        let mut terminal = HashMap::new();
        for (id, status) in snapshot.terminal {
            terminal.insert(id, status);
        }

        Ok(Self {
            store,
            sequencer,
            active: Mutex::new(active),
            terminal: Mutex::new(terminal),
            next_ticket_id: AtomicU64::new(snapshot.next_ticket_id.max(1)),
            next_transition_seq: AtomicU64::new(snapshot.next_transition_seq.max(1)),
        })
    }

    fn stored(
        &self,
        kind: TransitionKind,
        old_status: Option<TicketStatus>,
        ticket: TicketRecord,
    ) -> StoredTransition {
        let seq = self.next_transition_seq.fetch_add(1, Ordering::Relaxed);
        StoredTransition {
            seq,
            transition: Transition {
                ticket_id: ticket.id,
                kind,
                old_status,
                new_status: ticket.status,
                ts_ms: now_ms(),
            },
            ticket,
        }
    }

    fn cancel_ticket(
        &self,
        mut ticket: TicketRecord,
        old_status: TicketStatus,
        reason: String,
    ) -> StoredTransition {
        ticket.status = TicketStatus::Cancelled;
        ticket.cancel_reason = Some(reason);
        self.terminal
            .lock()
            .insert(ticket.id, TicketStatus::Cancelled);
        tracing::debug!(ticket = ticket.id, ?old_status, "ticket cancelled");
        self.stored(TransitionKind::Cancelled, Some(old_status), ticket)
    }

    fn transition_error(&self, id: TicketId) -> DispatchError {
        if let Some(status) = self.terminal.lock().get(&id).copied() {
            return DispatchError::InvalidTransition {
                ticket_id: id,
                from: status,
            };
        }
        if self.store.contains(id) {
            return DispatchError::InvalidTransition {
                ticket_id: id,
                from: TicketStatus::Waiting,
            };
        }
        StoreError::NotFound(id).into()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
