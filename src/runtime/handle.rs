use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};

use crate::{
    dispatch::engine::{DispatchEngine, DispatchError, EngineSnapshotV1},
    persist::{HistorySink, PersistError},
    ticket::{TicketDraft, TicketRecord},
    transition::StoredTransition,
    types::{DayStamp, DepartmentId, ProfessionalId, RoutingKey, TicketId, TransitionSeq},
};

use super::events::TicketEvent;

#[derive(Debug)]
pub enum RuntimeError {
    Dispatch(DispatchError),
    Persist(PersistError),
    ChannelClosed,
}

impl From<DispatchError> for RuntimeError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<PersistError> for RuntimeError {
    fn from(value: PersistError) -> Self {
        Self::Persist(value)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub flush_on_terminal: bool,
    pub batch_max_transitions: usize,
    pub batch_max_latency_ms: u64,
    pub persist_queue_bound: usize,
    pub snapshot_every_transitions: usize,
    pub compact_after_snapshot: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_on_terminal: true,
            batch_max_transitions: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            snapshot_every_transitions: 2000,
            compact_after_snapshot: false,
        }
    }
}

/// Cloneable facade over a shared [`DispatchEngine`].
///
/// Mutations run directly against the engine's per-key locks, so callers on
/// different routing keys proceed in parallel; the handle only adds event
/// publication and history journaling. Durability runs on a dedicated
/// worker task; its backpressure surfaces as [`RuntimeError::Persist`].
pub struct DispatchHandle {
    engine: Arc<DispatchEngine>,
    events_tx: broadcast::Sender<TicketEvent>,
    persist_tx: Option<mpsc::Sender<PersistMsg>>,
    config: RuntimeConfig,
    since_snapshot: Arc<AtomicUsize>,
}

impl Clone for DispatchHandle {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            events_tx: self.events_tx.clone(),
            persist_tx: self.persist_tx.clone(),
            config: self.config.clone(),
            since_snapshot: Arc::clone(&self.since_snapshot),
        }
    }
}

enum PersistMsg {
    Transition(StoredTransition),
    Archive(TicketRecord),
    Flush {
        resp: oneshot::Sender<Result<TransitionSeq, PersistError>>,
    },
    Checkpoint {
        snapshot: EngineSnapshotV1,
        last_seq: TransitionSeq,
        compact: bool,
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Wraps an engine in a runtime handle, optionally journaling to `sink`.
pub fn spawn_dispatch(
    engine: DispatchEngine,
    sink: Option<Box<dyn HistorySink>>,
    config: RuntimeConfig,
) -> DispatchHandle {
    let engine = Arc::new(engine);
    let (events_tx, _) = broadcast::channel::<TicketEvent>(1024);

    let persist_tx = sink.map(|sink| {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound);
        spawn_persistence_worker(sink, persist_rx, events_tx.clone(), config.clone());
        persist_tx
    });

    DispatchHandle {
        engine,
        events_tx,
        persist_tx,
        config,
        since_snapshot: Arc::new(AtomicUsize::new(0)),
    }
}

impl DispatchHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<TicketEvent> {
        self.events_tx.subscribe()
    }

    pub fn register(
        &self,
        draft: TicketDraft,
        day: DayStamp,
    ) -> Result<TicketId, RuntimeError> {
        let (id, stored) = self.engine.register(draft, day)?;
        self.publish(stored)?;
        Ok(id)
    }

    pub fn call_next(
        &self,
        professional: ProfessionalId,
        department: DepartmentId,
    ) -> Result<TicketRecord, RuntimeError> {
        let (ticket, stored) = self.engine.call_next(professional, department)?;
        self.publish(stored)?;
        Ok(ticket)
    }

    pub fn finish(
        &self,
        id: TicketId,
        professional: ProfessionalId,
    ) -> Result<(), RuntimeError> {
        let stored = self.engine.finish(id, professional)?;
        self.publish(stored)
    }

    /// Cancels a ticket; a repeat cancel is a silent success.
    pub fn cancel(
        &self,
        id: TicketId,
        reason: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        match self.engine.cancel(id, reason)? {
            Some(stored) => self.publish(stored),
            None => Ok(()),
        }
    }

    pub fn requeue(&self, id: TicketId) -> Result<(), RuntimeError> {
        let stored = self.engine.requeue(id)?;
        self.publish(stored)
    }

    pub fn reassign(&self, id: TicketId, new_key: RoutingKey) -> Result<(), RuntimeError> {
        let stored = self.engine.reassign(id, new_key)?;
        self.publish(stored)
    }

    pub fn lookup(&self, id: TicketId) -> Option<TicketRecord> {
        self.engine.lookup(id)
    }

    pub fn active_ticket(&self, professional: ProfessionalId) -> Option<TicketRecord> {
        self.engine.active_ticket(professional)
    }

    pub fn waiting_count(&self, key: RoutingKey) -> usize {
        self.engine.waiting_count(key)
    }

    /// Waits until everything published so far is durable.
    pub async fn flush(&self) -> Result<TransitionSeq, RuntimeError> {
        let Some(tx) = &self.persist_tx else {
            return Ok(self.engine.latest_seq());
        };
        let (flush_tx, flush_rx) = oneshot::channel();
        tx.send(PersistMsg::Flush { resp: flush_tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        flush_rx
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?
            .map_err(RuntimeError::from)
    }

    /// Writes an engine snapshot, optionally compacting the journal.
    pub async fn checkpoint(&self) -> Result<(), RuntimeError> {
        let Some(tx) = &self.persist_tx else {
            return Ok(());
        };
        let snapshot = self.engine.export_snapshot();
        let last_seq = self.engine.latest_seq();
        let (cp_tx, cp_rx) = oneshot::channel();
        tx.send(PersistMsg::Checkpoint {
            snapshot,
            last_seq,
            compact: self.config.compact_after_snapshot,
            resp: cp_tx,
        })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
        cp_rx
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?
            .map_err(RuntimeError::from)
    }

    /// Flushes outstanding history work and stops the worker.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let Some(tx) = &self.persist_tx else {
            return Ok(());
        };
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(PersistMsg::Shutdown { resp: done_tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        done_rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    fn publish(&self, stored: StoredTransition) -> Result<(), RuntimeError> {
        let terminal = stored.transition.new_status.is_terminal();
        let _ = self
            .events_tx
            .send(TicketEvent::Transition(stored.transition.clone()));

        if let Some(tx) = &self.persist_tx {
            let archive = terminal.then(|| stored.ticket.clone());
            enqueue_persist(tx, PersistMsg::Transition(stored))?;
            if let Some(ticket) = archive {
                enqueue_persist(tx, PersistMsg::Archive(ticket))?;
            }
            self.maybe_auto_checkpoint(tx);
        } else {
            let _ = self.events_tx.send(TicketEvent::DurableUpTo {
                seq: self.engine.latest_seq(),
            });
        }
        Ok(())
    }

    fn maybe_auto_checkpoint(&self, tx: &mpsc::Sender<PersistMsg>) {
        if self.config.snapshot_every_transitions == 0 {
            return;
        }
        let count = self.since_snapshot.fetch_add(1, Ordering::Relaxed) + 1;
        if count < self.config.snapshot_every_transitions {
            return;
        }
        self.since_snapshot.store(0, Ordering::Relaxed);

        let snapshot = self.engine.export_snapshot();
        let last_seq = self.engine.latest_seq();
        let (cp_tx, _cp_rx) = oneshot::channel();
        let msg = PersistMsg::Checkpoint {
            snapshot,
            last_seq,
            compact: self.config.compact_after_snapshot,
            resp: cp_tx,
        };
        if tx.try_send(msg).is_err() {
            tracing::warn!("auto checkpoint skipped: history queue full");
        }
    }
}

fn spawn_persistence_worker(
    sink: Box<dyn HistorySink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    events_tx: broadcast::Sender<TicketEvent>,
    config: RuntimeConfig,
) {
    let sink = Arc::new(Mutex::new(sink));
    tokio::spawn(async move {
        let mut transitions = Vec::<StoredTransition>::new();
        let mut archives = Vec::<TicketRecord>::new();
        let mut deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
        let mut last_durable: TransitionSeq = 0;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = flush_buffers(&sink, &mut transitions, &mut archives, &mut last_durable, &events_tx, true).await;
                        break;
                    };

                    match msg {
                        PersistMsg::Transition(stored) => {
                            let terminal = stored.transition.new_status.is_terminal();
                            transitions.push(stored);

                            if transitions.len() >= config.batch_max_transitions
                                || (config.flush_on_terminal && terminal)
                            {
                                let _ = flush_buffers(&sink, &mut transitions, &mut archives, &mut last_durable, &events_tx, true).await;
                                deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                            }
                        }
                        PersistMsg::Archive(ticket) => {
                            archives.push(ticket);
                            if config.flush_on_terminal {
                                let _ = flush_buffers(&sink, &mut transitions, &mut archives, &mut last_durable, &events_tx, true).await;
                                deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                            }
                        }
                        PersistMsg::Flush { resp } => {
                            let result = flush_buffers(&sink, &mut transitions, &mut archives, &mut last_durable, &events_tx, true).await;
                            let _ = resp.send(result.map(|_| last_durable));
                            deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                        }
                        PersistMsg::Checkpoint { snapshot, last_seq, compact, resp } => {
                            let flush_result = flush_buffers(&sink, &mut transitions, &mut archives, &mut last_durable, &events_tx, true).await;
                            let result = if let Err(err) = flush_result {
                                Err(err)
                            } else {
                                let sink_ref = Arc::clone(&sink);
                                match tokio::task::spawn_blocking(move || {
                                    let mut sink = sink_ref.blocking_lock();
                                    sink.write_snapshot(&snapshot, last_seq)?;
                                    if compact {
                                        let _ = sink.compact_through(last_seq)?;
                                    }
                                    Result::<(), PersistError>::Ok(())
                                }).await {
                                    Ok(inner) => inner,
                                    Err(e) => Err(PersistError::Message(format!("join error: {e}"))),
                                }
                            };
                            let _ = resp.send(result);
                            deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                        }
                        PersistMsg::Shutdown { resp } => {
                            let _ = flush_buffers(&sink, &mut transitions, &mut archives, &mut last_durable, &events_tx, true).await;
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !transitions.is_empty() || !archives.is_empty() => {
                    let _ = flush_buffers(&sink, &mut transitions, &mut archives, &mut last_durable, &events_tx, false).await;
                    deadline = Instant::now() + Duration::from_millis(config.batch_max_latency_ms);
                }
            }
        }
    });
}

async fn flush_buffers(
    sink: &Arc<Mutex<Box<dyn HistorySink>>>,
    transitions: &mut Vec<StoredTransition>,
    archives: &mut Vec<TicketRecord>,
    last_durable: &mut TransitionSeq,
    events_tx: &broadcast::Sender<TicketEvent>,
    call_flush: bool,
) -> Result<(), PersistError> {
    if transitions.is_empty() && archives.is_empty() {
        if call_flush {
            let sink_ref = Arc::clone(sink);
            tokio::task::spawn_blocking(move || {
                let mut sink = sink_ref.blocking_lock();
                sink.flush()
            })
            .await
            .map_err(|e| PersistError::Message(format!("join error: {e}")))??;
        }
        return Ok(());
    }

    let batch = std::mem::take(transitions);
    let archive_batch = std::mem::take(archives);
    let sink_ref = Arc::clone(sink);
    let append_res: Result<TransitionSeq, PersistError> =
        tokio::task::spawn_blocking(move || {
            let mut sink = sink_ref.blocking_lock();
            let seq = sink.append_transitions(&batch)?;
            if !archive_batch.is_empty() {
                sink.archive_tickets(&archive_batch)?;
            }
            if call_flush {
                sink.flush()?;
            }
            Ok(seq)
        })
        .await
        .map_err(|e| PersistError::Message(format!("join error: {e}")))?;

    match append_res {
        Ok(seq) => {
            *last_durable = (*last_durable).max(seq);
            let _ = events_tx.send(TicketEvent::DurableUpTo { seq: *last_durable });
            Ok(())
        }
        Err(err) => {
            tracing::warn!(error = ?err, "history append failed");
            Err(err)
        }
    }
}

fn enqueue_persist(
    tx: &mpsc::Sender<PersistMsg>,
    msg: PersistMsg,
) -> Result<(), RuntimeError> {
    tx.try_send(msg).map_err(|err| {
        RuntimeError::Persist(PersistError::Message(format!(
            "history queue error: {err}"
        )))
    })
}
