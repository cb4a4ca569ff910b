pub mod sqlite;

use crate::{
    dispatch::engine::EngineSnapshotV1,
    ticket::TicketRecord,
    transition::StoredTransition,
    types::TransitionSeq,
};

#[derive(Debug)]
pub enum PersistError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    Message(String),
}

impl From<rusqlite::Error> for PersistError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

impl From<crate::dispatch::engine::DispatchError> for PersistError {
    fn from(value: crate::dispatch::engine::DispatchError) -> Self {
        Self::Message(format!("dispatch error: {value:?}"))
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Durable history collaborator: transition journal, terminal archive,
/// engine snapshots. Appends are batched by the runtime worker; archive
/// writes must tolerate at-least-once delivery.
pub trait HistorySink: Send {
    fn append_transitions(&mut self, transitions: &[StoredTransition]) -> PersistResult<TransitionSeq>;
    fn archive_tickets(&mut self, tickets: &[TicketRecord]) -> PersistResult<()>;
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
    fn write_snapshot(&mut self, _snapshot: &EngineSnapshotV1, _last_seq: TransitionSeq) -> PersistResult<()> {
        Ok(())
    }
    fn compact_through(&mut self, _seq: TransitionSeq) -> PersistResult<usize> {
        Ok(0)
    }
}
