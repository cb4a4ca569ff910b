//! SQLite-backed history sink: transition journal, archive, snapshots.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::{
    core::sequencer::SequencerConfig,
    dispatch::engine::{DispatchEngine, EngineSnapshotV1},
    ticket::TicketRecord,
    transition::{StoredTransition, StoredTransitionEnvelope, TransitionKind},
    types::{TicketId, TicketStatus, TransitionSeq},
};

use super::{HistorySink, PersistError, PersistResult};

const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    format_version: u16,
    snapshot: EngineSnapshotV1,
}

/// SQLite implementation of [`crate::persist::HistorySink`].
pub struct SqliteHistorySink {
    conn: Connection,
}

impl SqliteHistorySink {
    /// Opens or creates a SQLite-backed sink at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite sink.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Rebuilds an engine from the latest snapshot, or a fresh one.
    ///
    /// The journal is audit history and is not replayed; transitions after
    /// the last checkpoint belong to tickets whose live state is
    /// re-entered by the front desk on restart.
    pub fn load_engine(&self, config: SequencerConfig) -> PersistResult<DispatchEngine> {
        match self.load_latest_snapshot()? {
            Some(snapshot) => Ok(DispatchEngine::from_snapshot(snapshot, config)?),
            None => Ok(DispatchEngine::with_sequencer_config(config)),
        }
    }

    /// Loads journaled transitions strictly after `seq`, in order.
    pub fn load_transitions_after(
        &self,
        seq: TransitionSeq,
    ) -> PersistResult<Vec<StoredTransition>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, payload FROM transitions WHERE seq > ?1 ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![seq as i64], |row| {
            let seq: i64 = row.get(0)?;
            let payload: Vec<u8> = row.get(1)?;
            let mut stored = decode_transition_payload(&payload).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    payload.len(),
                    rusqlite::types::Type::Blob,
                    Box::new(std::io::Error::other(err)),
                )
            })?;
            stored.seq = seq as TransitionSeq;
            Ok(stored)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Loads one archived terminal ticket.
    pub fn load_archived(&self, id: TicketId) -> PersistResult<Option<TicketRecord>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM archive WHERE ticket_id = ?1",
                params![id as i64],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&payload)?))
    }

    /// Number of archived terminal tickets.
    pub fn archived_count(&self) -> PersistResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM archive", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Writes a snapshot covering `last_seq`.
    pub fn write_snapshot(
        &mut self,
        snapshot: &EngineSnapshotV1,
        last_seq: TransitionSeq,
    ) -> PersistResult<()> {
        let env = SnapshotEnvelope {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot: snapshot.clone(),
        };
        let payload = serde_json::to_vec(&env)?;
        let ts_ms = now_ms();
        self.conn.execute(
            "INSERT INTO snapshots(last_seq, ts_ms, payload) VALUES (?1, ?2, ?3)",
            params![last_seq as i64, ts_ms as i64, payload],
        )?;
        Ok(())
    }

    /// Deletes journal rows up to and including `seq`.
    pub fn compact_through(&mut self, seq: TransitionSeq) -> PersistResult<usize> {
        let count = self.conn.execute(
            "DELETE FROM transitions WHERE seq <= ?1",
            params![seq as i64],
        )?;
        Ok(count)
    }

    /// Returns the latest sequence persisted in the journal.
    pub fn latest_seq(&self) -> PersistResult<TransitionSeq> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM transitions", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(seq.unwrap_or(0) as TransitionSeq)
    }

    fn load_latest_snapshot(&self) -> PersistResult<Option<EngineSnapshotV1>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let env: SnapshotEnvelope = serde_json::from_slice(&payload)?;
        if env.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(PersistError::Message(
                "unsupported snapshot format".to_string(),
            ));
        }
        Ok(Some(env.snapshot))
    }
}

impl HistorySink for SqliteHistorySink {
    fn append_transitions(
        &mut self,
        transitions: &[StoredTransition],
    ) -> PersistResult<TransitionSeq> {
        if transitions.is_empty() {
            return self.latest_seq();
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO transitions(seq, ts_ms, kind, ticket_id, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for stored in transitions {
                let payload =
                    serde_json::to_vec(&StoredTransitionEnvelope::new(stored.clone()))?;
                stmt.execute(params![
                    stored.seq as i64,
                    stored.transition.ts_ms as i64,
                    kind_code(stored.transition.kind),
                    stored.transition.ticket_id as i64,
                    payload,
                ])?;
            }
        }
        tx.commit()?;

        Ok(transitions.last().map(|t| t.seq).unwrap_or(0))
    }

    fn archive_tickets(&mut self, tickets: &[TicketRecord]) -> PersistResult<()> {
        if tickets.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            // REPLACE keeps re-delivered archives harmless.
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO archive(ticket_id, department, status, ts_ms, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for ticket in tickets {
                let payload = serde_json::to_vec(ticket)?;
                stmt.execute(params![
                    ticket.id as i64,
                    i64::from(ticket.department),
                    status_label(ticket.status),
                    now_ms() as i64,
                    payload,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn write_snapshot(
        &mut self,
        snapshot: &EngineSnapshotV1,
        last_seq: TransitionSeq,
    ) -> PersistResult<()> {
        SqliteHistorySink::write_snapshot(self, snapshot, last_seq)
    }

    fn compact_through(&mut self, seq: TransitionSeq) -> PersistResult<usize> {
        SqliteHistorySink::compact_through(self, seq)
    }
}

fn kind_code(kind: TransitionKind) -> i64 {
    match kind {
        TransitionKind::Created => 1,
        TransitionKind::Called => 2,
        TransitionKind::Finished => 3,
        TransitionKind::Cancelled => 4,
        TransitionKind::Requeued => 5,
        TransitionKind::Reassigned => 6,
    }
}

fn status_label(status: TicketStatus) -> &'static str {
    match status {
        TicketStatus::Waiting => "waiting",
        TicketStatus::InService => "in-service",
        TicketStatus::Finished => "finished",
        TicketStatus::Cancelled => "cancelled",
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn decode_transition_payload(payload: &[u8]) -> Result<StoredTransition, String> {
    let envelope: StoredTransitionEnvelope = serde_json::from_slice(payload)
        .map_err(|e| format!("transition payload decode failed: {e}"))?;
    if envelope.format_version != crate::transition::TRANSITION_FORMAT_VERSION {
        return Err(format!(
            "unsupported transition format version: {}",
            envelope.format_version
        ));
    }
    Ok(envelope.stored)
}
