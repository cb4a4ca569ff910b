//! In-memory queue store and sequence-code issuance.

/// Display sequence-code sequencer, scoped per (department, day).
pub mod sequencer;
/// Per-routing-key FIFO queues and the ticket-id index.
pub mod store;
