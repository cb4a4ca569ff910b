//! Notifier event stream payloads.

use crate::{transition::Transition, types::TransitionSeq};

/// Events published to external listeners (display panels, reporting).
///
/// Delivery is at-least-once: consumers must de-duplicate by timestamp or
/// be idempotent on repeated identical events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketEvent {
    /// One lifecycle transition of one ticket.
    Transition(Transition),
    /// The history journal has reached at least this sequence.
    DurableUpTo {
        /// Highest sequence known durable.
        seq: TransitionSeq,
    },
}
