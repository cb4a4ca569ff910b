//! Lifecycle transition model and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    ticket::TicketRecord,
    types::{TicketId, TicketStatus, TransitionSeq},
};

/// Version number for serialized [`StoredTransitionEnvelope`] payloads.
pub const TRANSITION_FORMAT_VERSION: u16 = 1;

/// Discriminant for a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    /// Ticket registered and enqueued.
    Created,
    /// Ticket claimed into service.
    Called,
    /// Ticket served to completion.
    Finished,
    /// Ticket cancelled from waiting or in-service.
    Cancelled,
    /// In-service ticket returned to the tail of its queue.
    Requeued,
    /// Waiting ticket moved to another routing key.
    Reassigned,
}

/// One lifecycle transition, as published to external listeners.
///
/// `old_status` is `None` only for [`TransitionKind::Created`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Ticket the transition applies to.
    pub ticket_id: TicketId,
    /// Transition discriminant.
    pub kind: TransitionKind,
    /// Status before the transition.
    pub old_status: Option<TicketStatus>,
    /// Status after the transition.
    pub new_status: TicketStatus,
    /// Transition timestamp in milliseconds since epoch.
    pub ts_ms: u64,
}

/// Journal row metadata, transition payload, and post-transition snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransition {
    /// Monotonic transition sequence.
    pub seq: TransitionSeq,
    /// Transition body.
    pub transition: Transition,
    /// Full record as it stood immediately after the transition applied.
    pub ticket: TicketRecord,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransitionEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped transition.
    pub stored: StoredTransition,
}

impl StoredTransitionEnvelope {
    /// Constructs an envelope using [`TRANSITION_FORMAT_VERSION`].
    pub fn new(stored: StoredTransition) -> Self {
        Self {
            format_version: TRANSITION_FORMAT_VERSION,
            stored,
        }
    }
}
