//! Ticket domain record and registration draft.

use serde::{Deserialize, Serialize};

use crate::types::{
    DepartmentId, PatientId, ProfessionalId, RoutingKey, TicketId, TicketStatus,
};

/// Fully materialized, authoritative queue-entry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRecord {
    /// Stable ticket identifier.
    pub id: TicketId,
    /// Displayed sequence code, unique within (department, day), e.g. "A012".
    pub seq_code: String,
    /// Patient reference, trusted from the registration collaborator.
    pub patient_id: PatientId,
    /// Department the ticket is routed to.
    pub department: DepartmentId,
    /// Routing assignment fixed at creation (or by an explicit reassign);
    /// `None` routes to the department's shared queue.
    pub professional: Option<ProfessionalId>,
    /// Professional currently or last serving this ticket. Set on claim,
    /// cleared on requeue. Never alters the routing assignment.
    pub served_by: Option<ProfessionalId>,
    /// Arrival timestamp in milliseconds since epoch. Fixed at creation;
    /// requeue and reassign keep it so fairness accounting never resets.
    pub arrival_ms: u64,
    /// Set when the ticket left `Waiting`, cleared again by requeue.
    pub called_ms: Option<u64>,
    /// Set when the ticket reached `Finished`.
    pub finished_ms: Option<u64>,
    /// Authoritative lifecycle status. Timestamps are audit only.
    pub status: TicketStatus,
    /// Caller-supplied reason recorded on cancellation.
    pub cancel_reason: Option<String>,
}

impl TicketRecord {
    /// The queue key this ticket is routed under.
    pub fn routing_key(&self) -> RoutingKey {
        RoutingKey {
            department: self.department,
            professional: self.professional,
        }
    }

    /// Wait time accrued from the original arrival, in milliseconds.
    ///
    /// Uses the called timestamp once the ticket has been claimed, so a
    /// requeued ticket keeps accruing from its original arrival.
    pub fn waited_ms(&self, now_ms: u64) -> u64 {
        self.called_ms
            .unwrap_or(now_ms)
            .saturating_sub(self.arrival_ms)
    }

    /// Returns true once the ticket has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Registration payload used to create a new [`TicketRecord`].
///
/// Identifier, sequence code, and status are assigned by the dispatch
/// engine; the registration collaborator supplies only routing and arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketDraft {
    /// Patient reference; existence is the caller's responsibility.
    pub patient_id: PatientId,
    /// Department the ticket is routed to.
    pub department: DepartmentId,
    /// Fixed professional, or `None` for the department's shared queue.
    pub professional: Option<ProfessionalId>,
    /// Arrival timestamp in milliseconds since epoch.
    pub arrival_ms: u64,
}
