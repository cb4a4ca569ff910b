//! Shared primitive IDs, ticket status, and routing keys.

use serde::{Deserialize, Serialize};

/// Monotonic ticket identifier.
pub type TicketId = u64;
/// Monotonic transition sequence number.
pub type TransitionSeq = u64;
/// Patient identifier supplied by the registration collaborator.
pub type PatientId = u64;
/// Department identifier.
pub type DepartmentId = u32;
/// Professional (doctor/nurse) identifier.
pub type ProfessionalId = u32;
/// Opaque calendar-day stamp supplied by the caller (e.g. days since epoch).
///
/// The sequencer never reads the wall clock; the day is always explicit so
/// code issuance stays deterministic and testable.
pub type DayStamp = u32;

/// Lifecycle status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    /// Queued under a routing key, not yet called.
    Waiting,
    /// Claimed by a professional and currently being served.
    InService,
    /// Served to completion. Terminal.
    Finished,
    /// Cancelled from waiting or in-service. Terminal.
    Cancelled,
}

impl TicketStatus {
    /// Returns true for [`TicketStatus::Finished`] and [`TicketStatus::Cancelled`].
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

/// The (department, professional-or-unassigned) pair a queue is keyed by.
///
/// The derived `Ord` is the global lock-acquisition order: whenever more
/// than one queue must be locked, locks are taken in ascending key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingKey {
    /// Department the queue belongs to.
    pub department: DepartmentId,
    /// Fixed professional, or `None` for the department's shared queue.
    pub professional: Option<ProfessionalId>,
}

impl RoutingKey {
    /// Key of the department queue any professional there may draw from.
    pub fn unassigned(department: DepartmentId) -> Self {
        Self {
            department,
            professional: None,
        }
    }

    /// Key of a fixed department + professional queue.
    pub fn assigned(department: DepartmentId, professional: ProfessionalId) -> Self {
        Self {
            department,
            professional: Some(professional),
        }
    }
}
