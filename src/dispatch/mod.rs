//! Ticket lifecycle orchestration.

/// Dispatch engine: claim, finish, cancel, requeue, reassign.
pub mod engine;
