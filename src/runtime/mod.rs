//! Runtime facade, notifier stream, and persistence worker.

/// Event stream types published to external listeners.
pub mod events;
/// Handle and history-worker implementation.
pub mod handle;
