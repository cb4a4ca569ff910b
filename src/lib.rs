//! Waiting-queue dispatch core: sequence-coded tickets, per-routing-key
//! FIFO queues, and concurrency-safe claim/finish/cancel/requeue, with an
//! append-only SQLite history.
//!
//! # Examples
//!
//! In-memory usage with [`dispatch::engine::DispatchEngine`]:
//! ```
//! use waitline::{dispatch::engine::DispatchEngine, ticket::TicketDraft};
//!
//! let engine = DispatchEngine::new();
//! let (id, _op) = engine.register(
//!     TicketDraft {
//!         patient_id: 7,
//!         department: 0,
//!         professional: None,
//!         arrival_ms: 1,
//!     },
//!     20_000,
//! ).expect("register");
//!
//! let (ticket, _op) = engine.call_next(3, 0).expect("call next");
//! assert_eq!(ticket.id, id);
//! assert_eq!(ticket.seq_code, "A001");
//! engine.finish(id, 3).expect("finish");
//! ```
//!
//! Runtime usage with the SQLite history sink:
//! ```no_run
//! use waitline::{
//!     dispatch::engine::DispatchEngine,
//!     persist::sqlite::SqliteHistorySink,
//!     runtime::handle::{spawn_dispatch, RuntimeConfig},
//!     ticket::TicketDraft,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteHistorySink::open("history.db").expect("open sqlite");
//! let handle = spawn_dispatch(
//!     DispatchEngine::new(),
//!     Some(Box::new(sink)),
//!     RuntimeConfig::default(),
//! );
//! let id = handle.register(
//!     TicketDraft {
//!         patient_id: 7,
//!         department: 0,
//!         professional: None,
//!         arrival_ms: 1,
//!     },
//!     20_000,
//! ).expect("register");
//! let _ticket = handle.call_next(3, 0).expect("call next");
//! handle.finish(id, 3).expect("finish");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```

/// Queue store and sequence-code issuance.
pub mod core;
/// Dispatch engine and its error taxonomy.
pub mod dispatch;
/// History-sink abstraction and SQLite implementation.
pub mod persist;
/// Runtime handle, notifier events, and history worker.
pub mod runtime;
/// Ticket domain records and drafts.
pub mod ticket;
/// Transition model and persistence wrapper types.
pub mod transition;
/// Shared primitive types, status, and routing keys.
pub mod types;
