//! Transaction lifecycle.
//!
//! This module provides:
//! - The [`Transaction`] handle and its state machine
//! - The queue that buffers work until the begin statement succeeds
//! - Savepoint-backed child transactions
//! - Centralized error handling with automatic rollback

mod begin;
mod handle;
pub mod id;
mod queue;
pub mod state;
pub mod statements;

pub use begin::{begin, Begin};
pub use handle::{BeginCallback, CloseCallback, EventKind, Transaction, TransactionEvent};
pub use id::TransactionId;
pub use state::{State, StateMachine};
pub use statements::{savepoint_name, CloseAction, Statements, SAVEPOINT_PREFIX};
