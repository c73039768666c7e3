//! SQL transactions over any connection or pool, with savepoint-based
//! nesting.
//!
//! A [`Transaction`] accepts queries before its connection is even bound,
//! replays them in order once `BEGIN` succeeds, and rolls back automatically
//! when one of them fails. Beginning a transaction on another transaction
//! creates a child backed by a savepoint (`SAVEPOINT sp_1`, `sp_2`, ...).
//!
//! The crate does not execute SQL itself. Drivers implement [`Connection`]
//! (and optionally [`Pool`]) and complete each [`Query`] they are handed.

pub mod adapter;
pub mod connection;
pub mod error;
pub mod event;
pub mod query;
pub mod transaction;

pub use adapter::{Adapter, DefaultAdapter};
pub use connection::{
    AcquireCallback, Connection, ConnectionEvent, ConnectionEventKind, Lease, Pool, Queryable,
};
pub use error::{Error, Result};
pub use event::{Emitter, Event, ListenerId};
pub use query::{Query, QueryCallback, QueryEvent, QueryEventKind, QueryResult, Reporting, Value};
pub use transaction::{
    begin, Begin, CloseAction, EventKind, State, Statements, Transaction, TransactionEvent,
    TransactionId,
};
