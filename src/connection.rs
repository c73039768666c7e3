//! Connection and pool boundaries.
//!
//! The crate never talks to a database directly. A driver provides a
//! [`Connection`] that executes queries in submission order and completes each
//! one through [`Query::complete`] or [`Query::fail`], and optionally a
//! [`Pool`] that hands such connections out.

use std::fmt;
use std::sync::Arc;

use crate::adapter::Adapter;
use crate::error::Error;
use crate::event::{Emitter, Event};
use crate::query::Query;
use crate::transaction::Transaction;

/// Connection-level signals a transaction subscribes to while bound.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection itself failed (socket closed, protocol error).
    Error(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Error,
}

impl Event for ConnectionEvent {
    type Kind = ConnectionEventKind;

    fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Error(_) => ConnectionEventKind::Error,
        }
    }
}

/// A single live database connection.
pub trait Connection: Send + Sync + 'static {
    /// The adapter used to build queries for this connection, or `None` if the
    /// connection cannot run queries.
    fn adapter(&self) -> Option<Arc<dyn Adapter>>;

    /// Submits a query. Queries must execute in submission order.
    fn query(&self, query: Query);

    fn events(&self) -> &Emitter<ConnectionEvent>;

    /// Short description used in error messages.
    fn describe(&self) -> String {
        "connection".to_string()
    }
}

pub type AcquireCallback = Box<dyn FnOnce(anyhow::Result<Arc<dyn Connection>>) + Send>;

/// A source of connections.
pub trait Pool: Send + Sync + 'static {
    fn adapter(&self) -> Option<Arc<dyn Adapter>>;

    /// Acquires a connection and hands it to `callback`, possibly later.
    fn acquire(&self, callback: AcquireCallback);

    /// Returns a connection previously handed out by [`Pool::acquire`].
    fn release(&self, connection: Arc<dyn Connection>);

    /// Observes every query issued by transactions on this pool.
    fn on_query(&self, _query: &Query) {}

    fn describe(&self) -> String {
        "pool".to_string()
    }
}

/// A pooled connection checked out for one transaction.
///
/// The connection goes back to the pool when the lease is dropped, which
/// happens when the transaction detaches its connection on close, or when the
/// last handle to an unfinished transaction goes away.
pub struct Lease {
    pool: Arc<dyn Pool>,
    connection: Option<Arc<dyn Connection>>,
}

impl Lease {
    pub fn new(pool: Arc<dyn Pool>, connection: Arc<dyn Connection>) -> Self {
        Self {
            pool,
            connection: Some(connection),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            log::debug!("releasing {} to {}", connection.describe(), self.pool.describe());
            self.pool.release(connection);
        }
    }
}

/// Anything a transaction can be started on.
#[derive(Clone)]
pub enum Queryable {
    Connection(Arc<dyn Connection>),
    Pool(Arc<dyn Pool>),
    /// Starts a savepoint-backed child transaction.
    Transaction(Transaction),
}

impl Queryable {
    pub fn connection<C: Connection>(connection: Arc<C>) -> Self {
        Queryable::Connection(connection)
    }

    pub fn pool<P: Pool>(pool: Arc<P>) -> Self {
        Queryable::Pool(pool)
    }
}

impl From<Arc<dyn Connection>> for Queryable {
    fn from(connection: Arc<dyn Connection>) -> Self {
        Queryable::Connection(connection)
    }
}

impl From<Arc<dyn Pool>> for Queryable {
    fn from(pool: Arc<dyn Pool>) -> Self {
        Queryable::Pool(pool)
    }
}

impl From<Transaction> for Queryable {
    fn from(tx: Transaction) -> Self {
        Queryable::Transaction(tx)
    }
}

impl From<&Transaction> for Queryable {
    fn from(tx: &Transaction) -> Self {
        Queryable::Transaction(tx.clone())
    }
}

impl fmt::Debug for Queryable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Queryable::Connection(_) => f.write_str("Queryable::Connection"),
            Queryable::Pool(_) => f.write_str("Queryable::Pool"),
            Queryable::Transaction(tx) => write!(f, "Queryable::Transaction({})", tx.id()),
        }
    }
}
