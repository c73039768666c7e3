//! Starting transactions on connections, pools and parent transactions.

use std::sync::Arc;

use crate::adapter::Adapter;
use crate::connection::{Lease, Pool, Queryable};
use crate::error::{Error, Result};
use crate::event::defer;

use super::handle::{BeginCallback, EventKind, Transaction, TransactionEvent};
use super::state::State;
use super::statements::Statements;

/// Starts a transaction with the default begin statement and no callback.
///
/// Passing a [`Transaction`] starts a savepoint-backed child of it.
///
/// ```no_run
/// # fn demo(conn: std::sync::Arc<dyn sqltx::Connection>) -> sqltx::Result<()> {
/// let tx = sqltx::begin(conn)?;
/// tx.query("INSERT INTO t (a) VALUES (?)", vec![1.into()]);
/// tx.commit();
/// # Ok(())
/// # }
/// ```
pub fn begin(queryable: impl Into<Queryable>) -> Result<Transaction> {
    Begin::new(queryable).start()
}

/// Builder for transactions that need a custom begin statement or a begin
/// callback.
pub struct Begin {
    queryable: Queryable,
    statement: Option<String>,
    callback: Option<BeginCallback>,
}

impl Begin {
    pub fn new(queryable: impl Into<Queryable>) -> Self {
        Self {
            queryable: queryable.into(),
            statement: None,
            callback: None,
        }
    }

    /// Replaces `BEGIN`. Ignored for child transactions, which always use a
    /// savepoint.
    pub fn statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    /// Receives the transaction once its begin statement succeeded, or the
    /// first error if it did not. While pending, the callback takes the place
    /// of the `Error` event.
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<Transaction>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Creates the transaction and starts binding its connection.
    ///
    /// Returns immediately; queries and commit/rollback may be issued right
    /// away. Fails only when the queryable cannot run queries, in which case
    /// the callback, if any, receives the same error.
    pub fn start(self) -> Result<Transaction> {
        let Begin {
            queryable,
            statement,
            mut callback,
        } = self;

        match queryable {
            Queryable::Transaction(parent) => Ok(begin_with_parent(&parent, callback)),
            Queryable::Connection(connection) => {
                let adapter =
                    require_adapter(connection.adapter(), connection.describe(), &mut callback)?;
                let tx = Transaction::new(adapter, Statements::root(statement), 0, callback);
                tx.set_connection(connection, None);
                Ok(tx)
            }
            Queryable::Pool(pool) => {
                let adapter = require_adapter(pool.adapter(), pool.describe(), &mut callback)?;
                let tx = Transaction::new(adapter, Statements::root(statement), 0, callback);
                acquire(&tx, pool);
                Ok(tx)
            }
        }
    }
}

fn require_adapter(
    adapter: Option<Arc<dyn Adapter>>,
    description: String,
    callback: &mut Option<BeginCallback>,
) -> Result<Arc<dyn Adapter>> {
    adapter.ok_or_else(|| {
        let err = Error::NotQueryable(description);
        if let Some(callback) = callback.take() {
            callback(Err(err.clone()));
        }
        err
    })
}

fn acquire(tx: &Transaction, pool: Arc<dyn Pool>) {
    let tx = tx.clone();
    let source = pool.clone();
    pool.acquire(Box::new(move |acquired| match acquired {
        Ok(connection) => {
            let observer = source.clone();
            tx.on(EventKind::Query, move |event| {
                if let TransactionEvent::Query(query) = event {
                    observer.on_query(query);
                }
            });
            let lease = Lease::new(source, connection.clone());
            tx.set_connection(connection, Some(lease));
        }
        Err(err) => {
            let err = Error::Acquire(Arc::new(err));
            log::debug!("{}: {}", tx.id(), err);
            tx.reject_queued(Some(&err));
            defer(move || tx.emit_error(err));
        }
    }));
}

fn begin_with_parent(parent: &Transaction, callback: Option<BeginCallback>) -> Transaction {
    let level = parent.nesting_level() + 1;
    let child = Transaction::new(parent.adapter(), Statements::savepoint(level), level, callback);
    log::debug!("{}: child {} at level {}", parent.id(), child.id(), level);

    let forward = parent.clone();
    child.on(EventKind::Query, move |event| {
        forward.emit(event);
    });
    let bookkeeping = parent.clone();
    child.once(EventKind::StateChanged(State::Connected), move |_| {
        if let Err(err) = bookkeeping.transition(State::Connected) {
            log::trace!("{}: {}", bookkeeping.id(), err);
        }
    });
    let resume = parent.clone();
    child.once(EventKind::Close, move |_| resume.run_queue());

    parent.start_child(&child);
    child
}
