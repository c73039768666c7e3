//! Query objects exchanged between transactions and connections.
//!
//! A [`Query`] is created through an [`Adapter`](crate::Adapter), handed to a
//! connection, and completed by the driver with [`Query::complete`] or
//! [`Query::fail`]. It terminates with exactly one `Close` or `Error` event.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::event::{Emitter, Event, ListenerId};

/// A bind parameter or result column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Rows returned by a completed query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

impl QueryResult {
    /// Result of a statement that returns no rows.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }
}

/// Who reports a query's failure.
///
/// Fixed when the query is created: a query built with a callback is owned by
/// the caller, whose callback receives the error. The transaction still rolls
/// back but does not emit the error a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reporting {
    Transaction,
    Caller,
}

#[derive(Debug, Clone)]
pub enum QueryEvent {
    Error(Error),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEventKind {
    Error,
    Close,
}

impl Event for QueryEvent {
    type Kind = QueryEventKind;

    fn kind(&self) -> QueryEventKind {
        match self {
            QueryEvent::Error(_) => QueryEventKind::Error,
            QueryEvent::Close => QueryEventKind::Close,
        }
    }
}

pub type QueryCallback = Box<dyn FnOnce(Result<QueryResult>) + Send>;

struct QueryInner {
    text: String,
    params: Vec<Value>,
    reporting: Reporting,
    callback: Mutex<Option<QueryCallback>>,
    events: Emitter<QueryEvent>,
    outcome: watch::Sender<Option<Result<QueryResult>>>,
}

/// A single SQL statement with its parameters and completion signals.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

impl Query {
    pub fn new(
        text: impl Into<String>,
        params: Vec<Value>,
        callback: Option<QueryCallback>,
    ) -> Self {
        let reporting = if callback.is_some() {
            Reporting::Caller
        } else {
            Reporting::Transaction
        };
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(QueryInner {
                text: text.into(),
                params,
                reporting,
                callback: Mutex::new(callback),
                events: Emitter::new(),
                outcome,
            }),
        }
    }

    pub fn text(&self) -> &str {
        &self.inner.text
    }

    pub fn params(&self) -> &[Value] {
        &self.inner.params
    }

    pub fn reporting(&self) -> Reporting {
        self.inner.reporting
    }

    pub fn reports_to_caller(&self) -> bool {
        self.inner.reporting == Reporting::Caller
    }

    /// Returns true once the query has completed or failed.
    pub fn is_finished(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    pub fn on<F>(&self, kind: QueryEventKind, callback: F) -> ListenerId
    where
        F: Fn(&QueryEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, callback)
    }

    pub fn once<F>(&self, kind: QueryEventKind, callback: F) -> ListenerId
    where
        F: FnOnce(&QueryEvent) + Send + 'static,
    {
        self.inner.events.once(kind, callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove(id)
    }

    pub fn listener_count(&self, kind: QueryEventKind) -> usize {
        self.inner.events.listener_count(kind)
    }

    /// Marks the query as successfully executed.
    ///
    /// Called by the driver. Only the first completion counts.
    pub fn complete(&self, result: QueryResult) {
        if !self.settle(Ok(result.clone())) {
            return;
        }
        if let Some(callback) = self.inner.callback.lock().take() {
            callback(Ok(result));
        }
        self.inner.events.emit(&QueryEvent::Close);
    }

    /// Marks the query as failed.
    ///
    /// Called by the driver, or by the transaction when the query can no
    /// longer run. Only the first completion counts.
    pub fn fail(&self, err: impl Into<Error>) {
        let err = err.into();
        if !self.settle(Err(err.clone())) {
            return;
        }
        let callback = self.inner.callback.lock().take();
        let had_callback = callback.is_some();
        if let Some(callback) = callback {
            callback(Err(err.clone()));
        }
        let heard = self.inner.events.emit(&QueryEvent::Error(err.clone()));
        if !heard && !had_callback {
            log::warn!("query {:?} failed with nobody listening: {}", self.text(), err);
        }
    }

    fn settle(&self, outcome: Result<QueryResult>) -> bool {
        self.inner.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// Waits for the query to finish and returns its outcome.
    pub async fn result(&self) -> Result<QueryResult> {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(Error::Abandoned))
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("text", &self.inner.text)
            .field("params", &self.inner.params)
            .field("reporting", &self.inner.reporting)
            .field("finished", &self.is_finished())
            .finish()
    }
}
