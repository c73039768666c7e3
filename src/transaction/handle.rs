//! The transaction handle: state, bound connection, events and error policy.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::adapter::Adapter;
use crate::connection::{Connection, ConnectionEvent, ConnectionEventKind, Lease};
use crate::error::{Error, Result};
use crate::event::{defer, Emitter, Event, ListenerId};
use crate::query::{Query, QueryEvent, QueryEventKind, QueryResult, Value};

use super::id::TransactionId;
use super::queue::{reject, Task};
use super::state::{State, StateMachine};
use super::statements::{CloseAction, Statements};

pub type BeginCallback = Box<dyn FnOnce(Result<Transaction>) + Send>;
pub type CloseCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Lifecycle and query signals emitted by a transaction.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    BeginStart,
    BeginComplete,
    CommitStart,
    CommitComplete,
    RollbackStart,
    RollbackComplete,
    /// The transaction finished its commit or rollback.
    Close,
    /// A query was sent to the connection, by this transaction or a child.
    Query(Query),
    Error(Error),
    StateChanged(State),
}

impl TransactionEvent {
    fn close_start(action: CloseAction) -> Self {
        match action {
            CloseAction::Commit => Self::CommitStart,
            CloseAction::Rollback => Self::RollbackStart,
        }
    }

    fn close_complete(action: CloseAction) -> Self {
        match action {
            CloseAction::Commit => Self::CommitComplete,
            CloseAction::Rollback => Self::RollbackComplete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    BeginStart,
    BeginComplete,
    CommitStart,
    CommitComplete,
    RollbackStart,
    RollbackComplete,
    Close,
    Query,
    Error,
    StateChanged(State),
}

impl Event for TransactionEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            Self::BeginStart => EventKind::BeginStart,
            Self::BeginComplete => EventKind::BeginComplete,
            Self::CommitStart => EventKind::CommitStart,
            Self::CommitComplete => EventKind::CommitComplete,
            Self::RollbackStart => EventKind::RollbackStart,
            Self::RollbackComplete => EventKind::RollbackComplete,
            Self::Close => EventKind::Close,
            Self::Query(_) => EventKind::Query,
            Self::Error(_) => EventKind::Error,
            Self::StateChanged(state) => EventKind::StateChanged(*state),
        }
    }
}

/// The connection a transaction is currently bound to.
///
/// Dropping the binding unsubscribes from the connection and, for pooled
/// connections, releases the lease.
pub(super) struct Binding {
    pub(super) connection: Arc<dyn Connection>,
    error_listener: ListenerId,
    _lease: Option<Lease>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.connection.events().remove(self.error_listener);
    }
}

pub(super) struct Core {
    pub(super) machine: StateMachine,
    pub(super) binding: Option<Binding>,
    pub(super) queue: VecDeque<Task>,
}

impl Core {
    pub(super) fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.binding.as_ref().map(|binding| binding.connection.clone())
    }
}

pub(super) struct Inner {
    id: TransactionId,
    adapter: Arc<dyn Adapter>,
    statements: Statements,
    nesting_level: u32,
    pub(super) core: Mutex<Core>,
    events: Emitter<TransactionEvent>,
    begin_callback: Mutex<Option<BeginCallback>>,
}

/// A SQL transaction, or a savepoint inside one.
///
/// Cloning yields another handle to the same transaction. Work can be issued
/// in any state: until the begin statement has succeeded it is queued and
/// replayed in order.
#[derive(Clone)]
pub struct Transaction {
    pub(super) inner: Arc<Inner>,
}

#[derive(Clone)]
pub(super) struct WeakTransaction {
    inner: Weak<Inner>,
}

impl WeakTransaction {
    pub(super) fn upgrade(&self) -> Option<Transaction> {
        self.inner.upgrade().map(|inner| Transaction { inner })
    }
}

impl Transaction {
    pub(super) fn new(
        adapter: Arc<dyn Adapter>,
        statements: Statements,
        nesting_level: u32,
        callback: Option<BeginCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: TransactionId::next(),
                adapter,
                statements,
                nesting_level,
                core: Mutex::new(Core {
                    machine: StateMachine::new(),
                    binding: None,
                    queue: VecDeque::new(),
                }),
                events: Emitter::new(),
                begin_callback: Mutex::new(callback),
            }),
        }
    }

    /// Returns the id used to tag this transaction's log lines.
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.core.lock().machine.state()
    }

    /// 0 for a top-level transaction, n for the nth savepoint level.
    pub fn nesting_level(&self) -> u32 {
        self.inner.nesting_level
    }

    /// Returns the begin, commit and rollback statements for this level.
    pub fn statements(&self) -> &Statements {
        &self.inner.statements
    }

    /// Number of tasks waiting for the transaction to open.
    pub fn queued(&self) -> usize {
        self.inner.core.lock().queue.len()
    }

    pub(super) fn adapter(&self) -> Arc<dyn Adapter> {
        self.inner.adapter.clone()
    }

    pub(super) fn downgrade(&self) -> WeakTransaction {
        WeakTransaction {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Registers a listener for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&TransactionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, callback)
    }

    /// Registers a listener for the next event of `kind` only.
    pub fn once<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: FnOnce(&TransactionEvent) + Send + 'static,
    {
        self.inner.events.once(kind, callback)
    }

    /// Removes a listener. Returns false if it already fired or was removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove(id)
    }

    /// Returns the number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.events.listener_count(kind)
    }

    pub(super) fn emit(&self, event: &TransactionEvent) -> bool {
        self.inner.events.emit(event)
    }

    /// Reports an error to the pending begin callback, or else to `Error`
    /// listeners. An error nobody receives is logged.
    pub(super) fn emit_error(&self, err: Error) {
        let pending = self.inner.begin_callback.lock().take();
        if let Some(callback) = pending {
            callback(Err(err));
            return;
        }
        if !self.emit(&TransactionEvent::Error(err.clone())) {
            log::error!("{}: unhandled transaction error: {}", self.id(), err);
        }
    }

    pub(super) fn transition(&self, next: State) -> Result<()> {
        let from = self.inner.core.lock().machine.transition(next)?;
        log::debug!("{}: {} -> {}", self.id(), from, next);
        self.emit(&TransactionEvent::StateChanged(next));
        Ok(())
    }

    /// Binds `connection` and issues the begin statement.
    pub(super) fn set_connection(&self, connection: Arc<dyn Connection>, lease: Option<Lease>) {
        if let Err(err) = self.transition(State::Connected) {
            let tx = self.clone();
            defer(move || tx.emit_error(err));
            return;
        }

        let weak = self.downgrade();
        let error_listener = connection
            .events()
            .on(ConnectionEventKind::Error, move |event| {
                let ConnectionEvent::Error(err) = event;
                if let Some(tx) = weak.upgrade() {
                    tx.handle_error(err.clone(), false);
                }
            });
        self.inner.core.lock().binding = Some(Binding {
            connection: connection.clone(),
            error_listener,
            _lease: lease,
        });
        log::debug!("{}: bound to {}", self.id(), connection.describe());

        self.emit(&TransactionEvent::BeginStart);
        let tx = self.clone();
        let begin = self.inner.adapter.create_query(
            self.inner.statements.begin.clone(),
            Vec::new(),
            Some(Box::new(move |result| match result {
                Ok(_) => {
                    tx.complete_begin();
                    tx.run_queue();
                }
                Err(err) => tx.handle_error(err, false),
            })),
        );
        self.send(&connection, begin);
    }

    fn complete_begin(&self) {
        self.emit(&TransactionEvent::BeginComplete);
        let pending = self.inner.begin_callback.lock().take();
        if let Some(callback) = pending {
            callback(Ok(self.clone()));
        }
    }

    pub(super) fn send(&self, connection: &Arc<dyn Connection>, query: Query) {
        log::debug!("{}: {}", self.id(), query.text());
        self.emit(&TransactionEvent::Query(query.clone()));
        connection.query(query);
    }

    /// Issues a query. Failures are reported through the transaction's
    /// `Error` event.
    pub fn query(&self, text: impl Into<String>, params: Vec<Value>) -> Query {
        let query = self.inner.adapter.create_query(text.into(), params, None);
        self.dispatch(query)
    }

    /// Issues a query whose outcome goes to `callback`.
    ///
    /// A failure still rolls the transaction back, but it is reported only to
    /// the callback.
    pub fn query_with<F>(&self, text: impl Into<String>, params: Vec<Value>, callback: F) -> Query
    where
        F: FnOnce(Result<QueryResult>) + Send + 'static,
    {
        let query = self
            .inner
            .adapter
            .create_query(text.into(), params, Some(Box::new(callback)));
        self.dispatch(query)
    }

    fn dispatch(&self, query: Query) -> Query {
        let live = {
            let mut core = self.inner.core.lock();
            match core.machine.state() {
                State::Disconnected | State::Connected => {
                    core.queue.push_back(Task::Query(query.clone()));
                    log::trace!("{}: queued {:?}", self.id(), query.text());
                    return query;
                }
                State::Open => core.connection(),
                State::Closed => None,
            }
        };

        match live {
            Some(connection) => {
                let tx = self.clone();
                let skip_emit = query.reports_to_caller();
                query.once(QueryEventKind::Error, move |event| {
                    if let QueryEvent::Error(err) = event {
                        tx.handle_error(err.clone(), skip_emit);
                    }
                });
                self.send(&connection, query.clone());
            }
            None => {
                let err = Error::Closed { operation: "query" };
                self.handle_error(err.clone(), query.reports_to_caller());
                query.fail(err);
            }
        }
        query
    }

    /// Commits, or queues the commit if the transaction is not open yet.
    /// A failure is handled like any other error: reported via `Error`.
    pub fn commit(&self) -> &Self {
        self.close(CloseAction::Commit, None)
    }

    /// Commits and reports the outcome to `callback` instead of `Error`.
    ///
    /// If the commit fails, work queued behind it never runs.
    pub fn commit_with<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.close(CloseAction::Commit, Some(Box::new(callback)))
    }

    /// Rolls back, or queues the rollback if the transaction is not open yet.
    pub fn rollback(&self) -> &Self {
        self.close(CloseAction::Rollback, None)
    }

    /// Rolls back and reports the outcome to `callback` instead of `Error`.
    pub fn rollback_with<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.close(CloseAction::Rollback, Some(Box::new(callback)))
    }

    fn close(&self, action: CloseAction, callback: Option<CloseCallback>) -> &Self {
        let immediate = {
            let mut core = self.inner.core.lock();
            if core.machine.state().is_pending() {
                core.queue.push_back(Task::Close { action, callback });
                log::trace!("{}: queued {}", self.id(), action);
                None
            } else {
                Some(callback)
            }
        };
        if let Some(callback) = immediate {
            self.close_open(action, callback, None);
        }
        self
    }

    /// Sends the commit or rollback statement without consulting the queue.
    ///
    /// `previous` is the failure that caused a rollback, kept as context if the
    /// rollback itself fails.
    pub(super) fn close_open(
        &self,
        action: CloseAction,
        callback: Option<CloseCallback>,
        previous: Option<Error>,
    ) {
        if let Err(err) = self.transition(State::Closed) {
            let err = match err {
                Error::InvalidTransition {
                    from: State::Closed,
                    ..
                } => Error::Closed {
                    operation: action.as_str(),
                },
                err => err,
            };
            return self.fail_close(err, callback);
        }

        let connection = self.inner.core.lock().connection();
        let Some(connection) = connection else {
            return self.fail_close(
                Error::Closed {
                    operation: action.as_str(),
                },
                callback,
            );
        };

        self.emit(&TransactionEvent::close_start(action));
        let tx = self.clone();
        let statement = self.inner.adapter.create_query(
            self.inner.statements.close(action).to_string(),
            Vec::new(),
            Some(Box::new(move |result| {
                tx.detach();
                match result {
                    Ok(_) => {
                        tx.emit(&TransactionEvent::close_complete(action));
                        tx.emit(&TransactionEvent::Close);
                        if let Some(callback) = callback {
                            callback(Ok(()));
                        }
                        tx.reject_queued(None);
                    }
                    Err(err) => {
                        tx.fail_close(
                            Error::CloseFailed {
                                action,
                                source: Box::new(err),
                                previous: previous.map(Box::new),
                            },
                            callback,
                        );
                        // Still finished: a waiting parent must resume.
                        tx.emit(&TransactionEvent::Close);
                        tx.reject_queued(None);
                    }
                }
            })),
        );
        self.send(&connection, statement);
    }

    fn fail_close(&self, err: Error, callback: Option<CloseCallback>) {
        match callback {
            Some(callback) => callback(Err(err)),
            None => self.handle_error(err, false),
        }
    }

    fn detach(&self) {
        let binding = self.inner.core.lock().binding.take();
        if let Some(binding) = binding {
            log::debug!("{}: detached from {}", self.id(), binding.connection.describe());
        }
    }

    /// Central failure path: roll back if still possible, then report.
    ///
    /// With `skip_emit` the error has already been delivered to its owner and
    /// only the rollback happens; a failing rollback is reported regardless.
    pub(super) fn handle_error(&self, err: Error, skip_emit: bool) {
        let can_roll_back = {
            let core = self.inner.core.lock();
            !core.machine.state().is_closed() && core.binding.is_some()
        };
        if !can_roll_back {
            if !skip_emit {
                self.emit_error(err);
            }
            return;
        }

        log::debug!("{}: rolling back after error: {}", self.id(), err);
        let tx = self.clone();
        let original = err.clone();
        self.close_open(
            CloseAction::Rollback,
            Some(Box::new(move |result| match result {
                Err(rollback_err) => tx.emit_error(rollback_err),
                Ok(()) => {
                    if !skip_emit {
                        tx.emit_error(original);
                    }
                }
            })),
            Some(err),
        );
    }
}

/// Dropping the last handle of a transaction that never closed rolls it back
/// and gives the connection up.
impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        let state = core.machine.state();
        let pending: Vec<Task> = core.queue.drain(..).collect();
        let binding = core.binding.take();
        for task in pending {
            reject(self.id, task, None);
        }

        let Some(binding) = binding else {
            return;
        };
        if state.is_closed() {
            return;
        }
        log::warn!("{}: dropped while {}, rolling back", self.id, state);
        let rollback = self
            .adapter
            .create_query(self.statements.rollback.clone(), Vec::new(), None);
        self.events.emit(&TransactionEvent::Query(rollback.clone()));
        binding.connection.query(rollback);
        drop(binding);
        self.events.emit(&TransactionEvent::Close);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("nesting_level", &self.nesting_level())
            .finish()
    }
}
