//! Work queued before a transaction opens, and the drain that replays it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::Error;
use crate::event::defer;
use crate::query::{Query, QueryEvent, QueryEventKind};

use super::handle::{CloseCallback, EventKind, Transaction, TransactionEvent};
use super::id::TransactionId;
use super::state::State;
use super::statements::CloseAction;

/// A unit of deferred work.
pub(crate) enum Task {
    Query(Query),
    /// A child transaction waiting for this one to open.
    Child(Transaction),
    /// A commit or rollback requested before the transaction opened.
    Close {
        action: CloseAction,
        callback: Option<CloseCallback>,
    },
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Query(query) => write!(f, "Query({:?})", query.text()),
            Task::Child(child) => write!(f, "Child({})", child.id()),
            Task::Close { action, .. } => write!(f, "Close({})", action),
        }
    }
}

enum Step {
    Run(Task, Arc<dyn Connection>),
    Reject(Task),
    Opened,
    Failed(Error),
    Idle,
}

/// Advances the queue exactly once, whichever completion signal arrives first.
#[derive(Clone)]
struct Continuation {
    tx: Transaction,
    fired: Arc<AtomicBool>,
}

impl Continuation {
    fn new(tx: Transaction) -> Self {
        Self {
            tx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    fn resume(&self, failure: Option<(Error, bool)>) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.tx.advance(failure);
        }
    }
}

impl Transaction {
    /// Drains the queue in order. Called once the begin statement succeeds
    /// and again whenever a child transaction closes.
    pub(super) fn run_queue(&self) {
        self.advance(None);
    }

    /// Runs the next task. `failure` is the error that finished the previous
    /// one, paired with its `skip_emit` flag.
    fn advance(&self, failure: Option<(Error, bool)>) {
        if let Some((err, skip_emit)) = failure {
            self.handle_error(err, skip_emit);
        }

        loop {
            let step = {
                let mut core = self.inner.core.lock();
                let state = core.machine.state();
                match core.queue.pop_front() {
                    Some(task) => match core.connection() {
                        Some(connection) if !state.is_closed() => Step::Run(task, connection),
                        _ => Step::Reject(task),
                    },
                    None if state == State::Connected || state == State::Disconnected => {
                        match core.machine.transition(State::Open) {
                            Ok(_) => Step::Opened,
                            Err(err) => Step::Failed(err),
                        }
                    }
                    None => Step::Idle,
                }
            };

            match step {
                Step::Run(task, connection) => {
                    log::trace!("{}: running {:?}", self.id(), task);
                    match task {
                        Task::Query(query) => self.run_queued_query(&connection, query),
                        Task::Child(child) => self.run_child(&connection, child),
                        Task::Close { action, callback } => self.run_close(action, callback),
                    }
                    return;
                }
                Step::Reject(task) => reject(self.id(), task, None),
                Step::Opened => {
                    log::debug!("{}: {} -> {}", self.id(), State::Connected, State::Open);
                    self.emit(&TransactionEvent::StateChanged(State::Open));
                    return;
                }
                Step::Failed(err) => {
                    self.handle_error(err, false);
                    return;
                }
                Step::Idle => return,
            }
        }
    }

    fn run_queued_query(&self, connection: &Arc<dyn Connection>, query: Query) {
        let next = Continuation::new(self.clone());
        let skip_emit = query.reports_to_caller();

        let on_error = next.clone();
        query.once(QueryEventKind::Error, move |event| {
            if let QueryEvent::Error(err) = event {
                on_error.resume(Some((err.clone(), skip_emit)));
            }
        });
        query.once(QueryEventKind::Close, move |_| {
            defer(move || next.resume(None));
        });
        self.send(connection, query);
    }

    fn run_close(&self, action: CloseAction, callback: Option<CloseCallback>) {
        let tx = self.clone();
        let callback: CloseCallback = match callback {
            Some(user) => Box::new(move |result| match result {
                Ok(()) => {
                    user(Ok(()));
                    tx.advance(None);
                }
                Err(err) => user(Err(err)),
            }),
            None => Box::new(move |result| tx.advance(result.err().map(|err| (err, false)))),
        };
        self.close_open(action, Some(callback), None);
    }

    /// Starts `child` on this transaction's connection.
    ///
    /// While the child holds the connection this transaction's own queue
    /// waits; it resumes when the child emits `Close`.
    pub(super) fn run_child(&self, connection: &Arc<dyn Connection>, child: Transaction) {
        let parent = self.clone();
        let weak_child = child.downgrade();
        child.on(EventKind::Error, move |event| {
            let TransactionEvent::Error(err) = event else {
                return;
            };
            let Some(child) = weak_child.upgrade() else {
                return;
            };
            // The child already rolled back to its savepoint; only relay.
            if child.listener_count(EventKind::Error) == 1 {
                parent.emit_error(err.clone());
            }
        });
        child.set_connection(connection.clone(), None);
    }

    /// Rejects everything still queued.
    ///
    /// With no `cause` the tasks are rejected because this transaction closed.
    pub(super) fn reject_queued(&self, cause: Option<&Error>) {
        let tasks: Vec<Task> = self.inner.core.lock().queue.drain(..).collect();
        for task in tasks {
            reject(self.id(), task, cause);
        }
    }

    /// Starts a child now, queues it, or fails it, depending on this
    /// transaction's state.
    pub(super) fn start_child(&self, child: &Transaction) {
        enum Start {
            Queued,
            Now(Arc<dyn Connection>),
            Refused,
        }

        let start = {
            let mut core = self.inner.core.lock();
            match core.machine.state() {
                State::Disconnected | State::Connected => {
                    core.queue.push_back(Task::Child(child.clone()));
                    Start::Queued
                }
                State::Open => core.connection().map_or(Start::Refused, Start::Now),
                State::Closed => Start::Refused,
            }
        };

        match start {
            Start::Queued => log::trace!("{}: queued child {}", self.id(), child.id()),
            Start::Now(connection) => self.run_child(&connection, child.clone()),
            Start::Refused => refuse(child.clone(), Error::ChildOnClosedParent),
        }
    }
}

/// Disposes of a task that can no longer run.
pub(super) fn reject(id: TransactionId, task: Task, cause: Option<&Error>) {
    log::trace!("{}: rejecting {:?}", id, task);
    match task {
        Task::Query(query) => {
            let err = cause
                .cloned()
                .unwrap_or(Error::Closed { operation: "query" });
            query.fail(err);
        }
        Task::Close { action, callback } => {
            let err = cause.cloned().unwrap_or(Error::Closed {
                operation: action.as_str(),
            });
            match callback {
                Some(callback) => callback(Err(err)),
                None => log::debug!("{}: dropped queued {}: {}", id, action, err),
            }
        }
        Task::Child(child) => refuse(child, cause.cloned().unwrap_or(Error::ChildOnClosedParent)),
    }
}

/// Fails a child that can never start, along with anything queued on it.
/// Always reported on a later tick.
fn refuse(child: Transaction, err: Error) {
    defer(move || {
        child.reject_queued(Some(&err));
        child.emit_error(err);
    });
}
