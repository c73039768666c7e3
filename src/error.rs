//! Error types shared by transactions, queries and connections.

use std::sync::Arc;

use thiserror::Error;

use crate::transaction::{CloseAction, State};

/// Errors surfaced by a transaction, either through a callback or through its
/// `Error` event.
///
/// The type is `Clone` because one failure may be delivered to a query's
/// callback, the owning transaction and a parent transaction.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("{0} is not a queryable")]
    NotQueryable(String),

    #[error("{0:#}")]
    Driver(Arc<anyhow::Error>),

    #[error("failed to acquire connection: {0:#}")]
    Acquire(Arc<anyhow::Error>),

    #[error("Cannot start child transaction on parent in state 'closed'")]
    ChildOnClosedParent,

    #[error("{action} failed: {source}{}", previous_display(.previous))]
    CloseFailed {
        action: CloseAction,
        #[source]
        source: Box<Error>,
        /// The failure that triggered the rollback, if any.
        previous: Option<Box<Error>>,
    },

    #[error("cannot {operation} on a closed transaction")]
    Closed { operation: &'static str },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("query was dropped before it completed")]
    Abandoned,
}

fn previous_display(previous: &Option<Box<Error>>) -> String {
    match previous {
        Some(err) => format!("\nError causing rollback: {}", err),
        None => String::new(),
    }
}

impl Error {
    /// Wraps a driver-level failure.
    pub fn driver(err: impl Into<anyhow::Error>) -> Self {
        Self::Driver(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Driver(Arc::new(err))
    }
}

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, Error>;
