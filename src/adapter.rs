//! Query construction.

use crate::query::{Query, QueryCallback, Value};

/// Builds the query objects a transaction issues.
///
/// Drivers implement this when they need to attach driver-specific state to
/// a query; everyone else can use [`DefaultAdapter`].
pub trait Adapter: Send + Sync + 'static {
    fn create_query(
        &self,
        text: String,
        params: Vec<Value>,
        callback: Option<QueryCallback>,
    ) -> Query;
}

/// Adapter that builds plain [`Query`] objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAdapter;

impl Adapter for DefaultAdapter {
    fn create_query(
        &self,
        text: String,
        params: Vec<Value>,
        callback: Option<QueryCallback>,
    ) -> Query {
        Query::new(text, params, callback)
    }
}
