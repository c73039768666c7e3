//! Shared connection doubles for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqltx::{
    Adapter, Connection, ConnectionEvent, DefaultAdapter, Emitter, Error, EventKind, Pool, Query,
    QueryResult, Transaction, TransactionEvent, Value,
};
use tokio::sync::{mpsc, oneshot};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fails the test instead of hanging when a signal never arrives.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out waiting for transaction")
}

/// Gives spawned completions a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// In-memory connection that executes queries in submission order on a
/// worker task, recording each statement and failing the scripted ones.
pub struct ScriptedConnection {
    sender: mpsc::UnboundedSender<Query>,
    executed: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    events: Emitter<ConnectionEvent>,
}

impl ScriptedConnection {
    pub fn new() -> Arc<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Query>();
        let executed = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(Mutex::new(HashSet::new()));

        let log = executed.clone();
        let script = failing.clone();
        tokio::spawn(async move {
            while let Some(query) = receiver.recv().await {
                tokio::task::yield_now().await;
                let text = query.text().to_string();
                log.lock().push(text.clone());
                if script.lock().contains(&text) {
                    query.fail(anyhow::anyhow!("scripted failure: {}", text));
                } else {
                    query.complete(QueryResult::affected(1));
                }
            }
        });

        Arc::new(Self {
            sender,
            executed,
            failing,
            events: Emitter::new(),
        })
    }

    /// Every statement with exactly this text fails from now on.
    pub fn fail_on(&self, text: &str) {
        self.failing.lock().insert(text.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn count(&self, text: &str) -> usize {
        self.executed.lock().iter().filter(|t| *t == text).count()
    }

    /// Simulates the connection itself failing.
    pub fn break_with(&self, message: &str) {
        self.events
            .emit(&ConnectionEvent::Error(Error::driver(anyhow::anyhow!(message.to_string()))));
    }

    pub fn listeners(&self) -> usize {
        self.events.listener_count(sqltx::ConnectionEventKind::Error)
    }
}

impl Connection for ScriptedConnection {
    fn adapter(&self) -> Option<Arc<dyn Adapter>> {
        Some(Arc::new(DefaultAdapter))
    }

    fn query(&self, query: Query) {
        if self.sender.send(query.clone()).is_err() {
            query.fail(anyhow::anyhow!("connection worker stopped"));
        }
    }

    fn events(&self) -> &Emitter<ConnectionEvent> {
        &self.events
    }

    fn describe(&self) -> String {
        "scripted connection".to_string()
    }
}

/// Connection backed by a real SQLite database.
pub struct SqliteConnection {
    sender: mpsc::UnboundedSender<Query>,
    events: Emitter<ConnectionEvent>,
}

impl SqliteConnection {
    pub fn memory() -> Arc<Self> {
        Self::spawn(rusqlite::Connection::open_in_memory().expect("open sqlite"))
    }

    pub fn open(path: &Path) -> Arc<Self> {
        Self::spawn(rusqlite::Connection::open(path).expect("open sqlite"))
    }

    fn spawn(conn: rusqlite::Connection) -> Arc<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Query>();
        tokio::spawn(async move {
            while let Some(query) = receiver.recv().await {
                match execute(&conn, &query) {
                    Ok(result) => query.complete(result),
                    Err(err) => query.fail(anyhow::Error::from(err)),
                }
            }
        });
        Arc::new(Self {
            sender,
            events: Emitter::new(),
        })
    }

    /// Runs a statement outside of any transaction and waits for it.
    pub async fn run(&self, text: &str) -> sqltx::Result<QueryResult> {
        let query = Query::new(text, Vec::new(), None);
        self.query(query.clone());
        query.result().await
    }
}

impl Connection for SqliteConnection {
    fn adapter(&self) -> Option<Arc<dyn Adapter>> {
        Some(Arc::new(DefaultAdapter))
    }

    fn query(&self, query: Query) {
        if self.sender.send(query.clone()).is_err() {
            query.fail(anyhow::anyhow!("sqlite worker stopped"));
        }
    }

    fn events(&self) -> &Emitter<ConnectionEvent> {
        &self.events
    }

    fn describe(&self) -> String {
        "sqlite connection".to_string()
    }
}

fn execute(conn: &rusqlite::Connection, query: &Query) -> rusqlite::Result<QueryResult> {
    let mut stmt = conn.prepare(query.text())?;
    let params = rusqlite::params_from_iter(query.params().iter().map(to_sql));

    if stmt.column_count() == 0 {
        let changed = stmt.execute(params)?;
        return Ok(QueryResult::affected(changed as u64));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(from_sql(row.get_ref(i)?));
        }
        out.push(values);
    }
    Ok(QueryResult {
        columns,
        rows: out,
        rows_affected: 0,
    })
}

fn to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Integer(v) => Sql::Integer(*v),
        Value::Real(v) => Sql::Real(*v),
        Value::Text(v) => Sql::Text(v.clone()),
        Value::Blob(v) => Sql::Blob(v.clone()),
    }
}

fn from_sql(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}

/// Pool of SQLite connections to one database file.
pub struct SqlitePool {
    path: PathBuf,
    idle: Mutex<Vec<Arc<dyn Connection>>>,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub observed: Mutex<Vec<String>>,
    exhausted: AtomicBool,
}

impl SqlitePool {
    pub fn new(path: &Path) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_path_buf(),
            idle: Mutex::new(Vec::new()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            observed: Mutex::new(Vec::new()),
            exhausted: AtomicBool::new(false),
        })
    }

    /// Makes every later acquisition fail.
    pub fn exhaust(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Pool for SqlitePool {
    fn adapter(&self) -> Option<Arc<dyn Adapter>> {
        Some(Arc::new(DefaultAdapter))
    }

    fn acquire(&self, callback: sqltx::AcquireCallback) {
        if self.exhausted.load(Ordering::SeqCst) {
            tokio::spawn(async move { callback(Err(anyhow::anyhow!("pool exhausted"))) });
            return;
        }
        let pooled = self.idle.lock().pop();
        let connection =
            pooled.unwrap_or_else(|| SqliteConnection::open(&self.path) as Arc<dyn Connection>);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move { callback(Ok(connection)) });
    }

    fn release(&self, connection: Arc<dyn Connection>) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.idle.lock().push(connection);
    }

    fn on_query(&self, query: &Query) {
        self.observed.lock().push(query.text().to_string());
    }
}

/// Collects the names of lifecycle events in emission order.
pub fn record_events(tx: &Transaction) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::BeginStart,
        EventKind::BeginComplete,
        EventKind::CommitStart,
        EventKind::CommitComplete,
        EventKind::RollbackStart,
        EventKind::RollbackComplete,
        EventKind::Close,
    ] {
        let seen = seen.clone();
        tx.on(kind, move |event| seen.lock().push(format!("{:?}", event)));
    }
    seen
}

/// Streams every `Error` event of `tx`.
pub fn errors(tx: &Transaction) -> mpsc::UnboundedReceiver<Error> {
    let (sender, receiver) = mpsc::unbounded_channel();
    tx.on(EventKind::Error, move |event| {
        if let TransactionEvent::Error(err) = event {
            let _ = sender.send(err.clone());
        }
    });
    receiver
}

/// Resolves when `tx` emits `Close`.
pub fn closed(tx: &Transaction) -> oneshot::Receiver<()> {
    let (sender, receiver) = oneshot::channel();
    tx.once(EventKind::Close, move |_| {
        let _ = sender.send(());
    });
    receiver
}

/// Converts a one-shot callback result into a receiver.
pub fn channel<T: Send + 'static>() -> (impl FnOnce(T) + Send + 'static, oneshot::Receiver<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        move |value: T| {
            let _ = sender.send(value);
        },
        receiver,
    )
}

pub fn integers(result: &QueryResult) -> Vec<i64> {
    result
        .rows
        .iter()
        .filter_map(|row| match row.first() {
            Some(Value::Integer(v)) => Some(*v),
            _ => None,
        })
        .collect()
}
