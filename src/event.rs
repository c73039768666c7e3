//! Listener registry used by transactions, queries and connections.
//!
//! Listeners are registered per event kind and invoked in registration order.
//! A `once` listener is removed before it runs, so it observes at most one
//! event even when an emission re-enters the emitter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// An event that can be dispatched by an [`Emitter`].
pub trait Event: fmt::Debug {
    /// Discriminant listeners subscribe to.
    type Kind: Copy + Eq + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`Emitter::on`] and [`Emitter::once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<E: Event> {
    id: ListenerId,
    kind: E::Kind,
    once: bool,
    callback: Callback<E>,
}

/// Ordered listener lists keyed by event kind.
pub struct Emitter<E: Event> {
    listeners: Mutex<Vec<Listener<E>>>,
    next_id: AtomicU64,
}

impl<E: Event> Emitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a listener invoked for every event of `kind`.
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(callback))
    }

    /// Registers a listener invoked for the next event of `kind` only.
    pub fn once<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: FnOnce(&E) + Send + 'static,
    {
        let slot = Mutex::new(Some(callback));
        self.register(
            kind,
            true,
            Arc::new(move |event: &E| {
                if let Some(callback) = slot.lock().take() {
                    callback(event);
                }
            }),
        )
    }

    fn register(&self, kind: E::Kind, once: bool, callback: Callback<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Listener {
            id,
            kind,
            once,
            callback,
        });
        id
    }

    /// Removes a listener. Returns false if it already fired or was removed.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    /// Number of listeners currently registered for `kind`.
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|listener| listener.kind == kind)
            .count()
    }

    /// Dispatches `event` to the listeners registered for its kind.
    ///
    /// Returns false when nobody was listening.
    pub fn emit(&self, event: &E) -> bool {
        let kind = event.kind();
        let callbacks: Vec<Callback<E>> = {
            let mut listeners = self.listeners.lock();
            let callbacks = listeners
                .iter()
                .filter(|listener| listener.kind == kind)
                .map(|listener| listener.callback.clone())
                .collect();
            listeners.retain(|listener| !(listener.once && listener.kind == kind));
            callbacks
        };

        for callback in &callbacks {
            callback(event);
        }
        !callbacks.is_empty()
    }
}

impl<E: Event> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Runs `f` on a later scheduler tick.
///
/// Inside a Tokio runtime the work is spawned onto it; elsewhere a short-lived
/// thread is used so the caller never observes `f` running inline.
pub(crate) fn defer<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { f() });
        }
        Err(_) => {
            std::thread::spawn(f);
        }
    }
}
