//! Cache lifecycle events and listener registration.

use crate::cluster::view::ClusterView;
use crate::types::NodeAddress;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Events emitted by a cache node.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// The node joined its cluster and is serving requests.
    CacheStarted {
        /// The local node.
        node: NodeAddress,
        /// View at startup.
        view: ClusterView,
    },

    /// A new view was installed.
    ViewChanged {
        /// The replaced view.
        previous: ClusterView,
        /// The installed view.
        view: ClusterView,
        /// Whether the local node coordinates the new view.
        is_coordinator: bool,
        /// The local node.
        local: NodeAddress,
    },

    /// An entry was found expired and removed.
    EntryExpired {
        /// Key of the expired entry.
        key: String,
    },
}

impl CacheEvent {
    /// Short name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            CacheEvent::CacheStarted { .. } => "CacheStarted",
            CacheEvent::ViewChanged { .. } => "ViewChanged",
            CacheEvent::EntryExpired { .. } => "EntryExpired",
        }
    }
}

/// Receives cache events.
///
/// Listeners run inline on the task that produced the event and must not
/// block. A listener that needs the cache should hold a
/// [`WeakCache`](crate::cache::WeakCache).
pub trait CacheListener: Send + Sync + 'static {
    /// Called for every event.
    fn on_event(&self, event: &CacheEvent);
}

impl<F> CacheListener for F
where
    F: Fn(&CacheEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &CacheEvent) {
        self(event)
    }
}

/// Listener that logs events.
pub struct LoggingListener;

impl CacheListener for LoggingListener {
    fn on_event(&self, event: &CacheEvent) {
        match event {
            CacheEvent::CacheStarted { node, view } => {
                tracing::info!(node = %node, view = %view, "Cache started");
            }
            CacheEvent::ViewChanged {
                previous,
                view,
                is_coordinator,
                ..
            } => {
                tracing::info!(
                    previous = %previous,
                    view = %view,
                    is_coordinator,
                    "View changed"
                );
            }
            CacheEvent::EntryExpired { key } => {
                tracing::debug!(key = %key, "Entry expired");
            }
        }
    }
}

/// Handle returned by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registered listeners.
#[derive(Default)]
pub struct Listeners {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn CacheListener>)>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every listener, outside the registry lock.
    pub fn emit(&self, event: &CacheEvent) {
        let listeners: Vec<Arc<dyn CacheListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.on_event(event);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}
