//! Cluster views, membership protocol and cache events.

pub mod events;
pub mod membership;
pub mod view;

pub use events::{CacheEvent, CacheListener, ListenerId, Listeners, LoggingListener};
pub use membership::{ViewManager, ViewSubscriber};
pub use view::{ClusterView, ViewChange};
