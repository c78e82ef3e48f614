//! Clustered read-through cache with synchronous segment replication.
//!
//! This crate provides an embedded cache whose nodes form a cluster over TCP:
//! - **Segments** spread keys over members, each segment owned by `num_owners` nodes
//! - **Synchronous replication** to every owner on put and remove
//! - **Read-through loading** with one loader invocation per key and node
//! - **State transfer** moving segments to their new owners on view changes
//!
//! # Features
//!
//! - Any node can serve any key; reads go remote only for keys it does not own
//! - Per-entry lifespan with lazy expiry and a background reaper
//! - Coordinator-driven membership with heartbeat failure detection
//! - Degraded writes keep working when fewer owners than configured are alive
//! - Hit/miss statistics and Prometheus text export
//!
//! # Example
//!
//! ```rust,no_run
//! use cortado::{CacheConfig, ClusteredCache};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::new("weather")
//!         .with_bind_addr("127.0.0.1:7801")
//!         .with_seed_nodes(["127.0.0.1:7800"])
//!         .with_num_owners(2)
//!         .with_statistics(true);
//!
//!     let cache: ClusteredCache<f32> = ClusteredCache::start(config).await?;
//!
//!     cache.put("Madrid", &18.5).await?;
//!     if let Some(temperature) = cache.get("Madrid").await? {
//!         println!("Madrid: {}", temperature);
//!     }
//!     cache.remove("Madrid").await?;
//!
//!     println!("hit ratio {}", cache.stats().hit_ratio);
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Application Layer                 │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          ClusteredCache API                 │
//! │  • get(key) -> Option<V>                    │
//! │  • put(key, value) -> Result<()>            │
//! │  • compute_if_absent(key, loader)           │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌────────────┐   ┌─────────┐
//! │ Cluster │   │Partitioning│   │  Entry  │
//! │  Views  │   │ (segments) │   │  Store  │
//! └─────────┘   └────────────┘   └─────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: acknowledged by every reachable owner before returning
//! - **Reads**: served by the first reachable owner; last writer wins
//! - **View changes**: reads prefer previous holders until transfer completes

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod partitioning;
#[cfg(test)]
mod testing;
pub mod types;

// Re-export main types for convenience
pub use cache::{ClusteredCache, WeakCache};
pub use config::{
    CacheConfig, ExpirationConfig, LoaderConfig, MembershipConfig, StateTransferConfig,
    TransportConfig,
};
pub use error::{Error, NetworkError, Result};
pub use types::{CacheMode, NodeAddress, NodeId};

// Re-export cluster types
pub use cluster::{CacheEvent, CacheListener, ClusterView, ListenerId, LoggingListener};

// Re-export partitioning types
pub use partitioning::SegmentId;

// Re-export metrics types
pub use metrics::{DegradedReplication, StatsSnapshot};
