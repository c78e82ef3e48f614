//! Configuration types for the clustered cache.

use crate::error::{Error, Result};
use crate::types::CacheMode;
use std::time::Duration;

/// Smallest accepted frame size; state transfer chunks need headroom.
pub const MIN_FRAME_SIZE: usize = 1024;

/// Main configuration for a clustered cache node.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Peers with matching names form a cluster.
    pub cluster_name: String,

    /// Human readable node name. A name is derived from the node id when unset.
    pub node_name: Option<String>,

    /// Address to bind the transport to, as `host:port`.
    pub bind_addr: String,

    /// Prefer IPv4 addresses when resolving the bind address and seeds.
    pub prefer_ipv4: bool,

    /// Seed nodes contacted when joining, as `host:port`.
    pub seed_nodes: Vec<String>,

    /// Minimum view size before the cache serves operations.
    pub initial_cluster_size: usize,

    /// How long to wait for the initial view to form.
    pub initial_cluster_timeout: Duration,

    /// Default entry lifespan.
    pub lifespan: Duration,

    /// Replication mode.
    pub cache_mode: CacheMode,

    /// Number of owners per segment.
    pub num_owners: usize,

    /// Number of hash segments.
    pub num_segments: u32,

    /// Whether statistics counters are maintained.
    pub statistics_enabled: bool,

    /// Expiration reaper configuration.
    pub expiration: ExpirationConfig,

    /// Value loader configuration.
    pub loader: LoaderConfig,

    /// State transfer configuration.
    pub state_transfer: StateTransferConfig,

    /// Transport configuration.
    pub transport: TransportConfig,

    /// View membership configuration.
    pub membership: MembershipConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cluster_name: "cortado".to_string(),
            node_name: None,
            bind_addr: "0.0.0.0:7800".to_string(),
            prefer_ipv4: true,
            seed_nodes: Vec::new(),
            initial_cluster_size: 1,
            initial_cluster_timeout: Duration::from_secs(15),
            lifespan: Duration::from_secs(15 * 60), // 15 minutes
            cache_mode: CacheMode::DistSync,
            num_owners: 2,
            num_segments: 128,
            statistics_enabled: false,
            expiration: ExpirationConfig::default(),
            loader: LoaderConfig::default(),
            state_transfer: StateTransferConfig::default(),
            transport: TransportConfig::default(),
            membership: MembershipConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration for the named cluster.
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Default::default()
        }
    }

    /// Set the node name.
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    /// Set the bind address.
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Prefer IPv4 when resolving addresses.
    pub fn with_prefer_ipv4(mut self, prefer: bool) -> Self {
        self.prefer_ipv4 = prefer;
        self
    }

    /// Set seed nodes for joining.
    pub fn with_seed_nodes<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seed_nodes = seeds.into_iter().map(Into::into).collect();
        self
    }

    /// Set the initial cluster size.
    pub fn with_initial_cluster_size(mut self, size: usize) -> Self {
        self.initial_cluster_size = size;
        self
    }

    /// Set the initial cluster timeout.
    pub fn with_initial_cluster_timeout(mut self, timeout: Duration) -> Self {
        self.initial_cluster_timeout = timeout;
        self
    }

    /// Set the default entry lifespan.
    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = lifespan;
        self
    }

    /// Set the number of owners per segment.
    pub fn with_num_owners(mut self, owners: usize) -> Self {
        self.num_owners = owners;
        self
    }

    /// Set the number of hash segments.
    pub fn with_num_segments(mut self, segments: u32) -> Self {
        self.num_segments = segments;
        self
    }

    /// Enable or disable statistics.
    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    /// Set expiration configuration.
    pub fn with_expiration_config(mut self, expiration: ExpirationConfig) -> Self {
        self.expiration = expiration;
        self
    }

    /// Set loader configuration.
    pub fn with_loader_config(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Set state transfer configuration.
    pub fn with_state_transfer_config(mut self, state_transfer: StateTransferConfig) -> Self {
        self.state_transfer = state_transfer;
        self
    }

    /// Set transport configuration.
    pub fn with_transport_config(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Set membership configuration.
    pub fn with_membership_config(mut self, membership: MembershipConfig) -> Self {
        self.membership = membership;
        self
    }

    /// Check the configuration for values the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(Error::Config("cluster_name must not be empty".into()));
        }
        if self.num_owners == 0 {
            return Err(Error::Config("num_owners must be at least 1".into()));
        }
        if self.num_segments == 0 {
            return Err(Error::Config("num_segments must be at least 1".into()));
        }
        if self.initial_cluster_size == 0 {
            return Err(Error::Config("initial_cluster_size must be at least 1".into()));
        }
        if self.lifespan.is_zero() {
            return Err(Error::Config("lifespan must be positive".into()));
        }
        if self.state_transfer.chunk_size == 0 {
            return Err(Error::Config("state transfer chunk_size must be at least 1".into()));
        }
        if self.expiration.batch_size == 0 {
            return Err(Error::Config("reaper batch_size must be at least 1".into()));
        }
        if self.transport.inbound_queue_depth == 0 {
            return Err(Error::Config("inbound_queue_depth must be at least 1".into()));
        }
        if self.transport.max_frame_size < MIN_FRAME_SIZE {
            return Err(Error::Config(format!(
                "max_frame_size must be at least {} bytes",
                MIN_FRAME_SIZE
            )));
        }
        if self.membership.max_missed_heartbeats == 0 {
            return Err(Error::Config("max_missed_heartbeats must be at least 1".into()));
        }
        if !self.num_segments.is_power_of_two() {
            tracing::warn!(
                num_segments = self.num_segments,
                "num_segments is not a power of two"
            );
        }
        Ok(())
    }
}

/// Expiration reaper configuration.
#[derive(Debug, Clone)]
pub struct ExpirationConfig {
    /// Upper bound on the reaper period. The effective period is
    /// `min(reaper_interval, lifespan / 10)`.
    pub reaper_interval: Duration,

    /// Keys evicted between yields.
    pub batch_size: usize,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(60),
            batch_size: 256,
        }
    }
}

impl ExpirationConfig {
    /// Set the reaper interval.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Set the reaper batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Value loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Deadline for a single loader invocation.
    pub loader_timeout: Duration,

    /// How long a caller joining an in-flight load waits for it.
    pub loader_wait_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            loader_timeout: Duration::from_secs(30),
            loader_wait_timeout: Duration::from_secs(30),
        }
    }
}

impl LoaderConfig {
    /// Set the loader deadline.
    pub fn with_loader_timeout(mut self, timeout: Duration) -> Self {
        self.loader_timeout = timeout;
        self
    }

    /// Set the joiner wait deadline.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.loader_wait_timeout = timeout;
        self
    }
}

/// State transfer configuration.
#[derive(Debug, Clone)]
pub struct StateTransferConfig {
    /// Entries per `STATE_TRANSFER_CHUNK` frame.
    pub chunk_size: usize,

    /// Deadline for pulling all newly owned segments after a view change.
    pub timeout: Duration,

    /// Attempts at delivering a transfer completion notice to each member.
    pub completion_retries: usize,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            timeout: Duration::from_secs(240),
            completion_retries: 3,
        }
    }
}

impl StateTransferConfig {
    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the transfer deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for control RPCs (join, view, leave, transfer completion).
    pub control_timeout: Duration,

    /// Timeout for data RPCs (remote get, replicate, invalidate, transfer chunks).
    pub data_timeout: Duration,

    /// Timeout for establishing a connection to a peer.
    pub connect_timeout: Duration,

    /// Bounded depth of each per-connection inbound queue.
    pub inbound_queue_depth: usize,

    /// Maximum frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            control_timeout: Duration::from_secs(15),
            data_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(2),
            inbound_queue_depth: 1024,
            max_frame_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl TransportConfig {
    /// Set the control timeout.
    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    /// Set the data timeout.
    pub fn with_data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    /// Set the inbound queue depth.
    pub fn with_inbound_queue_depth(mut self, depth: usize) -> Self {
        self.inbound_queue_depth = depth;
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }
}

/// View membership configuration.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Interval between coordinator heartbeats.
    pub heartbeat_interval: Duration,

    /// Consecutive missed heartbeats before a member is excluded.
    pub max_missed_heartbeats: u32,

    /// Pause between join attempts while the view is undersized.
    pub join_retry_interval: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            max_missed_heartbeats: 3,
            join_retry_interval: Duration::from_millis(500),
        }
    }
}

impl MembershipConfig {
    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the missed heartbeat threshold.
    pub fn with_max_missed_heartbeats(mut self, missed: u32) -> Self {
        self.max_missed_heartbeats = missed;
        self
    }

    /// Set the join retry interval.
    pub fn with_join_retry_interval(mut self, interval: Duration) -> Self {
        self.join_retry_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.initial_cluster_size, 1);
        assert_eq!(config.initial_cluster_timeout, Duration::from_secs(15));
        assert_eq!(config.lifespan, Duration::from_secs(900));
        assert_eq!(config.num_owners, 2);
        assert_eq!(config.num_segments, 128);
        assert_eq!(config.cache_mode, CacheMode::DistSync);
        assert!(!config.statistics_enabled);
        assert_eq!(config.transport.control_timeout, Duration::from_secs(15));
        assert_eq!(config.transport.data_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new("WeatherApp")
            .with_node_name("node-a")
            .with_bind_addr("127.0.0.1:0")
            .with_seed_nodes(["127.0.0.1:7801", "127.0.0.1:7802"])
            .with_initial_cluster_size(2)
            .with_lifespan(Duration::from_secs(5))
            .with_num_owners(3)
            .with_num_segments(8)
            .with_statistics(true);

        assert_eq!(config.cluster_name, "WeatherApp");
        assert_eq!(config.node_name.as_deref(), Some("node-a"));
        assert_eq!(config.seed_nodes.len(), 2);
        assert_eq!(config.initial_cluster_size, 2);
        assert_eq!(config.num_owners, 3);
        assert_eq!(config.num_segments, 8);
        assert!(config.statistics_enabled);
    }

    #[test]
    fn test_validate_rejects_invalid_values() {
        assert!(CacheConfig::default().with_num_owners(0).validate().is_err());
        assert!(CacheConfig::default().with_num_segments(0).validate().is_err());
        assert!(CacheConfig::default()
            .with_initial_cluster_size(0)
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_lifespan(Duration::ZERO)
            .validate()
            .is_err());
        assert!(CacheConfig::new("").validate().is_err());
        assert!(CacheConfig::default()
            .with_transport_config(TransportConfig::default().with_max_frame_size(512))
            .validate()
            .is_err());
        // Not a power of two only warns.
        assert!(CacheConfig::default().with_num_segments(100).validate().is_ok());
    }
}
