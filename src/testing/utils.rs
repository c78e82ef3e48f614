use crate::cache::ClusteredCache;
use crate::config::{CacheConfig, MembershipConfig};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Install a log subscriber once; set `RUST_LOG` to see node logs.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config for a test node bound to an OS-assigned loopback port.
pub(crate) fn node_config(cluster: &str, name: &str) -> CacheConfig {
    CacheConfig::new(cluster)
        .with_node_name(name)
        .with_bind_addr("127.0.0.1:0")
        .with_statistics(true)
        .with_initial_cluster_timeout(Duration::from_secs(5))
        .with_membership_config(
            MembershipConfig::default()
                .with_heartbeat_interval(Duration::from_millis(200))
                .with_max_missed_heartbeats(3),
        )
}

/// Config for a node joining through `seed`.
pub(crate) fn joining_config(cluster: &str, name: &str, seed: &ClusteredCache<String>) -> CacheConfig {
    node_config(cluster, name).with_seed_nodes([seed.address().addr.to_string()])
}

/// Start `size` nodes one after another, all seeded with the first.
pub(crate) async fn start_cluster(
    cluster: &str,
    size: usize,
    configure: impl Fn(CacheConfig) -> CacheConfig,
) -> Vec<ClusteredCache<String>> {
    init_tracing();
    let first = ClusteredCache::start(configure(node_config(cluster, "node-0")))
        .await
        .unwrap();
    let mut nodes = vec![first];
    for i in 1..size {
        let config = configure(joining_config(cluster, &format!("node-{}", i), &nodes[0]));
        nodes.push(ClusteredCache::start(config).await.unwrap());
    }
    assert!(
        wait_for(
            || nodes.iter().all(|n| n.view().len() == size),
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await,
        "cluster of {} did not form",
        size
    );
    nodes
}

/// Wait until no node is transferring segments.
pub(crate) async fn wait_for_rebalance(nodes: &[ClusteredCache<String>], timeout: Duration) -> bool {
    wait_for(
        || nodes.iter().all(|n| !n.rebalance_in_progress()),
        timeout,
        Duration::from_millis(20),
    )
    .await
}

pub(crate) async fn shutdown_all(nodes: &[ClusteredCache<String>]) {
    for node in nodes.iter().rev() {
        node.shutdown().await;
    }
}

/// Wait for a condition with timeout
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(check_interval).await;
    }
    condition()
}

/// Retry `action` until its result satisfies `predicate`.
pub(crate) async fn wait_for_result<F, Fut, T, P>(mut action: F, predicate: P, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(50);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        sleep(interval).await;
    }
    None
}
