//! Clustered read-through cache.
//!
//! Every node of a cluster runs a [`ClusteredCache`]. Keys hash to segments,
//! each segment is owned by `num_owners` nodes, and any node can serve any
//! key: reads go to the local store when the node owns the key, otherwise to
//! the owners in order. Writes are synchronous to every reachable owner.
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
//!         .with_bind_addr("127.0.0.1:7800")
//!         .with_lifespan(Duration::from_secs(5 * 60))
//!         .with_statistics(true);
//!
//!     let cache: ClusteredCache<String> = ClusteredCache::start(config).await?;
//!
//!     let forecast = cache
//!         .compute_if_absent("Madrid", |city| async move {
//!             Ok::<_, std::io::Error>(format!("{}: 18.5C, 40% humidity", city))
//!         })
//!         .await?;
//!     println!("{}", forecast);
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  ClusteredCache<V>                    │
//! │   get / put / remove / compute_if_absent / stats      │
//! └──────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                      CacheCore                        │
//! │  Topology ─ EntryStore ─ LoadCoordinator ─ CacheStats │
//! └──────────────────────────────────────────────────────┘
//!          │                 │                 │
//!          ▼                 ▼                 ▼
//!    ┌───────────┐    ┌────────────┐    ┌────────────┐
//!    │ViewManager│    │ Transport  │    │   Reaper   │
//!    └───────────┘    └────────────┘    └────────────┘
//! ```
//!
//! # State transfer
//!
//! On every view change each member diffs the previous holders of every
//! segment against the new segment table. Segments whose owner set changed
//! are *migrating*: reads prefer the previous holders, writes go to the new
//! owners and are forwarded to the previous holders. New owners pull the
//! migrating segments, then announce completion to the whole view. Once all
//! members have announced, nodes drop the segments they no longer own.

pub mod expiration;
pub mod loader;
pub mod router;
pub mod storage;
pub mod transfer;

use crate::cluster::events::{CacheEvent, CacheListener, ListenerId, Listeners};
use crate::cluster::membership::{ViewManager, ViewSubscriber};
use crate::cluster::view::{ClusterView, ViewChange};
use crate::config::CacheConfig;
use crate::error::{Error, NetworkError, Result};
use crate::metrics::{CacheStats, DegradedReplication, StatsSnapshot};
use crate::network::{Message, MessageKind, NetworkServer, ReplicateRequest, RequestHandler, Responder, Transport};
use crate::partitioning::{SegmentId, SegmentPull, Topology, TransferPlan};
use crate::types::{decode_value, encode_value, now_ms, NodeAddress, NodeId};
use async_trait::async_trait;
use bytes::Bytes;
use expiration::Reaper;
use loader::{Acquired, LoadCoordinator, LoadFailure, LoadGuard};
use parking_lot::{Mutex, RwLock};
use router::{ReadRoute, WriteRoute};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use storage::{EntryStore, Lookup};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transfer::{chunk_entries, PullSchedule, TransferState, CHUNK_FRAME_OVERHEAD};

/// Outcome of pulling the segments gained in a view.
enum PullOutcome {
    Completed { applied: u64 },
    Superseded,
}

/// Node state shared by the public handles, the request handler and the
/// background tasks. Values are handled as serialized bytes.
pub(crate) struct CacheCore {
    config: CacheConfig,

    /// This node.
    local: NodeAddress,

    store: Arc<EntryStore>,

    loads: LoadCoordinator,

    stats: CacheStats,

    transport: Arc<Transport>,

    views: Arc<ViewManager>,

    /// Routing snapshot, swapped on every view change.
    topology: RwLock<Arc<Topology>>,

    /// Transfer progress of the current view.
    transfer: Mutex<TransferState>,

    listeners: Listeners,

    shutdown: CancellationToken,

    me: Weak<CacheCore>,
}

impl CacheCore {
    fn new(
        config: CacheConfig,
        local: NodeAddress,
        transport: Arc<Transport>,
        views: Arc<ViewManager>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let topology = Topology::settled(
            ClusterView::unformed(local.clone()),
            config.num_segments,
            config.num_owners,
        );
        Arc::new_cyclic(|me| Self {
            store: Arc::new(EntryStore::new(config.num_segments)),
            loads: LoadCoordinator::new(),
            stats: CacheStats::new(config.statistics_enabled),
            topology: RwLock::new(Arc::new(topology)),
            transfer: Mutex::new(TransferState::new(0, [], HashSet::new())),
            listeners: Listeners::new(),
            me: me.clone(),
            config,
            local,
            transport,
            views,
            shutdown,
        })
    }

    fn topology(&self) -> Arc<Topology> {
        self.topology.read().clone()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }

    fn data_timeout(&self) -> Duration {
        self.config.transport.data_timeout
    }

    fn expired(&self, key: &str) {
        self.stats.record_expirations(1);
        self.listeners.emit(&CacheEvent::EntryExpired {
            key: key.to_string(),
        });
    }

    fn local_lookup(&self, key: &str) -> Option<Bytes> {
        match self.store.lookup(key) {
            Lookup::Hit(entry) => Some(entry.value),
            Lookup::Expired => {
                self.expired(key);
                None
            }
            Lookup::Absent => None,
        }
    }

    /// Read `key` locally if owned, then from the remote owners in order,
    /// previous holders first while the segment migrates. Unreachable owners
    /// are skipped; a timed out or overloaded owner ends the read as a miss.
    async fn lookup(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_running()?;
        let topology = self.topology();
        let route = ReadRoute::resolve(&topology, key, self.local.id);

        if route.local {
            if let Some(value) = self.local_lookup(key) {
                return Ok(Some(value));
            }
        }

        for owner in &route.remote {
            let message = Message::RemoteGet {
                key: key.to_string(),
                view_id: topology.view().id,
            };
            match self.transport.request(owner, message, self.data_timeout()).await {
                Ok(Message::RemoteGetResponse { value }) => return Ok(value),
                Ok(other) => {
                    debug!(owner = %owner, kind = %other.kind(), "Unexpected reply to remote get");
                }
                Err(e) if e.is_transient() => {
                    debug!(owner = %owner, key, error = %e, "Owner busy, treating as miss");
                    return Ok(None);
                }
                Err(e) if e.is_unreachable() => {
                    debug!(owner = %owner, key, error = %e, "Owner unreachable, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Write `value` to every owner of `key`, and to the previous holders
    /// while its segment migrates.
    async fn store_bytes(&self, key: &str, value: Bytes, lifespan: Duration) -> Result<()> {
        self.ensure_running()?;
        let topology = self.topology();
        let route = WriteRoute::resolve(&topology, key, self.local.id);
        let created_at = now_ms();
        let lifespan_ms = lifespan.as_millis() as u64;

        let mut acked = 0;
        if route.is_local() {
            let entry = self
                .store
                .replicated_entry(key, value.clone(), created_at, lifespan_ms);
            self.store.install_entry(key, entry);
            if route.local_owner {
                acked += 1;
            }
        }

        let request = Message::Replicate(ReplicateRequest {
            key: key.to_string(),
            value,
            created_at,
            lifespan_ms,
            view_id: topology.view().id,
        });
        let mut failed = 0;
        let results = self
            .transport
            .anycast(&route.remote(), request, self.data_timeout())
            .await;
        for (peer, result) in results {
            let owner = route.is_remote_owner(peer);
            match result {
                Ok(Message::ReplicateAck) if owner => acked += 1,
                Ok(Message::ReplicateAck) => {}
                Ok(other) => {
                    debug!(peer = %peer, kind = %other.kind(), "Unexpected reply to replicate");
                    failed += usize::from(owner);
                }
                Err(e) => {
                    debug!(peer = %peer, key, error = %e, "Replication failed");
                    failed += usize::from(owner);
                }
            }
        }

        if acked == 0 {
            return Err(Error::NoOwnerAvailable {
                key: key.to_string(),
            });
        }
        self.stats.record_store();

        let expected = self.config.num_owners;
        if acked < expected {
            if failed > 0 {
                warn!(key, acked, expected, "Degraded replication");
            } else {
                debug!(key, acked, expected, "Fewer members than owners");
            }
            self.stats.record_degraded(DegradedReplication {
                key: key.to_string(),
                acked,
                expected,
                at_ms: now_ms(),
            });
        }
        Ok(())
    }

    /// Remove `key` from every owner. Returns whether any owner held it.
    async fn invalidate(&self, key: &str) -> Result<bool> {
        self.ensure_running()?;
        let topology = self.topology();
        let route = WriteRoute::resolve(&topology, key, self.local.id);

        let mut acked = 0;
        let mut existed = false;
        if route.is_local() {
            existed |= self.store.remove(key, topology.is_migrating(route.segment));
            if route.local_owner {
                acked += 1;
            }
        }

        let request = Message::Invalidate {
            key: key.to_string(),
            view_id: topology.view().id,
        };
        let results = self
            .transport
            .anycast(&route.remote(), request, self.data_timeout())
            .await;
        for (peer, result) in results {
            match result {
                Ok(Message::InvalidateAck { existed: held }) => {
                    existed |= held;
                    if route.is_remote_owner(peer) {
                        acked += 1;
                    }
                }
                Ok(other) => debug!(peer = %peer, kind = %other.kind(), "Unexpected reply to invalidate"),
                Err(e) => debug!(peer = %peer, key, error = %e, "Invalidation failed"),
            }
        }

        if acked == 0 {
            return Err(Error::NoOwnerAvailable {
                key: key.to_string(),
            });
        }
        self.stats.record_remove();
        Ok(existed)
    }

    /// Run the loader as the installer of `guard` and publish the value.
    async fn load<V, F, Fut, E>(&self, guard: LoadGuard, loader: F) -> Result<Bytes>
    where
        V: Serialize,
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        E: Display,
    {
        // A concurrent installer may have finished between our miss and the slot.
        match self.lookup(guard.key()).await {
            Ok(Some(value)) => {
                guard.complete(Ok(value.clone()));
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => {
                guard.complete(Err(LoadFailure::Failed(e.to_string())));
                return Err(e);
            }
        }

        let key = guard.key().to_string();
        let loaded = tokio::time::timeout(self.config.loader.loader_timeout, loader(key.clone())).await;
        let value = match loaded {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                let cause = e.to_string();
                warn!(key = %key, error = %cause, "Value loader failed");
                self.stats.record_load(false);
                guard.complete(Err(LoadFailure::Failed(cause.clone())));
                return Err(Error::LoaderFailed(cause));
            }
            Err(_) => {
                warn!(key = %key, timeout_ms = self.config.loader.loader_timeout.as_millis() as u64, "Value loader timed out");
                self.stats.record_load(false);
                guard.complete(Err(LoadFailure::TimedOut));
                return Err(Error::LoaderTimeout);
            }
        };
        self.stats.record_load(true);

        let bytes = match encode_value(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                guard.complete(Err(LoadFailure::Failed(e.to_string())));
                return Err(e.into());
            }
        };
        if let Err(e) = self.store_bytes(&key, bytes.clone(), self.config.lifespan).await {
            warn!(key = %key, error = %e, "Loaded value could not be stored");
        }
        guard.complete(Ok(bytes.clone()));
        Ok(bytes)
    }

    /// Handle a cache request from a peer.
    async fn handle_request(&self, message: Message, responder: &mut Responder) -> Result<()> {
        if let Some(view_id) = stamped_view(&message) {
            self.await_view(view_id).await;
        }

        match message {
            Message::RemoteGet { key, .. } => {
                let value = self.local_lookup(&key);
                responder.reply(Message::RemoteGetResponse { value }).await
            }
            Message::Replicate(request) => {
                let entry = self.store.replicated_entry(
                    &request.key,
                    request.value,
                    request.created_at,
                    request.lifespan_ms,
                );
                self.store.install_entry(&request.key, entry);
                responder.reply(Message::ReplicateAck).await
            }
            Message::Invalidate { key, .. } => {
                let topology = self.topology();
                let migrating = topology.is_migrating(topology.segment_of(&key));
                let existed = self.store.remove(&key, migrating);
                responder.reply(Message::InvalidateAck { existed }).await
            }
            Message::StateTransferRequest { view_id, segments } => {
                self.stream_segments(view_id, segments, responder).await
            }
            Message::TransferComplete { view_id, node } => {
                self.confirm_transfer(view_id, node);
                let view_id = self.topology().view().id;
                responder.reply(Message::ViewAck { view_id }).await
            }
            Message::StatsRequest => {
                let entries = self.store.len() as u64;
                responder.reply(Message::StatsResponse { entries }).await
            }
            other => Err(Error::Internal(format!("unexpected request {}", other.kind()))),
        }
    }

    /// Hold a request stamped with a newer view until that view is installed.
    async fn await_view(&self, view_id: u64) {
        if view_id <= self.views.view_id() {
            return;
        }
        let timeout = self.config.transport.control_timeout;
        if !self.views.wait_for_view(view_id, timeout).await {
            warn!(view_id, current = self.views.view_id(), "View not installed in time");
        }
    }

    async fn stream_segments(
        &self,
        view_id: u64,
        segments: Vec<SegmentId>,
        responder: &mut Responder,
    ) -> Result<()> {
        let segments: HashSet<SegmentId> = segments.into_iter().collect();
        let entries = self.store.segment_entries(&segments);
        let total = entries.len() as u64;
        debug!(view_id, segments = segments.len(), entries = total, "Streaming segments");

        let max_bytes = self
            .config
            .transport
            .max_frame_size
            .saturating_sub(CHUNK_FRAME_OVERHEAD);
        for chunk in chunk_entries(entries, self.config.state_transfer.chunk_size, max_bytes) {
            responder
                .reply(Message::StateTransferChunk { entries: chunk })
                .await?;
        }
        responder
            .reply(Message::StateTransferEnd {
                view_id,
                entries: total,
            })
            .await
    }

    fn superseded(&self, view_id: u64) -> bool {
        self.topology().view().id != view_id
    }

    /// Pull, announce completion, and leave the cluster if the pulls cannot
    /// finish in time.
    async fn run_state_transfer(self: Arc<Self>, view_id: u64, pulls: Vec<SegmentPull>) {
        let timeout = self.config.state_transfer.timeout;
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, self.pull_segments(view_id, &pulls)).await;
        match outcome {
            Ok(Ok(PullOutcome::Completed { applied })) => {
                if !pulls.is_empty() {
                    info!(
                        node = %self.local,
                        view_id,
                        segments = pulls.len(),
                        applied,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "State transfer complete"
                    );
                }
            }
            Ok(Ok(PullOutcome::Superseded)) => {
                debug!(view_id, "State transfer superseded by a newer view");
                return;
            }
            Ok(Err(Error::Shutdown)) => return,
            Ok(Err(e)) => {
                self.abandon(Error::StateTransferFailed(e.to_string())).await;
                return;
            }
            Err(_) => {
                let reason = format!("pulls not finished after {:?}", timeout);
                self.abandon(Error::StateTransferFailed(reason)).await;
                return;
            }
        }

        self.announce_completion(view_id).await;
    }

    async fn pull_segments(&self, view_id: u64, pulls: &[SegmentPull]) -> Result<PullOutcome> {
        let mut schedule = PullSchedule::new(pulls);
        let mut applied = 0;

        while !schedule.is_done() {
            let round = schedule.next_round();
            if round.is_empty() {
                break;
            }
            for (source, segments) in round {
                if self.superseded(view_id) {
                    return Ok(PullOutcome::Superseded);
                }
                self.ensure_running()?;

                let peer = self.topology().view().member(source).cloned();
                let pulled = match peer {
                    Some(peer) => self.pull_from(&peer, view_id, &segments).await,
                    None => Err(Error::PeerUnreachable(source)),
                };
                match pulled {
                    Ok(count) => {
                        applied += count;
                        schedule.completed(&segments);
                    }
                    Err(Error::Shutdown) => return Err(Error::Shutdown),
                    Err(e) => {
                        warn!(source = %source, segments = segments.len(), error = %e, "Segment pull failed");
                        let exhausted = schedule.failed(&segments);
                        if !exhausted.is_empty() {
                            warn!(segments = ?exhausted, "No holder left to pull segments from");
                            return Err(Error::StateTransferFailed(format!(
                                "no holder left for segments {:?}: {}",
                                exhausted, e
                            )));
                        }
                    }
                }
            }
        }
        Ok(PullOutcome::Completed { applied })
    }

    async fn pull_from(&self, peer: &NodeAddress, view_id: u64, segments: &[SegmentId]) -> Result<u64> {
        let request = Message::StateTransferRequest {
            view_id,
            segments: segments.to_vec(),
        };
        let mut stream = self.transport.request_stream(peer, request).await?;
        let mut received = 0;
        let mut applied = 0;

        loop {
            match stream.next(self.data_timeout()).await? {
                Message::StateTransferChunk { entries } => {
                    for entry in entries {
                        received += 1;
                        if self.store.apply_transferred(entry) {
                            applied += 1;
                        }
                    }
                }
                Message::StateTransferEnd { entries, .. } => {
                    if entries != received {
                        return Err(Error::StateTransferFailed(format!(
                            "{} announced {} entries, received {}",
                            peer, entries, received
                        )));
                    }
                    debug!(source = %peer, segments = segments.len(), received, applied, "Pulled segments");
                    return Ok(applied);
                }
                other => {
                    return Err(NetworkError::UnexpectedReply(other.kind().to_string()).into());
                }
            }
        }
    }

    async fn announce_completion(&self, view_id: u64) {
        {
            let mut state = self.transfer.lock();
            if state.view_id() != view_id {
                return;
            }
            state.pulls_finished();
        }
        self.confirm_transfer(view_id, self.local.id);

        let mut pending = self.topology().view().others(self.local.id);
        let message = Message::TransferComplete {
            view_id,
            node: self.local.id,
        };
        for _ in 0..=self.config.state_transfer.completion_retries {
            if pending.is_empty() || self.superseded(view_id) || self.shutdown.is_cancelled() {
                return;
            }
            let results = self
                .transport
                .anycast(&pending, message.clone(), self.data_timeout())
                .await;
            let failed: HashSet<NodeId> = results
                .into_iter()
                .filter_map(|(peer, result)| match result {
                    Ok(_) => None,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "Transfer completion not acknowledged");
                        Some(peer)
                    }
                })
                .collect();
            pending.retain(|member| failed.contains(&member.id));
        }
        if !pending.is_empty() {
            warn!(view_id, members = pending.len(), "Members did not acknowledge transfer completion");
        }
    }

    fn confirm_transfer(&self, view_id: u64, node: NodeId) {
        let (settled, waiting) = {
            let mut state = self.transfer.lock();
            let settled = state.confirm(view_id, node);
            (settled, state.waiting_for().len())
        };
        if settled {
            self.finish_rebalance(view_id);
        } else {
            debug!(view_id, node = %node, waiting, "Transfer confirmation recorded");
        }
    }

    /// Every member finished pulling: drop segments this node no longer owns.
    fn finish_rebalance(&self, view_id: u64) {
        let settled = {
            let mut topology = self.topology.write();
            if topology.view().id != view_id {
                return;
            }
            let settled = Arc::new(topology.settle());
            *topology = settled.clone();
            settled
        };

        let local = self.local.id;
        let table = settled.table();
        let dropped = self.store.retain_segments(|segment| table.is_owner(segment, local));
        self.store.clear_tombstones();
        self.stats.record_evictions(dropped as u64);
        self.stats.update_cluster(settled.view().len(), 0);
        info!(node = %self.local, view_id, dropped, "Rebalance finished");
    }

    async fn abandon(&self, error: Error) {
        error!(node = %self.local, error = %error, "Leaving the cluster");
        self.views.leave().await;
        self.shutdown.cancel();
        self.transport.close_all();
    }

    /// Local entry count plus the count reported by every other member.
    async fn total_entries(&self) -> Result<u64> {
        self.ensure_running()?;
        let mut total = self.store.len() as u64;
        let others = self.topology().view().others(self.local.id);
        let results = self
            .transport
            .anycast(&others, Message::StatsRequest, self.config.transport.control_timeout)
            .await;
        for (peer, result) in results {
            match result {
                Ok(Message::StatsResponse { entries }) => total += entries,
                Ok(other) => debug!(peer = %peer, kind = %other.kind(), "Unexpected reply to stats request"),
                Err(e) => debug!(peer = %peer, error = %e, "Member did not report its entries"),
            }
        }
        Ok(total)
    }
}

impl ViewSubscriber for CacheCore {
    fn on_view_change(&self, change: &ViewChange) {
        let num_segments = self.config.num_segments;
        let num_owners = self.config.num_owners;

        let (topology, plan_pulls, dropped) = {
            let mut current = self.topology.write();
            let holders = if current.view().is_formed() && current.view().id == change.previous.id {
                current.holders()
            } else if change.previous.is_formed() {
                // Joined, or missed views: derive holders from the replaced view.
                Topology::settled(change.previous.clone(), num_segments, num_owners).holders()
            } else {
                vec![Vec::new(); num_segments as usize]
            };
            let unfinished = self.transfer.lock().pending_segments().clone();
            let plan = TransferPlan::compute(
                &holders,
                change.view.clone(),
                num_segments,
                num_owners,
                self.local.id,
                &unfinished,
            );
            let topology = Arc::new(plan.topology);
            *current = topology.clone();
            (topology, plan.pulls, plan.dropped)
        };

        let pending: HashSet<SegmentId> = plan_pulls.iter().map(|pull| pull.segment).collect();
        *self.transfer.lock() = TransferState::new(change.view.id, change.view.ids(), pending);
        self.stats
            .update_cluster(change.view.len(), topology.migrating_segments());

        info!(
            node = %self.local,
            view = %change.view,
            migrating = topology.migrating_segments(),
            pulls = plan_pulls.len(),
            dropped = dropped.len(),
            "Segment ownership changed"
        );
        self.listeners.emit(&CacheEvent::ViewChanged {
            previous: change.previous.clone(),
            view: change.view.clone(),
            is_coordinator: change.view.is_coordinator(self.local.id),
            local: self.local.clone(),
        });

        if let Some(core) = self.me.upgrade() {
            tokio::spawn(core.run_state_transfer(change.view.id, plan_pulls));
        }
    }
}

impl Drop for CacheCore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn stamped_view(message: &Message) -> Option<u64> {
    match message {
        Message::RemoteGet { view_id, .. }
        | Message::Invalidate { view_id, .. }
        | Message::StateTransferRequest { view_id, .. }
        | Message::TransferComplete { view_id, .. } => Some(*view_id),
        Message::Replicate(request) => Some(request.view_id),
        _ => None,
    }
}

/// Routes inbound requests to the view manager or the cache.
struct NodeHandler {
    core: Weak<CacheCore>,
}

#[async_trait]
impl RequestHandler for NodeHandler {
    async fn handle(&self, message: Message, responder: &mut Responder) -> Result<()> {
        let core = self.core.upgrade().ok_or(Error::Shutdown)?;
        match message.kind() {
            MessageKind::Join | MessageKind::View | MessageKind::Heartbeat | MessageKind::Leave => {
                let reply = core.views.handle(message).await?;
                responder.reply(reply).await
            }
            _ => core.handle_request(message, responder).await,
        }
    }
}

/// A node of a clustered cache holding values of type `V`.
///
/// Handles are cheap to clone. The node keeps running until
/// [`shutdown`](Self::shutdown) is called or the last handle is dropped.
pub struct ClusteredCache<V> {
    core: Arc<CacheCore>,
    _values: PhantomData<fn() -> V>,
}

impl<V> Clone for ClusteredCache<V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _values: PhantomData,
        }
    }
}

impl<V> ClusteredCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start a node and join (or form) its cluster.
    pub async fn start(config: CacheConfig) -> Result<Self> {
        Self::start_with_listeners(config, Vec::new()).await
    }

    /// Start a node with listeners registered before the first event.
    pub async fn start_with_listeners(
        config: CacheConfig,
        listeners: Vec<Arc<dyn CacheListener>>,
    ) -> Result<Self> {
        config.validate()?;
        let started = Instant::now();

        let bind = resolve(&config.bind_addr, config.prefer_ipv4).await?;
        let listener = TcpListener::bind(bind).await.map_err(|e| NetworkError::ConnectionFailed {
            addr: bind.to_string(),
            reason: e.to_string(),
        })?;
        let mut addr = listener.local_addr()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }

        let id = NodeId::random();
        let name = config
            .node_name
            .clone()
            .unwrap_or_else(|| format!("node-{}", id));
        let local = NodeAddress::new(id, name, addr);
        info!(
            node = %local,
            cluster = %config.cluster_name,
            mode = ?config.cache_mode,
            owners = config.num_owners,
            "Starting clustered cache"
        );

        let shutdown = CancellationToken::new();
        let transport = Arc::new(Transport::new(id, config.transport.clone(), shutdown.clone()));
        let views = Arc::new(ViewManager::new(
            local.clone(),
            config.cluster_name.clone(),
            config.membership.clone(),
            config.transport.control_timeout,
            transport.clone(),
            shutdown.clone(),
        ));

        let mut seeds = Vec::with_capacity(config.seed_nodes.len());
        for seed in &config.seed_nodes {
            match resolve(seed, config.prefer_ipv4).await {
                Ok(seed) => seeds.push(seed),
                Err(e) => warn!(seed = %seed, error = %e, "Ignoring unresolvable seed"),
            }
        }
        let initial_size = config.initial_cluster_size;
        let formation_timeout = config.initial_cluster_timeout;
        let server_config = config.transport.clone();

        let core = CacheCore::new(config, local, transport, views.clone(), shutdown.clone());
        for listener in listeners {
            core.listeners.add(listener);
        }
        let subscriber: Weak<dyn ViewSubscriber> = Arc::downgrade(&core) as Weak<dyn ViewSubscriber>;
        views.subscribe(subscriber);

        let handler = Arc::new(NodeHandler {
            core: Arc::downgrade(&core),
        });
        let server = NetworkServer::new(listener, handler, server_config, shutdown.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Network server error");
            }
        });
        views.start();

        let formed = async {
            views.join(&seeds, formation_timeout).await?;
            views
                .wait_for_members(initial_size, formation_timeout.saturating_sub(started.elapsed()))
                .await
        };
        if let Err(e) = formed.await {
            warn!(node = %core.local, error = %e, "Cluster formation failed");
            core.views.leave().await;
            core.shutdown.cancel();
            core.transport.close_all();
            return Err(e);
        }

        let reaper = Reaper::new(core.store.clone(), &core.config.expiration, core.config.lifespan);
        let weak = Arc::downgrade(&core);
        tokio::spawn(reaper.run(shutdown, move |key: &str| {
            if let Some(core) = weak.upgrade() {
                core.expired(key);
            }
        }));

        let view = core.views.current();
        info!(node = %core.local, view = %view, "Clustered cache started");
        core.listeners.emit(&CacheEvent::CacheStarted {
            node: core.local.clone(),
            view,
        });

        Ok(Self {
            core,
            _values: PhantomData,
        })
    }

    /// Get the value of `key`, or `None` on a miss.
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        let value = self.core.lookup(key).await?;
        match value {
            Some(bytes) => {
                self.core.stats.record_hit();
                Ok(Some(decode_value(&bytes)?))
            }
            None => {
                self.core.stats.record_miss();
                Ok(None)
            }
        }
    }

    /// Store `value` on every owner with the configured lifespan.
    pub async fn put(&self, key: &str, value: &V) -> Result<()> {
        self.put_with_lifespan(key, value, self.core.config.lifespan)
            .await
    }

    /// Store `value` on every owner with an explicit lifespan.
    pub async fn put_with_lifespan(&self, key: &str, value: &V, lifespan: Duration) -> Result<()> {
        let bytes = encode_value(value)?;
        self.core.store_bytes(key, bytes, lifespan).await
    }

    /// Remove `key` from every owner. Returns whether it was present.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.core.invalidate(key).await
    }

    /// Read-through primitive: return the cached value, or load it with
    /// `loader`, store it on the owners and return it.
    ///
    /// At most one loader runs per key on this node; concurrent callers wait
    /// for its outcome, and all of them observe the same failure.
    pub async fn compute_if_absent<F, Fut, E>(&self, key: &str, loader: F) -> Result<V>
    where
        F: FnOnce(String) -> Fut + Send,
        Fut: Future<Output = std::result::Result<V, E>> + Send,
        E: Display + Send,
    {
        if let Some(bytes) = self.core.lookup(key).await? {
            self.core.stats.record_hit();
            return Ok(decode_value(&bytes)?);
        }
        self.core.stats.record_miss();

        let bytes = match self.core.loads.acquire(key) {
            Acquired::Joiner(waiter) => {
                waiter
                    .wait(self.core.config.loader.loader_wait_timeout)
                    .await?
            }
            Acquired::Installer(guard) => self.core.load(guard, loader).await?,
        };
        Ok(decode_value(&bytes)?)
    }

    /// Statistics of this node.
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot(self.core.store.len())
    }

    /// Statistics of this node in Prometheus exposition format.
    pub fn prometheus_metrics(&self) -> String {
        self.core.stats.to_prometheus(self.core.store.len())
    }

    /// Entries held across the cluster, gathered from every member.
    pub async fn total_entries(&self) -> Result<u64> {
        self.core.total_entries().await
    }

    /// Register a listener.
    pub fn subscribe<L: CacheListener>(&self, listener: L) -> ListenerId {
        self.core.listeners.add(Arc::new(listener))
    }

    /// Remove a listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.core.listeners.remove(id)
    }

    /// Whether a live entry for `key` is held locally.
    pub fn contains_key(&self, key: &str) -> bool {
        self.core.store.contains(key)
    }

    /// Number of entries held locally.
    pub fn local_entry_count(&self) -> usize {
        self.core.store.len()
    }

    /// Keys held locally.
    pub fn local_keys(&self) -> Vec<String> {
        self.core.store.keys()
    }

    /// The current view.
    pub fn view(&self) -> ClusterView {
        self.core.views.current()
    }

    /// Whether this node coordinates the cluster.
    pub fn is_coordinator(&self) -> bool {
        self.core.views.is_coordinator()
    }

    /// This node's identity and address.
    pub fn address(&self) -> &NodeAddress {
        &self.core.local
    }

    /// Segment of `key`.
    pub fn segment_of(&self, key: &str) -> SegmentId {
        self.core.topology().segment_of(key)
    }

    /// Owners of `key` in the current view, primary first.
    pub fn owners_of(&self, key: &str) -> Vec<NodeId> {
        self.core.topology().ownership(key).all_owners()
    }

    /// Whether segments are still being transferred after a view change.
    pub fn rebalance_in_progress(&self) -> bool {
        self.core.topology().in_transition()
    }

    /// A handle that does not keep the node alive.
    pub fn downgrade(&self) -> WeakCache<V> {
        WeakCache {
            core: Arc::downgrade(&self.core),
            _values: PhantomData,
        }
    }

    /// Leave the cluster and stop the node.
    pub async fn shutdown(&self) {
        if self.core.shutdown.is_cancelled() {
            return;
        }
        info!(node = %self.core.local, "Shutting down clustered cache");
        self.core.views.leave().await;
        self.core.shutdown.cancel();
        self.core.transport.close_all();
    }

    /// Stop the node without leaving, as if it crashed.
    #[cfg(test)]
    pub(crate) fn kill(&self) {
        self.core.shutdown.cancel();
        self.core.transport.close_all();
    }

    /// Drop the local copy of `key` only, leaving other owners untouched.
    #[cfg(test)]
    pub(crate) fn evict_local(&self, key: &str) -> bool {
        self.core.store.evict(key).is_some()
    }
}

impl<V> std::fmt::Debug for ClusteredCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredCache")
            .field("node", &self.core.local)
            .field("view", &self.core.views.current())
            .field("entries", &self.core.store.len())
            .finish()
    }
}

/// Weak reference to a [`ClusteredCache`], for listeners that need the cache.
pub struct WeakCache<V> {
    core: Weak<CacheCore>,
    _values: PhantomData<fn() -> V>,
}

impl<V> Clone for WeakCache<V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _values: PhantomData,
        }
    }
}

impl<V> WeakCache<V> {
    /// The cache, if it is still alive.
    pub fn upgrade(&self) -> Option<ClusteredCache<V>> {
        self.core.upgrade().map(|core| ClusteredCache {
            core,
            _values: PhantomData,
        })
    }
}

/// Resolve `addr`, preferring IPv4 results when asked to.
async fn resolve(addr: &str, prefer_ipv4: bool) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", addr, e)))?
        .collect();
    let preferred = if prefer_ipv4 {
        candidates.iter().find(|a| a.is_ipv4())
    } else {
        None
    };
    preferred
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoaderConfig, TransportConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> CacheConfig {
        CacheConfig::new("unit")
            .with_bind_addr("127.0.0.1:0")
            .with_statistics(true)
    }

    /// An owner that answers every request with `Overloaded`, or never
    /// answers remote gets when `hang` is set.
    struct BusyOwner {
        hang: bool,
    }

    #[async_trait]
    impl RequestHandler for BusyOwner {
        async fn handle(&self, message: Message, responder: &mut Responder) -> Result<()> {
            match message {
                Message::RemoteGet { .. } if self.hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
                _ => responder.reply(Message::Overloaded).await,
            }
        }
    }

    async fn start_busy_owner(hang: bool) -> (NodeAddress, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token = CancellationToken::new();
        let server = NetworkServer::new(
            listener,
            Arc::new(BusyOwner { hang }),
            TransportConfig::default(),
            token.clone(),
        );
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (NodeAddress::new(NodeId::random(), "busy", addr), token)
    }

    /// A node sharing a settled single-owner view with `owner`, plus a key
    /// only `owner` holds.
    fn node_beside(owner: &NodeAddress, config: CacheConfig) -> (ClusteredCache<String>, String) {
        let local = NodeAddress::new(NodeId::random(), "reader", "127.0.0.1:1".parse().unwrap());
        let shutdown = CancellationToken::new();
        let transport = Arc::new(Transport::new(local.id, config.transport.clone(), shutdown.clone()));
        let views = Arc::new(ViewManager::new(
            local.clone(),
            "unit",
            config.membership.clone(),
            config.transport.control_timeout,
            transport.clone(),
            shutdown.clone(),
        ));
        let core = CacheCore::new(config, local.clone(), transport, views, shutdown);

        let view = ClusterView::new(1, vec![owner.clone(), local.clone()]);
        let topology = Topology::settled(view, 8, 1);
        let key = (0..)
            .map(|i| format!("city-{}", i))
            .find(|key| !ReadRoute::resolve(&topology, key, local.id).local)
            .unwrap();
        *core.topology.write() = Arc::new(topology);

        let cache = ClusteredCache {
            core,
            _values: PhantomData,
        };
        (cache, key)
    }

    async fn load_beside_busy_owner(hang: bool) {
        let (owner, token) = start_busy_owner(hang).await;
        let config = config()
            .with_num_segments(8)
            .with_num_owners(1)
            .with_transport_config(TransportConfig::default().with_data_timeout(Duration::from_millis(100)));
        let (cache, key) = node_beside(&owner, config);

        assert_eq!(cache.get(&key).await.unwrap(), None);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let value = cache
            .compute_if_absent(&key, move |city| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(format!("{} loaded", city))
            })
            .await
            .unwrap();
        assert_eq!(value, format!("{} loaded", key));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.loads, 1);

        cache.kill();
        token.cancel();
    }

    #[tokio::test]
    async fn test_overloaded_owner_reads_as_miss_and_loads_locally() {
        load_beside_busy_owner(false).await;
    }

    #[tokio::test]
    async fn test_timed_out_owner_reads_as_miss_and_loads_locally() {
        load_beside_busy_owner(true).await;
    }

    #[tokio::test]
    async fn test_joiner_times_out_while_installer_completes() {
        let config = config().with_loader_config(LoaderConfig::default().with_wait_timeout(Duration::from_millis(100)));
        let cache: ClusteredCache<String> = ClusteredCache::start(config).await.unwrap();

        let installer = cache.compute_if_absent("Vienna", |_| async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok::<_, String>("fresh".to_string())
        });
        let joiner = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cache
                .compute_if_absent("Vienna", |_| async { Ok::<_, String>("second".to_string()) })
                .await
        };
        let (installed, joined) = tokio::join!(installer, joiner);

        assert!(matches!(joined, Err(Error::LoaderTimeout)), "joiner got {:?}", joined);
        assert_eq!(installed.unwrap(), "fresh");
        assert_eq!(cache.get("Vienna").await.unwrap(), Some("fresh".to_string()));
        assert_eq!(cache.stats().loads, 1);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_single_node() {
        let cache: ClusteredCache<String> = ClusteredCache::start(config()).await.unwrap();
        assert_eq!(cache.view().len(), 1);
        assert!(cache.is_coordinator());
        assert!(!cache.rebalance_in_progress());
        assert_eq!(cache.owners_of("k"), vec![cache.address().id]);
        assert_ne!(cache.address().addr.port(), 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let cache: ClusteredCache<String> = ClusteredCache::start(config()).await.unwrap();

        cache.put("Rome", &"sunny".to_string()).await.unwrap();
        assert_eq!(cache.get("Rome").await.unwrap(), Some("sunny".to_string()));
        assert!(cache.contains_key("Rome"));
        assert_eq!(cache.local_keys(), vec!["Rome".to_string()]);

        assert!(cache.remove("Rome").await.unwrap());
        assert!(!cache.remove("Rome").await.unwrap());
        assert_eq!(cache.get("Rome").await.unwrap(), None);

        let stats = cache.stats();
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.removes, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_single_node_put_is_degraded() {
        let cache: ClusteredCache<u32> = ClusteredCache::start(config()).await.unwrap();
        cache.put("x", &1).await.unwrap();

        let degraded = cache.stats().last_degraded.unwrap();
        assert_eq!(degraded.key, "x");
        assert_eq!(degraded.acked, 1);
        assert_eq!(degraded.expected, 2);
    }

    #[tokio::test]
    async fn test_loader_failure_is_surfaced_and_not_cached() {
        let cache: ClusteredCache<String> = ClusteredCache::start(config()).await.unwrap();

        let result = cache
            .compute_if_absent("Oslo", |_| async { Err::<String, _>("backend down") })
            .await;
        match result {
            Err(Error::LoaderFailed(cause)) => assert_eq!(cause, "backend down"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!cache.contains_key("Oslo"));
        assert_eq!(cache.stats().load_failures, 1);

        let value = cache
            .compute_if_absent("Oslo", |city| async move { Ok::<_, String>(format!("{} ok", city)) })
            .await
            .unwrap();
        assert_eq!(value, "Oslo ok");
    }

    #[tokio::test]
    async fn test_loader_timeout() {
        let config = config().with_loader_config(
            crate::config::LoaderConfig::default().with_loader_timeout(Duration::from_millis(50)),
        );
        let cache: ClusteredCache<String> = ClusteredCache::start(config).await.unwrap();

        let result = cache
            .compute_if_absent("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>("late".to_string())
            })
            .await;
        assert!(matches!(result, Err(Error::LoaderTimeout)));
        assert!(!cache.contains_key("slow"));
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_fail() {
        let cache: ClusteredCache<String> = ClusteredCache::start(config()).await.unwrap();
        cache.shutdown().await;

        assert!(matches!(cache.get("k").await, Err(Error::Shutdown)));
        assert!(matches!(cache.put("k", &"v".to_string()).await, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_weak_cache_upgrade() {
        let cache: ClusteredCache<String> = ClusteredCache::start(config()).await.unwrap();
        let weak = cache.downgrade();
        assert!(weak.upgrade().is_some());

        drop(cache);
        let released = crate::testing::utils::wait_for(
            || weak.upgrade().is_none(),
            Duration::from_secs(2),
            Duration::from_millis(10),
        )
        .await;
        assert!(released);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = ClusteredCache::<String>::start(config().with_num_owners(0)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_formation_timeout() {
        let config = config()
            .with_initial_cluster_size(2)
            .with_initial_cluster_timeout(Duration::from_millis(200));
        let result = ClusteredCache::<String>::start(config).await;
        assert!(matches!(
            result,
            Err(Error::ClusterFormationTimeout {
                expected: 2,
                actual: 1
            })
        ));
    }
}
