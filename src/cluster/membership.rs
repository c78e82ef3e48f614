//! View management.
//!
//! The coordinator (first member of the view) admits joiners, detects failed
//! members through heartbeats and installs every new view, broadcasting it to
//! the remaining members. Members install the views they receive and take
//! over when the coordinator falls silent: the member at position `k` waits
//! `k` times the detection window before removing everyone ahead of it.
//!
//! Subscribers are notified synchronously while a view is installed, before
//! the view becomes visible through [`ViewManager::current`] and before the
//! VIEW message is acknowledged.

use crate::cluster::view::{ClusterView, ViewChange};
use crate::config::MembershipConfig;
use crate::error::{Error, Result};
use crate::network::{JoinRequest, JoinResponse, Message, Transport, ViewUpdate};
use crate::types::{NodeAddress, NodeId};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives every installed view change.
pub trait ViewSubscriber: Send + Sync + 'static {
    /// Called while the view is being installed. Must not block.
    fn on_view_change(&self, change: &ViewChange);
}

enum JoinOutcome {
    Joined,
    Redirect(NodeAddress),
    Retry,
}

/// Membership state of the local node.
pub struct ViewManager {
    /// This node.
    local: NodeAddress,

    /// Only nodes with the same cluster name are admitted.
    cluster_name: String,

    config: MembershipConfig,

    /// Timeout for JOIN, VIEW and LEAVE requests.
    control_timeout: Duration,

    transport: Arc<Transport>,

    /// Current view.
    view_tx: watch::Sender<ClusterView>,

    /// View replaced by the current one.
    previous: Mutex<ClusterView>,

    /// Serializes view changes decided by this node.
    changes: tokio::sync::Mutex<()>,

    /// Serializes installation and subscriber notification.
    install_lock: Mutex<()>,

    subscribers: RwLock<Vec<Weak<dyn ViewSubscriber>>>,

    /// Last heartbeat from the coordinator, or last installed view.
    last_heartbeat: Mutex<Instant>,

    /// Consecutive missed heartbeats per member, kept by the coordinator.
    missed: Mutex<HashMap<NodeId, u32>>,

    /// Set while this node is contacting seeds.
    joining: AtomicBool,

    /// Set once this node started leaving.
    leaving: AtomicBool,

    shutdown: CancellationToken,
}

impl ViewManager {
    /// Create a manager for an unformed node.
    pub fn new(
        local: NodeAddress,
        cluster_name: impl Into<String>,
        config: MembershipConfig,
        control_timeout: Duration,
        transport: Arc<Transport>,
        shutdown: CancellationToken,
    ) -> Self {
        let unformed = ClusterView::unformed(local.clone());
        let (view_tx, _) = watch::channel(unformed.clone());
        Self {
            local,
            cluster_name: cluster_name.into(),
            config,
            control_timeout,
            transport,
            view_tx,
            previous: Mutex::new(unformed),
            changes: tokio::sync::Mutex::new(()),
            install_lock: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            last_heartbeat: Mutex::new(Instant::now()),
            missed: Mutex::new(HashMap::new()),
            joining: AtomicBool::new(false),
            leaving: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Snapshot of the current view.
    pub fn current(&self) -> ClusterView {
        self.view_tx.borrow().clone()
    }

    /// Id of the current view.
    pub fn view_id(&self) -> u64 {
        self.view_tx.borrow().id
    }

    /// The view replaced by the current one.
    pub fn previous(&self) -> ClusterView {
        self.previous.lock().clone()
    }

    /// Whether the local node coordinates the current view.
    pub fn is_coordinator(&self) -> bool {
        self.view_tx.borrow().is_coordinator(self.local.id)
    }

    /// Register a subscriber. Dropped subscribers are pruned on the next view.
    pub fn subscribe(&self, subscriber: Weak<dyn ViewSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Wait until a view with id `view_id` or newer is installed.
    pub async fn wait_for_view(&self, view_id: u64, timeout: Duration) -> bool {
        let mut rx = self.view_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|view| view.id >= view_id))
            .await
            .map(|reached| reached.is_ok())
            .unwrap_or(false)
    }

    /// Wait until the view has at least `size` members.
    pub async fn wait_for_members(&self, size: usize, timeout: Duration) -> Result<()> {
        let mut rx = self.view_tx.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|view| view.is_formed() && view.len() >= size),
        )
        .await
        .map(|reached| reached.is_ok())
        .unwrap_or(false);

        if reached {
            Ok(())
        } else {
            Err(Error::ClusterFormationTimeout {
                expected: size,
                actual: self.current().len(),
            })
        }
    }

    /// Spawn the failure detector.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(self.clone().run_failure_detector());
    }

    /// Install `change.view` if it is newer than the current view and
    /// contains the local node. Returns whether it was installed.
    pub fn install(&self, change: ViewChange) -> bool {
        let _guard = self.install_lock.lock();
        let current_id = self.view_tx.borrow().id;
        if change.view.id <= current_id {
            debug!(
                view_id = change.view.id,
                current_id, "Ignoring stale view"
            );
            return false;
        }
        if !change.view.contains(self.local.id) {
            warn!(node = %self.local, view = %change.view, "Local node is not part of the view");
            return false;
        }

        info!(
            node = %self.local,
            view = %change.view,
            previous = %change.previous,
            "Installing view"
        );
        *self.last_heartbeat.lock() = Instant::now();
        self.missed.lock().retain(|id, _| change.view.contains(*id));

        let subscribers: Vec<Arc<dyn ViewSubscriber>> = {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|s| s.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        for subscriber in subscribers {
            subscriber.on_view_change(&change);
        }

        self.transport.retain_peers(&change.view);
        *self.previous.lock() = change.previous;
        self.view_tx.send_replace(change.view);
        true
    }

    fn form_singleton(&self) -> bool {
        let current = self.current();
        if current.is_formed() {
            return false;
        }
        info!(node = %self.local, "Forming a new cluster");
        self.install(ViewChange {
            previous: current,
            view: ClusterView::new(1, vec![self.local.clone()]),
        })
    }

    /// Join the cluster through `seeds`, or form a new one when no seed is
    /// reachable or `timeout` passes.
    pub async fn join(&self, seeds: &[SocketAddr], timeout: Duration) -> Result<()> {
        let seeds: Vec<NodeAddress> = seeds
            .iter()
            .filter(|addr| **addr != self.local.addr)
            .map(|addr| NodeAddress::new(NodeId::random(), "seed", *addr))
            .collect();
        if seeds.is_empty() {
            self.form_singleton();
            return Ok(());
        }

        self.joining.store(true, Ordering::SeqCst);
        let result = self.join_seeds(&seeds, timeout).await;
        self.joining.store(false, Ordering::SeqCst);
        for seed in &seeds {
            self.transport.disconnect(seed.id);
        }
        result
    }

    async fn join_seeds(&self, seeds: &[NodeAddress], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        while !self.current().is_formed() {
            if self.shutdown.is_cancelled() {
                return Err(Error::Shutdown);
            }

            let mut reachable = false;
            for seed in seeds {
                let mut outcome = self.try_join(seed).await;
                if let Ok(JoinOutcome::Redirect(coordinator)) = &outcome {
                    reachable = true;
                    debug!(seed = %seed.addr, coordinator = %coordinator, "Redirected to coordinator");
                    outcome = if coordinator.id == self.local.id {
                        Ok(JoinOutcome::Retry)
                    } else {
                        self.try_join(coordinator).await
                    };
                }
                match outcome {
                    Ok(JoinOutcome::Joined) => return Ok(()),
                    Ok(_) => reachable = true,
                    Err(Error::Rejected(reason)) => return Err(Error::Rejected(reason)),
                    Err(e) => debug!(seed = %seed.addr, error = %e, "Join attempt failed"),
                }
                if self.current().is_formed() {
                    return Ok(());
                }
            }

            if !reachable {
                info!(node = %self.local, "No seed reachable");
                self.form_singleton();
                break;
            }
            if Instant::now() >= deadline {
                warn!(node = %self.local, "Join timed out");
                self.form_singleton();
                break;
            }
            tokio::time::sleep(retry_delay(self.config.join_retry_interval)).await;
        }
        Ok(())
    }

    async fn try_join(&self, target: &NodeAddress) -> Result<JoinOutcome> {
        let current = self.current();
        let request = Message::Join(JoinRequest {
            cluster_name: self.cluster_name.clone(),
            node: self.local.clone(),
            view_size: current.len(),
            joining: !current.is_formed(),
        });
        match self.transport.request(target, request, self.control_timeout).await? {
            Message::JoinResponse(JoinResponse::Accepted { view, previous }) => {
                info!(node = %self.local, view = %view, "Joined cluster");
                self.install(ViewChange { previous, view });
                Ok(JoinOutcome::Joined)
            }
            Message::JoinResponse(JoinResponse::Redirect { coordinator }) => {
                Ok(JoinOutcome::Redirect(coordinator))
            }
            Message::JoinResponse(JoinResponse::Retry) => Ok(JoinOutcome::Retry),
            Message::JoinResponse(JoinResponse::Rejected { reason }) => Err(Error::Rejected(reason)),
            other => Err(Error::Internal(format!("unexpected join reply {}", other.kind()))),
        }
    }

    /// Leave the cluster. A coordinator hands over by broadcasting the view
    /// without itself; other members ask the coordinator to remove them.
    pub async fn leave(&self) {
        if self.leaving.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = self.current();
        if !current.is_formed() || current.len() <= 1 {
            return;
        }

        if current.is_coordinator(self.local.id) {
            let _changes = self.changes.lock().await;
            let current = self.current();
            let change = ViewChange {
                view: current.without(&HashSet::from([self.local.id])),
                previous: current,
            };
            info!(node = %self.local, view = %change.view, "Coordinator leaving, handing over");
            self.broadcast(&change, None).await;
        } else if let Some(coordinator) = current.coordinator() {
            let message = Message::Leave {
                node: self.local.id,
            };
            match self
                .transport
                .request(coordinator, message, self.control_timeout)
                .await
            {
                Ok(_) => info!(node = %self.local, "Left cluster"),
                Err(e) => warn!(node = %self.local, error = %e, "Coordinator did not acknowledge leave"),
            }
        }
    }

    /// Handle a membership message and produce its reply.
    pub async fn handle(&self, message: Message) -> Result<Message> {
        match message {
            Message::Join(request) => self.handle_join(request).await,
            Message::View(update) => {
                self.install(ViewChange {
                    previous: update.previous,
                    view: update.view,
                });
                Ok(Message::ViewAck {
                    view_id: self.view_id(),
                })
            }
            Message::Heartbeat {
                view_id,
                coordinator,
            } => {
                let current = self.current();
                if view_id >= current.id || current.is_coordinator(coordinator) {
                    *self.last_heartbeat.lock() = Instant::now();
                }
                Ok(Message::HeartbeatAck {
                    view_id: current.id,
                })
            }
            Message::Leave { node } => self.handle_leave(node).await,
            other => Err(Error::Internal(format!(
                "{} is not a membership message",
                other.kind()
            ))),
        }
    }

    async fn handle_join(&self, request: JoinRequest) -> Result<Message> {
        if request.cluster_name != self.cluster_name {
            return Ok(Message::JoinResponse(JoinResponse::Rejected {
                reason: format!(
                    "cluster name {:?} does not match {:?}",
                    request.cluster_name, self.cluster_name
                ),
            }));
        }

        let _changes = self.changes.lock().await;
        if !self.current().is_formed() {
            // Two nodes seeding each other: the lower id forms the cluster.
            let forms = self.joining.load(Ordering::SeqCst)
                && request.joining
                && self.local.id < request.node.id;
            if !forms {
                return Ok(Message::JoinResponse(JoinResponse::Retry));
            }
            self.form_singleton();
        }

        let current = self.current();
        if !current.is_coordinator(self.local.id) {
            let response = match current.coordinator() {
                Some(coordinator) => JoinResponse::Redirect {
                    coordinator: coordinator.clone(),
                },
                None => JoinResponse::Retry,
            };
            return Ok(Message::JoinResponse(response));
        }

        if current.contains(request.node.id) {
            return Ok(Message::JoinResponse(JoinResponse::Accepted {
                view: current,
                previous: self.previous(),
            }));
        }
        if request.view_size > 1 {
            return Ok(Message::JoinResponse(JoinResponse::Rejected {
                reason: format!(
                    "{} already belongs to a view of {} members",
                    request.node, request.view_size
                ),
            }));
        }

        let change = ViewChange {
            view: current.with_member(request.node.clone()),
            previous: current,
        };
        info!(joiner = %request.node, view = %change.view, "Admitting node");
        self.install(change.clone());
        self.broadcast(&change, Some(request.node.id)).await;

        Ok(Message::JoinResponse(JoinResponse::Accepted {
            view: change.view,
            previous: change.previous,
        }))
    }

    async fn handle_leave(&self, node: NodeId) -> Result<Message> {
        let current = self.current();
        if current.is_coordinator(self.local.id) {
            self.exclude(&HashSet::from([node]), "left").await;
            return Ok(Message::LeaveAck);
        }
        match current.coordinator() {
            Some(coordinator) => {
                self.transport
                    .request(coordinator, Message::Leave { node }, self.control_timeout)
                    .await
            }
            None => Ok(Message::LeaveAck),
        }
    }

    /// Remove `nodes` from the view, if this node coordinates it.
    async fn exclude(&self, nodes: &HashSet<NodeId>, reason: &'static str) -> bool {
        let _changes = self.changes.lock().await;
        let current = self.current();
        if !current.is_coordinator(self.local.id) {
            return false;
        }
        let remaining = current.without(nodes);
        if remaining.len() == current.len() {
            return false;
        }

        let change = ViewChange {
            view: remaining,
            previous: current,
        };
        for node in change.left() {
            info!(node = %node, reason, "Removing member");
        }
        self.install(change.clone());
        self.broadcast(&change, None).await;
        true
    }

    /// Send the view to every member except the local node and `skip`.
    async fn broadcast(&self, change: &ViewChange, skip: Option<NodeId>) {
        let targets: Vec<NodeAddress> = change
            .view
            .others(self.local.id)
            .into_iter()
            .filter(|member| Some(member.id) != skip)
            .collect();
        self.send_view(&targets, change).await;
    }

    async fn send_view(&self, targets: &[NodeAddress], change: &ViewChange) {
        if targets.is_empty() {
            return;
        }
        let message = Message::View(ViewUpdate {
            view: change.view.clone(),
            previous: change.previous.clone(),
        });
        let results = self
            .transport
            .anycast(targets, message, self.control_timeout)
            .await;
        for (peer, result) in results {
            if let Err(e) = result {
                warn!(peer = %peer, view_id = change.view.id, error = %e, "Member did not acknowledge view");
            }
        }
    }

    async fn run_failure_detector(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.leaving.load(Ordering::SeqCst) {
                continue;
            }
            let view = self.current();
            if !view.is_formed() {
                continue;
            }
            if view.is_coordinator(self.local.id) {
                self.check_members(&view).await;
            } else {
                self.watch_coordinator(&view).await;
            }
        }
        debug!(node = %self.local, "Failure detector stopped");
    }

    async fn check_members(&self, view: &ClusterView) {
        let others = view.others(self.local.id);
        if others.is_empty() {
            return;
        }
        let message = Message::Heartbeat {
            view_id: view.id,
            coordinator: self.local.id,
        };
        let results = self
            .transport
            .anycast(&others, message, self.config.heartbeat_interval)
            .await;

        let mut failed = HashSet::new();
        let mut lagging = Vec::new();
        {
            let mut missed = self.missed.lock();
            for (peer, result) in results {
                match result {
                    Ok(Message::HeartbeatAck { view_id }) => {
                        missed.remove(&peer);
                        if view_id < view.id {
                            lagging.extend(view.member(peer).cloned());
                        }
                    }
                    Ok(_) | Err(Error::Overloaded) => {
                        missed.remove(&peer);
                    }
                    Err(e) => {
                        let count = missed.entry(peer).or_insert(0);
                        *count += 1;
                        debug!(peer = %peer, missed = *count, error = %e, "Heartbeat missed");
                        if *count >= self.config.max_missed_heartbeats {
                            failed.insert(peer);
                        }
                    }
                }
            }
        }

        if !failed.is_empty() {
            self.exclude(&failed, "missed heartbeats").await;
        } else if !lagging.is_empty() {
            let change = ViewChange {
                previous: self.previous(),
                view: view.clone(),
            };
            debug!(members = lagging.len(), view_id = view.id, "Re-sending view to lagging members");
            self.send_view(&lagging, &change).await;
        }
    }

    async fn watch_coordinator(&self, view: &ClusterView) {
        let Some(position) = view.position(self.local.id) else {
            return;
        };
        let window = self.config.heartbeat_interval * (self.config.max_missed_heartbeats + 1);
        let silence = self.last_heartbeat.lock().elapsed();
        if silence < window * position as u32 {
            return;
        }

        let _changes = self.changes.lock().await;
        let current = self.current();
        if current.id != view.id {
            return;
        }
        let silent: HashSet<NodeId> = current.members[..position].iter().map(|m| m.id).collect();
        let change = ViewChange {
            view: current.without(&silent),
            previous: current,
        };
        warn!(
            node = %self.local,
            view = %change.view,
            silence_ms = silence.as_millis() as u64,
            "Coordinator silent, taking over"
        );
        self.install(change.clone());
        self.broadcast(&change, None).await;
    }
}

impl std::fmt::Debug for ViewManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewManager")
            .field("local", &self.local)
            .field("view", &*self.view_tx.borrow())
            .finish()
    }
}

/// Join retry delay with up to 50% jitter.
fn retry_delay(interval: Duration) -> Duration {
    let max_jitter = interval.as_millis() as u64 / 2;
    if max_jitter == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::network::{NetworkServer, RequestHandler, Responder};
    use crate::testing::utils::wait_for;
    use async_trait::async_trait;
    use tokio::net::TcpListener;

    #[test]
    fn test_retry_delay_jitter_bounds() {
        let interval = Duration::from_millis(100);
        for _ in 0..100 {
            let delay = retry_delay(interval);
            assert!(delay >= interval && delay <= Duration::from_millis(150));
        }
        assert_eq!(retry_delay(Duration::from_millis(1)), Duration::from_millis(1));
    }

    struct MembershipHandler(Arc<ViewManager>);

    #[async_trait]
    impl RequestHandler for MembershipHandler {
        async fn handle(&self, message: Message, responder: &mut Responder) -> Result<()> {
            let reply = self.0.handle(message).await?;
            responder.reply(reply).await
        }
    }

    struct Recorder(Mutex<Vec<ViewChange>>);

    impl ViewSubscriber for Recorder {
        fn on_view_change(&self, change: &ViewChange) {
            self.0.lock().push(change.clone());
        }
    }

    struct Member {
        local: NodeAddress,
        views: Arc<ViewManager>,
        shutdown: CancellationToken,
    }

    impl Member {
        fn addr(&self) -> SocketAddr {
            self.local.addr
        }

        fn view(&self) -> ClusterView {
            self.views.current()
        }
    }

    fn membership_config() -> MembershipConfig {
        MembershipConfig::default()
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_max_missed_heartbeats(3)
            .with_join_retry_interval(Duration::from_millis(50))
    }

    async fn member(cluster: &str, name: &str) -> Member {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let local = NodeAddress::new(NodeId::random(), name, addr);
        let shutdown = CancellationToken::new();
        let config = TransportConfig::default();
        let transport = Arc::new(Transport::new(local.id, config.clone(), shutdown.clone()));
        let views = Arc::new(ViewManager::new(
            local.clone(),
            cluster,
            membership_config(),
            Duration::from_secs(2),
            transport,
            shutdown.clone(),
        ));
        let server = NetworkServer::new(
            listener,
            Arc::new(MembershipHandler(views.clone())),
            config,
            shutdown.clone(),
        );
        tokio::spawn(server.run());
        views.start();
        Member { local, views, shutdown }
    }

    async fn join(member: &Member, seeds: &[SocketAddr]) -> Result<()> {
        member.views.join(seeds, Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn test_single_node_forms_cluster() {
        let a = member("weather", "a").await;
        assert!(!a.view().is_formed());

        join(&a, &[]).await.unwrap();
        let view = a.view();
        assert_eq!(view.id, 1);
        assert_eq!(view.len(), 1);
        assert!(a.views.is_coordinator());
    }

    #[tokio::test]
    async fn test_join_through_seed() {
        let a = member("weather", "a").await;
        let b = member("weather", "b").await;
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak: Weak<dyn ViewSubscriber> = Arc::downgrade(&recorder) as Weak<dyn ViewSubscriber>;
        a.views.subscribe(weak);

        join(&a, &[]).await.unwrap();
        join(&b, &[a.addr()]).await.unwrap();

        assert!(wait_for(|| a.view().len() == 2, Duration::from_secs(2), Duration::from_millis(10)).await);
        assert_eq!(a.view(), b.view());
        assert_eq!(a.view().id, 2);
        assert!(a.views.is_coordinator());
        assert!(!b.views.is_coordinator());
        assert_eq!(b.views.previous().id, 1);

        let changes = recorder.0.lock();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].joined()[0].id, b.local.id);
    }

    #[tokio::test]
    async fn test_join_redirected_to_coordinator() {
        let a = member("weather", "a").await;
        let b = member("weather", "b").await;
        let c = member("weather", "c").await;

        join(&a, &[]).await.unwrap();
        join(&b, &[a.addr()]).await.unwrap();
        join(&c, &[b.addr()]).await.unwrap();

        assert!(wait_for(
            || a.view().len() == 3 && b.view().len() == 3,
            Duration::from_secs(2),
            Duration::from_millis(10)
        )
        .await);
        assert_eq!(c.view().coordinator().unwrap().id, a.local.id);
    }

    #[tokio::test]
    async fn test_cluster_name_mismatch_rejected() {
        let a = member("weather", "a").await;
        let b = member("traffic", "b").await;
        join(&a, &[]).await.unwrap();

        match join(&b, &[a.addr()]).await {
            Err(Error::Rejected(reason)) => assert!(reason.contains("traffic")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(a.view().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_seed_forms_singleton() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let a = member("weather", "a").await;
        join(&a, &[dead]).await.unwrap();
        assert_eq!(a.view().len(), 1);
        assert!(a.views.is_coordinator());
    }

    #[tokio::test]
    async fn test_wait_for_members_times_out() {
        let a = member("weather", "a").await;
        join(&a, &[]).await.unwrap();

        match a.views.wait_for_members(2, Duration::from_millis(100)).await {
            Err(Error::ClusterFormationTimeout { expected, actual }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_member_excluded() {
        let a = member("weather", "a").await;
        let b = member("weather", "b").await;
        let c = member("weather", "c").await;
        join(&a, &[]).await.unwrap();
        join(&b, &[a.addr()]).await.unwrap();
        join(&c, &[a.addr()]).await.unwrap();
        assert!(wait_for(|| b.view().len() == 3, Duration::from_secs(2), Duration::from_millis(10)).await);

        let dead = c.local.id;
        c.shutdown.cancel();

        assert!(wait_for(
            || !a.view().contains(dead) && !b.view().contains(dead),
            Duration::from_secs(5),
            Duration::from_millis(20)
        )
        .await);
        assert_eq!(a.view(), b.view());
    }

    #[tokio::test]
    async fn test_member_takes_over_from_silent_coordinator() {
        let a = member("weather", "a").await;
        let b = member("weather", "b").await;
        join(&a, &[]).await.unwrap();
        join(&b, &[a.addr()]).await.unwrap();

        a.shutdown.cancel();

        assert!(wait_for(|| b.views.is_coordinator(), Duration::from_secs(5), Duration::from_millis(20)).await);
        assert_eq!(b.view().len(), 1);
        assert_eq!(b.view().id, 3);
    }

    #[tokio::test]
    async fn test_graceful_leave() {
        let a = member("weather", "a").await;
        let b = member("weather", "b").await;
        let c = member("weather", "c").await;
        join(&a, &[]).await.unwrap();
        join(&b, &[a.addr()]).await.unwrap();
        join(&c, &[a.addr()]).await.unwrap();
        assert!(wait_for(|| b.view().len() == 3, Duration::from_secs(2), Duration::from_millis(10)).await);

        c.views.leave().await;
        assert!(wait_for(
            || a.view().len() == 2 && b.view().len() == 2,
            Duration::from_secs(2),
            Duration::from_millis(10)
        )
        .await);

        // Coordinator hands over.
        a.views.leave().await;
        assert!(wait_for(|| b.views.is_coordinator(), Duration::from_secs(2), Duration::from_millis(10)).await);
        assert_eq!(b.view().len(), 1);
    }
}
