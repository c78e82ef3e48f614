//! Outbound side of the transport: pooled peer connections and correlated RPC.
//!
//! One connection is kept per peer. A reader task demultiplexes replies by
//! correlation id into the pending table. Dropping a connection (peer left
//! the view, socket closed) drops every pending sender, which callers
//! observe as [`Error::PeerUnreachable`].

use crate::cluster::view::ClusterView;
use crate::config::TransportConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Frame, Message};
use crate::types::{NodeAddress, NodeId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

enum PendingReply {
    Single(oneshot::Sender<Message>),
    Stream(mpsc::UnboundedSender<Message>),
}

struct PeerConnection {
    peer: NodeAddress,
    writer: Mutex<OwnedWriteHalf>,
    pending: DashMap<u64, PendingReply>,
    closed: CancellationToken,
}

impl PeerConnection {
    async fn send(&self, frame: &Frame, max_frame_size: usize) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame, max_frame_size).await
    }

    fn deliver(&self, frame: Frame) {
        let correlation_id = frame.correlation_id;
        if frame.kind.is_terminal() {
            match self.pending.remove(&correlation_id) {
                Some((_, PendingReply::Single(tx))) => {
                    let _ = tx.send(frame.message);
                }
                Some((_, PendingReply::Stream(tx))) => {
                    let _ = tx.send(frame.message);
                }
                None => trace!(peer = %self.peer, correlation_id, "Late reply dropped"),
            }
        } else if let Some(pending) = self.pending.get(&correlation_id) {
            if let PendingReply::Stream(tx) = pending.value() {
                let _ = tx.send(frame.message);
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
        self.pending.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Replies to a streamed request, in arrival order.
pub struct ReplyStream {
    rx: mpsc::UnboundedReceiver<Message>,
    conn: Arc<PeerConnection>,
    correlation_id: u64,
}

impl ReplyStream {
    /// Wait for the next reply.
    pub async fn next(&mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => reply_result(message),
            Ok(None) => Err(Error::PeerUnreachable(self.conn.peer.id)),
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        self.conn.pending.remove(&self.correlation_id);
    }
}

/// Point-to-point and anycast RPC over pooled TCP connections.
pub struct Transport {
    /// This node.
    local: NodeId,

    /// Transport settings.
    config: TransportConfig,

    /// Open connections by peer.
    connections: DashMap<NodeId, Arc<PeerConnection>>,

    /// Counter for generating unique correlation ids.
    next_correlation_id: AtomicU64,

    /// Closes every connection on shutdown.
    shutdown: CancellationToken,
}

impl Transport {
    /// Create a new transport.
    pub fn new(local: NodeId, config: TransportConfig, shutdown: CancellationToken) -> Self {
        Self {
            local,
            config,
            connections: DashMap::new(),
            next_correlation_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Number of open peer connections.
    pub fn connection_count(&self) -> usize {
        self.connections.iter().filter(|c| !c.is_closed()).count()
    }

    /// Send a request and wait for its reply.
    pub async fn request(
        &self,
        peer: &NodeAddress,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let (conn, correlation_id, rx) = {
            let conn = self.connection(peer).await?;
            let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            conn.pending.insert(correlation_id, PendingReply::Single(tx));
            (conn, correlation_id, rx)
        };

        let kind = message.kind();
        trace!(peer = %peer, %kind, correlation_id, "Sending request");
        self.send(&conn, Frame::new(correlation_id, message)).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply_result(reply),
            Ok(Err(_)) => Err(Error::PeerUnreachable(peer.id)),
            Err(_) => {
                conn.pending.remove(&correlation_id);
                debug!(peer = %peer, %kind, "Request timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Send a request whose reply arrives as several frames.
    pub async fn request_stream(&self, peer: &NodeAddress, message: Message) -> Result<ReplyStream> {
        let conn = self.connection(peer).await?;
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        conn.pending.insert(correlation_id, PendingReply::Stream(tx));
        let stream = ReplyStream {
            rx,
            conn: conn.clone(),
            correlation_id,
        };

        self.send(&conn, Frame::new(correlation_id, message)).await?;
        Ok(stream)
    }

    /// Send the same request to each peer in parallel. Results keep the order of `peers`.
    pub async fn anycast(
        &self,
        peers: &[NodeAddress],
        message: Message,
        timeout: Duration,
    ) -> Vec<(NodeId, Result<Message>)> {
        let requests = peers.iter().map(|peer| {
            let message = message.clone();
            async move { (peer.id, self.request(peer, message, timeout).await) }
        });
        futures::future::join_all(requests).await
    }

    /// Drop connections to nodes outside `view`, failing their pending requests.
    pub fn retain_peers(&self, view: &ClusterView) {
        self.connections.retain(|id, conn| {
            let keep = view.contains(*id);
            if !keep {
                debug!(peer = %conn.peer, "Closing connection to departed peer");
                conn.close();
            }
            keep
        });
    }

    /// Drop the connection to one peer.
    pub fn disconnect(&self, peer: NodeId) {
        if let Some((_, conn)) = self.connections.remove(&peer) {
            conn.close();
        }
    }

    /// Close every connection.
    pub fn close_all(&self) {
        self.connections.retain(|_, conn| {
            conn.close();
            false
        });
    }

    async fn send(&self, conn: &Arc<PeerConnection>, frame: Frame) -> Result<()> {
        match conn.send(&frame, self.config.max_frame_size).await {
            Ok(()) => Ok(()),
            Err(Error::Network(NetworkError::Io(e))) => {
                debug!(peer = %conn.peer, error = %e, "Send failed, dropping connection");
                conn.pending.remove(&frame.correlation_id);
                conn.close();
                Err(Error::PeerUnreachable(conn.peer.id))
            }
            Err(e) => {
                conn.pending.remove(&frame.correlation_id);
                Err(e)
            }
        }
    }

    async fn connection(&self, peer: &NodeAddress) -> Result<Arc<PeerConnection>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        if peer.id == self.local {
            return Err(Error::Internal("transport asked to connect to itself".into()));
        }
        if let Some(conn) = self.connections.get(&peer.id) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(peer.addr))
            .await
            .map_err(|_| Error::PeerUnreachable(peer.id))?
            .map_err(|e| {
                debug!(peer = %peer, error = %e, "Connection failed");
                Error::PeerUnreachable(peer.id)
            })?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let conn = Arc::new(PeerConnection {
            peer: peer.clone(),
            writer: Mutex::new(writer),
            pending: DashMap::new(),
            closed: self.shutdown.child_token(),
        });

        match self.connections.entry(peer.id) {
            // Lost a connect race; use the winner and let ours drop.
            Entry::Occupied(entry) if !entry.get().is_closed() => return Ok(entry.get().clone()),
            Entry::Occupied(mut entry) => {
                entry.insert(conn.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(conn.clone());
            }
        }

        debug!(peer = %peer, "Connected to peer");
        tokio::spawn(Self::read_replies(
            conn.clone(),
            reader,
            self.config.max_frame_size,
        ));
        Ok(conn)
    }

    async fn read_replies(conn: Arc<PeerConnection>, mut reader: OwnedReadHalf, max_frame_size: usize) {
        loop {
            let frame = tokio::select! {
                _ = conn.closed.cancelled() => break,
                frame = read_frame(&mut reader, max_frame_size) => frame,
            };
            match frame {
                Ok(Some(frame)) => conn.deliver(frame),
                Ok(None) => {
                    debug!(peer = %conn.peer, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    debug!(peer = %conn.peer, error = %e, "Failed to read reply");
                    break;
                }
            }
        }
        conn.close();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local", &self.local)
            .field("connections", &self.connections.len())
            .finish()
    }
}

/// Map protocol-level failure replies to errors.
fn reply_result(message: Message) -> Result<Message> {
    match message {
        Message::Overloaded => Err(Error::Overloaded),
        Message::Error { reason } => Err(Error::Remote(reason)),
        other => Ok(other),
    }
}
