//! Wire messages and framing.
//!
//! Every frame is a 4-byte big-endian length prefix followed by the bincode
//! encoding of a [`Frame`]: `(version, kind, correlation_id, message)`.

use crate::cache::transfer::TransferEntry;
use crate::cluster::view::ClusterView;
use crate::error::{NetworkError, Result};
use crate::types::{NodeAddress, NodeId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version carried by every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Discriminant of a [`Message`], carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Join,
    JoinResponse,
    View,
    ViewAck,
    Heartbeat,
    HeartbeatAck,
    Leave,
    LeaveAck,
    RemoteGet,
    RemoteGetResponse,
    Replicate,
    ReplicateAck,
    Invalidate,
    InvalidateAck,
    StateTransferRequest,
    StateTransferChunk,
    StateTransferEnd,
    TransferComplete,
    StatsRequest,
    StatsResponse,
    Overloaded,
    Error,
}

impl MessageKind {
    /// Membership traffic. Dispatched on its own queue; a data request
    /// waiting for a view must not block the view that releases it.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageKind::Join
                | MessageKind::View
                | MessageKind::Heartbeat
                | MessageKind::Leave
                | MessageKind::StatsRequest
        )
    }

    /// Replies that end a streamed exchange.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageKind::StateTransferChunk)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Network message for all node-to-node communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Ask to be added to the cluster.
    Join(JoinRequest),
    /// Outcome of a join.
    JoinResponse(JoinResponse),
    /// A new view installed by the coordinator.
    View(ViewUpdate),
    /// The receiver's view id after handling a view or transfer notice.
    ViewAck { view_id: u64 },
    /// Coordinator liveness check.
    Heartbeat { view_id: u64, coordinator: NodeId },
    /// Reply to a heartbeat with the member's view id.
    HeartbeatAck { view_id: u64 },
    /// Graceful departure.
    Leave { node: NodeId },
    /// Reply to a leave.
    LeaveAck,
    /// Read a key from an owner's local store.
    RemoteGet { key: String, view_id: u64 },
    /// Local value at the owner, if live.
    RemoteGetResponse { value: Option<Bytes> },
    /// Store an entry on an owner.
    Replicate(ReplicateRequest),
    /// The owner applied the entry.
    ReplicateAck,
    /// Remove a key from an owner.
    Invalidate { key: String, view_id: u64 },
    /// Whether the owner held a live entry.
    InvalidateAck { existed: bool },
    /// Stream all entries of the listed segments.
    StateTransferRequest { view_id: u64, segments: Vec<u32> },
    /// A batch of transferred entries.
    StateTransferChunk { entries: Vec<TransferEntry> },
    /// End of a transfer stream.
    StateTransferEnd { view_id: u64, entries: u64 },
    /// The sender finished pulling its segments for the view.
    TransferComplete { view_id: u64, node: NodeId },
    /// Ask for the local entry count.
    StatsRequest,
    /// Local entry count of the responder.
    StatsResponse { entries: u64 },
    /// The receiver's inbound queue was full.
    Overloaded,
    /// The request failed on the receiver.
    Error { reason: String },
}

impl Message {
    /// The kind carried in the frame header.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Join(_) => MessageKind::Join,
            Message::JoinResponse(_) => MessageKind::JoinResponse,
            Message::View(_) => MessageKind::View,
            Message::ViewAck { .. } => MessageKind::ViewAck,
            Message::Heartbeat { .. } => MessageKind::Heartbeat,
            Message::HeartbeatAck { .. } => MessageKind::HeartbeatAck,
            Message::Leave { .. } => MessageKind::Leave,
            Message::LeaveAck => MessageKind::LeaveAck,
            Message::RemoteGet { .. } => MessageKind::RemoteGet,
            Message::RemoteGetResponse { .. } => MessageKind::RemoteGetResponse,
            Message::Replicate(_) => MessageKind::Replicate,
            Message::ReplicateAck => MessageKind::ReplicateAck,
            Message::Invalidate { .. } => MessageKind::Invalidate,
            Message::InvalidateAck { .. } => MessageKind::InvalidateAck,
            Message::StateTransferRequest { .. } => MessageKind::StateTransferRequest,
            Message::StateTransferChunk { .. } => MessageKind::StateTransferChunk,
            Message::StateTransferEnd { .. } => MessageKind::StateTransferEnd,
            Message::TransferComplete { .. } => MessageKind::TransferComplete,
            Message::StatsRequest => MessageKind::StatsRequest,
            Message::StatsResponse { .. } => MessageKind::StatsResponse,
            Message::Overloaded => MessageKind::Overloaded,
            Message::Error { .. } => MessageKind::Error,
        }
    }
}

/// Join request sent to a seed or the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Cluster the joiner wants to be part of.
    pub cluster_name: String,
    /// The joining node.
    pub node: NodeAddress,
    /// Members in the joiner's current view.
    pub view_size: usize,
    /// Whether the joiner is itself still trying to join seeds.
    pub joining: bool,
}

/// Outcome of a join request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JoinResponse {
    /// The joiner is a member of `view`, installed over `previous`.
    Accepted {
        view: ClusterView,
        previous: ClusterView,
    },
    /// Ask the coordinator instead.
    Redirect { coordinator: NodeAddress },
    /// Two lone nodes found each other; the one with the lower id coordinates.
    Retry,
    /// The join is not allowed.
    Rejected { reason: String },
}

/// A view installed by the coordinator, together with the view it replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewUpdate {
    pub view: ClusterView,
    pub previous: ClusterView,
}

/// Entry written to an owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub key: String,
    pub value: Bytes,
    /// Creation time assigned by the writing node.
    pub created_at: u64,
    pub lifespan_ms: u64,
    pub view_id: u64,
}

/// A message with its header fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub version: u8,
    pub kind: MessageKind,
    pub correlation_id: u64,
    pub message: Message,
}

impl Frame {
    /// Wrap a message for sending.
    pub fn new(correlation_id: u64, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: message.kind(),
            correlation_id,
            message,
        }
    }
}

/// Encode a frame to bytes.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    Ok(bincode::serialize(frame)?)
}

/// Decode a frame from bytes, checking the header.
pub fn decode_frame(data: &[u8]) -> Result<Frame> {
    let frame: Frame = bincode::deserialize(data)?;
    if frame.version != PROTOCOL_VERSION {
        return Err(NetworkError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: frame.version,
        }
        .into());
    }
    if frame.kind != frame.message.kind() {
        return Err(NetworkError::UnexpectedReply(format!(
            "header kind {} does not match {}",
            frame.kind,
            frame.message.kind()
        ))
        .into());
    }
    Ok(frame)
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(frame: &Frame, max_frame_size: usize) -> Result<Vec<u8>> {
    let data = encode_frame(frame)?;
    if data.len() > max_frame_size {
        return Err(NetworkError::FrameTooLarge {
            size: data.len(),
            max: max_frame_size,
        }
        .into());
    }
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Read one frame. Returns `None` when the peer closed the connection cleanly.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        }
        .into());
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(NetworkError::Io)?;

    decode_frame(&data).map(Some)
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, max_frame_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(frame, max_frame_size)?;
    writer.write_all(&framed).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    const MAX: usize = 16 * 1024 * 1024;

    #[test]
    fn test_frame_header_matches_message() {
        let frame = Frame::new(
            42,
            Message::RemoteGet {
                key: "Madrid".to_string(),
                view_id: 3,
            },
        );
        assert_eq!(frame.version, PROTOCOL_VERSION);
        assert_eq!(frame.kind, MessageKind::RemoteGet);

        let decoded = decode_frame(&encode_frame(&frame).unwrap()).unwrap();
        assert_eq!(decoded.correlation_id, 42);
        match decoded.message {
            Message::RemoteGet { key, view_id } => {
                assert_eq!(key, "Madrid");
                assert_eq!(view_id, 3);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut frame = Frame::new(1, Message::StatsRequest);
        frame.version = PROTOCOL_VERSION + 1;
        let err = decode_frame(&encode_frame(&frame).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            Error::Network(NetworkError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut frame = Frame::new(1, Message::StatsRequest);
        frame.kind = MessageKind::Join;
        assert!(decode_frame(&encode_frame(&frame).unwrap()).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::new(
            1,
            Message::Replicate(ReplicateRequest {
                key: "k".to_string(),
                value: Bytes::from(vec![0u8; 128]),
                created_at: 0,
                lifespan_ms: 1,
                view_id: 1,
            }),
        );
        assert!(matches!(
            frame_message(&frame, 64),
            Err(Error::Network(NetworkError::FrameTooLarge { .. }))
        ));
    }

    #[test]
    fn test_control_and_terminal_kinds() {
        assert!(MessageKind::View.is_control());
        assert!(MessageKind::Join.is_control());
        assert!(!MessageKind::Replicate.is_control());
        assert!(!MessageKind::StateTransferChunk.is_terminal());
        assert!(MessageKind::StateTransferEnd.is_terminal());
        assert!(MessageKind::Overloaded.is_terminal());
    }

    #[tokio::test]
    async fn test_read_write_frame_over_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Frame::new(7, Message::InvalidateAck { existed: true });
        write_frame(&mut client, &frame, MAX).await.unwrap();
        drop(client);

        let read = read_frame(&mut server, MAX).await.unwrap().unwrap();
        assert_eq!(read.correlation_id, 7);
        assert!(matches!(read.message, Message::InvalidateAck { existed: true }));

        // Clean EOF after the last frame.
        assert!(read_frame(&mut server, MAX).await.unwrap().is_none());
    }
}
