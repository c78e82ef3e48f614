//! Network communication layer.

pub mod rpc;
pub mod server;
pub mod transport;

pub use rpc::{Frame, JoinRequest, JoinResponse, Message, MessageKind, ReplicateRequest, ViewUpdate};
pub use server::{NetworkServer, RequestHandler, Responder};
pub use transport::{ReplyStream, Transport};
