//! Core types used throughout the clustered cache.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Stable identity of a node, generated once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh random identity.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw identity bytes, used as the rendezvous hash input.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first group is enough to tell nodes apart in logs.
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Everything a peer needs to reach a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Node identity.
    pub id: NodeId,
    /// Human readable name, shown in logs and listener events.
    pub name: String,
    /// Transport address the node accepts connections on.
    pub addr: SocketAddr,
}

impl NodeAddress {
    /// Create a new node address.
    pub fn new(id: NodeId, name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id,
            name: name.into(),
            addr,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

/// Replication mode of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Distributed, synchronous: writes return after every reachable owner applied them.
    #[default]
    DistSync,
}

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serialize a user value into the bytes stored on every owner.
pub(crate) fn encode_value<V: Serialize>(value: &V) -> Result<bytes::Bytes, bincode::Error> {
    bincode::serialize(value).map(bytes::Bytes::from)
}

/// Decode stored bytes back into the user type.
pub(crate) fn decode_value<V: DeserializeOwned>(data: &[u8]) -> Result<V, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_is_short() {
        let id = NodeId::random();
        assert_eq!(id.to_string().len(), 8);
        assert_ne!(id, NodeId::random());
    }

    #[test]
    fn test_node_address_display() {
        let addr = NodeAddress::new(NodeId::random(), "node-a", "127.0.0.1:7800".parse().unwrap());
        assert_eq!(addr.to_string(), "node-a@127.0.0.1:7800");
    }

    #[test]
    fn test_value_encoding_is_stable() {
        let value = (18.5f32, 0.4f32, "Madrid".to_string());
        let first = encode_value(&value).unwrap();
        let second = encode_value(&value).unwrap();
        assert_eq!(first, second);
        let decoded: (f32, f32, String) = decode_value(&first).unwrap();
        assert_eq!(decoded, value);
    }
}
