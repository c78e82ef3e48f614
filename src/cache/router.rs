//! Request routing over a topology snapshot.
//!
//! A route resolves the owner ids of a key's segment into member addresses
//! and splits off the local node, which is served from the entry store
//! instead of over the transport.

use crate::partitioning::{SegmentId, Topology};
use crate::types::{NodeAddress, NodeId};

/// Where to read a key from.
#[derive(Debug, Clone)]
pub struct ReadRoute {
    pub segment: SegmentId,
    /// The local node is one of the nodes to read from.
    pub local: bool,
    /// Remote nodes to try in order, previous holders first while the
    /// segment migrates.
    pub remote: Vec<NodeAddress>,
}

impl ReadRoute {
    /// Route a read of `key` issued on `local`.
    pub fn resolve(topology: &Topology, key: &str, local: NodeId) -> Self {
        let segment = topology.segment_of(key);
        let owners = topology.read_owners(segment);
        Self {
            segment,
            local: owners.contains(&local),
            remote: addresses(topology, &owners, local),
        }
    }
}

/// Where a write of a key must go.
#[derive(Debug, Clone)]
pub struct WriteRoute {
    pub segment: SegmentId,
    /// The local node owns the segment.
    pub local_owner: bool,
    /// The local node held the segment before the view change and still
    /// receives writes until migration finishes.
    pub local_forward: bool,
    /// Remote owners; their acknowledgements count toward the write.
    pub owners: Vec<NodeAddress>,
    /// Remote previous holders kept up to date during migration.
    pub forwards: Vec<NodeAddress>,
}

impl WriteRoute {
    /// Route a write of `key` issued on `local`.
    pub fn resolve(topology: &Topology, key: &str, local: NodeId) -> Self {
        let segment = topology.segment_of(key);
        let (owners, forwards) = topology.write_targets(segment);
        Self {
            segment,
            local_owner: owners.contains(&local),
            local_forward: forwards.contains(&local),
            owners: addresses(topology, &owners, local),
            forwards: addresses(topology, &forwards, local),
        }
    }

    /// Whether the write touches the local store.
    pub fn is_local(&self) -> bool {
        self.local_owner || self.local_forward
    }

    /// Every remote node the write is sent to, owners first.
    pub fn remote(&self) -> Vec<NodeAddress> {
        self.owners.iter().chain(&self.forwards).cloned().collect()
    }

    /// Whether `node` is a remote owner.
    pub fn is_remote_owner(&self, node: NodeId) -> bool {
        self.owners.iter().any(|owner| owner.id == node)
    }
}

fn addresses(topology: &Topology, ids: &[NodeId], local: NodeId) -> Vec<NodeAddress> {
    ids.iter()
        .filter(|id| **id != local)
        .filter_map(|id| topology.view().member(*id).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::view::ClusterView;
    use crate::partitioning::TransferPlan;
    use std::collections::HashSet;

    fn node(i: u16) -> NodeAddress {
        NodeAddress::new(
            NodeId::random(),
            format!("node-{}", i),
            format!("127.0.0.1:{}", 7800 + i).parse().unwrap(),
        )
    }

    #[test]
    fn test_read_route_splits_local_owner() {
        let members: Vec<_> = (0..3).map(node).collect();
        let view = ClusterView::new(1, members.clone());
        let topology = Topology::settled(view, 8, 2);

        for member in &members {
            let route = ReadRoute::resolve(&topology, "k1", member.id);
            let owners = topology.table().owners(route.segment);
            assert_eq!(route.local, owners.contains(&member.id));
            assert_eq!(route.remote.len(), if route.local { 1 } else { 2 });
            assert!(route.remote.iter().all(|r| r.id != member.id));
            // Remote owners keep table order.
            let expected: Vec<_> = owners.iter().filter(|id| **id != member.id).copied().collect();
            let actual: Vec<_> = route.remote.iter().map(|r| r.id).collect();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_write_route_settled_has_no_forwards() {
        let members: Vec<_> = (0..3).map(node).collect();
        let topology = Topology::settled(ClusterView::new(1, members.clone()), 16, 2);

        let route = WriteRoute::resolve(&topology, "Paris", members[0].id);
        assert!(route.forwards.is_empty());
        assert!(!route.local_forward);
        let acking = route.owners.len() + usize::from(route.local_owner);
        assert_eq!(acking, 2);
        assert_eq!(route.remote().len(), route.owners.len());
    }

    #[test]
    fn test_routes_during_migration() {
        let members: Vec<_> = (0..2).map(node).collect();
        let before = Topology::settled(ClusterView::new(1, members.clone()), 16, 2);

        let joiner = node(9);
        let mut grown = members.clone();
        grown.push(joiner.clone());
        let plan = TransferPlan::compute(
            &before.holders(),
            ClusterView::new(2, grown),
            16,
            2,
            joiner.id,
            &HashSet::new(),
        );
        let topology = plan.topology;

        let pulled = plan.pulls.first().expect("joiner gains segments");
        let key = (0..10_000)
            .map(|i| format!("key-{}", i))
            .find(|k| topology.segment_of(k) == pulled.segment)
            .unwrap();

        // The joiner reads from previous holders first.
        let read = ReadRoute::resolve(&topology, &key, joiner.id);
        assert!(read.local);
        assert!(members.iter().any(|m| m.id == read.remote[0].id));

        // A write from the joiner reaches the new owners and the departing holder.
        let write = WriteRoute::resolve(&topology, &key, joiner.id);
        assert!(write.local_owner);
        let mut reached: HashSet<NodeId> = write.remote().iter().map(|n| n.id).collect();
        reached.insert(joiner.id);
        for holder in before.table().owners(pulled.segment) {
            assert!(reached.contains(holder));
        }
    }
}
