//! Immutable, versioned cluster views.

use crate::types::{NodeAddress, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Ordered membership snapshot. The coordinator is the first member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    /// Monotonic view version.
    pub id: u64,
    /// Members in join order.
    pub members: Vec<NodeAddress>,
}

impl ClusterView {
    /// Create a view with the given id and members.
    pub fn new(id: u64, members: Vec<NodeAddress>) -> Self {
        Self { id, members }
    }

    /// The provisional view a node holds before it has joined or formed a cluster.
    pub fn unformed(local: NodeAddress) -> Self {
        Self::new(0, vec![local])
    }

    /// Whether this view has been installed by a join or formation.
    pub fn is_formed(&self) -> bool {
        self.id > 0
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the view has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The coordinator, if any.
    pub fn coordinator(&self) -> Option<&NodeAddress> {
        self.members.first()
    }

    /// Whether `node` is the coordinator of this view.
    pub fn is_coordinator(&self, node: NodeId) -> bool {
        self.coordinator().map(|c| c.id == node).unwrap_or(false)
    }

    /// Whether `node` is a member.
    pub fn contains(&self, node: NodeId) -> bool {
        self.members.iter().any(|m| m.id == node)
    }

    /// Look up a member's address.
    pub fn member(&self, node: NodeId) -> Option<&NodeAddress> {
        self.members.iter().find(|m| m.id == node)
    }

    /// Position of `node` in the view.
    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|m| m.id == node)
    }

    /// Member ids in view order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// The next view with `node` appended.
    pub fn with_member(&self, node: NodeAddress) -> Self {
        let mut members = self.members.clone();
        if !self.contains(node.id) {
            members.push(node);
        }
        Self::new(self.id + 1, members)
    }

    /// The next view without the given nodes.
    pub fn without(&self, nodes: &HashSet<NodeId>) -> Self {
        let members = self
            .members
            .iter()
            .filter(|m| !nodes.contains(&m.id))
            .cloned()
            .collect();
        Self::new(self.id + 1, members)
    }

    /// Every member except `node`.
    pub fn others(&self, node: NodeId) -> Vec<NodeAddress> {
        self.members.iter().filter(|m| m.id != node).cloned().collect()
    }
}

impl fmt::Display for ClusterView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|", self.id)?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&member.name)?;
        }
        f.write_str("]")
    }
}

/// A view transition, delivered to view subscribers.
#[derive(Debug, Clone)]
pub struct ViewChange {
    /// The view the installing coordinator replaced.
    pub previous: ClusterView,
    /// The newly installed view.
    pub view: ClusterView,
}

impl ViewChange {
    /// Members present in the new view but not the previous one.
    pub fn joined(&self) -> Vec<NodeAddress> {
        self.view
            .members
            .iter()
            .filter(|m| !self.previous.contains(m.id))
            .cloned()
            .collect()
    }

    /// Members present in the previous view but not the new one.
    pub fn left(&self) -> Vec<NodeAddress> {
        self.previous
            .members
            .iter()
            .filter(|m| !self.view.contains(m.id))
            .cloned()
            .collect()
    }
}
