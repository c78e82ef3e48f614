//! Ownership queries and view-change transfer plans.

use crate::cluster::view::ClusterView;
use crate::partitioning::segments::{segment_of, SegmentId, SegmentTable};
use crate::types::NodeId;
use std::collections::HashSet;

/// Ownership information for a key.
#[derive(Debug, Clone)]
pub struct KeyOwnership {
    /// The key.
    pub key: String,

    /// Segment the key hashes to.
    pub segment: SegmentId,

    /// Primary owner node.
    pub primary: Option<NodeId>,

    /// Backup nodes (in order of preference).
    pub backups: Vec<NodeId>,
}

impl KeyOwnership {
    /// Get all owner nodes (primary + backups).
    pub fn all_owners(&self) -> Vec<NodeId> {
        self.primary.iter().chain(self.backups.iter()).copied().collect()
    }
}

/// The routing snapshot for one view: the segment table plus, while entries
/// are migrating, the previous holders of each changed segment that are still
/// members.
///
/// Snapshots are immutable and replaced wholesale on every view change.
#[derive(Debug, Clone)]
pub struct Topology {
    view: ClusterView,
    table: SegmentTable,
    sources: Option<Vec<Vec<NodeId>>>,
}

impl Topology {
    /// A settled topology for `view`.
    pub fn settled(view: ClusterView, num_segments: u32, num_owners: usize) -> Self {
        let table = SegmentTable::compute(&view, num_segments, num_owners);
        Self {
            view,
            table,
            sources: None,
        }
    }

    /// The view this snapshot routes for.
    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    /// The segment table of the view.
    pub fn table(&self) -> &SegmentTable {
        &self.table
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.table.num_segments()
    }

    /// Segment of a key.
    pub fn segment_of(&self, key: &str) -> SegmentId {
        segment_of(key, self.table.num_segments())
    }

    /// Ownership of a key under the new table.
    pub fn ownership(&self, key: &str) -> KeyOwnership {
        let segment = self.segment_of(key);
        KeyOwnership {
            key: key.to_string(),
            segment,
            primary: self.table.primary(segment),
            backups: self.table.owners(segment).iter().skip(1).copied().collect(),
        }
    }

    /// Whether `segment` is still being transferred to new owners.
    pub fn is_migrating(&self, segment: SegmentId) -> bool {
        self.sources
            .as_ref()
            .and_then(|s| s.get(segment as usize))
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    /// Whether any segment is migrating.
    pub fn in_transition(&self) -> bool {
        self.migrating_segments() > 0
    }

    /// Number of migrating segments.
    pub fn migrating_segments(&self) -> usize {
        self.sources
            .as_ref()
            .map(|s| s.iter().filter(|holders| !holders.is_empty()).count())
            .unwrap_or(0)
    }

    /// Previous holders of a migrating segment that are still members.
    pub fn sources(&self, segment: SegmentId) -> &[NodeId] {
        self.sources
            .as_ref()
            .and_then(|s| s.get(segment as usize))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes to read a segment from, in order. Previous holders come first
    /// while the segment migrates.
    pub fn read_owners(&self, segment: SegmentId) -> Vec<NodeId> {
        let mut owners: Vec<NodeId> = self.sources(segment).to_vec();
        for id in self.table.owners(segment) {
            if !owners.contains(id) {
                owners.push(*id);
            }
        }
        owners
    }

    /// Nodes a write must reach: the new owners, and the previous holders
    /// outside the new owners while the segment migrates.
    pub fn write_targets(&self, segment: SegmentId) -> (Vec<NodeId>, Vec<NodeId>) {
        let owners = self.table.owners(segment).to_vec();
        let forwards = self
            .sources(segment)
            .iter()
            .filter(|id| !owners.contains(id))
            .copied()
            .collect();
        (owners, forwards)
    }

    /// Every node that may hold entries of each segment right now.
    pub fn holders(&self) -> Vec<Vec<NodeId>> {
        (0..self.num_segments()).map(|s| self.read_owners(s)).collect()
    }

    /// The same view with migration finished.
    pub fn settle(&self) -> Self {
        Self {
            view: self.view.clone(),
            table: self.table.clone(),
            sources: None,
        }
    }
}

/// A segment the local node must pull, with the nodes to pull it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPull {
    pub segment: SegmentId,
    pub sources: Vec<NodeId>,
}

/// Result of diffing the previous holders against a new segment table.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    /// Segments the local node gained, to be pulled from previous holders.
    pub pulls: Vec<SegmentPull>,

    /// Segments the local node lost, dropped once transfer completes.
    pub dropped: Vec<SegmentId>,

    /// Routing snapshot to install for the new view.
    pub topology: Topology,
}

impl TransferPlan {
    /// Diff `holders` (per segment, the nodes that held entries before the
    /// view change) against the table for `view`.
    ///
    /// Segments in `unfinished` were being pulled when the view changed and are
    /// pulled again if the local node still owns them.
    pub fn compute(
        holders: &[Vec<NodeId>],
        view: ClusterView,
        num_segments: u32,
        num_owners: usize,
        local: NodeId,
        unfinished: &HashSet<SegmentId>,
    ) -> Self {
        let table = SegmentTable::compute(&view, num_segments, num_owners);
        let mut sources = Vec::with_capacity(num_segments as usize);
        let mut pulls = Vec::new();
        let mut dropped = Vec::new();

        for segment in 0..num_segments {
            let old: &[NodeId] = holders.get(segment as usize).map(Vec::as_slice).unwrap_or(&[]);
            let new = table.owners(segment);

            let old_set: HashSet<&NodeId> = old.iter().collect();
            let new_set: HashSet<&NodeId> = new.iter().collect();
            if old_set == new_set {
                sources.push(Vec::new());
                continue;
            }

            let surviving: Vec<NodeId> = old.iter().filter(|id| view.contains(**id)).copied().collect();

            let was_holder = old.contains(&local);
            let is_owner = new.contains(&local);
            if is_owner && (!was_holder || unfinished.contains(&segment)) {
                let from: Vec<NodeId> = surviving.iter().filter(|id| **id != local).copied().collect();
                if !from.is_empty() {
                    pulls.push(SegmentPull {
                        segment,
                        sources: from,
                    });
                }
            }
            if was_holder && !is_owner {
                dropped.push(segment);
            }

            sources.push(surviving);
        }

        let migrating = sources.iter().any(|s| !s.is_empty());
        let topology = Topology {
            view,
            table,
            sources: migrating.then_some(sources),
        };

        Self {
            pulls,
            dropped,
            topology,
        }
    }
}
