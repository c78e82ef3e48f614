//! Segment allocation.
//!
//! Keys hash into `num_segments` segments. Each segment is owned by up to
//! `num_owners` nodes chosen by rendezvous hashing, primary first. The table
//! is a pure function of the view members and the two parameters, so every
//! node computes the same table for the same view.

use crate::cluster::view::ClusterView;
use crate::types::NodeId;
use std::collections::HashMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Index of a hash segment.
pub type SegmentId = u32;

/// Segment of a key: `xxHash64(key) mod num_segments`.
pub fn segment_of(key: &str, num_segments: u32) -> SegmentId {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key.as_bytes());
    (hasher.finish() % num_segments as u64) as SegmentId
}

/// Rendezvous score of a node for a segment.
fn score(segment: SegmentId, node: NodeId) -> u64 {
    let mut hasher = XxHash64::with_seed(segment as u64);
    hasher.write(node.as_bytes());
    hasher.finish()
}

/// Nodes ranked for a segment: highest score first, ties broken by view order.
fn ranking(segment: SegmentId, members: &[NodeId]) -> Vec<NodeId> {
    let mut ranked: Vec<(u64, usize, NodeId)> = members
        .iter()
        .enumerate()
        .map(|(pos, id)| (score(segment, *id), pos, *id))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    ranked.into_iter().map(|(_, _, id)| id).collect()
}

/// Owners of every segment for one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTable {
    view_id: u64,
    owners: Vec<Vec<NodeId>>,
}

impl SegmentTable {
    /// Compute the table for `view`.
    pub fn compute(view: &ClusterView, num_segments: u32, num_owners: usize) -> Self {
        let members = view.ids();
        let n = members.len();
        if n == 0 {
            return Self {
                view_id: view.id,
                owners: vec![Vec::new(); num_segments as usize],
            };
        }

        let s = num_segments as usize;
        let o = num_owners.min(n);
        let slot_cap = (s * o).div_ceil(n);
        let primary_cap = s.div_ceil(n);

        let rankings: Vec<Vec<NodeId>> = (0..num_segments)
            .map(|segment| ranking(segment, &members))
            .collect();
        let mut owners: Vec<Vec<NodeId>> = rankings
            .iter()
            .map(|ranked| ranked.iter().take(o).copied().collect())
            .collect();

        Self::cap_slots(&mut owners, &rankings, &members, slot_cap);
        Self::balance_primaries(&mut owners, &rankings, primary_cap);

        Self {
            view_id: view.id,
            owners,
        }
    }

    /// Hand segments of nodes above the slot cap to the best-ranked node below it.
    ///
    /// A node above the cap always owns some segment that a node below the cap
    /// does not, so each step makes progress.
    fn cap_slots(owners: &mut [Vec<NodeId>], rankings: &[Vec<NodeId>], members: &[NodeId], cap: usize) {
        let mut slots: HashMap<NodeId, usize> = members.iter().map(|id| (*id, 0)).collect();
        for list in owners.iter() {
            for id in list {
                *slots.entry(*id).or_insert(0) += 1;
            }
        }

        for heavy in members {
            while slots[heavy] > cap {
                let mut moved = false;
                for (segment, list) in owners.iter_mut().enumerate() {
                    let Some(pos) = list.iter().position(|id| id == heavy) else {
                        continue;
                    };
                    let light = rankings[segment]
                        .iter()
                        .find(|id| !list.contains(id) && slots[*id] < cap)
                        .copied();
                    if let Some(light) = light {
                        list[pos] = light;
                        let ranked = &rankings[segment];
                        list.sort_by_key(|id| ranked.iter().position(|r| r == id));
                        *slots.entry(*heavy).or_insert(0) -= 1;
                        *slots.entry(light).or_insert(0) += 1;
                        moved = true;
                        break;
                    }
                }
                if !moved {
                    break;
                }
            }
        }
    }

    /// Swap an overloaded primary with the next-ranked backup that still has room.
    fn balance_primaries(owners: &mut [Vec<NodeId>], rankings: &[Vec<NodeId>], cap: usize) {
        let mut primaries: HashMap<NodeId, usize> = HashMap::new();
        for list in owners.iter() {
            if let Some(primary) = list.first() {
                *primaries.entry(*primary).or_insert(0) += 1;
            }
        }

        for (segment, list) in owners.iter_mut().enumerate() {
            let Some(&primary) = list.first() else {
                continue;
            };
            if primaries[&primary] <= cap {
                continue;
            }
            let lighter = rankings[segment]
                .iter()
                .filter(|id| **id != primary && list.contains(id))
                .find(|id| primaries.get(id).copied().unwrap_or(0) < cap)
                .copied();
            if let Some(backup) = lighter {
                if let Some(pos) = list.iter().position(|id| *id == backup) {
                    list.swap(0, pos);
                    *primaries.entry(primary).or_insert(0) -= 1;
                    *primaries.entry(backup).or_insert(0) += 1;
                }
            }
        }
    }

    /// View this table was computed for.
    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Owners of a segment, primary first.
    pub fn owners(&self, segment: SegmentId) -> &[NodeId] {
        self.owners
            .get(segment as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Primary owner of a segment.
    pub fn primary(&self, segment: SegmentId) -> Option<NodeId> {
        self.owners(segment).first().copied()
    }

    /// Whether `node` owns `segment`.
    pub fn is_owner(&self, segment: SegmentId, node: NodeId) -> bool {
        self.owners(segment).contains(&node)
    }

    /// Segments owned by `node`.
    pub fn segments_of(&self, node: NodeId) -> Vec<SegmentId> {
        (0..self.num_segments())
            .filter(|s| self.is_owner(*s, node))
            .collect()
    }

    /// Number of segments each node owns.
    pub fn owned_counts(&self) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for list in &self.owners {
            for id in list {
                *counts.entry(*id).or_insert(0) += 1;
            }
        }
        counts
    }
}
