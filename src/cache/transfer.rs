//! State transfer bookkeeping.
//!
//! After a view change every member pulls the segments it gained from their
//! previous holders, then announces completion to the whole view. Entries of
//! segments a node lost are only dropped once every member has announced
//! completion for the same view.

use crate::partitioning::{SegmentId, SegmentPull};
use crate::types::NodeId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A cache entry being transferred between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    /// The cache key.
    pub key: String,

    /// The serialized value.
    pub value: Bytes,

    /// Creation time assigned by the original writer, in milliseconds.
    pub created_at: u64,

    /// Lifespan in milliseconds.
    pub lifespan_ms: u64,
}

/// Bytes reserved in a chunk frame for the header and message framing.
pub const CHUNK_FRAME_OVERHEAD: usize = 64;

/// Encoded size of an entry inside a chunk.
fn encoded_len(entry: &TransferEntry) -> usize {
    bincode::serialized_size(entry)
        .map(|n| n as usize)
        .unwrap_or_else(|_| entry.key.len() + entry.value.len() + 32)
}

/// Split entries into chunks of at most `chunk_size` entries and at most
/// `max_bytes` encoded bytes. An entry larger than `max_bytes` travels alone.
pub fn chunk_entries(entries: Vec<TransferEntry>, chunk_size: usize, max_bytes: usize) -> Vec<Vec<TransferEntry>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0;
    for entry in entries {
        let size = encoded_len(&entry);
        if !current.is_empty() && (current.len() == chunk_size || current_bytes + size > max_bytes) {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(entry);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Segments still to be pulled, with the next source to try for each.
#[derive(Debug, Default)]
pub struct PullSchedule {
    remaining: BTreeMap<SegmentId, (Vec<NodeId>, usize)>,
}

impl PullSchedule {
    /// Schedule the given pulls.
    pub fn new(pulls: &[SegmentPull]) -> Self {
        let remaining = pulls
            .iter()
            .map(|p| (p.segment, (p.sources.clone(), 0)))
            .collect();
        Self { remaining }
    }

    /// Whether everything has been pulled.
    pub fn is_done(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Remaining segments grouped by the source to ask next.
    pub fn next_round(&self) -> Vec<(NodeId, Vec<SegmentId>)> {
        let mut groups: HashMap<NodeId, Vec<SegmentId>> = HashMap::new();
        let mut order = Vec::new();
        for (segment, (sources, attempt)) in &self.remaining {
            if let Some(source) = sources.get(*attempt) {
                groups
                    .entry(*source)
                    .or_insert_with(|| {
                        order.push(*source);
                        Vec::new()
                    })
                    .push(*segment);
            }
        }
        order
            .into_iter()
            .filter_map(|source| groups.remove(&source).map(|segs| (source, segs)))
            .collect()
    }

    /// The segments were fully received.
    pub fn completed(&mut self, segments: &[SegmentId]) {
        for segment in segments {
            self.remaining.remove(segment);
        }
    }

    /// The source failed; move the segments to their next source. Returns the
    /// segments that ran out of sources.
    pub fn failed(&mut self, segments: &[SegmentId]) -> Vec<SegmentId> {
        let mut exhausted = Vec::new();
        for segment in segments {
            if let Some((sources, attempt)) = self.remaining.get_mut(segment) {
                *attempt += 1;
                if *attempt >= sources.len() {
                    exhausted.push(*segment);
                }
            }
        }
        exhausted
    }
}

/// Progress of the transfer for the current view.
#[derive(Debug, Clone)]
pub struct TransferState {
    view_id: u64,
    members: HashSet<NodeId>,
    pending: HashSet<SegmentId>,
    confirmed: HashSet<NodeId>,
    settled: bool,
}

impl TransferState {
    /// Start tracking a view whose local pulls are `pending`.
    pub fn new(view_id: u64, members: impl IntoIterator<Item = NodeId>, pending: HashSet<SegmentId>) -> Self {
        Self {
            view_id,
            members: members.into_iter().collect(),
            pending,
            confirmed: HashSet::new(),
            settled: false,
        }
    }

    /// View being tracked.
    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    /// Segments this node has not finished pulling.
    pub fn pending_segments(&self) -> &HashSet<SegmentId> {
        &self.pending
    }

    /// Mark local pulls as finished.
    pub fn pulls_finished(&mut self) {
        self.pending.clear();
    }

    /// Record that `node` finished its pulls for `view_id`. Returns true
    /// exactly once, when the last member of the view confirms.
    pub fn confirm(&mut self, view_id: u64, node: NodeId) -> bool {
        if view_id != self.view_id || self.settled {
            return false;
        }
        if self.members.contains(&node) {
            self.confirmed.insert(node);
        }
        if self.confirmed.len() == self.members.len() {
            self.settled = true;
            return true;
        }
        false
    }

    /// Members that have not confirmed yet.
    pub fn waiting_for(&self) -> Vec<NodeId> {
        self.members.difference(&self.confirmed).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: usize) -> TransferEntry {
        TransferEntry {
            key: format!("key-{}", i),
            value: Bytes::from_static(b"v"),
            created_at: 0,
            lifespan_ms: 1_000,
        }
    }

    #[test]
    fn test_chunk_entries_by_count() {
        let chunks = chunk_entries((0..10).map(entry).collect(), 4, usize::MAX);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(chunk_entries(Vec::new(), 4, usize::MAX).is_empty());
    }

    #[test]
    fn test_chunk_entries_by_size() {
        let large = |i: usize| TransferEntry {
            value: Bytes::from(vec![7u8; 1024]),
            ..entry(i)
        };
        let budget = 4 * 1024;
        let chunks = chunk_entries((0..300).map(large).collect(), 512, budget);

        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 300);
        for chunk in &chunks {
            let bytes: usize = chunk.iter().map(encoded_len).sum();
            assert!(bytes <= budget, "chunk of {} bytes", bytes);
            assert!(!chunk.is_empty());
        }
    }

    #[test]
    fn test_oversized_entry_travels_alone() {
        let huge = TransferEntry {
            value: Bytes::from(vec![0u8; 10_000]),
            ..entry(1)
        };
        let chunks = chunk_entries(vec![entry(0), huge, entry(2)], 512, 1_000);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
    }

    #[test]
    fn test_pull_schedule_falls_through_sources() {
        let a = NodeId::random();
        let b = NodeId::random();
        let mut schedule = PullSchedule::new(&[
            SegmentPull {
                segment: 1,
                sources: vec![a, b],
            },
            SegmentPull {
                segment: 2,
                sources: vec![a],
            },
            SegmentPull {
                segment: 3,
                sources: vec![b],
            },
        ]);

        let round = schedule.next_round();
        assert_eq!(round.len(), 2);
        assert!(round.contains(&(a, vec![1, 2])));
        assert!(round.contains(&(b, vec![3])));

        schedule.completed(&[3]);
        let exhausted = schedule.failed(&[1, 2]);
        assert_eq!(exhausted, vec![2]);

        // Segment 1 moves on to b; segment 2 has nowhere left to go.
        assert_eq!(schedule.next_round(), vec![(b, vec![1])]);
        schedule.completed(&[1, 2]);
        assert!(schedule.is_done());
    }

    #[test]
    fn test_transfer_state_settles_once() {
        let a = NodeId::random();
        let b = NodeId::random();
        let pending: HashSet<SegmentId> = [4, 5].into_iter().collect();
        let mut state = TransferState::new(7, [a, b], pending);
        assert_eq!(state.pending_segments().len(), 2);

        assert!(!state.confirm(6, a), "stale view ignored");
        assert!(!state.confirm(7, a));
        assert_eq!(state.waiting_for(), vec![b]);
        assert!(!state.confirm(7, NodeId::random()), "non-members ignored");
        assert!(state.confirm(7, b));
        assert!(state.waiting_for().is_empty());
        assert!(!state.confirm(7, b), "settles only once");

        state.pulls_finished();
        assert!(state.pending_segments().is_empty());
    }
}
