//! Partitioning of the key space into segments and their owners.
//!
//! ```text
//! key ──xxHash64──▶ segment (mod num_segments)
//!                      │
//!                      ▼
//!     SegmentTable[segment] = [primary, backup, ...]   (rendezvous ranking per view)
//! ```
//!
//! A view change produces a new table. Diffing the nodes that held each
//! segment before the change against the new table yields a [`TransferPlan`]:
//! which segments the local node pulls, which it drops, and the [`Topology`]
//! that routes requests while entries migrate.

mod ownership;
mod segments;

pub use ownership::{KeyOwnership, SegmentPull, Topology, TransferPlan};
pub use segments::{segment_of, SegmentId, SegmentTable};
