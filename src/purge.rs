//! Invalidation of queued helper work after the root moves.
//!
//! When a move is committed only the subtree under it survives. Node-queue
//! entries carry the depth-1 ancestor they hung under; an entry survives iff
//! that ancestor is the node the played move led to, and is then re-anchored
//! under the new root. PV entries are root-relative move lists; one survives
//! iff it starts with the played move, which is stripped. Moves are absolute
//! (from/to squares), so they compare directly whichever side is to move.

use std::fmt;

use chess::ChessMove;

use crate::node::{NodeId, NodeTree};
use crate::stats::{BoundedQueue, QueuedNode, QueuedPv};

/// Entries kept and dropped by one purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub nodes_kept: usize,
    pub nodes_dropped: usize,
    pub pvs_kept: usize,
    pub pvs_dropped: usize,
}

impl fmt::Display for PurgeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nodes kept {} dropped {}, pvs kept {} dropped {}",
            self.nodes_kept, self.nodes_dropped, self.pvs_kept, self.pvs_dropped
        )
    }
}

/// Keep entries under `kept_branch` and recompute their branch against the
/// re-rooted `tree`. Returns `(kept, dropped)`.
///
/// With `kept_branch == None` (the played move had no subtree) everything
/// is dropped.
pub fn purge_node_queue(
    queue: &mut BoundedQueue<QueuedNode>,
    tree: &NodeTree,
    kept_branch: Option<NodeId>,
) -> (usize, usize) {
    let dropped = queue.retain_map(|entry| {
        if entry.branch.is_none() || entry.branch != kept_branch {
            return None;
        }
        let ancestry = tree.ancestry(entry.node)?;
        Some(QueuedNode {
            node: entry.node,
            branch: ancestry.branch,
        })
    });
    (queue.len(), dropped)
}

/// Keep lines starting with `selected`, minus that move. Returns `(kept, dropped)`.
pub fn purge_pv_queue(queue: &mut BoundedQueue<QueuedPv>, selected: ChessMove) -> (usize, usize) {
    let dropped = queue.retain_map(|mut pv| {
        if pv.moves.first() != Some(&selected) {
            return None;
        }
        pv.moves.remove(0);
        pv.starting_depth = pv.starting_depth.saturating_sub(1);
        (!pv.moves.is_empty()).then_some(pv)
    });
    (queue.len(), dropped)
}
