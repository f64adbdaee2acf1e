//! Search tree stored in a generational arena.
//!
//! The tree owns every node; a node refers to its parent by [`NodeId`] only,
//! which keeps upward walks (depth, move path, branch lookup) cheap without
//! shared ownership. Freed slots bump their generation, so an id held by a
//! queue after its subtree was discarded is detected as stale instead of
//! silently aliasing a new node.
//!
//! ## Concurrency
//!
//! The tree lives behind the tree lock ([`crate::locks::TreeLock`]).
//! Structural changes and statistics updates need the write lock. Visit
//! reservations (`n_in_flight`) and the helper marker are atomics so that
//! descent and helper bookkeeping work under the shared read lock.

use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use chess::ChessMove;

use crate::constants::{AUX_NONE, AUX_PENDING, AUX_RESOLVED};
use crate::error::PositionError;
use crate::fen;
use crate::game_result::GameResult;
use crate::position::PositionHistory;

/// Handle to a node slot plus the generation it was allocated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Helper-engine marker of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxState {
    /// Never queued.
    None,
    /// Queued, or being analyzed by a helper.
    Pending,
    /// Analysis finished or abandoned.
    Resolved,
}

impl AuxState {
    fn from_raw(raw: u16) -> Self {
        match raw {
            AUX_PENDING => AuxState::Pending,
            AUX_RESOLVED => AuxState::Resolved,
            _ => AuxState::None,
        }
    }

    fn raw(self) -> u16 {
        match self {
            AuxState::None => AUX_NONE,
            AuxState::Pending => AUX_PENDING,
            AuxState::Resolved => AUX_RESOLVED,
        }
    }
}

/// A candidate move of a node.
pub struct Edge {
    mv: ChessMove,
    prior: f32,
    child: Option<NodeId>,
    /// Visits reserved through this edge before its child exists.
    n_in_flight: AtomicU32,
}

impl Edge {
    fn new(mv: ChessMove, prior: f32) -> Self {
        Self {
            mv,
            prior,
            child: None,
            n_in_flight: AtomicU32::new(0),
        }
    }

    pub fn mv(&self) -> ChessMove {
        self.mv
    }

    pub fn prior(&self) -> f32 {
        self.prior
    }

    pub fn child(&self) -> Option<NodeId> {
        self.child
    }

    pub fn n_in_flight(&self) -> u32 {
        self.n_in_flight.load(Ordering::Acquire)
    }

    /// Reserve a visit; returns the reservations held before this one.
    pub fn add_in_flight(&self, count: u32) -> u32 {
        self.n_in_flight.fetch_add(count, Ordering::AcqRel)
    }

    pub fn cancel_in_flight(&self, count: u32) {
        self.n_in_flight.fetch_sub(count, Ordering::AcqRel);
    }
}

/// One position in the search tree.
///
/// `wl` is the average value from the point of view of the player who made
/// the move leading to this node, so a parent picks the child with the
/// highest `wl`.
pub struct Node {
    parent: Option<NodeId>,
    /// Index of the edge in the parent that leads here.
    edge_index: u16,
    edges: Vec<Edge>,
    n: u32,
    n_in_flight: AtomicU32,
    wl: f64,
    d: f32,
    m: f32,
    terminal: Option<GameResult>,
    aux: AtomicU16,
}

impl Node {
    fn new(parent: Option<NodeId>, edge_index: u16) -> Self {
        Self {
            parent,
            edge_index,
            edges: Vec::new(),
            n: 0,
            n_in_flight: AtomicU32::new(0),
            wl: 0.0,
            d: 0.0,
            m: 0.0,
            terminal: None,
            aux: AtomicU16::new(AUX_NONE),
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn edge_index(&self) -> usize {
        usize::from(self.edge_index)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn has_edges(&self) -> bool {
        !self.edges.is_empty()
    }

    /// Completed visits.
    pub fn n(&self) -> u32 {
        self.n
    }

    /// Visits reserved by descents whose evaluation has not been backed up.
    pub fn n_in_flight(&self) -> u32 {
        self.n_in_flight.load(Ordering::Acquire)
    }

    /// Completed plus reserved visits.
    pub fn n_started(&self) -> u32 {
        self.n + self.n_in_flight()
    }

    pub fn wl(&self) -> f64 {
        self.wl
    }

    pub fn d(&self) -> f32 {
        self.d
    }

    pub fn m(&self) -> f32 {
        self.m
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn terminal_result(&self) -> Option<GameResult> {
        self.terminal
    }

    pub fn add_in_flight(&self, count: u32) -> u32 {
        self.n_in_flight.fetch_add(count, Ordering::AcqRel)
    }

    pub fn cancel_in_flight(&self, count: u32) {
        self.n_in_flight.fetch_sub(count, Ordering::AcqRel);
    }

    pub fn aux_state(&self) -> AuxState {
        AuxState::from_raw(self.aux.load(Ordering::Acquire))
    }

    pub fn set_aux_state(&self, state: AuxState) {
        self.aux.store(state.raw(), Ordering::Release);
    }

    /// Move the marker from `None` to `Pending`. Returns false if it was set.
    pub fn try_mark_aux_pending(&self) -> bool {
        self.aux
            .compare_exchange(AUX_NONE, AUX_PENDING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move the marker from `Pending` back to `None`. Returns false if it
    /// was not pending.
    pub fn try_clear_aux_pending(&self) -> bool {
        self.aux
            .compare_exchange(AUX_PENDING, AUX_NONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Fold `multivisit` evaluations of value `v` into the averages and
    /// release the same number of reservations.
    pub fn finalize_score_update(&mut self, v: f64, d: f32, m: f32, multivisit: u32) {
        let total = f64::from(self.n + multivisit);
        let weight = f64::from(multivisit) / total;
        self.wl += weight * (v - self.wl);
        self.d += (weight as f32) * (d - self.d);
        self.m += (weight as f32) * (m - self.m);
        self.n += multivisit;
        self.cancel_in_flight(multivisit);
    }

    /// Freeze the node as a game end with a fixed value.
    pub fn make_terminal(&mut self, result: GameResult, wl: f64, d: f32) {
        self.terminal = Some(result);
        self.wl = wl;
        self.d = d;
        self.m = 0.0;
        self.edges.clear();
    }

    /// Edge index for `mv`, if the node has it.
    pub fn find_edge(&self, mv: ChessMove) -> Option<usize> {
        self.edges.iter().position(|edge| edge.mv == mv)
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Depth of a node below the root and the root child it hangs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ancestry {
    pub depth: u32,
    /// Depth-1 ancestor (the node itself at depth 1, `None` for the root).
    pub branch: Option<NodeId>,
}

/// Result of playing a move on the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedMove {
    pub mv: ChessMove,
    pub root: NodeId,
    /// True if the new root is the old root's child, subtree kept.
    pub reused: bool,
}

impl AppliedMove {
    /// Former depth-1 node now serving as root, if the subtree survived.
    pub fn kept_branch(&self) -> Option<NodeId> {
        self.reused.then_some(self.root)
    }
}

/// How [`NodeTree::reset_to_position`] reached the requested position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionUpdate {
    /// Same game, these moves were played on top of the old head.
    Extended(Vec<AppliedMove>),
    /// Unrelated position, the tree was rebuilt from scratch.
    Rebuilt,
}

/// The search tree together with the game history leading to its root.
pub struct NodeTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    root: NodeId,
    history: PositionHistory,
    start_fen: String,
    played: Vec<ChessMove>,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    /// Tree rooted at the standard starting position.
    pub fn new() -> Self {
        Self::with_history(PositionHistory::starting(), Vec::new())
    }

    /// Tree rooted after `moves` (UCI text) played from `fen`.
    pub fn from_position(fen: &str, moves: &[&str]) -> Result<Self, PositionError> {
        let (history, played) = Self::replay(fen, moves)?;
        Ok(Self::with_history(history, played))
    }

    fn with_history(history: PositionHistory, played: Vec<ChessMove>) -> Self {
        let start_fen = fen::encode(history.starting_position());
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            root: NodeId { index: 0, generation: 0 },
            history,
            start_fen,
            played,
        };
        tree.root = tree.alloc(None, 0);
        tree
    }

    fn replay(fen: &str, moves: &[&str]) -> Result<(PositionHistory, Vec<ChessMove>), PositionError> {
        let mut history = PositionHistory::from_fen(fen)?;
        let mut played = Vec::with_capacity(moves.len());
        for text in moves {
            played.push(history.append_uci(text)?);
        }
        Ok((history, played))
    }

    /// Move the tree to the game given by `fen` + `moves`.
    ///
    /// If that game continues the current one, the extra moves are played
    /// with [`NodeTree::make_move`] and the matching subtree is kept.
    pub fn reset_to_position(&mut self, fen: &str, moves: &[&str]) -> Result<PositionUpdate, PositionError> {
        self.reset_to_position_with(fen, moves, |_, _| {})
    }

    /// [`NodeTree::reset_to_position`], calling `on_move` after each move
    /// played on the kept tree.
    pub fn reset_to_position_with<F>(&mut self, fen: &str, moves: &[&str], mut on_move: F) -> Result<PositionUpdate, PositionError>
    where
        F: FnMut(&NodeTree, &AppliedMove),
    {
        let (history, played) = Self::replay(fen, moves)?;
        let same_start = fen::encode(history.starting_position()) == self.start_fen;
        if same_start && played.len() >= self.played.len() && played[..self.played.len()] == self.played[..] {
            let extra = played[self.played.len()..].to_vec();
            let mut applied = Vec::with_capacity(extra.len());
            for mv in extra {
                let played = self.make_move(mv)?;
                on_move(self, &played);
                applied.push(played);
            }
            return Ok(PositionUpdate::Extended(applied));
        }
        *self = Self::with_history(history, played);
        Ok(PositionUpdate::Rebuilt)
    }

    /// Play `mv` at the root: keep its subtree, free everything else.
    pub fn make_move(&mut self, mv: ChessMove) -> Result<AppliedMove, PositionError> {
        let board = *self.history.last().board();
        if !board.legal(mv) {
            return Err(PositionError::IllegalMove {
                mv: mv.to_string(),
                fen: fen::encode(self.history.last()),
            });
        }
        let old_root = self.root;
        // A terminal node cannot be searched from, so it is not kept as root.
        let kept = self
            .get(old_root)
            .and_then(|root| root.find_edge(mv).and_then(|i| root.edges[i].child))
            .filter(|&id| self.get(id).is_some_and(|node| !node.is_terminal()));
        self.free_subtree_except(old_root, kept);
        let root = match kept {
            Some(id) => {
                if let Some(node) = self.get_mut(id) {
                    node.parent = None;
                    node.edge_index = 0;
                }
                id
            }
            None => self.alloc(None, 0),
        };
        self.root = root;
        self.history.append(mv);
        self.played.push(mv);
        Ok(AppliedMove {
            mv,
            root,
            reused: kept.is_some(),
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_node(&self) -> &Node {
        self.node(self.root)
    }

    /// History from the game start to the root.
    pub fn history(&self) -> &PositionHistory {
        &self.history
    }

    /// Moves played from the start position to the root.
    pub fn played_moves(&self) -> &[ChessMove] {
        &self.played
    }

    pub fn start_fen(&self) -> &str {
        &self.start_fen
    }

    /// Number of allocated nodes.
    pub fn live_nodes(&self) -> usize {
        self.live
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Clear the pending marker of every live node in `ids` so it can be
    /// queued again. Returns how many were released.
    pub fn release_aux_markers(&self, ids: &[NodeId]) -> usize {
        ids.iter()
            .filter_map(|&id| self.get(id))
            .filter(|node| node.try_clear_aux_pending())
            .count()
    }

    /// Node for an id taken from this tree under the current lock.
    ///
    /// Panics if `id` is stale; ids that may outlive a re-root go through
    /// [`NodeTree::get`].
    pub fn node(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => panic!("stale node id {id}"),
        }
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.get_mut(id) {
            Some(node) => node,
            None => panic!("stale node id {id}"),
        }
    }

    fn alloc(&mut self, parent: Option<NodeId>, edge_index: u16) -> NodeId {
        self.live += 1;
        let node = Node::new(parent, edge_index);
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId { index, generation: 0 }
    }

    fn release(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(node)
    }

    fn free_subtree_except(&mut self, start: NodeId, keep: Option<NodeId>) {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if Some(id) == keep {
                continue;
            }
            if let Some(node) = self.release(id) {
                stack.extend(node.edges.iter().filter_map(Edge::child));
            }
        }
    }

    /// Give `id` one edge per move. Priors default to uniform.
    ///
    /// Does nothing if the node already has edges.
    pub fn create_edges(&mut self, id: NodeId, moves: &[ChessMove], priors: Option<&[f32]>) {
        let node = self.node_mut(id);
        if node.has_edges() || moves.is_empty() {
            return;
        }
        let uniform = 1.0 / moves.len() as f32;
        node.edges = moves
            .iter()
            .enumerate()
            .map(|(i, &mv)| {
                let prior = priors.and_then(|p| p.get(i).copied()).unwrap_or(uniform);
                Edge::new(mv, prior)
            })
            .collect();
    }

    /// Overwrite priors of existing edges, matched by move.
    pub fn set_priors(&mut self, id: NodeId, moves: &[ChessMove], priors: &[f32]) {
        let node = self.node_mut(id);
        for (&mv, &prior) in moves.iter().zip(priors) {
            if let Some(i) = node.find_edge(mv) {
                node.edges[i].prior = prior;
            }
        }
    }

    /// Set one prior and rescale all priors of the node to sum to one.
    pub fn raise_prior(&mut self, id: NodeId, edge: usize, prior: f32) {
        let node = self.node_mut(id);
        let Some(target) = node.edges.get_mut(edge) else {
            return;
        };
        target.prior = prior;
        let total: f32 = node.edges.iter().map(Edge::prior).sum();
        if total > 0.0 {
            for e in &mut node.edges {
                e.prior /= total;
            }
        }
    }

    /// Child behind `edge`, creating it if needed. Returns `(child, created)`.
    ///
    /// Reservations made on the edge move to the new child.
    pub fn get_or_create_child(&mut self, parent: NodeId, edge: usize) -> (NodeId, bool) {
        if let Some(child) = self.node(parent).edges[edge].child {
            return (child, false);
        }
        let child = self.alloc(Some(parent), edge as u16);
        let slot = &mut self.node_mut(parent).edges[edge];
        slot.child = Some(child);
        let reserved = std::mem::take(slot.n_in_flight.get_mut());
        *self.node_mut(child).n_in_flight.get_mut() = reserved;
        (child, true)
    }

    /// Depth and root branch of `id`, or `None` if it is not under the root.
    pub fn ancestry(&self, id: NodeId) -> Option<Ancestry> {
        let mut current = id;
        let mut depth = 0;
        let mut branch = None;
        loop {
            if current == self.root {
                return Some(Ancestry { depth, branch });
            }
            let parent = self.get(current)?.parent?;
            branch = Some(current);
            depth += 1;
            current = parent;
        }
    }

    /// Moves from the root down to `id`, oldest first.
    pub fn moves_from_root(&self, id: NodeId) -> Option<Vec<ChessMove>> {
        let mut moves = Vec::new();
        let mut current = id;
        while current != self.root {
            let node = self.get(current)?;
            let parent = self.get(node.parent?)?;
            moves.push(parent.edges.get(node.edge_index())?.mv);
            current = node.parent?;
        }
        moves.reverse();
        Some(moves)
    }

    /// History of the root extended by `moves`.
    pub fn history_after(&self, moves: &[ChessMove]) -> PositionHistory {
        let mut history = self.history.clone();
        for &mv in moves {
            history.append(mv);
        }
        history
    }

    /// Children of `id` with their statistics, most visited first.
    pub fn describe_children(&self, id: NodeId) -> String {
        let Some(node) = self.get(id) else {
            return String::new();
        };
        let mut rows: Vec<(u32, String)> = node
            .edges
            .iter()
            .map(|edge| {
                let (n, wl) = edge
                    .child
                    .and_then(|c| self.get(c))
                    .map_or((0, 0.0), |c| (c.n, c.wl));
                (
                    n,
                    format!("{:<6} N={:<7} P={:>6.2}% Q={:>7.4}", edge.mv.to_string(), n, edge.prior * 100.0, wl),
                )
            })
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.into_iter().map(|(_, row)| row).collect::<Vec<_>>().join("\n")
    }
}
