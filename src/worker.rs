//! Search worker: one thread of the primary search.
//!
//! Each iteration runs a fixed pipeline:
//!
//! 1. **initialize**: clear per-iteration state
//! 2. **pre-extend**: splice helper lines from the PV queue into the tree
//!    and add the new nodes to the batch
//! 3. **gather**: descend from the root under the shared lock, reserving
//!    visits; a descent that meets a reservation is a collision
//! 4. **extend**: create leaf nodes, detect game ends
//! 5. **prefetch**: answer leaves from the evaluation cache
//! 6. **inference**: evaluate the remaining leaves in one backend call
//! 7. **backup**: fold values into the path to the root, cancel collisions,
//!    queue well-visited nodes for helper analysis
//! 8. **adjust policy**: raise priors of helper moves that proved good
//! 9. **update counters**: playouts, limits, back-off
//!
//! Gathering takes the tree read lock; steps 2, 4, 7 and 8 take the write
//! lock. Visit reservations are atomics, so descents of several workers (and
//! of the task threads of one worker) can run side by side.

use std::sync::Arc;
use std::thread;

use chess::{ChessMove, Color};
use log::{debug, error};
use rayon::prelude::*;

use crate::backend::{Backend, EvalCache, EvalRequest, Evaluation};
use crate::constants::COLLISION_BACKOFF;
use crate::error::{BackendError, SearchError};
use crate::game_result::GameResult;
use crate::locks::{LockToken, OrderedRwLock, TreeLock, Unlocked};
use crate::node::{AuxState, Node, NodeId, NodeTree};
use crate::params::SearchParams;
use crate::position::PositionHistory;
use crate::search::SearchState;
use crate::stats::{QueuedNode, SearchStats, bump};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafKind {
    /// Needs an evaluation.
    Visit,
    /// Fixed value, no evaluation.
    Terminal,
    /// Another descent holds the reservation; only undone during backup.
    Collision,
}

/// Result of one descent, taken under the read lock.
struct Descent {
    /// `(node, edge)` pairs from the root; the last edge leads to the leaf.
    path: Vec<(NodeId, usize)>,
    /// The leaf if it exists; `None` means the last edge has no child yet.
    node: Option<NodeId>,
    kind: LeafKind,
}

struct Leaf {
    path: Vec<(NodeId, usize)>,
    node: Option<NodeId>,
    kind: LeafKind,
    request: Option<EvalRequest>,
    cache_key: u64,
    /// Index into the backend batch.
    batch_index: Option<usize>,
    eval: Option<Evaluation>,
}

impl Leaf {
    fn from_descent(descent: Descent) -> Self {
        Self {
            path: descent.path,
            node: descent.node,
            kind: descent.kind,
            request: None,
            cache_key: 0,
            batch_index: None,
            eval: None,
        }
    }

    fn is_prepared(&self) -> bool {
        self.request.is_some() || self.kind != LeafKind::Visit
    }

    fn prepare(&mut self, history: &PositionHistory) {
        let last = history.last();
        self.request = Some(EvalRequest {
            board: *last.board(),
            moves: last.legal_moves(),
        });
        self.cache_key = history.hash_last(1);
    }
}

/// A node created from a helper line during pre-extension.
struct Injected {
    parent: NodeId,
    edge: usize,
    child: NodeId,
    depth: usize,
    starting_depth: usize,
    support: u64,
}

/// Value of a game end from the view of the side that moved into it.
///
/// Plain draws score `draw_score` for the root side, so the sign follows the
/// parity of `depth`.
pub fn terminal_value(result: GameResult, mover: Color, depth: usize, draw_score: f32) -> (f64, f32) {
    if result == GameResult::Draw {
        let score = if depth % 2 == 1 { draw_score } else { -draw_score };
        return (f64::from(score), 1.0);
    }
    (f64::from(result.value_for(mover)), 0.0)
}

/// PUCT choice among the edges of an expanded node.
fn select_edge(tree: &NodeTree, node: &Node, params: &SearchParams) -> Option<usize> {
    let sqrt_n = (node.n_started() as f32).max(1.0).sqrt();
    let parent_q = if node.n() > 0 { -node.wl() as f32 } else { 0.0 };
    let visited_policy: f32 = node
        .edges()
        .iter()
        .filter(|edge| edge.child().and_then(|c| tree.get(c)).is_some_and(|c| c.n() > 0))
        .map(|edge| edge.prior())
        .sum();
    let fpu = parent_q - params.fpu_reduction * visited_policy.sqrt();

    node.edges()
        .iter()
        .enumerate()
        .map(|(i, edge)| {
            let (q, started) = match edge.child().and_then(|c| tree.get(c)) {
                Some(child) if child.n() > 0 => (child.wl() as f32, child.n_started()),
                Some(child) => (fpu, child.n_started()),
                None => (fpu, edge.n_in_flight()),
            };
            let u = params.cpuct * edge.prior() * sqrt_n / (1.0 + started as f32);
            (i, q + u)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// Descend from the root to a leaf, reserving one visit on every node passed.
fn pick_leaf(tree: &NodeTree, params: &SearchParams) -> Descent {
    let mut path = Vec::new();
    let mut current = tree.root();
    loop {
        let node = tree.node(current);
        let previous = node.add_in_flight(1);
        if node.is_terminal() {
            return Descent {
                path,
                node: Some(current),
                kind: LeafKind::Terminal,
            };
        }
        let edge = match select_edge(tree, node, params) {
            Some(edge) if node.n() > 0 => edge,
            _ => {
                let kind = if previous == 0 { LeafKind::Visit } else { LeafKind::Collision };
                return Descent {
                    path,
                    node: Some(current),
                    kind,
                };
            }
        };
        path.push((current, edge));
        let target = &node.edges()[edge];
        match target.child() {
            Some(child) => current = child,
            None => {
                let kind = if target.add_in_flight(1) == 0 { LeafKind::Visit } else { LeafKind::Collision };
                return Descent { path, node: None, kind };
            }
        }
    }
}

pub struct SearchWorker {
    id: usize,
    tree: Arc<OrderedRwLock<TreeLock, NodeTree>>,
    stats: Arc<SearchStats>,
    state: Arc<SearchState>,
    backend: Arc<dyn Backend>,
    cache: Arc<EvalCache>,
    params: SearchParams,
    pool: Option<rayon::ThreadPool>,
    minibatch: Vec<Leaf>,
    injected: Vec<Injected>,
    batch: Vec<EvalRequest>,
}

impl SearchWorker {
    pub fn new(
        id: usize,
        tree: Arc<OrderedRwLock<TreeLock, NodeTree>>,
        stats: Arc<SearchStats>,
        state: Arc<SearchState>,
        backend: Arc<dyn Backend>,
        cache: Arc<EvalCache>,
        params: SearchParams,
    ) -> Result<Self, SearchError> {
        let pool = if params.task_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(params.task_workers)
                .thread_name(move |i| format!("search-{id}-task-{i}"))
                .build()
                .map_err(|err| SearchError::Thread(std::io::Error::other(err.to_string())))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            id,
            tree,
            stats,
            state,
            backend,
            cache,
            params,
            pool,
            minibatch: Vec::new(),
            injected: Vec::new(),
            batch: Vec::new(),
        })
    }

    /// Iterate until the search stops. A failing iteration records the
    /// error with the search and stops it.
    pub fn run(mut self) {
        let mut token = LockToken::new();
        debug!("search worker {} started", self.id);
        while !self.state.stop_requested() {
            if let Err(err) = self.iteration(&mut token) {
                error!("search worker {} failed: {err}", self.id);
                self.cancel_reservations(&mut token);
                self.state.record_fatal(err);
                self.state.fire_stop(&mut token);
                break;
            }
        }
        debug!("search worker {} exiting", self.id);
    }

    /// One pass through the pipeline.
    pub fn iteration(&mut self, token: &mut LockToken<Unlocked>) -> Result<(), SearchError> {
        self.initialize();
        self.pre_extend_from_helper(token);
        self.gather_minibatch(token);
        self.extend_leaves(token);
        self.prefetch_from_cache();
        self.run_inference()?;
        self.fetch_results();
        self.backup_update(token);
        self.adjust_policy_for_injected(token);
        self.update_counters(token);
        Ok(())
    }

    fn initialize(&mut self) {
        self.minibatch.clear();
        self.injected.clear();
        self.batch.clear();
    }

    // -------------------------------------------------------------------------
    // Pre-extension
    // -------------------------------------------------------------------------

    /// Splice queued helper lines into the tree.
    ///
    /// Each line is walked from the root; unexpanded nodes on the way get
    /// uniform edges and missing children are created, up to
    /// `max_injected_per_batch` new nodes. New nodes are reserved and added to
    /// this batch so they are evaluated like any other leaf. A move that is
    /// not legal ends the line.
    fn pre_extend_from_helper(&mut self, token: &mut LockToken<Unlocked>) {
        let budget = self.params.max_injected_per_batch;
        if budget == 0 {
            return;
        }
        let mut guard = self.tree.write(token);
        let (tree, tree_token) = guard.split();
        let lines = self.stats.drain_pvs(tree_token, budget);
        let mut added = 0;
        'lines: for line in lines {
            let mut current = tree.root();
            let mut history = tree.history().clone();
            let mut path = Vec::with_capacity(line.moves.len());
            for (ply, &mv) in line.moves.iter().enumerate() {
                if added >= budget {
                    break 'lines;
                }
                if tree.node(current).is_terminal() {
                    break;
                }
                if !tree.node(current).has_edges() {
                    tree.create_edges(current, &history.last().legal_moves(), None);
                }
                let Some(edge) = tree.node(current).find_edge(mv) else {
                    break;
                };
                path.push((current, edge));
                let (child, created) = tree.get_or_create_child(current, edge);
                history.append(mv);
                current = child;
                if !created {
                    continue;
                }
                added += 1;
                for &(id, _) in &path {
                    tree.node(id).add_in_flight(1);
                }
                tree.node(child).add_in_flight(1);
                let mut leaf = Leaf::from_descent(Descent {
                    path: path.clone(),
                    node: Some(child),
                    kind: LeafKind::Visit,
                });
                let result = history.compute_game_result();
                if result.is_decided() {
                    let mover = !history.last().side_to_move();
                    let (wl, d) = terminal_value(result, mover, ply + 1, self.params.draw_score);
                    tree.node_mut(child).make_terminal(result, wl, d);
                    leaf.kind = LeafKind::Terminal;
                } else {
                    leaf.prepare(&history);
                }
                self.minibatch.push(leaf);
                self.injected.push(Injected {
                    parent: path[path.len() - 1].0,
                    edge,
                    child,
                    depth: ply + 1,
                    starting_depth: line.starting_depth,
                    support: line.support,
                });
                if result.is_decided() {
                    break;
                }
            }
        }
        if added > 0 {
            bump(&self.stats.counters().nodes_injected, added as u64);
            debug!("search worker {} injected {added} helper nodes", self.id);
        }
    }

    // -------------------------------------------------------------------------
    // Gathering
    // -------------------------------------------------------------------------

    fn gather_minibatch(&mut self, token: &mut LockToken<Unlocked>) {
        let guard = self.tree.read(token);
        let tree: &NodeTree = &guard;
        let params = &self.params;
        let mut visits = self.minibatch.len();
        let mut collisions = 0;
        while visits < params.minibatch_size
            && collisions < params.max_collision_events
            && !self.state.stop_requested()
        {
            let descents: Vec<Descent> = match &self.pool {
                Some(pool) => {
                    let wanted = (params.minibatch_size - visits).min(pool.current_num_threads()).max(1);
                    pool.install(|| (0..wanted).into_par_iter().map(|_| pick_leaf(tree, params)).collect())
                }
                None => vec![pick_leaf(tree, params)],
            };
            for descent in descents {
                match descent.kind {
                    LeafKind::Collision => collisions += 1,
                    LeafKind::Visit | LeafKind::Terminal => visits += 1,
                }
                self.minibatch.push(Leaf::from_descent(descent));
            }
        }
    }

    /// Materialize new leaves and classify game ends.
    fn extend_leaves(&mut self, token: &mut LockToken<Unlocked>) {
        let mut guard = self.tree.write(token);
        let tree: &mut NodeTree = &mut guard;
        for leaf in &mut self.minibatch {
            if leaf.is_prepared() {
                continue;
            }
            let (id, created) = match (leaf.node, leaf.path.last()) {
                (Some(id), _) => (id, false),
                (None, Some(&(parent, edge))) => tree.get_or_create_child(parent, edge),
                (None, None) => continue,
            };
            leaf.node = Some(id);
            if tree.node(id).is_terminal() {
                leaf.kind = LeafKind::Terminal;
                continue;
            }
            let moves: Vec<ChessMove> = leaf
                .path
                .iter()
                .map(|&(parent, edge)| tree.node(parent).edges()[edge].mv())
                .collect();
            let history = tree.history_after(&moves);
            if created {
                let result = history.compute_game_result();
                if result.is_decided() {
                    let mover = !history.last().side_to_move();
                    let (wl, d) = terminal_value(result, mover, moves.len(), self.params.draw_score);
                    tree.node_mut(id).make_terminal(result, wl, d);
                    leaf.kind = LeafKind::Terminal;
                    continue;
                }
            }
            leaf.prepare(&history);
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    fn prefetch_from_cache(&mut self) {
        for leaf in &mut self.minibatch {
            let Some(request) = &leaf.request else {
                continue;
            };
            if let Some(eval) = self.cache.get(leaf.cache_key) {
                if eval.policy.len() == request.moves.len() {
                    leaf.eval = Some(eval);
                    continue;
                }
            }
            leaf.batch_index = Some(self.batch.len());
            self.batch.push(request.clone());
        }
    }

    fn run_inference(&mut self) -> Result<(), SearchError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let results = self.backend.evaluate_batch(&self.batch)?;
        if results.len() != self.batch.len() {
            return Err(BackendError::BatchSize {
                expected: self.batch.len(),
                got: results.len(),
            }
            .into());
        }
        for leaf in &mut self.minibatch {
            if let Some(index) = leaf.batch_index {
                leaf.eval = results.get(index).cloned();
            }
        }
        Ok(())
    }

    fn fetch_results(&mut self) {
        for leaf in &self.minibatch {
            if let (Some(_), Some(eval)) = (leaf.batch_index, &leaf.eval) {
                self.cache.insert(leaf.cache_key, eval.clone());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Backup
    // -------------------------------------------------------------------------

    /// Undo the reservations of a leaf that will not be backed up.
    fn cancel_leaf(tree: &NodeTree, leaf: &Leaf) {
        for &(id, _) in &leaf.path {
            tree.node(id).cancel_in_flight(1);
        }
        match (leaf.node, leaf.path.last()) {
            (Some(id), _) => tree.node(id).cancel_in_flight(1),
            (None, Some(&(parent, edge))) => {
                let edge = &tree.node(parent).edges()[edge];
                match edge.child() {
                    Some(child) => tree.node(child).cancel_in_flight(1),
                    None => edge.cancel_in_flight(1),
                }
            }
            (None, None) => {}
        }
    }

    fn backup_update(&mut self, token: &mut LockToken<Unlocked>) {
        let threshold = self.state.aux_threshold();
        let mut guard = self.tree.write(token);
        let (tree, tree_token) = guard.split();
        for leaf in &self.minibatch {
            let Some(id) = leaf.node.filter(|_| leaf.kind != LeafKind::Collision) else {
                Self::cancel_leaf(tree, leaf);
                continue;
            };
            let (wl, d, m) = match (leaf.kind, &leaf.eval, &leaf.request) {
                (LeafKind::Terminal, _, _) => {
                    let node = tree.node(id);
                    (node.wl(), node.d(), 0.0)
                }
                (_, Some(eval), Some(request)) => {
                    if tree.node(id).has_edges() {
                        tree.set_priors(id, &request.moves, &eval.policy);
                    } else {
                        tree.create_edges(id, &request.moves, Some(&eval.policy));
                    }
                    (-f64::from(eval.value), eval.draw, eval.moves_left)
                }
                _ => {
                    Self::cancel_leaf(tree, leaf);
                    continue;
                }
            };

            tree.node_mut(id).finalize_score_update(wl, d, m, 1);
            let mut value = wl;
            let mut moves_left = m;
            for &(ancestor, _) in leaf.path.iter().rev() {
                value = -value;
                moves_left += 1.0;
                tree.node_mut(ancestor).finalize_score_update(value, d, moves_left, 1);
            }

            if threshold > 0 {
                let candidates = leaf.path.iter().map(|&(ancestor, _)| ancestor).chain(Some(id));
                for candidate in candidates {
                    let node = tree.node(candidate);
                    if node.n() < threshold || node.is_terminal() || !node.has_edges() {
                        continue;
                    }
                    if !node.try_mark_aux_pending() {
                        continue;
                    }
                    let branch = tree.ancestry(candidate).and_then(|a| a.branch);
                    let entry = QueuedNode {
                        node: candidate,
                        branch,
                    };
                    if !self.stats.enqueue_node(tree_token, entry) {
                        tree.node(candidate).set_aux_state(AuxState::Resolved);
                    }
                }
            }
        }
        if !self.state.root_ready.is_raised() && tree.root_node().has_edges() {
            self.state.root_ready.raise();
        }
    }

    /// Release every reservation of the current batch.
    fn cancel_reservations(&mut self, token: &mut LockToken<Unlocked>) {
        let guard = self.tree.read(token);
        for leaf in &self.minibatch {
            Self::cancel_leaf(&guard, leaf);
        }
        self.minibatch.clear();
    }

    /// Raise the prior of helper moves whose evaluation beats every visited
    /// sibling, weighted by how many nodes the helper spent on the line.
    fn adjust_policy_for_injected(&mut self, token: &mut LockToken<Unlocked>) {
        if self.injected.is_empty() {
            return;
        }
        let mut guard = self.tree.write(token);
        let tree: &mut NodeTree = &mut guard;
        for injected in &self.injected {
            if injected.depth <= injected.starting_depth {
                continue;
            }
            let Some(child) = tree.get(injected.child).filter(|c| c.n() > 0) else {
                continue;
            };
            let child_wl = child.wl();
            let Some(parent) = tree.get(injected.parent) else {
                continue;
            };
            let Some(edge) = parent.edges().get(injected.edge) else {
                continue;
            };
            let mut best_sibling_wl = f64::NEG_INFINITY;
            let mut best_sibling_prior = 0.0f32;
            for (i, sibling) in parent.edges().iter().enumerate() {
                if i == injected.edge {
                    continue;
                }
                best_sibling_prior = best_sibling_prior.max(sibling.prior());
                if let Some(s) = sibling.child().and_then(|c| tree.get(c)).filter(|s| s.n() > 0) {
                    best_sibling_wl = best_sibling_wl.max(s.wl());
                }
            }
            if child_wl <= best_sibling_wl || best_sibling_prior <= edge.prior() {
                continue;
            }
            let weight = ((1.0 + injected.support as f64).log10() / 6.0).min(1.0) as f32;
            let prior = edge.prior() + (best_sibling_prior - edge.prior()) * weight;
            debug!(
                "raising prior of helper move {} from {:.4} to {prior:.4}",
                edge.mv(),
                edge.prior()
            );
            tree.raise_prior(injected.parent, injected.edge, prior);
        }
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    fn update_counters(&mut self, token: &mut LockToken<Unlocked>) {
        let visits = self
            .minibatch
            .iter()
            .filter(|leaf| leaf.kind != LeafKind::Collision)
            .count();
        self.state.add_playouts(visits as u64);
        if self.state.limits_reached() {
            self.state.fire_stop(token);
        }
        if visits == 0 && !self.minibatch.is_empty() {
            thread::sleep(COLLISION_BACKOFF);
        }
    }
}
