//! Session controller: one engine across many moves of many games.
//!
//! The controller owns the shared tree, the [`SearchStats`] context and the
//! evaluation cache, and drives the move cycle:
//!
//! ```text
//! set_position ─► go ─► (stop) ─► finish ─► commit + purge ─► set_position ...
//! ```
//!
//! Every move played on the tree, whether committed after a search or
//! replayed from a `position` command that extends the current game, is
//! followed by a purge of the helper queues. A position that does not extend
//! the current game rebuilds the tree and empties both queues.

use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::backend::{Backend, EvalCache};
use crate::error::{ParamError, SearchError};
use crate::locks::{LockToken, OrderedRwLock, TreeLock, Unlocked};
use crate::node::{NodeTree, PositionUpdate};
use crate::params::SearchParams;
use crate::search::{self, BestMove, Search, SearchLimits, SearchState};
use crate::stats::{AuxSummary, SearchStats, process_factory};

/// Outcome of [`EngineController::finish`].
#[derive(Debug, Clone)]
pub struct FinishedMove {
    pub best: Option<BestMove>,
    /// True if the best move was played on the tree.
    pub committed: bool,
    pub playouts: u64,
    pub summary: AuxSummary,
}

pub struct EngineController {
    params: SearchParams,
    tree: Arc<OrderedRwLock<TreeLock, NodeTree>>,
    stats: Arc<SearchStats>,
    backend: Arc<dyn Backend>,
    cache: Arc<EvalCache>,
    search: Option<Search>,
    limits: SearchLimits,
}

impl EngineController {
    /// Controller whose helpers are spawned from `params.aux.path`.
    pub fn new(params: SearchParams, backend: Arc<dyn Backend>) -> Self {
        let stats = Arc::new(SearchStats::from_params(&params.aux));
        Self::with_stats(params, backend, stats)
    }

    /// Controller over a prepared stats context (custom engine factory).
    pub fn with_stats(params: SearchParams, backend: Arc<dyn Backend>, stats: Arc<SearchStats>) -> Self {
        Self {
            tree: Arc::new(OrderedRwLock::new(NodeTree::new())),
            cache: Arc::new(EvalCache::new(params.cache_size)),
            params,
            stats,
            backend,
            search: None,
            limits: SearchLimits::default(),
        }
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn tree(&self) -> &Arc<OrderedRwLock<TreeLock, NodeTree>> {
        &self.tree
    }

    pub fn stats(&self) -> &Arc<SearchStats> {
        &self.stats
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_searching(&self) -> bool {
        self.search.is_some()
    }

    /// State of the running search, if any.
    pub fn search_state(&self) -> Option<&Arc<SearchState>> {
        self.search.as_ref().map(Search::state)
    }

    /// Apply a UCI option. Takes effect at the next `go`.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        let before = self.params.clone();
        self.params.set_option(name, value)?;
        if self.params.aux.path != before.aux.path || self.params.aux.args != before.aux.args {
            self.stats.set_engine_factory(process_factory(&self.params.aux));
        } else if self.params.aux.options != before.aux.options
            || self.params.aux.options_on_root != before.aux.options_on_root
            || self.params.aux.syzygy_path != before.aux.syzygy_path
        {
            // Options are only sent during the handshake.
            self.stats.shutdown_engines();
        }
        if self.params.cache_size != before.cache_size {
            self.cache = Arc::new(EvalCache::new(self.params.cache_size));
        }
        Ok(())
    }

    /// Forget the current game: fresh tree, empty caches, helper queues
    /// cleared by the next initial purge.
    pub fn new_game(&mut self, token: &mut LockToken<Unlocked>) {
        self.abort(token);
        self.stats.mark_new_game(token);
        *self.tree.write(token) = NodeTree::new();
        self.cache.clear();
        debug!("new game");
    }

    /// Move the tree to `fen` + `moves`, reusing it when the game extends
    /// the current one.
    pub fn set_position(
        &mut self,
        token: &mut LockToken<Unlocked>,
        fen: &str,
        moves: &[&str],
    ) -> Result<PositionUpdate, SearchError> {
        self.abort(token);
        let stats = &self.stats;
        let mut tree = self.tree.write(token);
        let (tree, tree_token) = tree.split();
        let update = tree.reset_to_position_with(fen, moves, |tree, applied| {
            stats.purge_for_move(tree_token, tree, applied);
        })?;
        match &update {
            PositionUpdate::Extended(applied) => {
                debug!("position extends the game by {} moves, {} nodes kept", applied.len(), tree.live_nodes());
            }
            PositionUpdate::Rebuilt => {
                stats.clear_queues(tree_token);
                debug!("position rebuilt the tree");
            }
        }
        Ok(update)
    }

    /// Start searching the current root. `done` is signalled when the
    /// search ends on its own or after [`EngineController::stop`].
    pub fn go(&mut self, limits: SearchLimits, done: Option<Sender<()>>) -> Result<(), SearchError> {
        if self.search.is_some() {
            return Err(SearchError::AlreadyRunning);
        }
        let search = Search::start(
            Arc::clone(&self.tree),
            Arc::clone(&self.stats),
            Arc::clone(&self.backend),
            Arc::clone(&self.cache),
            &self.params,
            limits,
            done,
        )?;
        self.limits = limits;
        self.search = Some(search);
        Ok(())
    }

    pub fn stop(&self, token: &mut LockToken<Unlocked>) {
        if let Some(search) = &self.search {
            search.stop(token);
        }
    }

    /// Stop and join the search, pick the best move and close the move
    /// cycle. Unless the search was infinite analysis, the best move is
    /// played on the tree and the helper queues are purged for it.
    pub fn finish(&mut self, token: &mut LockToken<Unlocked>) -> Result<FinishedMove, SearchError> {
        let mut search = self.search.take().ok_or(SearchError::NotRunning)?;
        search.stop(token);
        let outcome = search.wait();
        let playouts = search.state().playouts();
        drop(search);
        // A failed cycle leaves the final purge undone; the next initial
        // purge then clears the queues.
        outcome?;

        let best = search::best_move(&self.tree.read(token));
        let mut committed = false;
        if !self.limits.infinite {
            if let Some(best) = &best {
                let mut tree = self.tree.write(token);
                let (tree, tree_token) = tree.split();
                let applied = tree.make_move(best.mv)?;
                let report = self.stats.purge_for_move(tree_token, tree, &applied);
                debug!("committed {}: {report}", best.mv);
                committed = true;
            }
        }
        let summary = self.stats.finish_move(token);
        match &best {
            Some(best) => info!(
                "move {} after {playouts} playouts ({} visits, {} cp)",
                best.mv,
                best.visits,
                best.score_cp()
            ),
            None => warn!("search ended without a move"),
        }
        Ok(FinishedMove {
            best,
            committed,
            playouts,
            summary,
        })
    }

    /// Stop a running search without choosing a move.
    fn abort(&mut self, token: &mut LockToken<Unlocked>) {
        if let Some(mut search) = self.search.take() {
            search.stop(token);
            if let Err(err) = search.wait() {
                warn!("aborted search ended with an error: {err}");
            }
        }
    }
}

impl Drop for EngineController {
    fn drop(&mut self) {
        if let Some(mut token) = LockToken::try_new() {
            self.abort(&mut token);
        }
        self.stats.shutdown_engines();
    }
}
