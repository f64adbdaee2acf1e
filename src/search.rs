//! Search controller.
//!
//! A [`Search`] owns the threads of one search: the primary workers and,
//! when a helper engine is configured, the auxiliary workers. All of them
//! share a [`SearchState`] carrying the global stop flag, the root-ready
//! signal, limits, the playout counter and the first fatal error.
//!
//! Stopping is cooperative: [`SearchState::fire_stop`] sets the flag, wakes
//! every blocked waiter and sends `stop` once to each helper with a query in
//! flight. Workers finish their current iteration and exit; [`Search::wait`]
//! joins them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chess::ChessMove;
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::aux_worker;
use crate::backend::{Backend, EvalCache};
use crate::error::SearchError;
use crate::locks::{LockToken, OrderedRwLock, TreeLock, Unlocked};
use crate::node::{NodeId, NodeTree};
use crate::params::SearchParams;
use crate::stats::{SearchStats, Signal};
use crate::worker::SearchWorker;

/// When a search ends on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchLimits {
    /// Playouts, counted over all workers.
    pub nodes: Option<u64>,
    pub movetime: Option<Duration>,
    /// Run until stopped; other limits are ignored.
    pub infinite: bool,
}

/// State shared by every thread of one search.
pub struct SearchState {
    stop: AtomicBool,
    /// Raised once the root has edges.
    pub root_ready: Signal,
    limits: SearchLimits,
    started: Instant,
    playouts: AtomicU64,
    fatal: Mutex<Option<SearchError>>,
    aux_threshold: u32,
    stats: Arc<SearchStats>,
}

impl SearchState {
    pub fn new(stats: Arc<SearchStats>, limits: SearchLimits, aux_threshold: u32) -> Self {
        Self {
            stop: AtomicBool::new(false),
            root_ready: Signal::new(),
            limits,
            started: Instant::now(),
            playouts: AtomicU64::new(0),
            fatal: Mutex::new(None),
            aux_threshold,
            stats,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }

    /// Stop the search. Only the first call has an effect.
    pub fn fire_stop(&self, token: &mut LockToken<Unlocked>) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("stop fired after {} playouts", self.playouts());
        self.stats.wake_all();
        self.root_ready.notify();
        self.stats.stop_engines(token);
    }

    /// Keep the first fatal error; later ones are only logged.
    pub fn record_fatal(&self, err: SearchError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        } else {
            warn!("additional search failure: {err}");
        }
    }

    fn take_fatal(&self) -> Option<SearchError> {
        self.fatal.lock().take()
    }

    pub fn add_playouts(&self, count: u64) -> u64 {
        self.playouts.fetch_add(count, Ordering::AcqRel) + count
    }

    pub fn playouts(&self) -> u64 {
        self.playouts.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn limits(&self) -> SearchLimits {
        self.limits
    }

    pub fn limits_reached(&self) -> bool {
        if self.limits.infinite {
            return false;
        }
        if self.limits.nodes.is_some_and(|nodes| self.playouts() >= nodes) {
            return true;
        }
        self.limits.movetime.is_some_and(|time| self.elapsed() >= time)
    }

    /// Visits a node needs before it is queued for helper analysis; 0 disables it.
    pub fn aux_threshold(&self) -> u32 {
        self.aux_threshold
    }
}

/// Sends the completion notice when the last search worker exits.
struct WorkerExit {
    alive: Arc<AtomicUsize>,
    done: Option<Sender<()>>,
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        if self.alive.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(done) = &self.done {
                let _ = done.send(());
            }
        }
    }
}

/// A running search.
pub struct Search {
    state: Arc<SearchState>,
    workers: Vec<JoinHandle<()>>,
    aux_workers: Vec<JoinHandle<()>>,
}

impl Search {
    /// Start searching the root of `tree`.
    ///
    /// `done` receives one message when the last primary worker exits, which
    /// happens once a limit is reached or the search is stopped.
    pub fn start(
        tree: Arc<OrderedRwLock<TreeLock, NodeTree>>,
        stats: Arc<SearchStats>,
        backend: Arc<dyn Backend>,
        cache: Arc<EvalCache>,
        params: &SearchParams,
        limits: SearchLimits,
        done: Option<Sender<()>>,
    ) -> Result<Search, SearchError> {
        let mut token = LockToken::new();
        let root_expanded = {
            let guard = tree.read(&mut token);
            if guard.history().last().legal_move_count() == 0 {
                return Err(SearchError::NoLegalMoves);
            }
            guard.root_node().has_edges()
        };

        let helpers = stats.helpers_enabled() && params.aux.instances > 0;
        stats.begin_search(&mut token, helpers);
        let aux_threshold = if !helpers || (params.aux.root_pinned() && params.aux.instances == 1) {
            0
        } else {
            params.aux.threshold
        };
        let state = Arc::new(SearchState::new(Arc::clone(&stats), limits, aux_threshold));
        if root_expanded {
            state.root_ready.raise();
        }

        let threads = params.threads.max(1);
        let alive = Arc::new(AtomicUsize::new(threads));
        let mut search = Search {
            state: Arc::clone(&state),
            workers: Vec::with_capacity(threads),
            aux_workers: Vec::new(),
        };
        for id in 0..threads {
            let exit = WorkerExit {
                alive: Arc::clone(&alive),
                done: done.clone(),
            };
            let tree = Arc::clone(&tree);
            let stats = Arc::clone(&stats);
            let state = Arc::clone(&state);
            let backend = Arc::clone(&backend);
            let cache = Arc::clone(&cache);
            let params = params.clone();
            let spawned = thread::Builder::new().name(format!("search-{id}")).spawn(move || {
                let _exit = exit;
                match SearchWorker::new(id, tree, stats, Arc::clone(&state), backend, cache, params) {
                    Ok(worker) => worker.run(),
                    Err(err) => {
                        state.record_fatal(err);
                        state.fire_stop(&mut LockToken::new());
                    }
                }
            });
            match spawned {
                Ok(handle) => search.workers.push(handle),
                Err(err) => {
                    search.stop(&mut token);
                    return Err(SearchError::Thread(err));
                }
            }
        }

        if helpers {
            for index in 0..params.aux.instances {
                let tree = Arc::clone(&tree);
                let stats = Arc::clone(&stats);
                let state = Arc::clone(&state);
                let aux = params.aux.clone();
                let spawned = thread::Builder::new()
                    .name(format!("aux-{index}"))
                    .spawn(move || aux_worker::run(index, tree, stats, state, aux));
                match spawned {
                    Ok(handle) => search.aux_workers.push(handle),
                    Err(err) => {
                        search.stop(&mut token);
                        return Err(SearchError::Thread(err));
                    }
                }
            }
        }
        info!(
            "search started: {threads} workers, {} helpers, limits {limits:?}",
            search.aux_workers.len()
        );
        Ok(search)
    }

    pub fn state(&self) -> &Arc<SearchState> {
        &self.state
    }

    pub fn stop(&self, token: &mut LockToken<Unlocked>) {
        self.state.fire_stop(token);
    }

    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }

    /// Join every thread. Returns the first fatal error of the search.
    ///
    /// Does not stop the search; call [`Search::stop`] first unless a limit
    /// is known to end it.
    pub fn wait(&mut self) -> Result<(), SearchError> {
        let mut first_panic = None;
        for handle in self.workers.drain(..).chain(self.aux_workers.drain(..)) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() && first_panic.is_none() {
                first_panic = Some(SearchError::WorkerPanicked(name));
            }
        }
        if let Some(err) = self.state.take_fatal() {
            return Err(err);
        }
        match first_panic {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Search {
    fn drop(&mut self) {
        if self.workers.is_empty() && self.aux_workers.is_empty() {
            return;
        }
        let Some(mut token) = LockToken::try_new() else {
            error!("search dropped while a lock is held; its threads are left to finish");
            return;
        };
        self.stop(&mut token);
        if let Err(err) = self.wait() {
            warn!("search ended with an error: {err}");
        }
    }
}

// =============================================================================
// Move selection
// =============================================================================

/// The chosen move of a finished search.
#[derive(Debug, Clone, PartialEq)]
pub struct BestMove {
    pub mv: ChessMove,
    pub ponder: Option<ChessMove>,
    pub visits: u32,
    /// Average value for the side to move at the root.
    pub q: f64,
}

impl BestMove {
    pub fn score_cp(&self) -> i32 {
        q_to_centipawns(self.q)
    }
}

/// Centipawn score of an expected value in `[-1, 1]`.
pub fn q_to_centipawns(q: f64) -> i32 {
    let q = q.clamp(-0.999, 0.999);
    (290.680623072 * (1.548090806 * q).tan()).round() as i32
}

/// Child of `id` with the most visits; ties go to higher Q, then prior.
pub fn best_child(tree: &NodeTree, id: NodeId) -> Option<(ChessMove, Option<NodeId>)> {
    let node = tree.get(id)?;
    node.edges()
        .iter()
        .map(|edge| {
            let child = edge.child().and_then(|c| tree.get(c).map(|n| (c, n)));
            let (n, q) = child.map_or((0, f64::NEG_INFINITY), |(_, n)| {
                (n.n(), if n.n() > 0 { n.wl() } else { f64::NEG_INFINITY })
            });
            (edge, child.map(|(c, _)| c), n, q)
        })
        .max_by(|a, b| {
            a.2.cmp(&b.2)
                .then(a.3.total_cmp(&b.3))
                .then(a.0.prior().total_cmp(&b.0.prior()))
        })
        .map(|(edge, child, _, _)| (edge.mv(), child))
}

/// Best move at the root, or `None` if the root has no edges.
pub fn best_move(tree: &NodeTree) -> Option<BestMove> {
    let (mv, child) = best_child(tree, tree.root())?;
    let (visits, q) = child
        .and_then(|c| tree.get(c))
        .map_or((0, 0.0), |n| (n.n(), n.wl()));
    let ponder = child.and_then(|c| best_child(tree, c)).map(|(mv, _)| mv);
    Some(BestMove { mv, ponder, visits, q })
}

/// Most-visited line from the root, up to `max_len` moves.
pub fn principal_variation(tree: &NodeTree, max_len: usize) -> Vec<ChessMove> {
    let mut line = Vec::new();
    let mut current = Some(tree.root());
    while let Some(id) = current {
        if line.len() >= max_len {
            break;
        }
        let Some((mv, child)) = best_child(tree, id) else {
            break;
        };
        if child.and_then(|c| tree.get(c)).is_none_or(|c| c.n() == 0) {
            break;
        }
        line.push(mv);
        current = child;
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::UniformBackend;

    fn shared(tree: NodeTree) -> Arc<OrderedRwLock<TreeLock, NodeTree>> {
        Arc::new(OrderedRwLock::new(tree))
    }

    #[test]
    fn test_cp_mapping() {
        assert_eq!(q_to_centipawns(0.0), 0);
        assert!(q_to_centipawns(0.5) > 100);
        assert_eq!(q_to_centipawns(-0.5), -q_to_centipawns(0.5));
    }

    #[test]
    fn test_refuses_root_without_moves() {
        // Black is checkmated.
        let tree = NodeTree::from_position("R5k1/5ppp/8/8/8/8/8/6K1 b - - 1 1", &[]).expect("valid");
        let result = Search::start(
            shared(tree),
            Arc::new(SearchStats::new(10, 10)),
            Arc::new(UniformBackend),
            Arc::new(EvalCache::new(10)),
            &SearchParams::default(),
            SearchLimits::default(),
            None,
        );
        assert!(matches!(result, Err(SearchError::NoLegalMoves)));
    }

    #[test]
    fn test_node_limit_ends_search() {
        let tree = shared(NodeTree::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let limits = SearchLimits {
            nodes: Some(200),
            ..SearchLimits::default()
        };
        let mut search = Search::start(
            Arc::clone(&tree),
            Arc::new(SearchStats::new(10, 10)),
            Arc::new(UniformBackend),
            Arc::new(EvalCache::new(1000)),
            &SearchParams::default(),
            limits,
            Some(tx),
        )
        .expect("started");
        rx.recv_timeout(Duration::from_secs(20)).expect("search finishes");
        search.wait().expect("no failure");
        let mut token = LockToken::new();
        let guard = tree.read(&mut token);
        assert!(guard.root_node().n() >= 200);
        assert_eq!(guard.root_node().n_in_flight(), 0);
        let best = best_move(&guard).expect("root expanded");
        assert!(best.visits > 0);
        assert!(!principal_variation(&guard, 10).is_empty());
    }
}
