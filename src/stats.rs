//! Coordination state shared by one search session.
//!
//! A single [`SearchStats`] is created per session and handed to every
//! search worker, auxiliary worker and the controller behind an `Arc`. It
//! holds the two bounded work queues, the PV deduplication cache, the
//! game/move lifecycle flags, parked helper engines and diagnostic counters.
//!
//! Every lock here sits on the ladder of [`crate::locks`]; the methods are
//! generic over the level the caller already holds so that, for example, a
//! search worker can push to the node queue while still holding the tree lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use chess::ChessMove;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::aux_engine::{EngineControl, EngineHandle};
use crate::constants::CANCEL_POLL;
use crate::error::EngineError;
use crate::locks::{
    AuxQueueLock, LifecycleLock, LockAfter, LockLevel, LockToken, OrderedCondvar, OrderedMutex, PvCacheLock,
    PvQueueLock, Unlocked,
};
use crate::node::{AppliedMove, NodeId, NodeTree};
use crate::params::AuxEngineParams;
use crate::purge::{self, PurgeReport};

// =============================================================================
// Queue entries
// =============================================================================

/// A node waiting for helper analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedNode {
    pub node: NodeId,
    /// Depth-1 ancestor when queued; `None` for the root.
    pub branch: Option<NodeId>,
}

/// A helper line waiting to be spliced into the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPv {
    /// Moves from the current root, oldest first.
    pub moves: Vec<ChessMove>,
    /// Depth of the analyzed node; moves past it come from the helper.
    pub starting_depth: usize,
    /// Nodes the helper searched for this line.
    pub support: u64,
}

/// FIFO that refuses pushes once full.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    cap: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::new(),
            cap,
        }
    }

    /// Append `item`. Returns false, dropping it, when the queue is full.
    pub fn push(&mut self, item: T) -> bool {
        if self.items.len() >= self.cap {
            return false;
        }
        self.items.push_back(item);
        true
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Replace every item by `f(item)`, dropping those mapped to `None`.
    /// Order is preserved. Returns the number dropped.
    pub fn retain_map<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(T) -> Option<T>,
    {
        let before = self.items.len();
        self.items = self.items.drain(..).filter_map(&mut f).collect();
        before - self.items.len()
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Game and move-cycle flags.
#[derive(Debug, Default)]
struct Lifecycle {
    /// Set by `ucinewgame`; consumed by the initial purge.
    new_game: bool,
    /// Queues are consistent with the root of the current move cycle.
    initial_purge_done: bool,
    /// The controller purged (or deliberately kept) the queues after the
    /// last move cycle.
    final_purge_done: bool,
}

/// One-shot notification that can be waited on together with a stop flag.
#[derive(Default)]
pub struct Signal {
    raised: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        *self.raised.lock() = true;
        self.cv.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock()
    }

    pub fn reset(&self) {
        *self.raised.lock() = false;
    }

    /// Wake waiters so they re-check their stop flag.
    pub fn notify(&self) {
        let _raised = self.raised.lock();
        self.cv.notify_all();
    }

    /// Block until raised or `stop` is set. Returns true if raised.
    pub fn wait(&self, stop: &AtomicBool) -> bool {
        let mut raised = self.raised.lock();
        while !*raised {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            self.cv.wait_for(&mut raised, CANCEL_POLL);
        }
        true
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Diagnostic counters of the helper pipeline for the current move.
#[derive(Debug, Default)]
pub struct AuxCounters {
    pub nodes_enqueued: AtomicU64,
    pub nodes_shed: AtomicU64,
    pub nodes_stale: AtomicU64,
    pub nodes_deferred: AtomicU64,
    pub pvs_accepted: AtomicU64,
    pub pvs_duplicate: AtomicU64,
    pub pvs_too_short: AtomicU64,
    pub pvs_shed: AtomicU64,
    /// Tree nodes created from helper lines.
    pub nodes_injected: AtomicU64,
    pub queries: AtomicU64,
    pub query_micros: AtomicU64,
}

/// Increment a relaxed counter.
pub fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl AuxCounters {
    fn take(counter: &AtomicU64) -> u64 {
        counter.swap(0, Ordering::Relaxed)
    }

    fn drain(&self, node_queue_len: usize, pv_queue_len: usize) -> AuxSummary {
        AuxSummary {
            node_queue_len,
            pv_queue_len,
            nodes_enqueued: Self::take(&self.nodes_enqueued),
            nodes_shed: Self::take(&self.nodes_shed),
            nodes_stale: Self::take(&self.nodes_stale),
            nodes_deferred: Self::take(&self.nodes_deferred),
            pvs_accepted: Self::take(&self.pvs_accepted),
            pvs_duplicate: Self::take(&self.pvs_duplicate),
            pvs_too_short: Self::take(&self.pvs_too_short),
            pvs_shed: Self::take(&self.pvs_shed),
            nodes_injected: Self::take(&self.nodes_injected),
            queries: Self::take(&self.queries),
            query_micros: Self::take(&self.query_micros),
        }
    }
}

/// Counters of one move cycle, as logged when it ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuxSummary {
    pub node_queue_len: usize,
    pub pv_queue_len: usize,
    pub nodes_enqueued: u64,
    pub nodes_shed: u64,
    pub nodes_stale: u64,
    pub nodes_deferred: u64,
    pub pvs_accepted: u64,
    pub pvs_duplicate: u64,
    pub pvs_too_short: u64,
    pub pvs_shed: u64,
    pub nodes_injected: u64,
    pub queries: u64,
    pub query_micros: u64,
}

impl AuxSummary {
    pub fn mean_query_ms(&self) -> f64 {
        if self.queries == 0 {
            return 0.0;
        }
        self.query_micros as f64 / self.queries as f64 / 1000.0
    }
}

impl fmt::Display for AuxSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queues {}/{} | enqueued {} shed {} stale {} deferred {} | pvs {} dup {} short {} shed {} | injected {} | queries {} ({:.1} ms avg)",
            self.node_queue_len,
            self.pv_queue_len,
            self.nodes_enqueued,
            self.nodes_shed,
            self.nodes_stale,
            self.nodes_deferred,
            self.pvs_accepted,
            self.pvs_duplicate,
            self.pvs_too_short,
            self.pvs_shed,
            self.nodes_injected,
            self.queries,
            self.mean_query_ms(),
        )
    }
}

/// Keeps the auxiliary thread count up while alive.
pub struct AliveGuard<'a>(&'a AtomicUsize);

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Engines
// =============================================================================

/// Creates the helper engine for a worker index.
pub type EngineFactory = Arc<dyn Fn(usize) -> Result<EngineHandle, EngineError> + Send + Sync>;

/// Factory spawning `aux.path` as a child process, if a path is set.
pub fn process_factory(aux: &AuxEngineParams) -> Option<EngineFactory> {
    let path = aux.path.clone()?;
    let args = aux.args.clone();
    Some(Arc::new(move |index| EngineHandle::spawn(index, &path, &args)))
}

/// Outcome of [`SearchStats::offer_pv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvOffer {
    Accepted,
    Duplicate,
    Shed,
}

// =============================================================================
// SearchStats
// =============================================================================

pub struct SearchStats {
    node_queue: OrderedMutex<AuxQueueLock, BoundedQueue<QueuedNode>>,
    node_ready: OrderedCondvar,
    pv_queue: OrderedMutex<PvQueueLock, BoundedQueue<QueuedPv>>,
    pv_cache: OrderedMutex<PvCacheLock, HashSet<String>>,
    lifecycle: OrderedMutex<LifecycleLock, Lifecycle>,
    lifecycle_changed: OrderedCondvar,
    factory: Mutex<Option<EngineFactory>>,
    parked: Mutex<HashMap<usize, EngineHandle>>,
    controls: Mutex<HashMap<usize, Arc<EngineControl>>>,
    counters: AuxCounters,
    aux_alive: AtomicUsize,
}

impl SearchStats {
    pub fn new(node_queue_cap: usize, pv_queue_cap: usize) -> Self {
        Self {
            node_queue: OrderedMutex::new(BoundedQueue::new(node_queue_cap)),
            node_ready: OrderedCondvar::new(),
            pv_queue: OrderedMutex::new(BoundedQueue::new(pv_queue_cap)),
            pv_cache: OrderedMutex::new(HashSet::new()),
            lifecycle: OrderedMutex::new(Lifecycle::default()),
            lifecycle_changed: OrderedCondvar::new(),
            factory: Mutex::new(None),
            parked: Mutex::new(HashMap::new()),
            controls: Mutex::new(HashMap::new()),
            counters: AuxCounters::default(),
            aux_alive: AtomicUsize::new(0),
        }
    }

    /// Session context sized and wired from `aux`.
    pub fn from_params(aux: &AuxEngineParams) -> Self {
        let stats = Self::new(aux.node_queue_cap, aux.pv_queue_cap);
        stats.set_engine_factory(process_factory(aux));
        stats
    }

    pub fn counters(&self) -> &AuxCounters {
        &self.counters
    }

    // -------------------------------------------------------------------------
    // Node queue
    // -------------------------------------------------------------------------

    /// Queue a node for analysis. Returns false if it was shed.
    pub fn enqueue_node<H: LockLevel>(&self, token: &mut LockToken<H>, entry: QueuedNode) -> bool
    where
        AuxQueueLock: LockAfter<H>,
    {
        let pushed = self.node_queue.lock(token).push(entry);
        if pushed {
            bump(&self.counters.nodes_enqueued, 1);
            self.node_ready.notify_one();
        } else {
            bump(&self.counters.nodes_shed, 1);
        }
        pushed
    }

    /// Put a popped entry back at the tail.
    pub fn requeue_node<H: LockLevel>(&self, token: &mut LockToken<H>, entry: QueuedNode) -> bool
    where
        AuxQueueLock: LockAfter<H>,
    {
        let pushed = self.node_queue.lock(token).push(entry);
        if pushed {
            bump(&self.counters.nodes_deferred, 1);
        } else {
            bump(&self.counters.nodes_shed, 1);
        }
        pushed
    }

    /// Block until an entry is available or `stop` is set.
    ///
    /// Also returns the number of entries left behind it.
    pub fn pop_node_blocking(&self, token: &mut LockToken<Unlocked>, stop: &AtomicBool) -> Option<(QueuedNode, usize)> {
        let mut queue = self.node_queue.lock(token);
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            if let Some(entry) = queue.pop() {
                return Some((entry, queue.len()));
            }
            self.node_ready.wait_for(&mut queue, CANCEL_POLL);
        }
    }

    pub fn node_queue_len<H: LockLevel>(&self, token: &mut LockToken<H>) -> usize
    where
        AuxQueueLock: LockAfter<H>,
    {
        self.node_queue.lock(token).len()
    }

    // -------------------------------------------------------------------------
    // PV queue
    // -------------------------------------------------------------------------

    /// Queue a helper line unless its signature was seen before.
    pub fn offer_pv<H: LockLevel>(&self, token: &mut LockToken<H>, signature: String, pv: QueuedPv) -> PvOffer
    where
        PvQueueLock: LockAfter<H>,
    {
        let mut queue = self.pv_queue.lock(token);
        let (queue, queue_token) = queue.split();
        if !self.pv_cache.lock(queue_token).insert(signature) {
            bump(&self.counters.pvs_duplicate, 1);
            return PvOffer::Duplicate;
        }
        if !queue.push(pv) {
            bump(&self.counters.pvs_shed, 1);
            return PvOffer::Shed;
        }
        bump(&self.counters.pvs_accepted, 1);
        PvOffer::Accepted
    }

    /// Take up to `max` lines for injection.
    ///
    /// Returns nothing until the initial purge of the move cycle is done.
    pub fn drain_pvs<H: LockLevel>(&self, token: &mut LockToken<H>, max: usize) -> Vec<QueuedPv>
    where
        LifecycleLock: LockAfter<H>,
    {
        let mut lifecycle = self.lifecycle.lock(token);
        let (lifecycle, lifecycle_token) = lifecycle.split();
        if !lifecycle.initial_purge_done {
            return Vec::new();
        }
        let mut queue = self.pv_queue.lock(lifecycle_token);
        let take = max.min(queue.len());
        (0..take).filter_map(|_| queue.pop()).collect()
    }

    pub fn pv_queue_len<H: LockLevel>(&self, token: &mut LockToken<H>) -> usize
    where
        PvQueueLock: LockAfter<H>,
    {
        self.pv_queue.lock(token).len()
    }

    /// Lines waiting for injection, oldest first.
    pub fn queued_pvs<H: LockLevel>(&self, token: &mut LockToken<H>) -> Vec<QueuedPv>
    where
        PvQueueLock: LockAfter<H>,
    {
        self.pv_queue.lock(token).iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Purge
    // -------------------------------------------------------------------------

    /// Drop queued work that does not survive `applied` and re-anchor the rest.
    ///
    /// `tree` must already be re-rooted by `applied`.
    pub fn purge_for_move<H: LockLevel>(&self, token: &mut LockToken<H>, tree: &NodeTree, applied: &AppliedMove) -> PurgeReport
    where
        AuxQueueLock: LockAfter<H>,
    {
        let mut nodes = self.node_queue.lock(token);
        let (nodes, nodes_token) = nodes.split();
        let (nodes_kept, nodes_dropped) = purge::purge_node_queue(nodes, tree, applied.kept_branch());
        let mut pvs = self.pv_queue.lock(nodes_token);
        let (pvs_kept, pvs_dropped) = purge::purge_pv_queue(&mut pvs, applied.mv);
        let report = PurgeReport {
            nodes_kept,
            nodes_dropped,
            pvs_kept,
            pvs_dropped,
        };
        debug!("purge after {}: {report}", applied.mv);
        report
    }

    /// Empty both queues.
    pub fn clear_queues<H: LockLevel>(&self, token: &mut LockToken<H>)
    where
        AuxQueueLock: LockAfter<H>,
    {
        self.drain_queues(token);
    }

    /// Empty both queues, returning the nodes that were waiting.
    fn drain_queues<H: LockLevel>(&self, token: &mut LockToken<H>) -> Vec<NodeId>
    where
        AuxQueueLock: LockAfter<H>,
    {
        let mut nodes = self.node_queue.lock(token);
        let (nodes, nodes_token) = nodes.split();
        let dropped = nodes.iter().map(|entry| entry.node).collect();
        nodes.clear();
        self.pv_queue.lock(nodes_token).clear();
        dropped
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub fn mark_new_game(&self, token: &mut LockToken<Unlocked>) {
        self.lifecycle.lock(token).new_game = true;
    }

    /// Open a move cycle. Without helpers there is nothing to purge, so PV
    /// consumption is allowed immediately.
    pub fn begin_search(&self, token: &mut LockToken<Unlocked>, helpers: bool) {
        let mut lifecycle = self.lifecycle.lock(token);
        lifecycle.initial_purge_done = !helpers;
    }

    /// Run by auxiliary worker 0 before any helper work of the move cycle.
    ///
    /// A new game, or a previous cycle that ended without its final purge,
    /// leaves queues that may not match the root; they are emptied. Returns
    /// the nodes whose entries were dropped; their markers are still
    /// pending (see [`NodeTree::release_aux_markers`]).
    pub fn run_initial_purge(&self, token: &mut LockToken<Unlocked>) -> Vec<NodeId> {
        let mut lifecycle = self.lifecycle.lock(token);
        let (lifecycle, lifecycle_token) = lifecycle.split();
        let mut dropped = Vec::new();
        if lifecycle.new_game || !lifecycle.final_purge_done {
            dropped = self.drain_queues(lifecycle_token);
            if lifecycle.new_game {
                let mut queue = self.pv_queue.lock(lifecycle_token);
                self.pv_cache.lock(queue.token()).clear();
            }
            debug!("initial purge cleared the helper queues (new game: {})", lifecycle.new_game);
        }
        lifecycle.new_game = false;
        lifecycle.final_purge_done = false;
        lifecycle.initial_purge_done = true;
        self.lifecycle_changed.notify_all();
        dropped
    }

    /// Block until the initial purge ran or `stop` is set. Returns true once purged.
    pub fn wait_initial_purge(&self, token: &mut LockToken<Unlocked>, stop: &AtomicBool) -> bool {
        let mut lifecycle = self.lifecycle.lock(token);
        loop {
            if lifecycle.initial_purge_done {
                return true;
            }
            if stop.load(Ordering::Acquire) {
                return false;
            }
            self.lifecycle_changed.wait_for(&mut lifecycle, CANCEL_POLL);
        }
    }

    /// Close the move cycle: log and reset counters, forget PV signatures.
    pub fn finish_move(&self, token: &mut LockToken<Unlocked>) -> AuxSummary {
        let mut lifecycle = self.lifecycle.lock(token);
        let (lifecycle, lifecycle_token) = lifecycle.split();
        lifecycle.final_purge_done = true;
        lifecycle.initial_purge_done = false;
        let mut nodes = self.node_queue.lock(lifecycle_token);
        let (nodes, nodes_token) = nodes.split();
        let mut pvs = self.pv_queue.lock(nodes_token);
        let (pvs, pvs_token) = pvs.split();
        self.pv_cache.lock(pvs_token).clear();
        let summary = self.counters.drain(nodes.len(), pvs.len());
        info!("helper summary: {summary}");
        summary
    }

    // -------------------------------------------------------------------------
    // Threads and engines
    // -------------------------------------------------------------------------

    pub fn register_aux_thread(&self) -> AliveGuard<'_> {
        self.aux_alive.fetch_add(1, Ordering::AcqRel);
        AliveGuard(&self.aux_alive)
    }

    pub fn aux_threads_alive(&self) -> usize {
        self.aux_alive.load(Ordering::Acquire)
    }

    /// Wake every thread blocked on a queue or lifecycle condition.
    pub fn wake_all(&self) {
        self.node_ready.notify_all();
        self.lifecycle_changed.notify_all();
    }

    /// Replace the engine factory. Parked engines were made by the old one
    /// and are shut down.
    pub fn set_engine_factory(&self, factory: Option<EngineFactory>) {
        *self.factory.lock() = factory;
        let parked: Vec<EngineHandle> = self.parked.lock().drain().map(|(_, handle)| handle).collect();
        drop(parked);
    }

    pub fn helpers_enabled(&self) -> bool {
        self.factory.lock().is_some()
    }

    /// Engine for worker `index`: the parked one if it is still running,
    /// otherwise a fresh one. The flag is true for fresh engines, which
    /// still need their handshake.
    pub fn acquire_engine(&self, index: usize) -> Result<(EngineHandle, bool), EngineError> {
        let parked = self.parked.lock().remove(&index);
        if let Some(mut handle) = parked {
            if handle.is_running() {
                return Ok((handle, false));
            }
            debug!("aux[{index}] parked engine is gone, spawning a new one");
        }
        let factory = self.factory.lock().clone().ok_or(EngineError::NotConfigured)?;
        Ok((factory(index)?, true))
    }

    /// Expose a running engine to [`SearchStats::stop_engines`].
    pub fn register_engine(&self, handle: &EngineHandle) {
        self.controls.lock().insert(handle.index(), handle.control());
    }

    /// Keep a still-running engine for the next search.
    pub fn park_engine(&self, mut handle: EngineHandle) {
        self.controls.lock().remove(&handle.index());
        if handle.is_running() {
            self.parked.lock().insert(handle.index(), handle);
        }
    }

    /// Send `stop` to every helper with a query in progress, once.
    pub fn stop_engines(&self, token: &mut LockToken<Unlocked>) {
        let controls: Vec<Arc<EngineControl>> = self.controls.lock().values().cloned().collect();
        for control in controls {
            if let Err(err) = control.stop_once(token) {
                debug!("aux[{}] stop failed: {err}", control.index());
            }
        }
    }

    /// Shut down parked engines.
    pub fn shutdown_engines(&self) {
        let parked: Vec<EngineHandle> = self.parked.lock().drain().map(|(_, handle)| handle).collect();
        drop(parked);
    }
}
