//! Auxiliary worker pool.
//!
//! Each worker thread owns one helper engine for the length of a search.
//! Worker 0 runs the initial purge of the move cycle; the others wait for it
//! before touching the queues. Worker 0 either analyzes the root without a
//! time limit (root-pinned mode) or, like every other worker, serves the
//! node queue with time-limited queries.
//!
//! Lines reported by a helper are truncated to the reported depth, checked
//! for legality, prefixed with the path from the root and offered to the PV
//! queue under a signature of the whole root-relative line.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chess::{Board, ChessMove};
use log::{debug, error, warn};

use crate::aux_engine::{EngineHandle, GoLimit, InfoLine, QueryOutcome};
use crate::constants::{EMPTY_LINE_BACKOFF, HANDSHAKE_TIMEOUT, MAX_PV_LEN, ROOT_PINNED_MIN_DEPTH, ROOT_PINNED_MIN_NODES};
use crate::error::EngineError;
use crate::fen;
use crate::locks::{LockAfter, LockLevel, LockToken, OrderedRwLock, PvQueueLock, TreeLock, Unlocked};
use crate::node::{AuxState, NodeId, NodeTree};
use crate::params::AuxEngineParams;
use crate::position::{move_code, parse_uci_move};
use crate::search::SearchState;
use crate::stats::{PvOffer, QueuedNode, QueuedPv, SearchStats, bump};

/// A node prepared for a helper query.
struct Job {
    node: NodeId,
    depth: u32,
    /// Moves from the root to the node.
    path: Vec<ChessMove>,
    fen: String,
    board: Board,
}

/// Signature of a root-relative line: packed move codes joined by commas.
pub fn pv_signature(moves: &[ChessMove]) -> String {
    moves
        .iter()
        .map(|&mv| move_code(mv).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether a node at `depth` is put back instead of analyzed.
///
/// Nodes up to `max_depth` are always analyzed; deeper ones are analyzed
/// with probability `1 / depth`. `sample` is uniform in `[0, 1)`.
pub fn should_defer(depth: u32, max_depth: u32, sample: f32) -> bool {
    depth > max_depth && sample > 1.0 / depth as f32
}

/// Turn a helper `info` line for the node reached by `root_path` (whose
/// position is `board`) into a queued PV.
///
/// At most `info.depth` moves are kept and parsing stops at the first
/// illegal move. Returns `None` when fewer than `min_pv_len` moves remain.
pub fn encode_and_enqueue<H: LockLevel>(
    stats: &SearchStats,
    token: &mut LockToken<H>,
    root_path: &[ChessMove],
    board: &Board,
    info: &InfoLine,
    min_pv_len: usize,
) -> Option<PvOffer>
where
    PvQueueLock: LockAfter<H>,
{
    let limit = (info.depth as usize).min(MAX_PV_LEN);
    let mut board = *board;
    let mut pv = Vec::with_capacity(limit.min(info.pv.len()));
    for text in info.pv.iter().take(limit) {
        match parse_uci_move(&board, text) {
            Ok(mv) => {
                pv.push(mv);
                board = board.make_move_new(mv);
            }
            Err(err) => {
                debug!("helper line cut at {text}: {err}");
                break;
            }
        }
    }
    if pv.len() < min_pv_len {
        bump(&stats.counters().pvs_too_short, 1);
        return None;
    }
    let mut moves = Vec::with_capacity(root_path.len() + pv.len());
    moves.extend_from_slice(root_path);
    moves.extend_from_slice(&pv);
    let signature = pv_signature(&moves);
    Some(stats.offer_pv(
        token,
        signature,
        QueuedPv {
            moves,
            starting_depth: root_path.len(),
            support: info.nodes,
        },
    ))
}

/// Look up a dequeued node under the read lock. `None` if it left the tree.
fn prepare_job(tree: &OrderedRwLock<TreeLock, NodeTree>, token: &mut LockToken<Unlocked>, entry: QueuedNode) -> Option<Job> {
    let guard = tree.read(token);
    let ancestry = guard.ancestry(entry.node)?;
    let path = guard.moves_from_root(entry.node)?;
    let history = guard.history_after(&path);
    Some(Job {
        node: entry.node,
        depth: ancestry.depth,
        path,
        fen: fen::encode(history.last()),
        board: *history.last().board(),
    })
}

fn resolve(tree: &OrderedRwLock<TreeLock, NodeTree>, token: &mut LockToken<Unlocked>, node: NodeId) {
    if let Some(node) = tree.read(token).get(node) {
        node.set_aux_state(AuxState::Resolved);
    }
}

/// Put a node back at the tail. A node shed by a full queue is resolved.
fn defer(tree: &OrderedRwLock<TreeLock, NodeTree>, stats: &SearchStats, token: &mut LockToken<Unlocked>, entry: QueuedNode) {
    if !stats.requeue_node(token, entry) {
        resolve(tree, token, entry.node);
    }
}

/// Engine for `index`, handshake done.
fn start_engine(
    index: usize,
    stats: &SearchStats,
    aux: &AuxEngineParams,
    token: &mut LockToken<Unlocked>,
) -> Result<EngineHandle, EngineError> {
    let (mut engine, fresh) = stats.acquire_engine(index)?;
    if fresh {
        let mut options = aux.options.clone();
        if index == 0 && aux.root_pinned() {
            options.extend(aux.options_on_root.iter().cloned());
        }
        engine.start(token, &options, aux.syzygy_path.as_deref(), HANDSHAKE_TIMEOUT)?;
    }
    Ok(engine)
}

/// Thread body of auxiliary worker `index`.
pub fn run(
    index: usize,
    tree: Arc<OrderedRwLock<TreeLock, NodeTree>>,
    stats: Arc<SearchStats>,
    state: Arc<SearchState>,
    aux: AuxEngineParams,
) {
    let _alive = stats.register_aux_thread();
    let mut token = LockToken::new();
    let mut engine = match start_engine(index, &stats, &aux, &mut token) {
        Ok(engine) => engine,
        Err(err) => {
            error!("aux[{index}] failed to start: {err}");
            state.record_fatal(err.into());
            state.fire_stop(&mut token);
            return;
        }
    };
    stats.register_engine(&engine);

    let purged = if index == 0 {
        let dropped = stats.run_initial_purge(&mut token);
        if !dropped.is_empty() {
            let released = tree.read(&mut token).release_aux_markers(&dropped);
            debug!("aux[0] initial purge dropped {} nodes, {released} can be queued again", dropped.len());
        }
        true
    } else {
        stats.wait_initial_purge(&mut token, state.stop_flag())
    };

    let result = if !purged {
        Ok(())
    } else if index == 0 && aux.root_pinned() {
        root_pinned_loop(&mut engine, &tree, &stats, &state, &aux, &mut token)
    } else {
        queue_loop(&mut engine, &tree, &stats, &state, &aux, &mut token)
    };
    if let Err(err) = result {
        error!("aux[{index}] failed: {err}");
        state.record_fatal(err.into());
        state.fire_stop(&mut token);
    }
    stats.park_engine(engine);
    debug!("aux[{index}] exiting");
}

fn timed_query(
    engine: &mut EngineHandle,
    stats: &SearchStats,
    state: &SearchState,
    token: &mut LockToken<Unlocked>,
    fen: &str,
    limit: GoLimit,
    on_info: &mut dyn FnMut(&mut LockToken<Unlocked>, &str, &InfoLine),
) -> Result<QueryOutcome, EngineError> {
    let started = Instant::now();
    let outcome = engine.query(token, fen, limit, state.stop_flag(), on_info);
    bump(&stats.counters().queries, 1);
    bump(&stats.counters().query_micros, started.elapsed().as_micros() as u64);
    outcome
}

fn queue_loop(
    engine: &mut EngineHandle,
    tree: &OrderedRwLock<TreeLock, NodeTree>,
    stats: &SearchStats,
    state: &SearchState,
    aux: &AuxEngineParams,
    token: &mut LockToken<Unlocked>,
) -> Result<(), EngineError> {
    let index = engine.index();
    let movetime = GoLimit::MoveTime(Duration::from_millis(aux.time_ms));
    while let Some((entry, remaining)) = stats.pop_node_blocking(token, state.stop_flag()) {
        let Some(job) = prepare_job(tree, token, entry) else {
            bump(&stats.counters().nodes_stale, 1);
            continue;
        };
        if remaining > 0 && should_defer(job.depth, aux.max_depth, fastrand::f32()) {
            defer(tree, stats, token, entry);
            continue;
        }
        let outcome = timed_query(engine, stats, state, token, &job.fen, movetime, &mut |_, _, _| {})?;
        match outcome {
            QueryOutcome::Completed(line) => {
                if let Some(info) = InfoLine::parse(&line) {
                    encode_and_enqueue(stats, token, &job.path, &job.board, &info, aux.min_pv_len);
                }
            }
            QueryOutcome::Empty => {
                warn!("aux[{index}] produced no line for {}", job.fen);
                thread::sleep(EMPTY_LINE_BACKOFF);
            }
            QueryOutcome::Cancelled => {}
        }
        resolve(tree, token, job.node);
    }
    Ok(())
}

fn root_pinned_loop(
    engine: &mut EngineHandle,
    tree: &OrderedRwLock<TreeLock, NodeTree>,
    stats: &SearchStats,
    state: &SearchState,
    aux: &AuxEngineParams,
    token: &mut LockToken<Unlocked>,
) -> Result<(), EngineError> {
    if !state.root_ready.wait(state.stop_flag()) {
        return Ok(());
    }
    while !state.stop_requested() {
        let job = {
            let guard = tree.read(token);
            let root = guard.root();
            guard.root_node().try_mark_aux_pending();
            let last = guard.history().last();
            Job {
                node: root,
                depth: 0,
                path: Vec::new(),
                fen: fen::encode(last),
                board: *last.board(),
            }
        };
        debug!("aux[{}] analyzing the root {}", engine.index(), job.fen);
        let min_pv_len = aux.min_pv_len;
        let mut harvest = |token: &mut LockToken<Unlocked>, _: &str, info: &InfoLine| {
            if info.nodes >= ROOT_PINNED_MIN_NODES || info.depth > ROOT_PINNED_MIN_DEPTH {
                encode_and_enqueue(stats, token, &job.path, &job.board, info, min_pv_len);
            }
        };
        let outcome = timed_query(engine, stats, state, token, &job.fen, GoLimit::Infinite, &mut harvest)?;
        resolve(tree, token, job.node);
        if outcome != QueryOutcome::Cancelled {
            thread::sleep(EMPTY_LINE_BACKOFF);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::PositionHistory;

    fn info(depth: u32, nodes: u64, pv: &str) -> InfoLine {
        InfoLine {
            depth,
            nodes,
            pv: pv.split_whitespace().map(str::to_string).collect(),
        }
    }

    #[test]
    fn test_should_defer_is_monotonic_in_depth() {
        assert!(!should_defer(5, 5, 0.99));
        assert!(!should_defer(8, 5, 0.1));
        assert!(should_defer(8, 5, 0.2));
        // Acceptance 1/depth shrinks with depth.
        let accepted = |depth| (0..100).filter(|i| !should_defer(depth, 0, *i as f32 / 100.0)).count();
        assert!(accepted(2) > accepted(4));
        assert!(accepted(4) > accepted(20));
    }

    #[test]
    fn test_pv_truncated_to_depth() {
        let stats = SearchStats::new(10, 10);
        let mut token = LockToken::new();
        let board = *PositionHistory::starting().last().board();
        let offer = encode_and_enqueue(&stats, &mut token, &[], &board, &info(5, 100, "e2e4 e7e5 g1f3 b8c6 f1b5 a7a6 b5a4"), 4);
        assert_eq!(offer, Some(PvOffer::Accepted));
        let queued = stats.queued_pvs(&mut token);
        assert_eq!(queued[0].moves.len(), 5);
        assert_eq!(queued[0].support, 100);
    }

    #[test]
    fn test_illegal_move_ends_line() {
        let stats = SearchStats::new(10, 10);
        let mut token = LockToken::new();
        let board = *PositionHistory::starting().last().board();
        let offer = encode_and_enqueue(&stats, &mut token, &[], &board, &info(20, 100, "e2e4 e7e5 e4e5 g1f3"), 2);
        assert_eq!(offer, Some(PvOffer::Accepted));
        assert_eq!(stats.queued_pvs(&mut token)[0].moves.len(), 2);
        let short = encode_and_enqueue(&stats, &mut token, &[], &board, &info(20, 100, "e2e4 e7e5 e4e5"), 4);
        assert_eq!(short, None);
    }

    #[test]
    fn test_deferred_node_shed_by_full_queue_is_resolved() {
        let mut token = LockToken::new();
        let stats = SearchStats::new(1, 1);
        let mut tree = NodeTree::new();
        let root = tree.root();
        let moves = tree.history().last().legal_moves();
        tree.create_edges(root, &moves, None);
        let queued = tree.get_or_create_child(root, 0).0;
        let deferred = tree.get_or_create_child(root, 1).0;
        let tree = OrderedRwLock::<TreeLock, NodeTree>::new(tree);

        let entry = |node| QueuedNode { node, branch: Some(node) };
        {
            let guard = tree.read(&mut token);
            assert!(guard.node(queued).try_mark_aux_pending());
            assert!(guard.node(deferred).try_mark_aux_pending());
        }
        assert!(stats.enqueue_node(&mut token, entry(queued)));
        defer(&tree, &stats, &mut token, entry(deferred));

        let guard = tree.read(&mut token);
        assert_eq!(guard.node(deferred).aux_state(), AuxState::Resolved);
        assert_eq!(guard.node(queued).aux_state(), AuxState::Pending);
        drop(guard);
        assert_eq!(stats.node_queue_len(&mut token), 1);
        assert_eq!(stats.counters().nodes_shed.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_signature_covers_root_path() {
        let mut history = PositionHistory::starting();
        let e4 = history.append_uci("e2e4").expect("legal");
        let e5 = history.append_uci("e7e5").expect("legal");
        assert_eq!(pv_signature(&[e4, e5]), format!("{},{}", move_code(e4), move_code(e5)));
        assert_ne!(pv_signature(&[e4]), pv_signature(&[e4, e5]));
    }
}
