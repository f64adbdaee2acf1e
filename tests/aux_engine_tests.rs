//! Integration tests for helper engines: the UCI actor against in-process
//! and subprocess engines, and one auxiliary worker end to end.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use aux_mcts::aux_engine::{EngineHandle, GoLimit, InfoLine, QueryOutcome};
use aux_mcts::aux_worker;
use aux_mcts::constants::STARTPOS_FEN;
use aux_mcts::locks::{LockToken, OrderedRwLock};
use aux_mcts::node::{NodeId, NodeTree};
use aux_mcts::params::AuxEngineParams;
use aux_mcts::position::parse_uci_move;
use aux_mcts::scripted::ScriptedEngine;
use aux_mcts::search::{SearchLimits, SearchState};
use aux_mcts::stats::{QueuedNode, SearchStats};

const RUY_LOPEZ: &str = "g1f3 b8c6 f1b5 a7a6 b5a4 g8f6";

// =============================================================================
// Helper functions
// =============================================================================

fn scripted_in_process(index: usize, engine: ScriptedEngine) -> EngineHandle {
    EngineHandle::in_process(index, move |input, output| {
        let _ = engine.run(input, output);
    })
    .expect("engine thread")
}

/// Helper parameters running this crate's binary as a scripted engine.
fn subprocess_params(pv: &str) -> AuxEngineParams {
    AuxEngineParams {
        path: Some(PathBuf::from(env!("CARGO_BIN_EXE_aux-mcts"))),
        args: ["scripted-engine", "--pv", pv, "--depth", "20", "--nodes", "50000"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        instances: 1,
        time_ms: 50,
        ..AuxEngineParams::default()
    }
}

fn grow(tree: &mut NodeTree, id: NodeId, mv: &str) -> NodeId {
    let path = tree.moves_from_root(id).expect("node under root");
    let history = tree.history_after(&path);
    tree.create_edges(id, &history.last().legal_moves(), None);
    let mv = parse_uci_move(history.last().board(), mv).expect("legal move");
    let edge = tree.node(id).find_edge(mv).expect("edge exists");
    tree.get_or_create_child(id, edge).0
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

// =============================================================================
// Engine actor
// =============================================================================

#[test]
fn test_in_process_query_completes() {
    let mut token = LockToken::new();
    let mut engine = scripted_in_process(0, ScriptedEngine::first_legal(4, 12, 900));
    engine
        .start(&mut token, &[], None, Duration::from_secs(5))
        .expect("handshake");

    let cancel = AtomicBool::new(false);
    let mut seen = 0;
    let outcome = engine
        .query(&mut token, STARTPOS_FEN, GoLimit::MoveTime(Duration::from_millis(10)), &cancel, &mut |_, _, _| {
            seen += 1;
        })
        .expect("query");
    let QueryOutcome::Completed(line) = outcome else {
        panic!("expected a completed query, got {outcome:?}");
    };
    let info = InfoLine::parse(&line).expect("info line");
    assert_eq!((info.depth, info.nodes, info.pv.len()), (12, 900, 4));
    assert_eq!(seen, 1);
    assert!(engine.is_running());
}

#[test]
fn test_cancelled_query_is_drained() {
    let mut token = LockToken::new();
    let mut engine = scripted_in_process(1, ScriptedEngine::fixed(&["e2e4", "e7e5"], 3, 10));
    engine
        .start(&mut token, &[], None, Duration::from_secs(5))
        .expect("handshake");

    let cancel = Arc::new(AtomicBool::new(false));
    let canceller = {
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.store(true, Ordering::Release);
        })
    };
    let outcome = engine
        .query(&mut token, STARTPOS_FEN, GoLimit::Infinite, &cancel, &mut |_, _, _| {})
        .expect("query");
    canceller.join().expect("canceller");
    assert_eq!(outcome, QueryOutcome::Cancelled);

    // The engine is idle again and answers the next query normally.
    cancel.store(false, Ordering::Release);
    let outcome = engine
        .query(&mut token, STARTPOS_FEN, GoLimit::MoveTime(Duration::from_millis(5)), &cancel, &mut |_, _, _| {})
        .expect("query");
    assert!(matches!(outcome, QueryOutcome::Completed(_)));
}

#[test]
fn test_subprocess_handshake_and_query() {
    let mut token = LockToken::new();
    let params = subprocess_params(RUY_LOPEZ);
    let path = params.path.clone().expect("binary path");
    let mut engine = EngineHandle::spawn(0, &path, &params.args).expect("spawn");
    engine
        .start(&mut token, &[("Threads".to_string(), "1".to_string())], Some("/tb"), Duration::from_secs(10))
        .expect("handshake");
    let cancel = AtomicBool::new(false);
    let outcome = engine
        .query(
            &mut token,
            "r1bqkbnr/pppp1ppp/2n5/4p3/4P3/5N2/PPPP1PPP/RNBQKB1R w KQkq - 2 3",
            GoLimit::MoveTime(Duration::from_millis(10)),
            &cancel,
            &mut |_, _, _| {},
        )
        .expect("query");
    assert_eq!(
        outcome,
        QueryOutcome::Completed(format!("info depth 20 nodes 50000 pv {RUY_LOPEZ}"))
    );
}

#[test]
fn test_missing_executable_fails_to_spawn() {
    let path = PathBuf::from("/nonexistent/helper-engine");
    assert!(EngineHandle::spawn(0, &path, &[]).is_err());
}

// =============================================================================
// Auxiliary worker end to end
// =============================================================================

#[test]
fn test_worker_turns_node_into_root_relative_pv() {
    let mut token = LockToken::new();
    let aux = subprocess_params(RUY_LOPEZ);
    let tree = Arc::new(OrderedRwLock::new(NodeTree::new()));
    let (e4, e5) = {
        let mut guard = tree.write(&mut token);
        let root = guard.root();
        let e4 = grow(&mut guard, root, "e2e4");
        (e4, grow(&mut guard, e4, "e7e5"))
    };

    let stats = Arc::new(SearchStats::from_params(&aux));
    assert!(stats.helpers_enabled());
    stats.begin_search(&mut token, true);
    let limits = SearchLimits {
        infinite: true,
        ..SearchLimits::default()
    };
    let state = Arc::new(SearchState::new(Arc::clone(&stats), limits, 1));
    let worker = {
        let (tree, stats, state, aux) = (Arc::clone(&tree), Arc::clone(&stats), Arc::clone(&state), aux.clone());
        thread::spawn(move || aux_worker::run(0, tree, stats, state, aux))
    };

    assert!(stats.wait_initial_purge(&mut token, state.stop_flag()));
    assert!(stats.enqueue_node(&mut token, QueuedNode { node: e5, branch: Some(e4) }));
    let produced = wait_until(Duration::from_secs(10), || stats.pv_queue_len(&mut LockToken::new()) > 0);
    state.fire_stop(&mut token);
    worker.join().expect("aux worker");
    assert!(produced, "helper produced no PV");
    assert_eq!(stats.aux_threads_alive(), 0);

    let queued = stats.queued_pvs(&mut token);
    assert_eq!(queued.len(), 1);
    let text: Vec<String> = queued[0].moves.iter().map(ToString::to_string).collect();
    assert_eq!(text.len(), 8);
    assert_eq!(text[..2], ["e2e4", "e7e5"]);
    assert_eq!(text[2..].join(" "), RUY_LOPEZ);
    assert_eq!(queued[0].starting_depth, 2);
    assert_eq!(queued[0].support, 50_000);

    // Playing the first two moves strips them from the queued line.
    for (i, expected_len) in [(0, 7), (1, 6)] {
        let mut guard = tree.write(&mut token);
        let (tree, tree_token) = guard.split();
        let mv = queued[0].moves[i];
        let applied = tree.make_move(mv).expect("legal");
        stats.purge_for_move(tree_token, tree, &applied);
        drop(guard);
        let queued = stats.queued_pvs(&mut token);
        assert_eq!(queued[0].moves.len(), expected_len);
    }
    assert_eq!(stats.queued_pvs(&mut token)[0].starting_depth, 0);
}
