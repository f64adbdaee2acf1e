//! Stress tests: several search workers and helper engines sharing one tree
//! across a short game.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aux_mcts::aux_engine::EngineHandle;
use aux_mcts::backend::MaterialBackend;
use aux_mcts::constants::STARTPOS_FEN;
use aux_mcts::controller::EngineController;
use aux_mcts::locks::LockToken;
use aux_mcts::params::SearchParams;
use aux_mcts::scripted::ScriptedEngine;
use aux_mcts::search::SearchLimits;
use aux_mcts::stats::SearchStats;

const WATCHDOG: Duration = Duration::from_secs(30);

// =============================================================================
// Helper functions
// =============================================================================

fn stress_params(helpers: usize) -> SearchParams {
    let mut params = SearchParams::default();
    params.threads = 3;
    params.minibatch_size = 8;
    params.aux.instances = helpers;
    params.aux.threshold = 2;
    params.aux.time_ms = 5;
    params.aux.max_depth = 3;
    params.aux.node_queue_cap = 16;
    params.aux.pv_queue_cap = 8;
    params
}

/// Controller whose helpers are scripted engines on threads of this process.
fn controller_with_scripted_helpers(params: SearchParams) -> EngineController {
    let stats = Arc::new(SearchStats::from_params(&params.aux));
    stats.set_engine_factory(Some(Arc::new(|index: usize| {
        EngineHandle::in_process(index, move |input, output| {
            let _ = ScriptedEngine::first_legal(6, 20, 50_000)
                .with_think(Duration::from_millis(2))
                .run(input, output);
        })
    })));
    EngineController::with_stats(params, Arc::new(MaterialBackend::default()), stats)
}

// =============================================================================
// Stress
// =============================================================================

#[test]
fn test_game_with_helpers_under_load() {
    let params = stress_params(3);
    let (node_cap, pv_cap) = (params.aux.node_queue_cap, params.aux.pv_queue_cap);
    let mut controller = controller_with_scripted_helpers(params);
    let mut token = LockToken::new();
    controller.new_game(&mut token);

    let mut played: Vec<String> = Vec::new();
    let mut queries = 0;
    for _ in 0..4 {
        let moves: Vec<&str> = played.iter().map(String::as_str).collect();
        controller
            .set_position(&mut token, STARTPOS_FEN, &moves)
            .expect("position from the game so far");

        let limits = SearchLimits {
            movetime: Some(Duration::from_millis(150)),
            ..SearchLimits::default()
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        controller.go(limits, Some(done_tx)).expect("search starts");
        // Sample the queues while everything runs.
        for _ in 0..10 {
            assert!(controller.stats().node_queue_len(&mut token) <= node_cap);
            assert!(controller.stats().pv_queue_len(&mut token) <= pv_cap);
            thread::sleep(Duration::from_millis(5));
        }
        done_rx.recv_timeout(WATCHDOG).expect("search reached its time limit");

        let finished = controller.finish(&mut token).expect("search succeeds");
        assert_eq!(controller.stats().aux_threads_alive(), 0);
        assert!(finished.committed);
        let best = finished.best.expect("a legal move exists");
        played.push(best.mv.to_string());
        queries += finished.summary.queries;

        let tree = controller.tree().read(&mut token);
        assert_eq!(tree.played_moves().len(), played.len());
        assert!(tree.root_node().parent().is_none());
    }
    assert!(queries > 0, "helpers never ran a query");
}

#[test]
fn test_stop_during_infinite_analysis() {
    let mut controller = controller_with_scripted_helpers(stress_params(2));
    let mut token = LockToken::new();
    controller
        .set_position(&mut token, STARTPOS_FEN, &["d2d4", "d7d5"])
        .expect("valid position");
    let limits = SearchLimits {
        infinite: true,
        ..SearchLimits::default()
    };
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    controller.go(limits, Some(done_tx)).expect("search starts");
    thread::sleep(Duration::from_millis(100));
    assert!(controller.is_searching());

    controller.stop(&mut token);
    done_rx.recv_timeout(WATCHDOG).expect("workers exit after stop");
    let finished = controller.finish(&mut token).expect("search succeeds");
    assert!(!finished.committed);
    assert!(finished.best.is_some());
    assert!(finished.playouts > 0);
    assert_eq!(controller.stats().aux_threads_alive(), 0);
    assert_eq!(controller.tree().read(&mut token).played_moves().len(), 2);
}

#[test]
fn test_repeated_searches_reuse_parked_helpers() {
    let mut controller = controller_with_scripted_helpers(stress_params(2));
    let mut token = LockToken::new();
    for _ in 0..3 {
        controller.new_game(&mut token);
        controller
            .set_position(&mut token, STARTPOS_FEN, &[])
            .expect("valid position");
        let limits = SearchLimits {
            nodes: Some(200),
            movetime: Some(Duration::from_secs(5)),
            infinite: false,
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        controller.go(limits, Some(done_tx)).expect("search starts");
        done_rx.recv_timeout(WATCHDOG).expect("search ends");
        let finished = controller.finish(&mut token).expect("search succeeds");
        assert!(finished.best.is_some());
        assert_eq!(controller.stats().aux_threads_alive(), 0);
    }
}
