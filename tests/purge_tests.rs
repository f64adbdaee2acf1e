//! Integration tests for the helper queues: purge, deduplication and caps.

use std::sync::atomic::{AtomicBool, Ordering};

use aux_mcts::locks::LockToken;
use aux_mcts::node::{AuxState, NodeId, NodeTree};
use aux_mcts::position::parse_uci_move;
use aux_mcts::stats::{PvOffer, QueuedNode, QueuedPv, SearchStats};
use chess::ChessMove;

// =============================================================================
// Helper functions
// =============================================================================

/// Child of `id` reached by `mv`, expanding `id` if needed.
fn grow(tree: &mut NodeTree, id: NodeId, mv: &str) -> NodeId {
    let path = tree.moves_from_root(id).expect("node under root");
    let history = tree.history_after(&path);
    tree.create_edges(id, &history.last().legal_moves(), None);
    let mv = parse_uci_move(history.last().board(), mv).expect("legal move");
    let edge = tree.node(id).find_edge(mv).expect("edge exists");
    tree.get_or_create_child(id, edge).0
}

/// Moves from the root position of `tree`.
fn line(tree: &NodeTree, moves: &[&str]) -> Vec<ChessMove> {
    let mut history = tree.history().clone();
    moves
        .iter()
        .map(|text| history.append_uci(text).expect("legal move"))
        .collect()
}

fn entry(tree: &NodeTree, node: NodeId) -> QueuedNode {
    QueuedNode {
        node,
        branch: tree.ancestry(node).expect("under root").branch,
    }
}

fn drain_nodes(stats: &SearchStats) -> Vec<QueuedNode> {
    let mut token = LockToken::new();
    let stop = AtomicBool::new(false);
    let mut out = Vec::new();
    while stats.node_queue_len(&mut token) > 0 {
        let (entry, _) = stats.pop_node_blocking(&mut token, &stop).expect("entry available");
        out.push(entry);
    }
    out
}

// =============================================================================
// Node queue purge
// =============================================================================

#[test]
fn test_purge_keeps_only_selected_branch() {
    let mut token = LockToken::new();
    let stats = SearchStats::new(64, 64);
    let mut tree = NodeTree::new();
    let root = tree.root();

    // G1 is reached by the move that will be played, G2 is not.
    let g1 = grow(&mut tree, root, "e2e4");
    let g1_a = grow(&mut tree, g1, "e7e5");
    let g1_b = grow(&mut tree, g1, "c7c5");
    let g1_a_deep = grow(&mut tree, g1_a, "g1f3");
    let g2 = grow(&mut tree, root, "d2d4");
    let g2_a = grow(&mut tree, g2, "d7d5");
    let g2_b = grow(&mut tree, g2_a, "c2c4");

    for node in [g1_a, g2_a, g1_b, g2_b, g1_a_deep] {
        assert!(stats.enqueue_node(&mut token, entry(&tree, node)));
    }
    let before_g1 = drain_nodes(&stats)
        .into_iter()
        .inspect(|e| assert!(stats.enqueue_node(&mut token, *e)))
        .filter(|e| e.branch == Some(g1))
        .count();
    assert_eq!(before_g1, 3);

    let e4 = line(&tree, &["e2e4"])[0];
    let applied = tree.make_move(e4).expect("legal");
    let report = stats.purge_for_move(&mut token, &tree, &applied);
    assert_eq!(report.nodes_kept, before_g1);
    assert_eq!(report.nodes_dropped, 2);

    let kept = drain_nodes(&stats);
    assert_eq!(
        kept,
        vec![
            QueuedNode { node: g1_a, branch: Some(g1_a) },
            QueuedNode { node: g1_b, branch: Some(g1_b) },
            QueuedNode { node: g1_a_deep, branch: Some(g1_a) },
        ]
    );
}

#[test]
fn test_purge_into_unexplored_move_drops_everything() {
    let mut token = LockToken::new();
    let stats = SearchStats::new(64, 64);
    let mut tree = NodeTree::new();
    let root = tree.root();
    let e4 = grow(&mut tree, root, "e2e4");
    let e5 = grow(&mut tree, e4, "e7e5");
    stats.enqueue_node(&mut token, entry(&tree, e5));

    let c4 = line(&tree, &["c2c4"])[0];
    let applied = tree.make_move(c4).expect("legal");
    let report = stats.purge_for_move(&mut token, &tree, &applied);
    assert_eq!((report.nodes_kept, report.nodes_dropped), (0, 1));
    assert_eq!(stats.node_queue_len(&mut token), 0);
}

#[test]
fn test_initial_purge_after_aborted_cycle_releases_markers() {
    let mut token = LockToken::new();
    let stats = SearchStats::new(64, 64);
    let mut tree = NodeTree::new();
    let root = tree.root();
    let e4 = grow(&mut tree, root, "e2e4");
    let e5 = grow(&mut tree, e4, "e7e5");
    for node in [e4, e5] {
        assert!(tree.node(node).try_mark_aux_pending());
        stats.enqueue_node(&mut token, entry(&tree, node));
    }

    // The cycle ends without its final purge, so the next one clears the queues.
    stats.begin_search(&mut token, true);
    let dropped = stats.run_initial_purge(&mut token);
    assert_eq!(dropped, vec![e4, e5]);
    assert_eq!(stats.node_queue_len(&mut token), 0);

    // Both nodes survive the move that was replayed; the old root does not.
    let e4_move = line(&tree, &["e2e4"])[0];
    tree.make_move(e4_move).expect("legal");
    assert_eq!(tree.release_aux_markers(&[root, e4, e5]), 2);
    assert_eq!(tree.node(e5).aux_state(), AuxState::None);
    assert!(tree.node(e5).try_mark_aux_pending());
}

// =============================================================================
// PV queue purge
// =============================================================================

#[test]
fn test_pv_purge_strips_played_moves() {
    let mut token = LockToken::new();
    let stats = SearchStats::new(8, 8);
    let mut tree = NodeTree::new();
    let moves = line(&tree, &["e2e4", "e7e5", "g1f3", "b8c6", "f1b5", "a7a6"]);
    let other = line(&tree, &["d2d4", "d7d5", "c2c4", "e7e6"]);
    for (signature, pv) in [("ruy", moves.clone()), ("qgd", other)] {
        let offer = stats.offer_pv(
            &mut token,
            signature.to_string(),
            QueuedPv {
                moves: pv,
                starting_depth: 2,
                support: 50_000,
            },
        );
        assert_eq!(offer, PvOffer::Accepted);
    }

    for (ply, &mv) in moves.iter().take(2).enumerate() {
        let applied = tree.make_move(mv).expect("legal");
        let report = stats.purge_for_move(&mut token, &tree, &applied);
        assert_eq!(report.pvs_kept, 1);
        assert_eq!(report.pvs_dropped, usize::from(ply == 0));
    }
    let queued = stats.queued_pvs(&mut token);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].moves, moves[2..].to_vec());
    assert_eq!(queued[0].starting_depth, 0);
}

// =============================================================================
// Deduplication and caps
// =============================================================================

#[test]
fn test_same_signature_reaches_queue_once() {
    let mut token = LockToken::new();
    let stats = SearchStats::new(8, 8);
    let tree = NodeTree::new();
    let pv = QueuedPv {
        moves: line(&tree, &["e2e4", "e7e5", "g1f3", "b8c6"]),
        starting_depth: 0,
        support: 1,
    };
    assert_eq!(stats.offer_pv(&mut token, "sig".to_string(), pv.clone()), PvOffer::Accepted);
    assert_eq!(stats.offer_pv(&mut token, "sig".to_string(), pv), PvOffer::Duplicate);
    assert_eq!(stats.pv_queue_len(&mut token), 1);
    assert_eq!(stats.counters().pvs_duplicate.load(Ordering::Relaxed), 1);
}

#[test]
fn test_new_game_forgets_signatures() {
    let mut token = LockToken::new();
    let stats = SearchStats::new(8, 8);
    let tree = NodeTree::new();
    let pv = QueuedPv {
        moves: line(&tree, &["e2e4", "e7e5", "g1f3", "b8c6"]),
        starting_depth: 0,
        support: 1,
    };
    stats.offer_pv(&mut token, "sig".to_string(), pv.clone());
    stats.mark_new_game(&mut token);
    stats.begin_search(&mut token, true);
    stats.run_initial_purge(&mut token);
    assert_eq!(stats.pv_queue_len(&mut token), 0);
    assert_eq!(stats.offer_pv(&mut token, "sig".to_string(), pv), PvOffer::Accepted);
}

#[test]
fn test_queues_never_exceed_caps() {
    let mut token = LockToken::new();
    let stats = SearchStats::new(2, 3);
    let mut tree = NodeTree::new();
    let root = tree.root();
    let nodes: Vec<NodeId> = ["a2a3", "b2b3", "c2c3", "d2d3", "e2e3"]
        .iter()
        .map(|mv| grow(&mut tree, root, mv))
        .collect();
    let pushed = nodes
        .iter()
        .filter(|&&node| stats.enqueue_node(&mut token, entry(&tree, node)))
        .count();
    assert_eq!(pushed, 2);
    assert_eq!(stats.node_queue_len(&mut token), 2);

    let mut accepted = 0;
    for (i, first) in ["a2a3", "b2b3", "c2c3", "d2d3", "e2e3", "g2g3"].into_iter().enumerate() {
        let pv = QueuedPv {
            moves: line(&tree, &[first, "e7e5", "g1f3", "b8c6"]),
            starting_depth: 0,
            support: 1,
        };
        if stats.offer_pv(&mut token, format!("pv{i}"), pv) == PvOffer::Accepted {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(stats.pv_queue_len(&mut token), 3);
    let counters = stats.counters();
    assert_eq!(counters.nodes_shed.load(Ordering::Relaxed), 3);
    assert_eq!(counters.pvs_shed.load(Ordering::Relaxed), 3);
}
