//! Integration tests for the arena search tree.

use aux_mcts::constants::STARTPOS_FEN;
use aux_mcts::game_result::GameResult;
use aux_mcts::node::{Ancestry, NodeId, NodeTree, PositionUpdate};
use aux_mcts::position::parse_uci_move;
use chess::ChessMove;

// =============================================================================
// Helper functions
// =============================================================================

/// Expand `id` with every legal move of its position and return the child
/// reached by `mv`.
fn grow(tree: &mut NodeTree, id: NodeId, mv: &str) -> NodeId {
    let path = tree.moves_from_root(id).expect("node under root");
    let history = tree.history_after(&path);
    let board = *history.last().board();
    tree.create_edges(id, &history.last().legal_moves(), None);
    let mv = parse_uci_move(&board, mv).expect("legal move");
    let edge = tree.node(id).find_edge(mv).expect("edge exists");
    tree.get_or_create_child(id, edge).0
}

fn mv(tree: &NodeTree, text: &str) -> ChessMove {
    parse_uci_move(tree.history().last().board(), text).expect("legal move")
}

// =============================================================================
// Structure
// =============================================================================

#[test]
fn test_ancestry_and_path() {
    let mut tree = NodeTree::new();
    let root = tree.root();
    let e4 = grow(&mut tree, root, "e2e4");
    let e5 = grow(&mut tree, e4, "e7e5");
    let nf3 = grow(&mut tree, e5, "g1f3");

    assert_eq!(tree.ancestry(root), Some(Ancestry { depth: 0, branch: None }));
    assert_eq!(tree.ancestry(e4), Some(Ancestry { depth: 1, branch: Some(e4) }));
    assert_eq!(tree.ancestry(nf3), Some(Ancestry { depth: 3, branch: Some(e4) }));

    let path: Vec<String> = tree
        .moves_from_root(nf3)
        .expect("under root")
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(path, vec!["e2e4", "e7e5", "g1f3"]);
    assert_eq!(tree.live_nodes(), 4);
}

#[test]
fn test_children_are_created_once() {
    let mut tree = NodeTree::new();
    let root = tree.root();
    let first = grow(&mut tree, root, "d2d4");
    let edge = tree.root_node().find_edge(mv(&tree, "d2d4")).expect("edge");
    let (again, created) = tree.get_or_create_child(root, edge);
    assert_eq!(again, first);
    assert!(!created);
}

// =============================================================================
// Moving the root
// =============================================================================

#[test]
fn test_make_move_keeps_subtree() {
    let mut tree = NodeTree::new();
    let root = tree.root();
    let e4 = grow(&mut tree, root, "e2e4");
    let e5 = grow(&mut tree, e4, "e7e5");
    let d4 = grow(&mut tree, root, "d2d4");

    let applied = tree.make_move(mv(&tree, "e2e4")).expect("legal");
    assert!(applied.reused);
    assert_eq!(applied.kept_branch(), Some(e4));
    assert_eq!(tree.root(), e4);
    assert!(tree.root_node().parent().is_none());
    assert!(tree.get(root).is_none());
    assert!(tree.get(d4).is_none(), "sibling subtree is freed");
    assert_eq!(tree.ancestry(e5), Some(Ancestry { depth: 1, branch: Some(e5) }));
    assert_eq!(tree.live_nodes(), 2);
    assert_eq!(tree.history().len(), 2);
}

#[test]
fn test_make_move_into_unexplored_branch() {
    let mut tree = NodeTree::new();
    let root = tree.root();
    grow(&mut tree, root, "e2e4");
    let applied = tree.make_move(mv(&tree, "c2c4")).expect("legal");
    assert!(!applied.reused);
    assert_eq!(applied.kept_branch(), None);
    assert_eq!(tree.live_nodes(), 1);
    assert!(!tree.root_node().has_edges());
}

#[test]
fn test_terminal_child_is_not_kept() {
    let mut tree = NodeTree::from_position("6k1/5ppp/8/8/8/8/8/R5K1 w - - 0 1", &[]).expect("valid");
    let root = tree.root();
    let mate = grow(&mut tree, root, "a1a8");
    tree.node_mut(mate).make_terminal(GameResult::WhiteWon, 1.0, 0.0);
    assert_eq!(tree.node(mate).terminal_result(), Some(GameResult::WhiteWon));
    let applied = tree.make_move(mv(&tree, "a1a8")).expect("legal");
    assert!(!applied.reused);
    assert!(!tree.root_node().is_terminal());
}

#[test]
fn test_illegal_move_is_rejected() {
    let mut tree = NodeTree::new();
    let illegal = ChessMove::new(chess::Square::E2, chess::Square::E5, None);
    assert!(tree.make_move(illegal).is_err());
    assert_eq!(tree.history().len(), 1);
}

// =============================================================================
// Positions
// =============================================================================

#[test]
fn test_reset_extends_current_game() {
    let mut tree = NodeTree::new();
    let root = tree.root();
    let e4 = grow(&mut tree, root, "e2e4");
    let e5 = grow(&mut tree, e4, "e7e5");

    let mut seen = Vec::new();
    let update = tree
        .reset_to_position_with(STARTPOS_FEN, &["e2e4", "e7e5"], |tree, applied| {
            assert_eq!(tree.root(), applied.root);
            seen.push(applied.mv.to_string());
        })
        .expect("valid position");
    let PositionUpdate::Extended(applied) = update else {
        panic!("expected the tree to be reused");
    };
    assert_eq!(seen, vec!["e2e4", "e7e5"]);
    assert!(applied.iter().all(|a| a.reused));
    assert_eq!(tree.root(), e5);
    assert_eq!(tree.played_moves().len(), 2);

    // Same position again: nothing to do.
    let update = tree.reset_to_position(STARTPOS_FEN, &["e2e4", "e7e5"]).expect("valid");
    assert_eq!(update, PositionUpdate::Extended(Vec::new()));
    assert_eq!(tree.root(), e5);
}

#[test]
fn test_reset_rebuilds_unrelated_game() {
    let mut tree = NodeTree::from_position(STARTPOS_FEN, &["e2e4"]).expect("valid");
    let update = tree.reset_to_position(STARTPOS_FEN, &["d2d4"]).expect("valid");
    assert_eq!(update, PositionUpdate::Rebuilt);
    assert_eq!(tree.live_nodes(), 1);

    let update = tree
        .reset_to_position("8/8/8/8/8/5k2/8/5K2 w - - 0 1", &[])
        .expect("valid");
    assert_eq!(update, PositionUpdate::Rebuilt);
    assert_eq!(tree.start_fen(), "8/8/8/8/8/5k2/8/5K2 w - - 0 1");
}

#[test]
fn test_reset_rejects_illegal_moves_and_keeps_tree() {
    let mut tree = NodeTree::from_position(STARTPOS_FEN, &["e2e4"]).expect("valid");
    assert!(tree.reset_to_position(STARTPOS_FEN, &["e2e4", "e2e4"]).is_err());
    assert_eq!(tree.played_moves().len(), 1);
}
