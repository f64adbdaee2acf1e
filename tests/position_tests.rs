//! Integration tests for game histories, results and FEN text.

use aux_mcts::constants::STARTPOS_FEN;
use aux_mcts::fen;
use aux_mcts::game_result::GameResult;
use aux_mcts::position::PositionHistory;
use chess::Color;

// =============================================================================
// Helper functions
// =============================================================================

fn play(fen: &str, moves: &[&str]) -> PositionHistory {
    let mut history = PositionHistory::from_fen(fen).expect("valid fen");
    for mv in moves {
        history.append_uci(mv).expect("legal move");
    }
    history
}

const KNIGHT_SHUFFLE: [&str; 4] = ["g1f3", "g8f6", "f3g1", "f6g8"];

// =============================================================================
// FEN
// =============================================================================

#[test]
fn test_fen_after_e4_e5() {
    let history = play(STARTPOS_FEN, &["e2e4", "e7e5"]);
    assert_eq!(
        fen::encode(history.last()),
        "rnbqkbnr/pppp1ppp/8/4p3/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2"
    );
}

#[test]
fn test_fen_keeps_capturable_en_passant() {
    let history = play(STARTPOS_FEN, &["e2e4", "a7a6", "e4e5", "d7d5"]);
    let text = fen::encode(history.last());
    assert_eq!(text, "rnbqkbnr/1pp1pppp/p7/3pP3/8/8/PPPP1PPP/RNBQKBNR w KQkq d6 0 3");
}

#[test]
fn test_fen_round_trip() {
    let texts = [
        STARTPOS_FEN,
        "r3k2r/pppq1ppp/2n2n2/3pp3/1b1PP3/2N2N2/PPPQ1PPP/R3KB1R b KQkq - 3 7",
        "8/8/8/8/8/5k2/8/5K2 w - - 42 120",
    ];
    for text in texts {
        let history = PositionHistory::from_fen(text).expect("valid fen");
        assert_eq!(fen::encode(history.last()), text);
        let parsed = fen::parse(text).expect("valid fen");
        assert!(parsed.board == *history.last().board());
        assert_eq!(parsed.rule50_ply, history.last().rule50_ply());
    }
}

#[test]
fn test_fen_rejects_garbage() {
    assert!(PositionHistory::from_fen("").is_err());
    assert!(PositionHistory::from_fen("8/8/8 w - - 0 1").is_err());
}

// =============================================================================
// Game results
// =============================================================================

#[test]
fn test_fools_mate() {
    let history = play(STARTPOS_FEN, &["f2f3", "e7e5", "g2g4", "d8h4"]);
    let result = history.compute_game_result();
    assert_eq!(result, GameResult::BlackWon);
    assert_eq!(result.to_string(), "0-1");
    // Pure: asking twice gives the same answer.
    assert_eq!(history.compute_game_result(), result);
}

#[test]
fn test_stalemate_is_credited_to_the_stalemating_side() {
    let history = play("k7/8/8/8/8/8/8/1Q5K w - - 0 1", &["b1b6"]);
    let result = history.compute_game_result();
    assert_eq!(result, GameResult::WhiteStalemate);
    assert_eq!(result.to_string(), "1-0 (stalemate)");
    assert_eq!(result.value_for(Color::White), 0.5);
}

#[test]
fn test_game_goes_on() {
    let history = play(STARTPOS_FEN, &["e2e4"]);
    assert_eq!(history.compute_game_result(), GameResult::Undecided);
}

#[test]
fn test_fifty_moves_grade_restricted_opponent() {
    // Black had two moves, not in check, when the counter ran out.
    let history = play("k7/8/8/2Q5/8/8/8/7K b - - 99 80", &["a8b8"]);
    let result = history.compute_game_result();
    assert_eq!(result, GameResult::from_mobility(Color::White, 2, false));
    assert_eq!(result.to_string(), "1-0 (G2.5)");
    assert!(result > GameResult::Draw);
    assert!(result < GameResult::WhiteStalemate);
}

#[test]
fn test_fifty_moves_without_restriction_is_a_draw() {
    let history = play("4k3/8/8/8/8/8/8/R3K3 w - - 99 80", &["a1a2"]);
    assert_eq!(history.compute_game_result(), GameResult::Draw);
}

// =============================================================================
// Repetitions
// =============================================================================

#[test]
fn test_repetition_count_and_cycle() {
    let mut history = PositionHistory::starting();
    for mv in KNIGHT_SHUFFLE {
        history.append_uci(mv).expect("legal");
    }
    assert_eq!(history.compute_last_move_repetitions(), (1, 4));
    assert!(history.did_repeat_since_last_zeroing_move());
    assert_eq!(history.compute_game_result(), GameResult::Undecided);

    for mv in KNIGHT_SHUFFLE {
        history.append_uci(mv).expect("legal");
    }
    assert_eq!(history.compute_last_move_repetitions(), (2, 4));
    // Threefold repetition with plenty of moves on both sides.
    assert_eq!(history.compute_game_result(), GameResult::Draw);
}

#[test]
fn test_zeroing_move_breaks_repetition() {
    let mut history = PositionHistory::starting();
    for mv in KNIGHT_SHUFFLE {
        history.append_uci(mv).expect("legal");
    }
    history.append_uci("e2e4").expect("legal");
    assert_eq!(history.compute_last_move_repetitions(), (0, 0));
    assert!(!history.did_repeat_since_last_zeroing_move());
}

#[test]
fn test_pop_restores_head() {
    let mut history = play(STARTPOS_FEN, &["e2e4"]);
    let before = history.hash_last(1);
    history.append_uci("e7e5").expect("legal");
    assert_ne!(history.hash_last(1), before);
    history.pop();
    assert_eq!(history.hash_last(1), before);
    assert_eq!(history.len(), 2);
}
