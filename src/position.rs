//! Chess positions and game history.
//!
//! This module provides the game-history layer that the search and the helper
//! engines share:
//! - [`Position`]: a board plus the fifty-move counter, game ply and
//!   repetition bookkeeping
//! - [`PositionHistory`]: the append-only line of positions from the game
//!   start, with repetition detection and terminal classification
//! - UCI move text parsing and a compact move code used for PV signatures
//!
//! Move generation and board representation come from the `chess` crate.

use std::fmt;
use std::str::FromStr;

use chess::{Board, ChessMove, Color, MoveGen, Piece, Square};

use crate::constants::{MOBILITY_LIMIT, RULE50_CAP};
use crate::error::PositionError;
use crate::fen;
use crate::game_result::GameResult;

/// Mix two 64-bit hashes.
pub fn hash_cat(seed: u64, value: u64) -> u64 {
    seed ^ (value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2))
}

/// A position in a game: board, counters and repetition information.
///
/// Positions are immutable once appended to a history; a child is derived
/// from its parent with [`Position::from_parent`].
#[derive(Clone, Copy)]
pub struct Position {
    board: Board,
    rule50_ply: u32,
    ply_count: u32,
    repetitions: u32,
    cycle_length: u32,
}

impl Position {
    /// Create a root position with the given counters.
    pub fn new(board: Board, rule50_ply: u32, ply_count: u32) -> Self {
        Self {
            board,
            rule50_ply,
            ply_count,
            repetitions: 0,
            cycle_length: 0,
        }
    }

    /// Apply `mv` to `parent`. The parent is left untouched.
    ///
    /// Repetition fields are zero; [`PositionHistory::append`] fills them in.
    pub fn from_parent(parent: &Position, mv: ChessMove) -> Self {
        let rule50_ply = if is_zeroing_move(&parent.board, mv) {
            0
        } else {
            parent.rule50_ply + 1
        };
        Self {
            board: parent.board.make_move_new(mv),
            rule50_ply,
            ply_count: parent.ply_count + 1,
            repetitions: 0,
            cycle_length: 0,
        }
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Plies since the last capture or pawn move.
    pub fn rule50_ply(&self) -> u32 {
        self.rule50_ply
    }

    /// Plies since the start of the game.
    pub fn ply_count(&self) -> u32 {
        self.ply_count
    }

    /// How many times this exact position occurred before.
    pub fn repetitions(&self) -> u32 {
        self.repetitions
    }

    /// Distance in plies to the previous occurrence (0 if none).
    pub fn cycle_length(&self) -> u32 {
        self.cycle_length
    }

    pub fn side_to_move(&self) -> Color {
        self.board.side_to_move()
    }

    pub fn is_black_to_move(&self) -> bool {
        self.board.side_to_move() == Color::Black
    }

    pub fn in_check(&self) -> bool {
        self.board.checkers().popcnt() > 0
    }

    /// Hash of the board combined with the repetition count.
    pub fn hash(&self) -> u64 {
        hash_cat(self.board.get_hash(), u64::from(self.repetitions))
    }

    pub fn legal_moves(&self) -> Vec<ChessMove> {
        MoveGen::new_legal(&self.board).collect()
    }

    pub fn legal_move_count(&self) -> usize {
        MoveGen::new_legal(&self.board).len()
    }

    /// Full move number as written in FEN.
    pub fn fullmove_number(&self) -> u32 {
        (self.ply_count + if self.is_black_to_move() { 1 } else { 2 }) / 2
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Position")
            .field("fen", &fen::encode(self))
            .field("repetitions", &self.repetitions)
            .field("cycle_length", &self.cycle_length)
            .finish()
    }
}

/// True if `mv` resets the fifty-move counter (pawn move or capture).
pub fn is_zeroing_move(board: &Board, mv: ChessMove) -> bool {
    board.piece_on(mv.get_source()) == Some(Piece::Pawn) || board.piece_on(mv.get_dest()).is_some()
}

/// Parse a move in UCI notation (`e2e4`, `e7e8q`) and check it is legal.
pub fn parse_uci_move(board: &Board, text: &str) -> Result<ChessMove, PositionError> {
    let malformed = || PositionError::MalformedMove(text.to_string());
    if !text.is_ascii() || !(4..=5).contains(&text.len()) {
        return Err(malformed());
    }
    let from = Square::from_str(&text[0..2]).map_err(|_| malformed())?;
    let to = Square::from_str(&text[2..4]).map_err(|_| malformed())?;
    let promotion = match text.get(4..5) {
        None => None,
        Some("q") => Some(Piece::Queen),
        Some("r") => Some(Piece::Rook),
        Some("b") => Some(Piece::Bishop),
        Some("n") => Some(Piece::Knight),
        Some(_) => return Err(malformed()),
    };
    let mv = ChessMove::new(from, to, promotion);
    if board.legal(mv) {
        Ok(mv)
    } else {
        Err(PositionError::IllegalMove {
            mv: text.to_string(),
            fen: fen::encode_board(board, 0, 1),
        })
    }
}

/// Compact 16-bit code of a move: from, to and promotion piece.
pub fn move_code(mv: ChessMove) -> u16 {
    let promotion = match mv.get_promotion() {
        None => 0,
        Some(Piece::Knight) => 1,
        Some(Piece::Bishop) => 2,
        Some(Piece::Rook) => 3,
        Some(_) => 4,
    };
    mv.get_source().to_index() as u16 | (mv.get_dest().to_index() as u16) << 6 | promotion << 12
}

/// Line of positions from the game start (or a set-up position) to the head.
///
/// A history is never empty: every constructor installs a root position and
/// [`PositionHistory::pop`] refuses to remove it.
#[derive(Clone)]
pub struct PositionHistory {
    positions: Vec<Position>,
}

impl Default for PositionHistory {
    fn default() -> Self {
        Self::starting()
    }
}

impl PositionHistory {
    /// History holding only the standard starting position.
    pub fn starting() -> Self {
        Self::from_board(Board::default(), 0, 0)
    }

    pub fn from_board(board: Board, rule50_ply: u32, ply_count: u32) -> Self {
        Self {
            positions: vec![Position::new(board, rule50_ply, ply_count)],
        }
    }

    pub fn from_fen(text: &str) -> Result<Self, PositionError> {
        let parsed = fen::parse(text)?;
        Ok(Self::from_board(parsed.board, parsed.rule50_ply, parsed.ply_count))
    }

    /// Replace the whole history with a single root position.
    pub fn reset(&mut self, board: Board, rule50_ply: u32, ply_count: u32) {
        self.positions.clear();
        self.positions.push(Position::new(board, rule50_ply, ply_count));
    }

    /// Append the position reached by `mv` from the head.
    pub fn append(&mut self, mv: ChessMove) {
        let next = Position::from_parent(self.last(), mv);
        self.positions.push(next);
        let (repetitions, cycle_length) = self.compute_last_move_repetitions();
        if let Some(last) = self.positions.last_mut() {
            last.repetitions = repetitions;
            last.cycle_length = cycle_length;
        }
    }

    /// Parse `text` as a UCI move legal at the head and append it.
    pub fn append_uci(&mut self, text: &str) -> Result<ChessMove, PositionError> {
        let mv = parse_uci_move(self.last().board(), text)?;
        self.append(mv);
        Ok(mv)
    }

    /// Remove the head position. The root position is never removed.
    pub fn pop(&mut self) {
        if self.positions.len() > 1 {
            self.positions.pop();
        }
    }

    pub fn last(&self) -> &Position {
        // Never empty, see the type docs.
        &self.positions[self.positions.len() - 1]
    }

    pub fn get(&self, index: usize) -> Option<&Position> {
        self.positions.get(index)
    }

    pub fn starting_position(&self) -> &Position {
        &self.positions[0]
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn is_black_to_move(&self) -> bool {
        self.last().is_black_to_move()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter()
    }

    /// Classify the head position.
    ///
    /// Checkmate and stalemate are read from the head. When the fifty-move
    /// counter reaches its cap or the head is a second repetition, the game
    /// is not simply drawn: the plies since the last zeroing move are scanned
    /// for the position where a side had the fewest legal moves, and the side
    /// that restricted its opponent there is credited with a mobility grade.
    pub fn compute_game_result(&self) -> GameResult {
        let last = self.last();
        let legal = last.legal_move_count();
        if legal == 0 {
            let winner = !last.side_to_move();
            return if last.in_check() {
                GameResult::won_by(winner)
            } else {
                GameResult::stalemate_for(winner)
            };
        }
        if last.rule50_ply() >= RULE50_CAP || last.repetitions() >= 2 {
            return self.compute_mobility_result();
        }
        GameResult::Undecided
    }

    fn compute_mobility_result(&self) -> GameResult {
        let len = self.positions.len();
        let window = (self.last().rule50_ply() as usize).min(len - 1);
        let mut best: Option<(usize, bool, Color)> = None;
        for back in 1..=window {
            let pos = &self.positions[len - 1 - back];
            let legal = pos.legal_move_count();
            if legal >= MOBILITY_LIMIT {
                continue;
            }
            // Going backwards, so `<=` keeps the position reached first.
            if best.is_none_or(|(fewest, _, _)| legal <= fewest) {
                best = Some((legal, pos.in_check(), !pos.side_to_move()));
            }
        }
        match best {
            Some((legal, in_check, credited)) => GameResult::from_mobility(credited, legal, in_check),
            None => GameResult::Draw,
        }
    }

    /// Repetition count and cycle length of the head position.
    ///
    /// Earlier positions with the same side to move are compared while the
    /// fifty-move counter allows a repetition to exist. Returns `(0, 0)` when
    /// the head is new.
    pub fn compute_last_move_repetitions(&self) -> (u32, u32) {
        let last = self.last();
        if last.rule50_ply() < 4 {
            return (0, 0);
        }
        let len = self.positions.len();
        let mut idx = len as isize - 3;
        while idx >= 0 {
            let pos = &self.positions[idx as usize];
            if pos.board == last.board {
                return (1 + pos.repetitions, (len as isize - 1 - idx) as u32);
            }
            if pos.rule50_ply() < 2 {
                return (0, 0);
            }
            idx -= 2;
        }
        (0, 0)
    }

    /// True if any position since the last zeroing move was a repetition.
    pub fn did_repeat_since_last_zeroing_move(&self) -> bool {
        for pos in self.positions.iter().rev() {
            if pos.repetitions() > 0 {
                return true;
            }
            if pos.rule50_ply() == 0 {
                return false;
            }
        }
        false
    }

    /// Hash of the last `count` positions and the fifty-move counter.
    pub fn hash_last(&self, count: usize) -> u64 {
        let mut hash = self.positions.len().min(count) as u64;
        for pos in self.positions.iter().rev().take(count) {
            hash = hash_cat(hash, pos.hash());
        }
        hash_cat(hash, u64::from(self.last().rule50_ply()))
    }
}

impl fmt::Debug for PositionHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PositionHistory")
            .field("len", &self.positions.len())
            .field("head", self.last())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_after(moves: &[&str]) -> PositionHistory {
        let mut history = PositionHistory::starting();
        for mv in moves {
            history.append_uci(mv).expect("legal test move");
        }
        history
    }

    #[test]
    fn test_rule50_resets_on_pawn_move_and_capture() {
        let history = history_after(&["g1f3", "g8f6", "e2e4"]);
        assert_eq!(history.get(2).map(Position::rule50_ply), Some(2));
        assert_eq!(history.last().rule50_ply(), 0);

        let history = history_after(&["e2e4", "d7d5", "g1f3", "g8f6", "e4d5"]);
        assert_eq!(history.last().rule50_ply(), 0, "capture resets the counter");
    }

    #[test]
    fn test_parse_uci_move_rejects_garbage() {
        let board = Board::default();
        assert!(matches!(
            parse_uci_move(&board, "e2"),
            Err(PositionError::MalformedMove(_))
        ));
        assert!(matches!(
            parse_uci_move(&board, "e2e5"),
            Err(PositionError::IllegalMove { .. })
        ));
        assert!(matches!(
            parse_uci_move(&board, "e2e4x"),
            Err(PositionError::MalformedMove(_))
        ));
        assert!(parse_uci_move(&board, "e2e4").is_ok());
    }

    #[test]
    fn test_move_code_distinguishes_promotions() {
        let from = Square::from_str("a7").expect("square");
        let to = Square::from_str("a8").expect("square");
        let queen = ChessMove::new(from, to, Some(Piece::Queen));
        let knight = ChessMove::new(from, to, Some(Piece::Knight));
        assert_ne!(move_code(queen), move_code(knight));
    }

    #[test]
    fn test_pop_keeps_root() {
        let mut history = history_after(&["e2e4"]);
        history.pop();
        history.pop();
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().ply_count(), 0);
    }

    #[test]
    fn test_hash_includes_repetitions() {
        let history = history_after(&["g1f3", "g8f6", "f3g1", "f6g8"]);
        let first = history.get(0).map(Position::hash);
        assert_ne!(first, Some(history.last().hash()));
        assert_eq!(history.get(0).map(|p| p.board().get_hash()), Some(history.last().board().get_hash()));
    }
}
