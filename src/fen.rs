//! Position text encoding (FEN) and a plain-text board diagram.

use std::fmt;
use std::str::FromStr;

use chess::{Board, CastleRights, Color, File, Piece, Rank, Square};

use crate::constants::MAX_FEN_PLY;
use crate::error::PositionError;
use crate::position::Position;

/// Fields recovered from a FEN string.
#[derive(Clone, Copy)]
pub struct ParsedFen {
    pub board: Board,
    pub rule50_ply: u32,
    pub ply_count: u32,
}

fn square(rank: usize, file: usize) -> Square {
    Square::make_square(Rank::from_index(rank), File::from_index(file))
}

fn piece_char(piece: Piece, color: Color) -> char {
    let c = match piece {
        Piece::Pawn => 'p',
        Piece::Knight => 'n',
        Piece::Bishop => 'b',
        Piece::Rook => 'r',
        Piece::Queen => 'q',
        Piece::King => 'k',
    };
    match color {
        Color::White => c.to_ascii_uppercase(),
        Color::Black => c,
    }
}

fn castling_field(board: &Board) -> String {
    let mut field = String::new();
    for (color, king, queen) in [(Color::White, 'K', 'Q'), (Color::Black, 'k', 'q')] {
        let rights: CastleRights = board.castle_rights(color);
        if rights.has_kingside() {
            field.push(king);
        }
        if rights.has_queenside() {
            field.push(queen);
        }
    }
    if field.is_empty() {
        field.push('-');
    }
    field
}

/// En passant target square, written only when a capture is available.
fn en_passant_field(board: &Board) -> String {
    match board.en_passant() {
        // The crate stores the square of the pawn that just advanced two ranks.
        Some(pawn) => {
            let rank = match board.side_to_move() {
                Color::White => 5,
                Color::Black => 2,
            };
            square(rank, pawn.get_file().to_index()).to_string()
        }
        None => "-".to_string(),
    }
}

/// Encode a board with explicit counters.
pub fn encode_board(board: &Board, rule50_ply: u32, fullmove: u32) -> String {
    let mut out = String::with_capacity(90);
    for rank in (0..8).rev() {
        let mut empty = 0;
        for file in 0..8 {
            let sq = square(rank, file);
            match (board.piece_on(sq), board.color_on(sq)) {
                (Some(piece), Some(color)) => {
                    if empty > 0 {
                        out.push_str(&empty.to_string());
                        empty = 0;
                    }
                    out.push(piece_char(piece, color));
                }
                _ => empty += 1,
            }
        }
        if empty > 0 {
            out.push_str(&empty.to_string());
        }
        if rank > 0 {
            out.push('/');
        }
    }
    let side = match board.side_to_move() {
        Color::White => 'w',
        Color::Black => 'b',
    };
    format!(
        "{out} {side} {} {} {rule50_ply} {fullmove}",
        castling_field(board),
        en_passant_field(board)
    )
}

/// Encode a position, counters included.
pub fn encode(position: &Position) -> String {
    encode_board(position.board(), position.rule50_ply(), position.fullmove_number())
}

/// Parse a FEN string. Half-move and full-move fields are optional.
pub fn parse(text: &str) -> Result<ParsedFen, PositionError> {
    let invalid = || PositionError::InvalidFen(text.to_string());
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() < 4 || fields.len() > 6 {
        return Err(invalid());
    }
    let normalized = format!("{} {} {} {} 0 1", fields[0], fields[1], fields[2], fields[3]);
    let board = Board::from_str(&normalized).map_err(|_| invalid())?;
    let rule50_ply = match fields.get(4) {
        Some(field) => field.parse::<u32>().map_err(|_| invalid())?,
        None => 0,
    };
    let fullmove = match fields.get(5) {
        Some(field) => field.parse::<u32>().map_err(|_| invalid())?.max(1),
        None => 1,
    };
    let black = board.side_to_move() == Color::Black;
    let ply_count = ply_count_of(fullmove, black).ok_or_else(invalid)?;
    if rule50_ply > MAX_FEN_PLY {
        return Err(invalid());
    }
    Ok(ParsedFen {
        board,
        rule50_ply,
        ply_count,
    })
}

/// Game ply of full move `fullmove`, or `None` past [`MAX_FEN_PLY`].
///
/// Counters stay well below `u32::MAX` so plies appended during a game
/// cannot overflow them.
fn ply_count_of(fullmove: u32, black: bool) -> Option<u32> {
    fullmove
        .checked_sub(1)
        .and_then(|moves| moves.checked_mul(2))
        .and_then(|ply| ply.checked_add(u32::from(black)))
        .filter(|&ply| ply <= MAX_FEN_PLY)
}

/// Board diagram for logs and the command line, White at the bottom.
pub struct Diagram<'a>(pub &'a Board);

impl fmt::Display for Diagram<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rank in (0..8).rev() {
            write!(f, "{} ", rank + 1)?;
            for file in 0..8 {
                let sq = square(rank, file);
                let ch = match (self.0.piece_on(sq), self.0.color_on(sq)) {
                    (Some(piece), Some(color)) => piece_char(piece, color),
                    _ => '.',
                };
                write!(f, "{ch} ")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "  a b c d e f g h")
    }
}
