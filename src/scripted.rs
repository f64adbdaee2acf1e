//! A deterministic UCI engine that replays a canned analysis.
//!
//! It stands in for a real helper engine in tests and demos. Every `go`
//! produces one `info depth D nodes N pv ...` line followed by `bestmove`;
//! `go infinite` holds the `bestmove` back until `stop` arrives.

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use chess::{Board, MoveGen};

use crate::constants::STARTPOS_FEN;
use crate::position::PositionHistory;

/// Where the reported PV comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedPv {
    /// The same moves for every query, legal or not.
    Fixed(Vec<String>),
    /// The first legal move of each successive position, up to this many plies.
    FirstLegal(usize),
}

#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    pub pv: ScriptedPv,
    pub depth: u32,
    pub nodes: u64,
    /// Upper bound on the time spent per `go movetime`.
    pub think: Duration,
}

impl ScriptedEngine {
    pub fn fixed(pv: &[&str], depth: u32, nodes: u64) -> Self {
        Self {
            pv: ScriptedPv::Fixed(pv.iter().map(|m| m.to_string()).collect()),
            depth,
            nodes,
            think: Duration::ZERO,
        }
    }

    pub fn first_legal(plies: usize, depth: u32, nodes: u64) -> Self {
        Self {
            pv: ScriptedPv::FirstLegal(plies),
            depth,
            nodes,
            think: Duration::ZERO,
        }
    }

    pub fn with_think(mut self, think: Duration) -> Self {
        self.think = think;
        self
    }

    fn pv_from(&self, board: &Board) -> Vec<String> {
        match &self.pv {
            ScriptedPv::Fixed(moves) => moves.clone(),
            ScriptedPv::FirstLegal(plies) => {
                let mut board = *board;
                let mut moves = Vec::with_capacity(*plies);
                for _ in 0..*plies {
                    let Some(mv) = MoveGen::new_legal(&board).next() else {
                        break;
                    };
                    moves.push(mv.to_string());
                    board = board.make_move_new(mv);
                }
                moves
            }
        }
    }

    /// Serve the UCI protocol until `quit` or the end of `input`.
    pub fn run<I, W>(&self, input: I, mut output: W) -> io::Result<()>
    where
        I: IntoIterator<Item = String>,
        W: Write,
    {
        let mut board = Board::default();
        let mut lines = input.into_iter();
        while let Some(line) = lines.next() {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("uci") => {
                    writeln!(output, "id name scripted-engine")?;
                    writeln!(output, "option name Threads type spin default 1 min 1 max 1")?;
                    writeln!(output, "option name SyzygyPath type string default <empty>")?;
                    writeln!(output, "uciok")?;
                }
                Some("isready") => writeln!(output, "readyok")?,
                Some("position") => {
                    let rest: Vec<&str> = tokens.collect();
                    board = parse_position(&rest).unwrap_or_default();
                }
                Some("go") => {
                    let rest: Vec<&str> = tokens.collect();
                    let infinite = rest.contains(&"infinite");
                    let movetime = rest
                        .iter()
                        .position(|t| *t == "movetime")
                        .and_then(|i| rest.get(i + 1))
                        .and_then(|t| t.parse::<u64>().ok())
                        .map(Duration::from_millis)
                        .unwrap_or(Duration::ZERO);
                    let pv = self.pv_from(&board);
                    writeln!(output, "info depth {} nodes {} pv {}", self.depth, self.nodes, pv.join(" "))?;
                    output.flush()?;
                    if infinite {
                        loop {
                            match lines.next().as_deref().map(str::trim) {
                                Some("stop") => break,
                                Some("quit") | None => return Ok(()),
                                Some(_) => {}
                            }
                        }
                    } else {
                        thread::sleep(movetime.min(self.think));
                    }
                    let best = pv.first().map_or("0000", String::as_str);
                    writeln!(output, "bestmove {best}")?;
                }
                Some("quit") => return Ok(()),
                _ => {}
            }
            output.flush()?;
        }
        Ok(())
    }
}

/// Board of `position [startpos | fen <fen>] [moves ...]`.
fn parse_position(tokens: &[&str]) -> Option<Board> {
    let moves_at = tokens.iter().position(|t| *t == "moves").unwrap_or(tokens.len());
    let fen = match tokens.first() {
        Some(&"startpos") => STARTPOS_FEN.to_string(),
        Some(&"fen") => tokens[1..moves_at].join(" "),
        _ => return None,
    };
    let mut history = PositionHistory::from_fen(&fen).ok()?;
    for mv in tokens.iter().skip(moves_at + 1) {
        history.append_uci(mv).ok()?;
    }
    Some(*history.last().board())
}
