//! Universal Chess Interface (UCI) front-end.
//!
//! Lets the engine run under a chess GUI or match runner. Input lines are
//! read on a separate thread and multiplexed with the search completion
//! signal and a periodic info tick, so `stop` and `isready` are answered
//! while a search runs.
//!
//! ## Supported Commands
//!
//! - `uci` - Identify the engine and list its options
//! - `isready` - Synchronize, answered with `readyok`
//! - `ucinewgame` - Forget the current game
//! - `setoption name <name> [value <value>]` - Change an option
//! - `position [startpos | fen <fen>] [moves <move>...]` - Set the position
//! - `go [infinite] [nodes <n>] [movetime <ms>] [wtime <ms> btime <ms> winc <ms> binc <ms>]` - Search
//! - `stop` - End the search, answered with `bestmove`
//! - `d` - Print the current position
//! - `quit` - Exit

use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use log::{debug, warn};

use crate::constants::{STARTPOS_FEN, UCI_INFO_INTERVAL};
use crate::controller::EngineController;
use crate::error::SearchError;
use crate::fen::{self, Diagram};
use crate::locks::{LockToken, Unlocked};
use crate::params::SearchParams;
use crate::search::{self, SearchLimits};

/// The list of known UCI commands.
const KNOWN_COMMANDS: &[&str] = &[
    "d",
    "go",
    "isready",
    "position",
    "quit",
    "setoption",
    "stop",
    "uci",
    "ucinewgame",
];

/// What the command loop does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// UCI engine state.
pub struct UciEngine<W: Write> {
    controller: EngineController,
    out: W,
    token: LockToken<Unlocked>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl<W: Write> UciEngine<W> {
    pub fn new(controller: EngineController, out: W) -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            controller,
            out,
            token: LockToken::new(),
            done_tx,
            done_rx,
        }
    }

    /// Run the command loop until `quit` or end of input.
    pub fn run<R: BufRead + Send + 'static>(&mut self, input: R) -> io::Result<()> {
        let (line_tx, line_rx) = unbounded();
        thread::Builder::new().name("uci-input".to_string()).spawn(move || {
            for line in input.lines() {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        })?;
        let ticker = tick(UCI_INFO_INTERVAL);
        let done_rx = self.done_rx.clone();

        loop {
            select! {
                recv(line_rx) -> line => {
                    let line = match line {
                        Ok(line) => line?,
                        // End of input.
                        Err(_) => break,
                    };
                    if self.handle_line(&line)? == Flow::Quit {
                        return Ok(());
                    }
                }
                recv(done_rx) -> _ => {
                    if self.controller.is_searching() {
                        self.report_best_move()?;
                    }
                }
                recv(ticker) -> _ => {
                    if self.controller.is_searching() {
                        self.print_info()?;
                    }
                }
            }
        }
        if self.controller.is_searching() {
            self.report_best_move()?;
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> io::Result<Flow> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Flow::Continue);
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let command = parts[0].to_lowercase();
        debug!("uci < {line}");
        self.execute(&command, &parts[1..])
    }

    /// Execute one UCI command, writing any response.
    fn execute(&mut self, command: &str, args: &[&str]) -> io::Result<Flow> {
        match command {
            "uci" => {
                writeln!(self.out, "id name aux-mcts {}", env!("CARGO_PKG_VERSION"))?;
                writeln!(self.out, "id author the aux-mcts developers")?;
                for option in SearchParams::uci_options() {
                    writeln!(self.out, "{option}")?;
                }
                writeln!(self.out, "uciok")?;
            }

            "isready" => writeln!(self.out, "readyok")?,

            "ucinewgame" => self.controller.new_game(&mut self.token),

            "setoption" => match parse_setoption(args) {
                Some((name, value)) => {
                    if let Err(err) = self.controller.set_option(&name, &value) {
                        writeln!(self.out, "info string {err}")?;
                    }
                }
                None => writeln!(self.out, "info string malformed setoption")?,
            },

            "position" => match parse_position(args) {
                Some((fen, moves)) => {
                    if let Err(err) = self.controller.set_position(&mut self.token, &fen, &moves) {
                        writeln!(self.out, "info string {err}")?;
                    }
                }
                None => writeln!(self.out, "info string malformed position")?,
            },

            "go" => {
                if self.controller.is_searching() {
                    writeln!(self.out, "info string search already running")?;
                } else {
                    let black = self.controller.tree().read(&mut self.token).history().is_black_to_move();
                    let limits = parse_go(args, black);
                    match self.controller.go(limits, Some(self.done_tx.clone())) {
                        Ok(()) => {}
                        Err(SearchError::NoLegalMoves) => writeln!(self.out, "bestmove 0000")?,
                        Err(err) => writeln!(self.out, "info string {err}")?,
                    }
                }
            }

            "stop" => {
                if self.controller.is_searching() {
                    self.report_best_move()?;
                }
            }

            "d" => {
                let tree = self.controller.tree().read(&mut self.token);
                let last = tree.history().last();
                write!(self.out, "{}", Diagram(last.board()))?;
                writeln!(self.out, "Fen: {}", fen::encode(last))?;
                writeln!(self.out, "Nodes: {}", tree.live_nodes())?;
                writeln!(self.out, "Backend: {}", self.controller.backend_name())?;
                let children = tree.describe_children(tree.root());
                if !children.is_empty() {
                    writeln!(self.out, "{children}")?;
                }
            }

            "quit" => {
                if self.controller.is_searching() {
                    self.report_best_move()?;
                }
                return Ok(Flow::Quit);
            }

            _ => writeln!(self.out, "info string unknown command: {command}")?,
        }
        self.out.flush()?;
        Ok(Flow::Continue)
    }

    fn print_info(&mut self) -> io::Result<()> {
        let Some(state) = self.controller.search_state() else {
            return Ok(());
        };
        let playouts = state.playouts();
        let elapsed = state.elapsed();
        let tree = self.controller.tree().read(&mut self.token);
        let pv = search::principal_variation(&tree, 64);
        let Some(best) = search::best_move(&tree) else {
            return Ok(());
        };
        drop(tree);
        let ms = elapsed.as_millis().max(1);
        let pv: Vec<String> = pv.iter().map(ToString::to_string).collect();
        writeln!(
            self.out,
            "info depth {} nodes {playouts} nps {} time {ms} score cp {} pv {}",
            pv.len().max(1),
            u128::from(playouts) * 1000 / ms,
            best.score_cp(),
            pv.join(" ")
        )?;
        self.out.flush()
    }

    /// Stop the search and print its final info line and `bestmove`.
    fn report_best_move(&mut self) -> io::Result<()> {
        self.controller.stop(&mut self.token);
        self.print_info()?;
        let finished = self.controller.finish(&mut self.token);
        // Only the finished search signalled completion.
        while self.done_rx.try_recv().is_ok() {}
        match finished {
            Ok(finished) => match finished.best {
                Some(best) => match best.ponder {
                    Some(ponder) => writeln!(self.out, "bestmove {} ponder {ponder}", best.mv)?,
                    None => writeln!(self.out, "bestmove {}", best.mv)?,
                },
                None => writeln!(self.out, "bestmove 0000")?,
            },
            Err(err) => {
                warn!("search failed: {err}");
                writeln!(self.out, "info string search failed: {err}")?;
                writeln!(self.out, "bestmove 0000")?;
            }
        }
        self.out.flush()
    }

    pub fn controller(&self) -> &EngineController {
        &self.controller
    }
}

/// Split `name <name...> [value <value...>]`. Names may contain spaces.
fn parse_setoption(args: &[&str]) -> Option<(String, String)> {
    if args.first() != Some(&"name") {
        return None;
    }
    let rest = &args[1..];
    let split = rest.iter().position(|&word| word == "value");
    let (name, value) = match split {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, &[][..]),
    };
    if name.is_empty() {
        return None;
    }
    Some((name.join(" "), value.join(" ")))
}

/// Start FEN and move list of a `position` command.
fn parse_position<'a>(args: &[&'a str]) -> Option<(String, Vec<&'a str>)> {
    let moves_at = args.iter().position(|&word| word == "moves").unwrap_or(args.len());
    let moves = args.get(moves_at + 1..).unwrap_or_default().to_vec();
    let fen = match args.first() {
        Some(&"startpos") => STARTPOS_FEN.to_string(),
        Some(&"fen") if moves_at > 1 => args[1..moves_at].join(" "),
        _ => return None,
    };
    Some((fen, moves))
}

/// Search limits of a `go` command.
///
/// Clock times give a movetime of a twentieth of the remaining time plus
/// half the increment. Without any limit the search is infinite.
fn parse_go(args: &[&str], black_to_move: bool) -> SearchLimits {
    let mut limits = SearchLimits::default();
    let mut clock = None;
    let mut increment = 0;
    let mut words = args.iter();
    while let Some(&word) = words.next() {
        let mut number = || words.next().and_then(|v| v.parse::<u64>().ok());
        match word {
            "infinite" => limits.infinite = true,
            "nodes" => limits.nodes = number(),
            "movetime" => limits.movetime = number().map(Duration::from_millis),
            "wtime" if !black_to_move => clock = number(),
            "btime" if black_to_move => clock = number(),
            "winc" if !black_to_move => increment = number().unwrap_or(0),
            "binc" if black_to_move => increment = number().unwrap_or(0),
            _ => {}
        }
    }
    if limits.movetime.is_none() {
        if let Some(clock) = clock {
            let budget = (clock / 20 + increment / 2).min(clock.saturating_sub(50)).max(1);
            limits.movetime = Some(Duration::from_millis(budget));
        }
    }
    if limits.nodes.is_none() && limits.movetime.is_none() {
        limits.infinite = true;
    }
    limits
}

/// True for the commands [`UciEngine`] understands.
pub fn is_known_command(command: &str) -> bool {
    KNOWN_COMMANDS.contains(&command.to_lowercase().as_str())
}
