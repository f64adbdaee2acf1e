//! Lockstep self-play without search.
//!
//! [`MultiSelfPlayGames`] advances many games at once. Every round picks the
//! side to move of the first unfinished game, collects one batch for all
//! games where that side is to move, evaluates it with that side's backend
//! and plays one move in each. Two move pickers are available:
//!
//! - [`EvaluatorKind::Policy`]: the move with the highest prior.
//! - [`EvaluatorKind::Value`]: the move whose resulting position is best for
//!   the mover. Finished games are scored from their [`GameResult`], so the
//!   graded mobility outcomes rank below checkmate and above a plain draw.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chess::{ChessMove, Color};
use log::{debug, info};

use crate::backend::{Backend, EvalRequest, Evaluation};
use crate::constants::STARTPOS_FEN;
use crate::error::{BackendError, PositionError};
use crate::game_result::GameResult;
use crate::position::PositionHistory;

/// Start of one game.
#[derive(Debug, Clone, PartialEq)]
pub struct Opening {
    pub start_fen: String,
    pub moves: Vec<String>,
}

impl Opening {
    pub fn startpos() -> Self {
        Self::new(STARTPOS_FEN, &[])
    }

    pub fn new(start_fen: &str, moves: &[&str]) -> Self {
        Self {
            start_fen: start_fen.to_string(),
            moves: moves.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn history(&self) -> Result<PositionHistory, PositionError> {
        let mut history = PositionHistory::from_fen(&self.start_fen)?;
        for mv in &self.moves {
            history.append_uci(mv)?;
        }
        Ok(history)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorKind {
    Policy,
    Value,
}

/// Gathers positions of one round, evaluates them in one batch and picks
/// the move of every gathered game in the same order.
pub trait Evaluator: Send {
    fn reset(&mut self);
    fn gather(&mut self, history: &PositionHistory);
    fn run(&mut self, backend: &dyn Backend) -> Result<(), BackendError>;
    fn best_move(&mut self, history: &PositionHistory) -> Option<ChessMove>;
}

#[derive(Default)]
struct Batch {
    requests: Vec<EvalRequest>,
    results: Vec<Evaluation>,
    next: usize,
}

impl Batch {
    fn reset(&mut self) {
        self.requests.clear();
        self.results.clear();
        self.next = 0;
    }

    fn run(&mut self, backend: &dyn Backend) -> Result<(), BackendError> {
        if self.requests.is_empty() {
            return Ok(());
        }
        self.results = backend.evaluate_batch(&self.requests)?;
        if self.results.len() != self.requests.len() {
            return Err(BackendError::BatchSize {
                expected: self.requests.len(),
                got: self.results.len(),
            });
        }
        Ok(())
    }

    fn take(&mut self) -> Option<(&EvalRequest, &Evaluation)> {
        let index = self.next;
        self.next += 1;
        Some((self.requests.get(index)?, self.results.get(index)?))
    }
}

/// Highest prior wins.
#[derive(Default)]
pub struct PolicyEvaluator {
    batch: Batch,
}

impl Evaluator for PolicyEvaluator {
    fn reset(&mut self) {
        self.batch.reset();
    }

    fn gather(&mut self, history: &PositionHistory) {
        let last = history.last();
        self.batch.requests.push(EvalRequest {
            board: *last.board(),
            moves: last.legal_moves(),
        });
    }

    fn run(&mut self, backend: &dyn Backend) -> Result<(), BackendError> {
        self.batch.run(backend)
    }

    fn best_move(&mut self, _history: &PositionHistory) -> Option<ChessMove> {
        let (request, eval) = self.batch.take()?;
        let mut best = None;
        let mut max_p = f32::MIN;
        for (&mv, &p) in request.moves.iter().zip(&eval.policy) {
            if p >= max_p {
                max_p = p;
                best = Some(mv);
            }
        }
        best
    }
}

/// Best resulting position for the mover wins.
#[derive(Default)]
pub struct ValueEvaluator {
    batch: Batch,
}

impl Evaluator for ValueEvaluator {
    fn reset(&mut self) {
        self.batch.reset();
    }

    fn gather(&mut self, history: &PositionHistory) {
        let mut history = history.clone();
        for mv in history.last().legal_moves() {
            history.append(mv);
            if history.compute_game_result() == GameResult::Undecided {
                let last = history.last();
                self.batch.requests.push(EvalRequest {
                    board: *last.board(),
                    moves: last.legal_moves(),
                });
            }
            history.pop();
        }
    }

    fn run(&mut self, backend: &dyn Backend) -> Result<(), BackendError> {
        self.batch.run(backend)
    }

    fn best_move(&mut self, history: &PositionHistory) -> Option<ChessMove> {
        let mover: Color = history.last().side_to_move();
        let mut history = history.clone();
        let mut best = None;
        let mut max_q = f32::MIN;
        for mv in history.last().legal_moves() {
            history.append(mv);
            let q = match history.compute_game_result() {
                // The backend scores the side to move, which is the opponent.
                GameResult::Undecided => -self.batch.take()?.1.value,
                result => result.value_for(mover),
            };
            history.pop();
            if q >= max_q {
                max_q = q;
                best = Some(mv);
            }
        }
        best
    }
}

/// Many games played in lockstep by two backends, White's first.
pub struct MultiSelfPlayGames {
    players: [Arc<dyn Backend>; 2],
    evaluator: Box<dyn Evaluator>,
    games: Vec<PositionHistory>,
    results: Vec<GameResult>,
    abort: Arc<AtomicBool>,
}

impl MultiSelfPlayGames {
    pub fn new(
        white: Arc<dyn Backend>,
        black: Arc<dyn Backend>,
        openings: &[Opening],
        kind: EvaluatorKind,
    ) -> Result<Self, PositionError> {
        let evaluator: Box<dyn Evaluator> = match kind {
            EvaluatorKind::Policy => Box::new(PolicyEvaluator::default()),
            EvaluatorKind::Value => Box::new(ValueEvaluator::default()),
        };
        let games = openings.iter().map(Opening::history).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            players: [white, black],
            evaluator,
            results: vec![GameResult::Undecided; games.len()],
            games,
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Make [`MultiSelfPlayGames::play`] return after the current round.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    /// Flag that aborts play when set, for use from another thread.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn results(&self) -> &[GameResult] {
        &self.results
    }

    pub fn histories(&self) -> &[PositionHistory] {
        &self.games
    }

    /// Play until every game is decided or play is aborted.
    pub fn play(&mut self) -> Result<(), BackendError> {
        let mut rounds = 0u64;
        while !self.abort.load(Ordering::Acquire) {
            let mut to_move = None;
            for (history, result) in self.games.iter().zip(self.results.iter_mut()) {
                if result.is_decided() {
                    continue;
                }
                let outcome = history.compute_game_result();
                if outcome.is_decided() {
                    debug!("game over after {} plies: {outcome}", history.len());
                    *result = outcome;
                    continue;
                }
                // Keep scanning: every game needs its result updated.
                if to_move.is_none() {
                    to_move = Some(history.is_black_to_move());
                }
            }
            let Some(blacks_move) = to_move else {
                break;
            };

            let backend = &self.players[usize::from(blacks_move)];
            self.evaluator.reset();
            for (history, result) in self.games.iter().zip(&self.results) {
                if !result.is_decided() && history.is_black_to_move() == blacks_move {
                    self.evaluator.gather(history);
                }
            }
            self.evaluator.run(backend.as_ref())?;
            for (history, result) in self.games.iter_mut().zip(&self.results) {
                if result.is_decided() || history.is_black_to_move() != blacks_move {
                    continue;
                }
                if let Some(mv) = self.evaluator.best_move(history) {
                    history.append(mv);
                }
            }
            rounds += 1;
        }
        info!("self-play stopped after {rounds} rounds, {} games", self.games.len());
        Ok(())
    }
}
