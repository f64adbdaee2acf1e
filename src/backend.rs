//! Batched leaf evaluation.
//!
//! Search workers collect leaves into a minibatch and hand it to a
//! [`Backend`] in one call. Values are from the point of view of the side to
//! move at the leaf; policy entries line up with the request's move list.
//!
//! Two reference backends are provided: [`UniformBackend`] (flat policy,
//! neutral value) and [`MaterialBackend`] (material balance plus a
//! capture-first policy). Real network backends implement the same trait.

use std::collections::{HashMap, VecDeque};

use chess::{Board, ChessMove, Color, Piece};
use parking_lot::Mutex;

use crate::error::BackendError;

/// One leaf to evaluate.
#[derive(Clone)]
pub struct EvalRequest {
    pub board: Board,
    pub moves: Vec<ChessMove>,
}

/// Backend output for one leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Expected score for the side to move, in `[-1, 1]`.
    pub value: f32,
    /// Draw probability.
    pub draw: f32,
    /// Expected plies until the game ends.
    pub moves_left: f32,
    /// Prior per move of the request, summing to one.
    pub policy: Vec<f32>,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Evaluate every request, in order.
    fn evaluate_batch(&self, batch: &[EvalRequest]) -> Result<Vec<Evaluation>, BackendError>;
}

fn uniform(len: usize) -> Vec<f32> {
    if len == 0 {
        return Vec::new();
    }
    vec![1.0 / len as f32; len]
}

/// Flat policy, value 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformBackend;

impl Backend for UniformBackend {
    fn name(&self) -> &str {
        "uniform"
    }

    fn evaluate_batch(&self, batch: &[EvalRequest]) -> Result<Vec<Evaluation>, BackendError> {
        Ok(batch
            .iter()
            .map(|request| Evaluation {
                value: 0.0,
                draw: 0.0,
                moves_left: 0.0,
                policy: uniform(request.moves.len()),
            })
            .collect())
    }
}

fn piece_value(piece: Piece) -> f32 {
    match piece {
        Piece::Pawn => 1.0,
        Piece::Knight | Piece::Bishop => 3.0,
        Piece::Rook => 5.0,
        Piece::Queen => 9.0,
        Piece::King => 0.0,
    }
}

/// Material balance from `side`'s point of view, in pawns.
pub fn material_balance(board: &Board, side: Color) -> f32 {
    let mut balance = 0.0;
    for piece in [Piece::Pawn, Piece::Knight, Piece::Bishop, Piece::Rook, Piece::Queen] {
        let ours = (board.pieces(piece) & board.color_combined(side)).popcnt();
        let theirs = (board.pieces(piece) & board.color_combined(!side)).popcnt();
        balance += piece_value(piece) * (ours as f32 - theirs as f32);
    }
    balance
}

/// Material evaluation with a capture-first policy.
#[derive(Debug, Clone, Copy)]
pub struct MaterialBackend {
    /// Amplitude of uniform noise added to values (0 for deterministic output).
    pub noise: f32,
}

impl Default for MaterialBackend {
    fn default() -> Self {
        Self { noise: 0.0 }
    }
}

impl MaterialBackend {
    pub fn with_noise(noise: f32) -> Self {
        Self { noise }
    }

    fn evaluate(&self, request: &EvalRequest) -> Evaluation {
        let board = &request.board;
        let balance = material_balance(board, board.side_to_move());
        let mut value = (balance * 0.2).tanh();
        if self.noise > 0.0 {
            value = (value + (fastrand::f32() - 0.5) * self.noise).clamp(-1.0, 1.0);
        }
        let weights: Vec<f32> = request
            .moves
            .iter()
            .map(|&mv| {
                let mut weight = 1.0;
                if let Some(victim) = board.piece_on(mv.get_dest()) {
                    weight += piece_value(victim);
                }
                if let Some(promotion) = mv.get_promotion() {
                    weight += piece_value(promotion);
                }
                if board.make_move_new(mv).checkers().popcnt() > 0 {
                    weight += 0.5;
                }
                weight
            })
            .collect();
        let total: f32 = weights.iter().sum();
        let material = board.combined().popcnt() as f32;
        Evaluation {
            value,
            draw: (1.0 - value.abs()) * 0.3,
            moves_left: 2.0 * material,
            policy: weights.iter().map(|w| w / total).collect(),
        }
    }
}

impl Backend for MaterialBackend {
    fn name(&self) -> &str {
        "material"
    }

    fn evaluate_batch(&self, batch: &[EvalRequest]) -> Result<Vec<Evaluation>, BackendError> {
        Ok(batch.iter().map(|request| self.evaluate(request)).collect())
    }
}

// =============================================================================
// Cache
// =============================================================================

struct CacheInner {
    entries: HashMap<u64, Evaluation>,
    order: VecDeque<u64>,
}

/// Evaluations shared by all workers, keyed by position hash. Oldest
/// entries are evicted first.
pub struct EvalCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl EvalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    pub fn get(&self, key: u64) -> Option<Evaluation> {
        self.inner.lock().entries.get(&key).cloned()
    }

    pub fn insert(&self, key: u64, evaluation: Evaluation) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.entries.insert(key, evaluation).is_some() {
            return;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.capacity {
            if let Some(old) = inner.order.pop_front() {
                inner.entries.remove(&old);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}
