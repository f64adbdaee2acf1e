//! aux-mcts: a concurrent chess MCTS engine assisted by UCI helper engines.
//!
//! Search workers grow one shared tree in minibatches. Nodes that collect
//! enough visits are handed to a pool of auxiliary workers, each driving an
//! external UCI engine; the principal variations those engines report are
//! spliced back into the tree. Every move played purges the queues so no
//! work aimed at an abandoned branch survives.
//!
//! ## Modules
//!
//! - [`constants`] - Defaults, caps and timeouts
//! - [`params`] - Runtime configuration and option parsing
//! - [`error`] - Error types per layer
//! - [`position`] - Positions, game history, repetitions, game results
//! - [`game_result`] - Game outcomes with the graded mobility ladder
//! - [`fen`] - FEN encoding and parsing, board diagrams
//! - [`node`] - Arena search tree
//! - [`locks`] - Lock levels checked at compile time
//! - [`stats`] - Shared session context: helper queues, dedup, lifecycle
//! - [`purge`] - Queue invalidation after a move
//! - [`backend`] - Batched leaf evaluation and its cache
//! - [`worker`] - Search worker iteration
//! - [`search`] - Running searches and picking moves
//! - [`controller`] - Move cycle across a game
//! - [`aux_engine`] - UCI subprocess actor
//! - [`aux_worker`] - Auxiliary worker pool
//! - [`scripted`] - Scripted mock UCI engine
//! - [`selfplay`] - Lockstep self-play without search
//! - [`uci`] - UCI front-end
//!
//! ## Example
//!
//! ```
//! use aux_mcts::game_result::GameResult;
//! use aux_mcts::position::PositionHistory;
//!
//! let mut history = PositionHistory::starting();
//! for mv in ["f2f3", "e7e5", "g2g4", "d8h4"] {
//!     history.append_uci(mv)?;
//! }
//! assert_eq!(history.compute_game_result(), GameResult::BlackWon);
//! # Ok::<(), aux_mcts::error::PositionError>(())
//! ```

pub mod aux_engine;
pub mod aux_worker;
pub mod backend;
pub mod constants;
pub mod controller;
pub mod error;
pub mod fen;
pub mod game_result;
pub mod locks;
pub mod node;
pub mod params;
pub mod position;
pub mod purge;
pub mod scripted;
pub mod search;
pub mod selfplay;
pub mod stats;
pub mod uci;
pub mod worker;
