//! Error types, one enum per layer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors building positions from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    #[error("invalid FEN: {0}")]
    InvalidFen(String),
    #[error("malformed move text: {0}")]
    MalformedMove(String),
    #[error("illegal move {mv} in position {fen}")]
    IllegalMove { mv: String, fen: String },
}

/// Errors talking to a helper engine process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn helper engine {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no helper engine is configured")]
    NotConfigured,
    #[error("helper engine I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("helper engine {index} did not finish the handshake in time")]
    HandshakeTimeout { index: usize },
    #[error("helper engine {index} died")]
    Died { index: usize },
    #[error("helper engine {index} kept running after stop")]
    Unresponsive { index: usize },
}

/// Errors from the evaluation backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend returned {got} results for a batch of {expected}")]
    BatchSize { expected: usize, got: usize },
    #[error("backend failure: {0}")]
    Failed(String),
}

/// Errors reading runtime options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid value {value:?} for option {name}")]
    InvalidValue { name: String, value: String },
}

/// Errors surfaced by a search or the session controller.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Position(#[from] PositionError),
    #[error("root position has no legal moves")]
    NoLegalMoves,
    #[error("a search is already running")]
    AlreadyRunning,
    #[error("no search has been started")]
    NotRunning,
    #[error("failed to start thread: {0}")]
    Thread(#[source] io::Error),
    #[error("worker thread panicked: {0}")]
    WorkerPanicked(String),
}
