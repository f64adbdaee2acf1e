//! Default values for search, helper-engine and queue parameters.
//!
//! Everything here is a default: [`crate::params::SearchParams`] carries the
//! runtime values, which start from these constants and can be overridden on
//! the command line or through UCI `setoption`.

use std::time::Duration;

// =============================================================================
// Search Worker
// =============================================================================

/// Number of primary search worker threads.
pub const DEFAULT_THREADS: usize = 2;

/// Task threads per search worker used for parallel tree descent (0 = inline).
pub const DEFAULT_TASK_WORKERS: usize = 0;

/// Maximum number of leaves gathered into one evaluation batch.
pub const DEFAULT_MINIBATCH_SIZE: usize = 32;

/// Collision events tolerated per batch before gathering stops early.
pub const DEFAULT_MAX_COLLISION_EVENTS: usize = 32;

/// Upper bound on nodes spliced from helper PVs into one batch.
pub const DEFAULT_MAX_INJECTED_PER_BATCH: usize = 16;

/// PUCT exploration constant.
pub const DEFAULT_CPUCT: f32 = 1.745;

/// First-play urgency reduction applied to unvisited children.
pub const DEFAULT_FPU_REDUCTION: f32 = 0.330;

/// Value assigned to a drawn terminal, from the root side's point of view.
pub const DEFAULT_DRAW_SCORE: f32 = 0.0;

/// Entries kept in the shared evaluation cache.
pub const DEFAULT_CACHE_SIZE: usize = 200_000;

/// Sleep used when a batch gathered nothing but collisions.
pub const COLLISION_BACKOFF: Duration = Duration::from_millis(5);

// =============================================================================
// Helper (Auxiliary) Engines
// =============================================================================

/// Number of helper engine processes, one per auxiliary worker.
pub const DEFAULT_AUX_INSTANCES: usize = 1;

/// Time budget in milliseconds for one queue-driven helper query.
pub const DEFAULT_AUX_TIME_MS: u64 = 100;

/// Visits a node needs before it is queued for helper analysis.
pub const DEFAULT_AUX_THRESHOLD: u32 = 100;

/// Depth beyond which queued nodes are sampled instead of always analyzed.
pub const DEFAULT_AUX_MAX_DEPTH: u32 = 5;

/// Cap of the node-work queue. Pushes beyond it are shed.
pub const NODE_QUEUE_CAP: usize = 15_000;

/// Cap of the PV-injection queue. Pushes beyond it are shed.
pub const PV_QUEUE_CAP: usize = 20_000;

/// Shortest helper PV (in plies) worth injecting.
pub const MIN_PV_LEN: usize = 4;

/// Longest helper PV accepted, whatever depth the helper claims.
pub const MAX_PV_LEN: usize = 99;

/// Largest game ply or fifty-move counter accepted from a FEN.
pub const MAX_FEN_PLY: u32 = 1 << 30;

/// Root-pinned analysis only harvests lines searched at least this many nodes...
pub const ROOT_PINNED_MIN_NODES: u64 = 1_000;

/// ...or deeper than this many plies.
pub const ROOT_PINNED_MIN_DEPTH: u32 = 10;

/// Back-off after a helper exchange that produced no usable line.
pub const EMPTY_LINE_BACKOFF: Duration = Duration::from_millis(100);

/// Poll interval for blocking waits that must also observe cancellation.
pub const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Time allowed for the `uci` / `uciok` handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a helper may keep talking after `stop` before it is declared hung.
pub const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between `quit` and killing a helper process.
pub const QUIT_GRACE: Duration = Duration::from_millis(500);

/// Interval between `info` lines printed during a UCI search.
pub const UCI_INFO_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Node Markers
// =============================================================================

/// Aux marker: node never queued for helper analysis.
pub const AUX_NONE: u16 = 0;

/// Aux marker: node queued or currently being analyzed by a helper.
pub const AUX_PENDING: u16 = 0xfffe;

/// Aux marker: helper analysis finished or abandoned.
pub const AUX_RESOLVED: u16 = 0xffff;

// =============================================================================
// Game Rules
// =============================================================================

/// Fifty-move counter value (in plies) that triggers the mobility scan.
pub const RULE50_CAP: u32 = 100;

/// Positions with at least this many legal moves never earn a mobility grade.
pub const MOBILITY_LIMIT: usize = 10;

/// Starting position in FEN.
pub const STARTPOS_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
