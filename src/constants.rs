//! Constants for board dimensions and search parameters.
//!
//! # Board Size Configuration
//!
//! The board size is controlled by Cargo features:
//! - `board9x9` (default): 9x9 board
//! - `board19x19`: 19x19 board
//!
//! To compile for a specific board size:
//! ```sh
//! cargo build                                               # 9x9 (default)
//! cargo build --no-default-features --features board19x19   # 19x19
//! ```

// =============================================================================
// Board Geometry
// =============================================================================

/// Board size (NxN).
#[cfg(feature = "board9x9")]
pub const N: usize = 9;

#[cfg(feature = "board19x19")]
pub const N: usize = 19;

// Compile-time check: exactly one board size feature must be enabled
#[cfg(all(feature = "board9x9", feature = "board19x19"))]
compile_error!("Cannot enable both 'board9x9' and 'board19x19' features at the same time");

#[cfg(not(any(feature = "board9x9", feature = "board19x19")))]
compile_error!("Must enable exactly one board size feature: 'board9x9' or 'board19x19'");

/// Number of points on the board.
pub const NUM_POINTS: usize = N * N;

/// N * N possible points on the board, plus pass.
pub const NUM_MOVES: usize = NUM_POINTS + 1;

/// Hard ceiling on game length: 505 moves for 19x19, 113 for 9x9.
pub const MAX_SEARCH_DEPTH: usize = NUM_POINTS * 14 / 10;

// =============================================================================
// Game Parameters
// =============================================================================

/// Default komi (compensation points added to White's score).
pub const DEFAULT_KOMI: f32 = 7.5;

/// Alpha for the Dirichlet noise mixed into the root priors, scaled so that
/// smaller boards get proportionally stronger noise per point.
pub const DIRICHLET_ALPHA: f32 = 0.03 * 361.0 / (NUM_POINTS as f32);

/// Minimum move number before the whole-board pass-alive check runs after
/// each played move.
pub const MIN_PASS_ALIVE_MOVES: usize = NUM_POINTS / 2;

// =============================================================================
// Tree Search Parameters
// =============================================================================

/// Base term of the PUCT exploration scale:
/// `U_scale = 2 * (ln((1 + N + UCT_BASE) / UCT_BASE) + UCT_INIT)`.
pub const UCT_BASE: f32 = 19652.0;

/// Initial term of the PUCT exploration scale.
pub const UCT_INIT: f32 = 1.25;

/// A cache of all ancestor stone hashes is installed in the search tree every
/// this many plies, bounding the superko check to a short parent walk.
pub const SUPERKO_CACHE_STRIDE: usize = 8;

/// Moves below this number are soft-picked (sampled proportionally to visit
/// counts) rather than played greedily. 30 on a 19x19, scaled by board area.
pub const SOFT_PICK_CUTOFF: usize = 1 + 29 * NUM_POINTS / 361;
