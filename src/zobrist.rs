//! Zobrist hash constants.
//!
//! The tables are filled once from a fixed-seed splitmix64 stream so that
//! hashes are reproducible across runs and processes. The hash for an empty
//! point is zero, which makes the stone hash of a position exactly the XOR of
//! `move_hash` over its placed stones.

use once_cell::sync::Lazy;

use crate::color::Color;
use crate::constants::{NUM_MOVES, NUM_POINTS};
use crate::coord::Coord;

pub type Hash = u64;

struct Tables {
    black_to_play: Hash,
    opponent_passed: Hash,
    /// Indexed by `[coord][color]`. The Empty column is zero.
    move_hashes: Vec<[Hash; 3]>,
    illegal_empty_point: Vec<Hash>,
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

static TABLES: Lazy<Tables> = Lazy::new(|| {
    let mut state = 0x6672_6f6d_2074_6865u64;
    let mut next = || splitmix64(&mut state);

    let black_to_play = next();
    let opponent_passed = next();
    let move_hashes = (0..NUM_MOVES)
        .map(|_| [0, next(), next()])
        .collect::<Vec<_>>();
    let illegal_empty_point = (0..NUM_POINTS).map(|_| next()).collect::<Vec<_>>();

    Tables {
        black_to_play,
        opponent_passed,
        move_hashes,
        illegal_empty_point,
    }
});

/// Hash for a stone of `color` at `c`. Zero for `Color::Empty`.
#[inline]
pub fn move_hash(c: Coord, color: Color) -> Hash {
    TABLES.move_hashes[c.index()][color as usize]
}

/// Non-zero when it's Black's turn.
#[inline]
pub fn to_play_hash(color: Color) -> Hash {
    if color == Color::Black {
        TABLES.black_to_play
    } else {
        0
    }
}

/// Hash mixed in when the previous move was a pass.
#[inline]
pub fn opponent_passed_hash() -> Hash {
    TABLES.opponent_passed
}

/// Hash for empty points that can't be played because of self-capture, ko or
/// positional superko. Contributes to inference cache keys only, never to the
/// stone hash.
#[inline]
pub fn illegal_empty_point_hash(c: Coord) -> Hash {
    TABLES.illegal_empty_point[c.index()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_hash_is_zero() {
        for i in 0..NUM_POINTS {
            assert_eq!(move_hash(Coord::from_index(i), Color::Empty), 0);
        }
    }

    #[test]
    fn test_hashes_distinct() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..NUM_POINTS {
            let c = Coord::from_index(i);
            assert!(seen.insert(move_hash(c, Color::Black)));
            assert!(seen.insert(move_hash(c, Color::White)));
            assert!(seen.insert(illegal_empty_point_hash(c)));
        }
        assert!(seen.insert(to_play_hash(Color::Black)));
        assert!(seen.insert(opponent_passed_hash()));
    }

    #[test]
    fn test_white_to_play_hash_is_zero() {
        assert_eq!(to_play_hash(Color::White), 0);
        assert_eq!(to_play_hash(Color::Empty), 0);
        assert_ne!(to_play_hash(Color::Black), 0);
    }
}
