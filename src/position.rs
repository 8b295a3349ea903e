//! Go position representation and move execution.
//!
//! This module provides the core game logic:
//! - Board state as a flat array of packed stones with incremental group
//!   tracking through a [`GroupPool`]
//! - Stone placement, capture detection and ko
//! - Legal-move recomputation, optionally under positional superko via a
//!   caller-supplied [`ZobristHistory`]
//! - Benson pass-alive analysis and Tromp-Taylor area scoring
//!
//! The MCTS code clones a `Position` for every expanded node, so the struct
//! is kept as compact as possible: stones are 16-bit values and groups only
//! track their size and liberty count.

use once_cell::sync::Lazy;

use crate::color::Color;
use crate::constants::{N, NUM_MOVES, NUM_POINTS};
use crate::coord::Coord;
use crate::group::{Group, GroupId, GroupPool};
use crate::stone::Stone;
use crate::zobrist::{self, Hash};

/// The stones of a position in row-major order.
pub type Stones = [Stone; NUM_POINTS];

static NEIGHBORS: Lazy<Vec<Vec<u16>>> = Lazy::new(|| {
    (0..NUM_POINTS)
        .map(|i| {
            let (row, col) = (i / N, i % N);
            let mut v = Vec::with_capacity(4);
            if col > 0 {
                v.push((i - 1) as u16);
            }
            if col < N - 1 {
                v.push((i + 1) as u16);
            }
            if row > 0 {
                v.push((i - N) as u16);
            }
            if row < N - 1 {
                v.push((i + N) as u16);
            }
            v
        })
        .collect()
});

/// The 4-connected neighbors of a point, as indices.
#[inline]
pub(crate) fn neighbors(i: usize) -> &'static [u16] {
    &NEIGHBORS[i]
}

/// The 4-connected neighbors of a point. Exposed for analysis tooling and
/// reference implementations in tests.
#[inline]
pub fn neighbors_of(i: usize) -> &'static [u16] {
    neighbors(i)
}

/// Classification of a candidate move. Neither `NoCapture` nor `Capture`
/// implies full legality: positional superko is checked separately.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MoveType {
    /// A stone is already there, the move is ko, or the move is suicidal.
    Illegal,
    /// The move will not capture an opponent group.
    NoCapture,
    /// The move will capture at least one opponent group.
    Capture,
}

/// Interface used to enforce positional superko based on the Zobrist hash of
/// a position. The search tree implements this by walking its ancestors.
pub trait ZobristHistory {
    fn has_position_been_played(&self, stone_hash: Hash) -> bool;
}

/// A single board position.
///
/// Tracks the stones on the board and their groups, and contains the logic
/// for removing groups with no remaining liberties and merging neighboring
/// groups of the same color.
#[derive(Clone)]
pub struct Position {
    stones: Stones,
    groups: GroupPool,
    to_play: Color,
    ko: Coord,
    /// Number of captures for (Black, White).
    num_captures: [i32; 2],
    n: usize,
    legal_moves: [bool; NUM_MOVES],
    /// Zobrist hash of the placed stones. Used for positional superko; does
    /// not cover ko, to-play or pass state, so it is not a cache key on its
    /// own.
    stone_hash: Hash,
}

impl Position {
    /// An empty board. All moves are legal.
    pub fn new(to_play: Color) -> Position {
        Position {
            stones: [Stone::default(); NUM_POINTS],
            groups: GroupPool::default(),
            to_play,
            ko: Coord::INVALID,
            num_captures: [0, 0],
            n: 0,
            legal_moves: [true; NUM_MOVES],
            stone_hash: 0,
        }
    }

    /// Builds a position from a textual board like the one `Display` prints:
    /// `.` empty, `X` black, `O` white, whitespace ignored. Rows run from the
    /// top. Intended for tests and diagnostic tooling.
    pub fn from_text_board(text: &str, to_play: Color) -> Position {
        let mut pos = Position::new(to_play);
        let mut i = 0;
        for ch in text.chars() {
            let color = match ch {
                'X' | 'x' => Color::Black,
                'O' | 'o' => Color::White,
                '.' => Color::Empty,
                _ => continue,
            };
            assert!(i < NUM_POINTS, "too many points in text board");
            if color != Color::Empty {
                pos.add_stone_to_board(Coord::from_index(i), color);
            }
            i += 1;
        }
        pos.ko = Coord::INVALID;
        pos.update_legal_moves(None);
        pos
    }

    #[inline]
    pub fn to_play(&self) -> Color {
        self.to_play
    }

    #[inline]
    pub fn stones(&self) -> &Stones {
        &self.stones
    }

    /// Move number: 0 at the start of the game.
    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn ko(&self) -> Coord {
        self.ko
    }

    #[inline]
    pub fn stone_hash(&self) -> Hash {
        self.stone_hash
    }

    #[inline]
    pub fn num_captures(&self) -> &[i32; 2] {
        &self.num_captures
    }

    /// True if playing `c` is legal, including positional superko if the
    /// legal moves were last updated with a history.
    #[inline]
    pub fn legal_move(&self, c: Coord) -> bool {
        self.legal_moves[c.index()]
    }

    #[inline]
    pub fn legal_moves(&self) -> &[bool; NUM_MOVES] {
        &self.legal_moves
    }

    /// Liberty count of the chain occupying point `i`, or 0 for empty points.
    #[inline]
    pub fn num_chain_liberties(&self, i: usize) -> u16 {
        let s = self.stones[i];
        if s.is_empty() {
            0
        } else {
            self.groups[s.group_id()].num_liberties
        }
    }

    /// The group of the stone at `c`, if any.
    pub fn group_at(&self, c: Coord) -> Option<Group> {
        let s = self.stones[c.index()];
        if s.is_empty() {
            None
        } else {
            Some(self.groups[s.group_id()])
        }
    }

    /// Zobrist hash of a stones array. Prefer [`Position::stone_hash`] when a
    /// position is at hand.
    pub fn calculate_stone_hash(stones: &Stones) -> Hash {
        let mut h = 0;
        for (i, s) in stones.iter().enumerate() {
            h ^= zobrist::move_hash(Coord::from_index(i), s.color());
        }
        h
    }

    /// Plays a move and recomputes the legal move set.
    ///
    /// `color` defaults to the side to play. If `history` is given, the legal
    /// move update also enforces positional superko; otherwise only basic
    /// legality (occupancy, ko, suicide) is considered.
    ///
    /// Panics if the move is illegal under [`Position::classify_move`].
    pub fn play_move(
        &mut self,
        c: Coord,
        color: Option<Color>,
        history: Option<&dyn ZobristHistory>,
    ) {
        if c == Coord::PASS || c == Coord::RESIGN {
            self.n += 1;
            self.ko = Coord::INVALID;
            self.to_play = self.to_play.other();
            self.update_legal_moves(history);
            return;
        }

        let color = match color {
            Some(Color::Empty) | None => self.to_play,
            Some(c) => c,
        };
        assert!(
            self.classify_move(c) != MoveType::Illegal,
            "illegal move {} for {}",
            c,
            color
        );

        self.add_stone_to_board(c, color);

        self.n += 1;
        self.to_play = color.other();
        self.update_legal_moves(history);

        #[cfg(debug_assertions)]
        debug_assert!(self.groups_consistent(), "group invariants broken by {}", c);
    }

    /// Returns `color` if the point at `c` is empty and surrounded on all
    /// sides by stones of `color`, and `Empty` otherwise.
    fn is_koish(&self, c: Coord) -> Color {
        if !self.stones[c.index()].is_empty() {
            return Color::Empty;
        }
        let mut ko_color = Color::Empty;
        for &nc in neighbors(c.index()) {
            let s = self.stones[nc as usize];
            if s.is_empty() {
                return Color::Empty;
            }
            if s.color() != ko_color {
                if ko_color == Color::Empty {
                    ko_color = s.color();
                } else {
                    return Color::Empty;
                }
            }
        }
        ko_color
    }

    /// Adds a stone to the board, removing newly surrounded opponent groups
    /// and updating liberty counts, captures, the stone hash and ko.
    ///
    /// Does NOT update the legal move set; callers must invoke
    /// `update_legal_moves` afterwards (which itself relies on the board
    /// state this method leaves behind).
    fn add_stone_to_board(&mut self, c: Coord, color: Color) {
        let potential_ko = self.is_koish(c);
        let opponent = color.other();

        // Traverse the coord's neighbors, building useful information:
        //  - list of captured groups (if any)
        //  - coordinates of the new stone's liberties
        //  - sets of neighboring groups of each color
        let mut captured: Vec<(GroupId, Coord, u16)> = Vec::with_capacity(4);
        let mut liberties: Vec<Coord> = Vec::with_capacity(4);
        let mut opponent_groups: Vec<GroupId> = Vec::with_capacity(4);
        let mut neighbor_groups: Vec<GroupId> = Vec::with_capacity(4);
        for &nc in neighbors(c.index()) {
            let s = self.stones[nc as usize];
            if s.is_empty() {
                liberties.push(Coord::from_index(nc as usize));
            } else if s.color() == color {
                if !neighbor_groups.contains(&s.group_id()) {
                    neighbor_groups.push(s.group_id());
                }
            } else if !opponent_groups.contains(&s.group_id()) {
                let id = s.group_id();
                opponent_groups.push(id);
                self.groups[id].num_liberties -= 1;
                if self.groups[id].num_liberties == 0 {
                    captured.push((id, Coord::from_index(nc as usize), self.groups[id].size));
                }
            }
        }

        // Place the new stone.
        match neighbor_groups.len() {
            0 => {
                // No same-colored neighbors: a new group.
                let id = self.groups.alloc(1, liberties.len() as u16);
                self.stones[c.index()] = Stone::new(color, id);
            }
            1 => {
                // Join the single neighboring group, counting only liberties
                // that weren't already liberties of that group.
                let id = neighbor_groups[0];
                let mut added = 0;
                for &lc in &liberties {
                    if !self.has_neighboring_group(lc, id) {
                        added += 1;
                    }
                }
                let group = &mut self.groups[id];
                group.size += 1;
                group.num_liberties = group.num_liberties - 1 + added;
                self.stones[c.index()] = Stone::new(color, id);
            }
            _ => {
                // The stone joins multiple groups. Incrementally updating the
                // merged liberty count is hard, so the merged chain is
                // rewalked and recounted from scratch. Merges are rare
                // compared to single-neighbor extensions.
                self.stones[c.index()] = Stone::new(color, neighbor_groups[0]);
                self.merge_group(c);
                for &id in &neighbor_groups[1..] {
                    self.groups.free(id);
                }
            }
        }
        self.stone_hash ^= zobrist::move_hash(c, color);

        // Remove captured groups.
        for &(_, gc, size) in &captured {
            match color {
                Color::Black => self.num_captures[0] += size as i32,
                Color::White => self.num_captures[1] += size as i32,
                Color::Empty => unreachable!(),
            }
            self.remove_group(gc);
        }

        // The move produces a ko iff it captured a single stone into a koish
        // shape; the ko point is the captured square.
        if captured.len() == 1 && captured[0].2 == 1 && potential_ko == opponent {
            self.ko = captured[0].1;
        } else {
            self.ko = Coord::INVALID;
        }
    }

    /// Removes the group with a stone at `c` from the board, incrementing the
    /// liberty counts of neighboring opposite-colored groups once per group
    /// per removed stone.
    fn remove_group(&mut self, c: Coord) {
        let removed_color = self.stones[c.index()].color();
        let other_color = removed_color.other();
        let removed_id = self.stones[c.index()].group_id();

        let mut visited = [false; NUM_POINTS];
        let mut stack = vec![c.index()];
        visited[c.index()] = true;
        while let Some(i) = stack.pop() {
            debug_assert_eq!(self.stones[i].group_id(), removed_id);
            self.stones[i] = Stone::default();
            self.stone_hash ^= zobrist::move_hash(Coord::from_index(i), removed_color);

            let mut adjusted: Vec<GroupId> = Vec::with_capacity(4);
            for &nc in neighbors(i) {
                let s = self.stones[nc as usize];
                if s.color() == other_color {
                    if !adjusted.contains(&s.group_id()) {
                        adjusted.push(s.group_id());
                        self.groups[s.group_id()].num_liberties += 1;
                    }
                } else if s.color() == removed_color && !visited[nc as usize] {
                    visited[nc as usize] = true;
                    stack.push(nc as usize);
                }
            }
        }

        self.groups.free(removed_id);
    }

    /// Recounts the size and liberties of the (just merged) chain containing
    /// `c` and relabels all its stones with that chain's group id.
    fn merge_group(&mut self, c: Coord) {
        let s = self.stones[c.index()];
        let color = s.color();
        let opponent = color.other();
        self.groups[s.group_id()] = Group::new(0, 0);

        let mut visited = [false; NUM_POINTS];
        let mut stack = vec![c.index()];
        visited[c.index()] = true;
        while let Some(i) = stack.pop() {
            if self.stones[i].is_empty() {
                // Empty coords go through the visited set too, so each one is
                // counted as a liberty once even when it touches several
                // stones of the chain.
                self.groups[s.group_id()].num_liberties += 1;
            } else {
                debug_assert_eq!(self.stones[i].color(), color);
                self.groups[s.group_id()].size += 1;
                self.stones[i] = s;
                for &nc in neighbors(i) {
                    if self.stones[nc as usize].color() != opponent && !visited[nc as usize] {
                        visited[nc as usize] = true;
                        stack.push(nc as usize);
                    }
                }
            }
        }
    }

    fn has_neighboring_group(&self, c: Coord, id: GroupId) -> bool {
        for &nc in neighbors(c.index()) {
            let s = self.stones[nc as usize];
            if !s.is_empty() && s.group_id() == id {
                return true;
            }
        }
        false
    }

    /// Classifies a candidate move for the side to play. Does not consider
    /// positional superko; `legal_move` covers that.
    pub fn classify_move(&self, c: Coord) -> MoveType {
        if c == Coord::PASS || c == Coord::RESIGN {
            return MoveType::NoCapture;
        }
        if !self.stones[c.index()].is_empty() {
            return MoveType::Illegal;
        }
        if c == self.ko {
            return MoveType::Illegal;
        }

        let mut result = MoveType::Illegal;
        let other_color = self.to_play.other();
        for &nc in neighbors(c.index()) {
            let s = self.stones[nc as usize];
            if s.is_empty() {
                // At least one liberty after playing at c.
                if result == MoveType::Illegal {
                    result = MoveType::NoCapture;
                }
            } else if s.color() == other_color {
                if self.groups[s.group_id()].num_liberties == 1 {
                    // Will capture the opponent group that has a stone here.
                    result = MoveType::Capture;
                }
            } else if self.groups[s.group_id()].num_liberties > 1 {
                // Connects to a friendly group with a spare liberty.
                if result == MoveType::Illegal {
                    result = MoveType::NoCapture;
                }
            }
        }
        result
    }

    /// The stone hash the position would have after the side to play moves at
    /// `c`. `c` must be playable (not `Illegal`). Used for superko detection
    /// without mutating the board.
    fn stone_hash_after(&self, c: Coord, move_type: MoveType) -> Hash {
        let color = self.to_play;
        let mut h = self.stone_hash ^ zobrist::move_hash(c, color);
        if move_type != MoveType::Capture {
            return h;
        }

        let opponent = color.other();
        let mut counted: Vec<GroupId> = Vec::with_capacity(4);
        for &nc in neighbors(c.index()) {
            let s = self.stones[nc as usize];
            if s.color() != opponent
                || self.groups[s.group_id()].num_liberties != 1
                || counted.contains(&s.group_id())
            {
                continue;
            }
            counted.push(s.group_id());
            // XOR out every stone of the captured chain.
            let id = s.group_id();
            let mut visited = [false; NUM_POINTS];
            let mut stack = vec![nc as usize];
            visited[nc as usize] = true;
            while let Some(i) = stack.pop() {
                h ^= zobrist::move_hash(Coord::from_index(i), opponent);
                for &nn in neighbors(i) {
                    let ns = self.stones[nn as usize];
                    if !ns.is_empty() && ns.group_id() == id && !visited[nn as usize] {
                        visited[nn as usize] = true;
                        stack.push(nn as usize);
                    }
                }
            }
        }
        h
    }

    /// Recomputes the legal move bitmap. With a `history`, empty playable
    /// points whose resulting stone hash repeats an earlier position are
    /// marked illegal (positional superko).
    pub fn update_legal_moves(&mut self, history: Option<&dyn ZobristHistory>) {
        self.legal_moves[Coord::PASS.index()] = true;
        for i in 0..NUM_POINTS {
            let c = Coord::from_index(i);
            let move_type = self.classify_move(c);
            self.legal_moves[i] = match (move_type, history) {
                (MoveType::Illegal, _) => false,
                (_, None) => true,
                (_, Some(history)) => {
                    !history.has_position_been_played(self.stone_hash_after(c, move_type))
                }
            };
        }
    }

    /// Area score from Black's perspective: stones plus single-color empty
    /// regions, minus komi. Negative means White is winning.
    pub fn calculate_score(&self, komi: f32) -> f32 {
        let mut score: i32 = 0;
        let mut visited = [false; NUM_POINTS];
        let mut group_seen = [false; Group::MAX_NUM_GROUPS];

        for i in 0..NUM_POINTS {
            let s = self.stones[i];
            if s.is_empty() {
                if visited[i] {
                    continue;
                }
                // Flood the empty region, recording which colors border it.
                let mut found_bits = 0;
                let mut num_visited = 0;
                let mut stack = vec![i];
                visited[i] = true;
                while let Some(p) = stack.pop() {
                    num_visited += 1;
                    for &nc in neighbors(p) {
                        let ns = self.stones[nc as usize];
                        if ns.is_empty() {
                            if !visited[nc as usize] {
                                visited[nc as usize] = true;
                                stack.push(nc as usize);
                            }
                        } else {
                            found_bits |= ns.color() as i32;
                        }
                    }
                }
                if found_bits == Color::Black as i32 {
                    score += num_visited;
                } else if found_bits == Color::White as i32 {
                    score -= num_visited;
                }
            } else if !group_seen[s.group_id() as usize] {
                group_seen[s.group_id() as usize] = true;
                let size = self.groups[s.group_id()].size as i32;
                if s.color() == Color::Black {
                    score += size;
                } else {
                    score -= size;
                }
            }
        }

        score as f32 - komi
    }

    /// Benson's algorithm for both colors combined. Points inside a
    /// pass-alive enclosed region are set to the enclosing color; everything
    /// else (including the stones of the enclosing chains) is `Empty`.
    pub fn calculate_pass_alive_regions(&self) -> [Color; NUM_POINTS] {
        let mut result = [Color::Empty; NUM_POINTS];
        self.calculate_pass_alive_regions_for_color(Color::Black, &mut result);
        self.calculate_pass_alive_regions_for_color(Color::White, &mut result);
        result
    }

    /// True if every empty point on the board lies inside some pass-alive
    /// region. Used to terminate games whose outcome can no longer change.
    pub fn calculate_whole_board_pass_alive(&self) -> bool {
        let regions = self.calculate_pass_alive_regions();
        for i in 0..NUM_POINTS {
            if regions[i] == Color::Empty && self.stones[i].is_empty() {
                return false;
            }
        }
        true
    }

    /// Marks the pass-alive regions enclosed by `color` chains in `result`.
    fn calculate_pass_alive_regions_for_color(
        &self,
        color: Color,
        result: &mut [Color; NUM_POINTS],
    ) {
        // A region is a maximal connected set of points that are empty or
        // hold opponent stones. A region is vital to a chain if every empty
        // point of the region is a liberty of that chain.
        struct Region {
            points: Vec<u16>,
            adjacent_chains: Vec<GroupId>,
            vital_chains: Vec<GroupId>,
            /// Every empty point touches at least one `color` chain.
            small: bool,
            alive: bool,
        }

        let mut region_ids = [usize::MAX; NUM_POINTS];
        let mut regions: Vec<Region> = Vec::new();
        for start in 0..NUM_POINTS {
            if self.stones[start].color() == color || region_ids[start] != usize::MAX {
                continue;
            }
            let region_id = regions.len();
            let mut points = Vec::new();
            let mut adjacent_chains: Vec<GroupId> = Vec::new();
            // Intersection over empty points of their adjacent chains.
            let mut vital_chains: Vec<GroupId> = Vec::new();
            let mut small = true;
            let mut seen_empty = false;

            let mut stack = vec![start];
            region_ids[start] = region_id;
            while let Some(p) = stack.pop() {
                points.push(p as u16);
                let mut point_chains: Vec<GroupId> = Vec::with_capacity(4);
                for &nc in neighbors(p) {
                    let s = self.stones[nc as usize];
                    if s.color() == color {
                        if !point_chains.contains(&s.group_id()) {
                            point_chains.push(s.group_id());
                        }
                        if !adjacent_chains.contains(&s.group_id()) {
                            adjacent_chains.push(s.group_id());
                        }
                    } else if region_ids[nc as usize] == usize::MAX {
                        region_ids[nc as usize] = region_id;
                        stack.push(nc as usize);
                    }
                }
                if self.stones[p].is_empty() {
                    if point_chains.is_empty() {
                        small = false;
                    }
                    if seen_empty {
                        vital_chains.retain(|id| point_chains.contains(id));
                    } else {
                        vital_chains = point_chains;
                        seen_empty = true;
                    }
                }
            }

            regions.push(Region {
                points,
                adjacent_chains,
                vital_chains,
                small,
                alive: true,
            });
        }

        // Chains of `color`, by group id.
        let mut chain_alive = [false; Group::MAX_NUM_GROUPS];
        let mut chains: Vec<GroupId> = Vec::new();
        for i in 0..NUM_POINTS {
            let s = self.stones[i];
            if s.color() == color && !chain_alive[s.group_id() as usize] {
                chain_alive[s.group_id() as usize] = true;
                chains.push(s.group_id());
            }
        }

        // Iterate to the fixed point: a chain needs at least two vital
        // regions to stay alive; a region needs all its enclosing chains
        // alive to stay in the candidate set.
        loop {
            let mut changed = false;
            for &id in &chains {
                if !chain_alive[id as usize] {
                    continue;
                }
                let num_vital = regions
                    .iter()
                    .filter(|r| r.alive && r.vital_chains.contains(&id))
                    .count();
                if num_vital < 2 {
                    chain_alive[id as usize] = false;
                    changed = true;
                }
            }
            for region in &mut regions {
                if region.alive
                    && region
                        .adjacent_chains
                        .iter()
                        .any(|&id| !chain_alive[id as usize])
                {
                    region.alive = false;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for region in &regions {
            if region.alive && region.small && !region.adjacent_chains.is_empty() {
                for &p in &region.points {
                    result[p as usize] = color;
                }
            }
        }
    }

    /// Re-derives every live group's size and liberty count from the stones
    /// and compares with the tracked values. Debug-build aid.
    #[cfg(debug_assertions)]
    fn groups_consistent(&self) -> bool {
        let mut checked = [false; Group::MAX_NUM_GROUPS];
        for start in 0..NUM_POINTS {
            let s = self.stones[start];
            if s.is_empty() || checked[s.group_id() as usize] {
                continue;
            }
            checked[s.group_id() as usize] = true;

            let mut size = 0u16;
            let mut libs = 0u16;
            let mut visited = [false; NUM_POINTS];
            let mut stack = vec![start];
            visited[start] = true;
            while let Some(i) = stack.pop() {
                if self.stones[i].is_empty() {
                    libs += 1;
                    continue;
                }
                size += 1;
                for &nc in neighbors(i) {
                    let ns = self.stones[nc as usize];
                    if (ns.is_empty() || ns.group_id() == s.group_id()) && !visited[nc as usize] {
                        visited[nc as usize] = true;
                        stack.push(nc as usize);
                    }
                }
            }

            let group = self.groups[s.group_id()];
            if group.size != size || group.num_liberties != libs {
                return false;
            }
        }
        true
    }

    /// Compact single-character-per-point rendering, rows from the top. The
    /// ko point renders as `*`.
    pub fn to_simple_string(&self) -> String {
        let mut out = String::with_capacity(NUM_POINTS + N);
        for row in 0..N {
            for col in 0..N {
                let c = Coord::from_row_col(row, col);
                out.push(match self.stones[c.index()].color() {
                    Color::Black => 'X',
                    Color::White => 'O',
                    Color::Empty => {
                        if c == self.ko {
                            '*'
                        } else {
                            '.'
                        }
                    }
                });
            }
            if row + 1 < N {
                out.push('\n');
            }
        }
        out
    }

    /// Board rendering with GTP coordinate labels, optionally with ANSI
    /// colors for terminals.
    pub fn to_pretty_string(&self, use_ansi_colors: bool) -> String {
        const PRINT_WHITE: &str = "\x1b[0;31;47m";
        const PRINT_BLACK: &str = "\x1b[0;31;40m";
        const PRINT_EMPTY: &str = "\x1b[0;31;43m";
        const PRINT_NORMAL: &str = "\x1b[0m";
        use crate::coord::GTP_COLUMNS;
        use std::fmt::Write;

        let (white, black, empty, normal) = if use_ansi_colors {
            (PRINT_WHITE, PRINT_BLACK, PRINT_EMPTY, PRINT_NORMAL)
        } else {
            ("", "", "", "")
        };

        let mut out = String::new();
        let mut cols = String::from("   ");
        for i in 0..N {
            cols.push(GTP_COLUMNS[i] as char);
            cols.push(' ');
        }
        out.push_str(&cols);
        out.push('\n');
        for row in 0..N {
            write!(out, "{:2} ", N - row).unwrap();
            for col in 0..N {
                let c = Coord::from_row_col(row, col);
                match self.stones[c.index()].color() {
                    Color::White => write!(out, "{}O ", white).unwrap(),
                    Color::Black => write!(out, "{}X ", black).unwrap(),
                    Color::Empty => {
                        let ch = if c == self.ko { '*' } else { '.' };
                        write!(out, "{}{} ", empty, ch).unwrap()
                    }
                }
            }
            write!(out, "{}{:2}\n", normal, N - row).unwrap();
        }
        out.push_str(&cols);
        out
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_simple_string())
    }
}

impl std::fmt::Debug for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Position {{ n: {}, to_play: {}, ko: {} }}",
            self.n, self.to_play, self.ko
        )?;
        write!(f, "{}", self.to_simple_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(pos: &mut Position, gtp: &str) {
        pos.play_move(Coord::from_gtp(gtp).unwrap(), None, None);
    }

    #[test]
    fn test_empty_position() {
        let pos = Position::new(Color::Black);
        assert_eq!(pos.n(), 0);
        assert_eq!(pos.ko(), Coord::INVALID);
        assert_eq!(pos.stone_hash(), 0);
        for i in 0..NUM_MOVES {
            assert!(pos.legal_move(Coord::from_index(i)));
        }
    }

    #[test]
    fn test_single_stone_liberties() {
        let mut pos = Position::new(Color::Black);
        play(&mut pos, "E5");
        let g = pos.group_at(Coord::from_gtp("E5").unwrap()).unwrap();
        assert_eq!(g.size, 1);
        assert_eq!(g.num_liberties, 4);

        play(&mut pos, "A1");
        let g = pos.group_at(Coord::from_gtp("A1").unwrap()).unwrap();
        assert_eq!(g.num_liberties, 2);
    }

    #[test]
    fn test_group_extension_and_merge() {
        let mut pos = Position::new(Color::Black);
        // Black builds two separate stones and joins them.
        play(&mut pos, "C3");
        play(&mut pos, "G7");
        play(&mut pos, "E3");
        play(&mut pos, "G6");
        play(&mut pos, "D3"); // joins C3 and E3
        let g = pos.group_at(Coord::from_gtp("D3").unwrap()).unwrap();
        assert_eq!(g.size, 3);
        assert_eq!(g.num_liberties, 8);
        // All three stones share the same group.
        let id = pos.stones()[Coord::from_gtp("C3").unwrap().index()].group_id();
        assert_eq!(
            pos.stones()[Coord::from_gtp("E3").unwrap().index()].group_id(),
            id
        );
    }

    #[test]
    fn test_capture_updates_liberties_and_count() {
        let mut pos = Position::from_text_board(
            "\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            ....X....\n\
            ...XOX...\n\
            .........\n\
            .........\n\
            .........",
            Color::Black,
        );
        let before = pos.num_captures()[0];
        pos.play_move(Coord::from_gtp("E3").unwrap(), None, None);
        assert_eq!(pos.num_captures()[0], before + 1);
        // The captured point is empty again.
        assert!(pos.stones()[Coord::from_gtp("E4").unwrap().index()].is_empty());
        // The capturing stones regained the shared liberty.
        let g = pos.group_at(Coord::from_gtp("D4").unwrap()).unwrap();
        assert_eq!(g.num_liberties, 4);
    }

    #[test]
    fn test_suicide_is_illegal() {
        // A1 is surrounded by black; white may not play there.
        let pos = Position::from_text_board(
            "\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            X........\n\
            .X.......",
            Color::White,
        );
        let a1 = Coord::from_gtp("A1").unwrap();
        assert_eq!(pos.classify_move(a1), MoveType::Illegal);
        assert!(!pos.legal_move(a1));
    }

    #[test]
    fn test_multi_stone_suicide_is_illegal() {
        // White D1 would leave the C1-D1 chain with no liberties.
        let pos = Position::from_text_board(
            "\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .XXX.....\n\
            X.XXX....\n\
            .XO.X....",
            Color::White,
        );
        let d1 = Coord::from_gtp("D1").unwrap();
        assert_eq!(pos.classify_move(d1), MoveType::Illegal);
    }

    #[test]
    fn test_capture_beats_suicide() {
        // The same shape, but the surrounding chain is in atari, so the
        // "suicidal" point actually captures.
        let mut pos = Position::from_text_board(
            "\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .OOO.....\n\
            OXXXO....\n\
            O...O....\n\
            OXXXO....",
            Color::Black,
        );
        // Black C2 connects the inside chains; every outside white chain
        // keeps liberties so this is just a legal inside move.
        let c2 = Coord::from_gtp("C2").unwrap();
        assert_ne!(pos.classify_move(c2), MoveType::Capture);
        pos.play_move(c2, None, None);
    }

    #[test]
    fn test_ko_point_set_and_cleared() {
        let mut pos = Position::from_text_board(
            "\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            ...XO....\n\
            ..X.XO...\n\
            ...XO....",
            Color::White,
        );
        // White takes the ko at D2.
        pos.play_move(Coord::from_gtp("D2").unwrap(), None, None);
        assert_eq!(pos.ko(), Coord::from_gtp("E2").unwrap());
        assert!(!pos.legal_move(Coord::from_gtp("E2").unwrap()));
        // Ko is cleared by a pass.
        pos.play_move(Coord::PASS, None, None);
        assert_eq!(pos.ko(), Coord::INVALID);
        assert!(pos.legal_move(Coord::from_gtp("E2").unwrap()));
    }

    #[test]
    fn test_stone_hash_matches_recalculation() {
        let mut pos = Position::new(Color::Black);
        for mv in ["D4", "E4", "D5", "E5", "C4", "F4", "pass", "D3"] {
            pos.play_move(Coord::from_gtp(mv).unwrap(), None, None);
            assert_eq!(pos.stone_hash(), Position::calculate_stone_hash(pos.stones()));
        }
    }

    #[test]
    fn test_score_empty_board() {
        let pos = Position::new(Color::Black);
        assert_eq!(pos.calculate_score(7.5), -7.5);
        assert_eq!(pos.calculate_score(0.0), 0.0);
    }

    #[test]
    fn test_score_counts_area() {
        // Black wall on column E splits the board; Black owns everything to
        // the left plus the wall, White owns one stone region.
        let pos = Position::from_text_board(
            "\
            ....X....\n\
            ....X....\n\
            ....X....\n\
            ....X....\n\
            ....X....\n\
            ....X....\n\
            ....X....\n\
            ....X....\n\
            ....X....",
            Color::White,
        );
        // Entire board becomes black: 81 - komi.
        assert_eq!(pos.calculate_score(7.5), 81.0 - 7.5);
    }

    #[test]
    fn test_pass_alive_corner() {
        // Black has two eyes in the corner; the eye points are pass-alive.
        let pos = Position::from_text_board(
            "\
            .X.X.....\n\
            XXXX.....\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........",
            Color::Black,
        );
        let regions = pos.calculate_pass_alive_regions();
        assert_eq!(regions[Coord::from_gtp("A9").unwrap().index()], Color::Black);
        assert_eq!(regions[Coord::from_gtp("C9").unwrap().index()], Color::Black);
        // An unrelated empty point is not pass-alive.
        assert_eq!(regions[Coord::from_gtp("E5").unwrap().index()], Color::Empty);
    }

    #[test]
    fn test_single_eye_not_pass_alive() {
        let pos = Position::from_text_board(
            "\
            .X.......\n\
            XX.......\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........\n\
            .........",
            Color::Black,
        );
        let regions = pos.calculate_pass_alive_regions();
        assert_eq!(regions[Coord::from_gtp("A9").unwrap().index()], Color::Empty);
    }

    #[test]
    fn test_from_text_board_roundtrip() {
        let text = "\
.XO.XO.OO
X.XXOOOO.
XXXXXOOOO
XXXXXOOOO
.XXXXOOO.
XXXXXOOOO
.XXXXOOO.
XXXXXOOOO
XXXXOOOOO";
        let pos = Position::from_text_board(text, Color::White);
        assert_eq!(pos.to_simple_string(), text);
    }
}
