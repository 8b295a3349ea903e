//! Monte Carlo Tree Search over Go positions.
//!
//! The tree is a strict arborescence stored in a slab arena indexed by 32-bit
//! ids; parent links are back references used only for ascending during
//! backup and superko checks. Each node's own visit statistics live in its
//! parent's edge array, so walking up the tree updates `(N, W)` for the edge
//! that was traversed.
//!
//! Selection uses PUCT: `AS(i) = Q(i)*to_play_sign + U(i) - 1000*!legal(i)`
//! with `U(i) = scale * P(i) * sqrt(max(1, N-1)) / (1 + N(i))`. `Q` is always
//! held from Black's perspective and reinterpreted per node via the sign.

use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::algorithm;
use crate::color::Color;
use crate::constants::{
    MAX_SEARCH_DEPTH, NUM_MOVES, NUM_POINTS, SOFT_PICK_CUTOFF, SUPERKO_CACHE_STRIDE, UCT_BASE,
    UCT_INIT,
};
use crate::coord::Coord;
use crate::position::{Position, ZobristHistory};
use crate::stone::Stone;
use crate::symmetry::{self, ALL_SYMMETRIES, Symmetry};
use crate::zobrist::Hash;

/// Index of a node in the tree's arena.
pub type NodeId = u32;

/// Statistics for the edge from a parent to one of its children.
#[derive(Copy, Clone, Default, Debug)]
pub struct EdgeStats {
    pub n: i32,
    pub w: f32,
    pub p: f32,
    pub original_p: f32,
}

struct MctsNode {
    parent: Option<NodeId>,
    /// Move that led to this position. `INVALID` for the game root.
    mv: Coord,
    edges: Box<[EdgeStats]>,
    /// Sparse child map: only expanded-into children exist.
    children: HashMap<Coord, NodeId>,
    is_expanded: bool,
    /// The symmetry mapping this position to its canonical (smallest stone
    /// hash) orientation, if that minimum is unique. Inherited from the
    /// parent once established so cache keys stay stable along a game path.
    canonical_symmetry: Option<Symmetry>,
    num_virtual_losses: i32,
    /// If present, the Zobrist stone hashes of every position from the game
    /// root down to and including this node. Installed every
    /// `SUPERKO_CACHE_STRIDE` plies so superko checks stay O(1) amortized.
    superko_cache: Option<HashSet<Hash>>,
    position: Position,
}

/// Tuning knobs for the tree.
#[derive(Copy, Clone, Debug)]
pub struct TreeOptions {
    /// Value initialization penalty in `[0, 2]`: new children start with
    /// `W = clamp(v - penalty * to_play_sign, -1, 1)`. 0 is init-to-parent,
    /// 2 is init-to-loss.
    pub value_init_penalty: f32,
    /// Exponent applied to visit counts during soft picks.
    pub policy_softmax_temp: f32,
    pub soft_pick_enabled: bool,
    /// Moves below this number are soft-picked.
    pub soft_pick_cutoff: usize,
}

impl Default for TreeOptions {
    fn default() -> TreeOptions {
        TreeOptions {
            value_init_penalty: 2.0,
            policy_softmax_temp: 0.98,
            soft_pick_enabled: true,
            soft_pick_cutoff: SOFT_PICK_CUTOFF,
        }
    }
}

/// Summary of a ranked child, used by `describe`.
#[derive(Copy, Clone, Debug)]
pub struct ChildInfo {
    pub c: Coord,
    pub n: i32,
    pub p: f32,
    pub action_score: f32,
}

/// Superko lookup that walks a node's ancestors, short-circuiting at the
/// first superko cache it encounters.
struct AncestorHistory<'a> {
    tree: &'a MctsTree,
    node: Option<NodeId>,
}

impl ZobristHistory for AncestorHistory<'_> {
    fn has_position_been_played(&self, stone_hash: Hash) -> bool {
        let mut cur = self.node;
        while let Some(id) = cur {
            let node = self.tree.node(id);
            if let Some(cache) = &node.superko_cache {
                return cache.contains(&stone_hash);
            }
            if node.position.stone_hash() == stone_hash {
                return true;
            }
            cur = node.parent;
        }
        false
    }
}

/// Picks the symmetry producing the smallest stone hash. Returns `None` when
/// the minimum is not unique; such positions are skipped by the inference
/// cache.
pub fn calculate_canonical_symmetry(position: &Position) -> Option<Symmetry> {
    let mut best = Symmetry::Identity;
    let mut best_hash = position.stone_hash();
    let mut transformed = [Stone::default(); NUM_POINTS];
    for &sym in &ALL_SYMMETRIES[1..] {
        symmetry::apply_plane(sym, position.stones(), &mut transformed);
        let h = Position::calculate_stone_hash(&transformed);
        if h < best_hash {
            best = sym;
            best_hash = h;
        } else if h == best_hash {
            return None;
        }
    }
    Some(best)
}

/// A search tree rooted at a game position.
///
/// The tree owns a game root (the position it was created with) and a current
/// root that advances as moves are played. Playing a move prunes all siblings
/// of the played edge; ancestors are kept so superko checks can reach back to
/// the start of the game.
pub struct MctsTree {
    nodes: Vec<Option<MctsNode>>,
    free: Vec<NodeId>,
    root: NodeId,
    game_root_stats: EdgeStats,
    options: TreeOptions,
}

fn new_edges() -> Box<[EdgeStats]> {
    vec![EdgeStats::default(); NUM_MOVES].into_boxed_slice()
}

impl MctsTree {
    pub fn new(position: Position, options: TreeOptions) -> MctsTree {
        let canonical_symmetry = calculate_canonical_symmetry(&position);
        let root = MctsNode {
            parent: None,
            mv: Coord::INVALID,
            edges: new_edges(),
            children: HashMap::new(),
            is_expanded: false,
            canonical_symmetry,
            num_virtual_losses: 0,
            superko_cache: None,
            position,
        };
        MctsTree {
            nodes: vec![Some(root)],
            free: Vec::new(),
            root: 0,
            game_root_stats: EdgeStats::default(),
            options,
        }
    }

    #[inline]
    fn node(&self, id: NodeId) -> &MctsNode {
        self.nodes[id as usize].as_ref().expect("freed node")
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut MctsNode {
        self.nodes[id as usize].as_mut().expect("freed node")
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[inline]
    pub fn position(&self, id: NodeId) -> &Position {
        &self.node(id).position
    }

    #[inline]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// The move that led to this node.
    #[inline]
    pub fn leaf_move(&self, id: NodeId) -> Coord {
        self.node(id).mv
    }

    #[inline]
    pub fn canonical_symmetry(&self, id: NodeId) -> Option<Symmetry> {
        self.node(id).canonical_symmetry
    }

    #[inline]
    pub fn is_expanded(&self, id: NodeId) -> bool {
        self.node(id).is_expanded
    }

    #[inline]
    pub fn num_virtual_losses(&self, id: NodeId) -> i32 {
        self.node(id).num_virtual_losses
    }

    pub fn child(&self, id: NodeId, c: Coord) -> Option<NodeId> {
        self.node(id).children.get(&c).copied()
    }

    fn stats(&self, id: NodeId) -> &EdgeStats {
        let node = self.node(id);
        match node.parent {
            Some(p) => &self.node(p).edges[node.mv.index()],
            None => &self.game_root_stats,
        }
    }

    fn stats_mut(&mut self, id: NodeId) -> &mut EdgeStats {
        let (parent, mv) = {
            let node = self.node(id);
            (node.parent, node.mv)
        };
        match parent {
            Some(p) => &mut self.node_mut(p).edges[mv.index()],
            None => &mut self.game_root_stats,
        }
    }

    #[inline]
    pub fn n(&self, id: NodeId) -> i32 {
        self.stats(id).n
    }

    #[inline]
    pub fn w(&self, id: NodeId) -> f32 {
        self.stats(id).w
    }

    /// Black-perspective mean value of the node.
    #[inline]
    pub fn q(&self, id: NodeId) -> f32 {
        let s = self.stats(id);
        s.w / (1.0 + s.n as f32)
    }

    /// Q from the point of view of the side to play at this node.
    #[inline]
    pub fn q_perspective(&self, id: NodeId) -> f32 {
        self.q(id) * self.node(id).position.to_play().sign()
    }

    /// The exploration scale applied to U at this node.
    #[inline]
    pub fn u_scale(&self, id: NodeId) -> f32 {
        2.0 * (((1.0 + self.n(id) as f32 + UCT_BASE) / UCT_BASE).ln() + UCT_INIT)
    }

    #[inline]
    pub fn child_n(&self, id: NodeId, i: usize) -> i32 {
        self.node(id).edges[i].n
    }

    #[inline]
    pub fn child_w(&self, id: NodeId, i: usize) -> f32 {
        self.node(id).edges[i].w
    }

    #[inline]
    pub fn child_p(&self, id: NodeId, i: usize) -> f32 {
        self.node(id).edges[i].p
    }

    #[inline]
    pub fn child_original_p(&self, id: NodeId, i: usize) -> f32 {
        self.node(id).edges[i].original_p
    }

    #[inline]
    pub fn child_q(&self, id: NodeId, i: usize) -> f32 {
        let e = &self.node(id).edges[i];
        e.w / (1.0 + e.n as f32)
    }

    #[inline]
    pub fn child_u(&self, id: NodeId, i: usize) -> f32 {
        let e = &self.node(id).edges[i];
        self.u_scale(id) * (self.n(id) as f32 - 1.0).max(1.0).sqrt() * e.p / (1.0 + e.n as f32)
    }

    /// True if this node ends the game: a resignation, or a pass answering a
    /// pass.
    pub fn game_over(&self, id: NodeId) -> bool {
        let node = self.node(id);
        node.mv == Coord::RESIGN
            || (node.mv == Coord::PASS
                && node
                    .parent
                    .is_some_and(|p| self.node(p).mv == Coord::PASS))
    }

    pub fn at_move_limit(&self, id: NodeId) -> bool {
        self.node(id).position.n() >= MAX_SEARCH_DEPTH
    }

    pub fn is_game_over(&self) -> bool {
        self.game_over(self.root)
    }

    pub fn to_play(&self) -> Color {
        self.node(self.root).position.to_play()
    }

    pub fn is_legal_move(&self, c: Coord) -> bool {
        self.node(self.root).position.legal_move(c)
    }

    fn calculate_single_move_child_action_score(
        &self,
        id: NodeId,
        to_play: f32,
        u_common: f32,
        i: usize,
    ) -> f32 {
        let node = self.node(id);
        let e = &node.edges[i];
        let q = e.w / (1.0 + e.n as f32);
        let u = u_common * e.p / (1.0 + e.n as f32);
        q * to_play + u - 1000.0 * (!node.position.legal_move(Coord::from_index(i))) as i32 as f32
    }

    /// PUCT action scores for every child move of `id`.
    pub fn calculate_child_action_score(&self, id: NodeId, result: &mut [f32; NUM_MOVES]) {
        let to_play = self.node(id).position.to_play().sign();
        let u_common = self.u_scale(id) * (self.n(id) as f32 - 1.0).max(1.0).sqrt();
        for i in 0..NUM_MOVES {
            result[i] = self.calculate_single_move_child_action_score(id, to_play, u_common, i);
        }
    }

    /// Walks from the current root to the first unexpanded node, creating
    /// children on demand, and returns it. With batched inference it can
    /// return a node that is already awaiting evaluation; virtual losses
    /// steer subsequent selections away from it.
    pub fn select_leaf(&mut self, allow_pass: bool) -> NodeId {
        let mut id = self.root;
        let mut scores = [0.0f32; NUM_MOVES];
        loop {
            // A node that has never been evaluated gives no basis to select
            // a child.
            if !self.node(id).is_expanded {
                return id;
            }

            self.calculate_child_action_score(id, &mut scores);
            if !allow_pass {
                scores[Coord::PASS.index()] = -100000.0;
            }

            let mut best = Coord::from_index(algorithm::argmax_unrolled(&scores));
            if !self.node(id).position.legal_move(best) {
                best = Coord::PASS;
            }
            id = self.maybe_add_child(id, best);
        }
    }

    /// Returns the child of `id` for move `c`, creating it if necessary.
    pub fn maybe_add_child(&mut self, id: NodeId, c: Coord) -> NodeId {
        if let Some(&child) = self.node(id).children.get(&c) {
            return child;
        }

        let mut position = self.node(id).position.clone();
        {
            let history = AncestorHistory {
                tree: self,
                node: Some(id),
            };
            position.play_move(c, None, Some(&history));
        }

        let canonical_symmetry = self
            .node(id)
            .canonical_symmetry
            .or_else(|| calculate_canonical_symmetry(&position));

        // Install an ancestor-hash cache at regular depths so the superko
        // walk stays short.
        let superko_cache = if position.n() % SUPERKO_CACHE_STRIDE == 0 {
            let mut cache = HashSet::with_capacity(position.n() + 1);
            cache.insert(position.stone_hash());
            let mut cur = Some(id);
            while let Some(a) = cur {
                let node = self.node(a);
                if let Some(ancestor_cache) = &node.superko_cache {
                    cache.extend(ancestor_cache.iter().copied());
                    break;
                }
                cache.insert(node.position.stone_hash());
                cur = node.parent;
            }
            Some(cache)
        } else {
            None
        };

        let node = MctsNode {
            parent: Some(id),
            mv: c,
            edges: new_edges(),
            children: HashMap::new(),
            is_expanded: false,
            canonical_symmetry,
            num_virtual_losses: 0,
            superko_cache,
            position,
        };
        let child = self.alloc(node);
        self.node_mut(id).children.insert(c, child);
        child
    }

    fn alloc(&mut self, node: MctsNode) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            (self.nodes.len() - 1) as NodeId
        }
    }

    fn free_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let node = self.nodes[n as usize].take().expect("freed node");
            stack.extend(node.children.values().copied());
            self.free.push(n);
        }
    }

    /// Sets the leaf's priors from a model output and backs its value up the
    /// tree. Priors over illegal moves are zeroed and the rest renormalized.
    /// A leaf that is already expanded (selected twice into one batch) is
    /// left untouched.
    pub fn incorporate_results(&mut self, leaf: NodeId, move_probabilities: &[f32], value: f32) {
        debug_assert_eq!(move_probabilities.len(), NUM_MOVES);
        // A finished game must not go through this code path; it reports its
        // result through incorporate_end_game_result instead.
        debug_assert!(!self.game_over(leaf));

        if self.node(leaf).is_expanded {
            return;
        }

        let mut policy_scalar = 0.0;
        for i in 0..NUM_MOVES {
            if self.node(leaf).position.legal_move(Coord::from_index(i)) {
                policy_scalar += move_probabilities[i];
            }
        }
        if policy_scalar > f32::MIN_POSITIVE {
            policy_scalar = 1.0 / policy_scalar;
        }

        // New edges start from the leaf value minus a penalty in the mover's
        // favor, clamped to the value range. 0 is init-to-parent, 2 is
        // init-to-loss.
        let reduction =
            self.options.value_init_penalty * self.node(leaf).position.to_play().sign();
        let reduced_value = (value - reduction).clamp(-1.0, 1.0);

        {
            let node = self.node_mut(leaf);
            node.is_expanded = true;
        }
        for i in 0..NUM_MOVES {
            let legal = self.node(leaf).position.legal_move(Coord::from_index(i));
            let move_prob = if legal {
                policy_scalar * move_probabilities[i]
            } else {
                0.0
            };
            let e = &mut self.node_mut(leaf).edges[i];
            e.p = move_prob;
            e.original_p = move_prob;
            e.w += reduced_value;
        }
        self.backup_value(leaf, value);
    }

    /// Backs up the final result of a game-over leaf. No priors are set.
    pub fn incorporate_end_game_result(&mut self, leaf: NodeId, value: f32) {
        debug_assert!(self.game_over(leaf) || self.at_move_limit(leaf));
        debug_assert!(!self.node(leaf).is_expanded);
        self.backup_value(leaf, value);
    }

    /// Adds `value` to `W` and 1 to `N` for every edge from `leaf` up to the
    /// current root. There is no sign flip: `Q` carries the Black-perspective
    /// value throughout the tree.
    pub fn backup_value(&mut self, leaf: NodeId, value: f32) {
        let mut id = leaf;
        loop {
            let s = self.stats_mut(id);
            s.w += value;
            s.n += 1;
            if id == self.root {
                return;
            }
            id = self.node(id).parent.expect("leaf not under root");
        }
    }

    /// Applies a virtual loss to every node from `leaf` up to the root so
    /// parallel leaf selections diverge.
    pub fn add_virtual_loss(&mut self, leaf: NodeId) {
        let mut id = leaf;
        loop {
            self.node_mut(id).num_virtual_losses += 1;
            let sign = self.node(id).position.to_play().sign();
            self.stats_mut(id).w += sign;
            if id == self.root {
                return;
            }
            id = self.node(id).parent.expect("leaf not under root");
        }
    }

    /// Exactly cancels a matching [`MctsTree::add_virtual_loss`].
    pub fn revert_virtual_loss(&mut self, leaf: NodeId) {
        let mut id = leaf;
        loop {
            self.node_mut(id).num_virtual_losses -= 1;
            let sign = self.node(id).position.to_play().sign();
            self.stats_mut(id).w -= sign;
            if id == self.root {
                return;
            }
            id = self.node(id).parent.expect("leaf not under root");
        }
    }

    /// Mixes noise into the root's priors: `P = (1-mix)*P + mix*noise`.
    /// Noise over illegal moves is zeroed and renormalized first.
    pub fn inject_noise(&mut self, noise: &[f32], mix: f32) {
        debug_assert_eq!(noise.len(), NUM_MOVES);
        assert!(self.node(self.root).is_expanded);

        let root = self.root;
        let mut scalar = 0.0;
        for i in 0..NUM_MOVES {
            if self.node(root).position.legal_move(Coord::from_index(i)) {
                scalar += noise[i];
            }
        }
        if scalar > f32::MIN_POSITIVE {
            scalar = 1.0 / scalar;
        }

        for i in 0..NUM_MOVES {
            let legal = self.node(root).position.legal_move(Coord::from_index(i));
            let scaled_noise = scalar * if legal { noise[i] } else { 0.0 };
            let e = &mut self.node_mut(root).edges[i];
            e.p = (1.0 - mix) * e.p + mix * scaled_noise;
        }
    }

    /// Finds the best move by visit count; ties break by child action score.
    /// With `restrict_pass_alive`, points inside either side's pass-alive
    /// regions are excluded (pass itself is always allowed).
    pub fn get_most_visited_move(&self, restrict_pass_alive: bool) -> Coord {
        let root = self.root;
        let out_of_bounds = if restrict_pass_alive {
            self.node(root).position.calculate_pass_alive_regions()
        } else {
            [Color::Empty; NUM_POINTS]
        };

        let mut moves: Vec<usize> = Vec::new();
        let mut best_n = 0;
        for i in 0..NUM_MOVES {
            if i != Coord::PASS.index() && out_of_bounds[i] != Color::Empty {
                continue;
            }
            let cn = self.child_n(root, i);
            if cn >= best_n {
                if cn > best_n {
                    moves.clear();
                    best_n = cn;
                }
                moves.push(i);
            }
        }

        if moves.is_empty() {
            return Coord::PASS;
        }
        if moves.len() == 1 {
            return Coord::from_index(moves[0]);
        }

        let to_play = self.node(root).position.to_play().sign();
        let u_common = self.u_scale(root) * (1.0 + self.n(root) as f32).sqrt();
        let mut best = moves[0];
        let mut best_cas =
            self.calculate_single_move_child_action_score(root, to_play, u_common, best);
        for &i in &moves {
            let cas = self.calculate_single_move_child_action_score(root, to_play, u_common, i);
            if cas > best_cas {
                best_cas = cas;
                best = i;
            }
        }
        Coord::from_index(best)
    }

    /// Chooses the move to play: sampled proportionally to visit counts
    /// early in the game, most-visited afterwards.
    pub fn pick_move<R: Rng>(&self, rnd: &mut R, restrict_pass_alive: bool) -> Coord {
        if self.options.soft_pick_enabled
            && self.node(self.root).position.n() < self.options.soft_pick_cutoff
        {
            self.soft_pick_move(rnd)
        } else {
            let c = self.get_most_visited_move(restrict_pass_alive);
            if !self.node(self.root).position.legal_move(c) {
                Coord::PASS
            } else {
                c
            }
        }
    }

    // Soft picks are only used for the opening moves of the game, so no
    // pass-alive restriction applies here. Board points only: passing is
    // never sampled.
    fn soft_pick_move<R: Rng>(&self, rnd: &mut R) -> Coord {
        let root = self.root;
        let mut cdf = [0.0f32; NUM_POINTS];
        for i in 0..NUM_POINTS {
            cdf[i] = (self.child_n(root, i) as f32).powf(self.options.policy_softmax_temp);
        }
        for i in 1..NUM_POINTS {
            cdf[i] += cdf[i - 1];
        }
        let total = cdf[NUM_POINTS - 1];
        if total == 0.0 {
            // An early model can put all its reads into pass; let it pass.
            return Coord::PASS;
        }

        let target = rnd.random::<f32>() * total;
        let mut i = 0;
        while i + 1 < NUM_POINTS && cdf[i] <= target {
            i += 1;
        }
        debug_assert!(self.child_n(root, i) > 0);
        Coord::from_index(i)
    }

    /// Reduces the visit counts of non-best moves to the smallest value that
    /// keeps their action score at or below the best move's, so that the
    /// emitted visit distribution reflects the post-search understanding of
    /// each move's regret. Optionally zeroes visits in pass-alive regions.
    pub fn reshape_final_visits(&mut self, restrict_pass_alive: bool) {
        let root = self.root;
        // Reads of pass-alive moves aren't disallowed, only their selection,
        // so take the most visited move regardless of pass-alive status and
        // reshape against its action score.
        let best = self.get_most_visited_move(false);
        assert!(self.node(root).edges[best.index()].n > 0);

        let pass_alive_regions = self.node(root).position.calculate_pass_alive_regions();
        let to_play = self.node(root).position.to_play().sign();
        let u_common = self.u_scale(root) * (1.0 + self.n(root) as f32).sqrt();
        let best_cas =
            self.calculate_single_move_child_action_score(root, to_play, u_common, best.index());

        let u_scale = self.u_scale(root);
        let sqrt_n = (self.n(root) as f32).sqrt();

        let mut any = false;
        for i in 0..NUM_MOVES {
            if restrict_pass_alive
                && i != Coord::PASS.index()
                && pass_alive_regions[i] != Color::Empty
            {
                self.node_mut(root).edges[i].n = 0;
                continue;
            }

            // The best move already has the highest action score.
            if i == best.index() {
                any |= self.node(root).edges[i].n > 0;
                continue;
            }

            // Solve best_cas >= Q + U_scale * P * sqrt(N_parent) / N_child
            // for N_child. The denominator can be tiny when the child's Q
            // approaches the best action score, producing spurious values;
            // clamping to [0, N_child] keeps the result sane.
            let child_q = self.child_q(root, i);
            let child_p = self.child_p(root, i);
            let child_n = self.child_n(root, i);
            let new_n = (-1.0 * (u_scale * child_p * sqrt_n) / (child_q * to_play - best_cas))
                as i32;
            let new_n = new_n.clamp(0, child_n);
            self.node_mut(root).edges[i].n = new_n;
            any |= new_n > 0;
        }

        // If every visit was in a pass-alive region, put one on pass.
        if !any {
            self.node_mut(root).edges[Coord::PASS.index()].n = 1;
        }
    }

    /// The trainable search target: normalized visit counts, squashed by the
    /// softmax temperature during the soft-pick phase.
    pub fn calculate_search_pi(&self) -> Vec<f32> {
        let root = self.root;
        let mut pi = vec![0.0f32; NUM_MOVES];
        let soft = self.options.soft_pick_enabled
            && self.node(root).position.n() < self.options.soft_pick_cutoff;
        for i in 0..NUM_MOVES {
            let n = self.child_n(root, i) as f32;
            pi[i] = if soft {
                n.powf(self.options.policy_softmax_temp)
            } else {
                n
            };
        }
        let sum: f32 = pi.iter().sum();
        assert!(sum > 0.0, "no visits to build a search pi from");
        for v in &mut pi {
            *v /= sum;
        }
        pi
    }

    /// Advances the root to the child of `c`, pruning all of its siblings.
    pub fn play_move(&mut self, c: Coord) {
        assert!(
            !self.is_game_over() && self.is_legal_move(c),
            "play_move({}) on a finished game or illegal move",
            c
        );
        let new_root = self.maybe_add_child(self.root, c);
        let old_root = self.root;
        // The old root's other children will never be revisited in normal
        // play; free them now.
        let siblings: Vec<NodeId> = self
            .node(old_root)
            .children
            .iter()
            .filter(|&(&mv, _)| mv != c)
            .map(|(_, &id)| id)
            .collect();
        for id in siblings {
            self.free_subtree(id);
        }
        self.node_mut(old_root).children.retain(|&mv, _| mv == c);
        self.root = new_root;
    }

    /// Drops all subtrees under the current root and resets its statistics.
    pub fn clear_subtrees(&mut self) {
        let root = self.root;
        let children: Vec<NodeId> = self.node(root).children.values().copied().collect();
        for id in children {
            self.free_subtree(id);
        }
        let node = self.node_mut(root);
        node.children.clear();
        node.edges = new_edges();
        node.is_expanded = false;
        *self.stats_mut(root) = EdgeStats::default();
    }

    /// Sorts child moves by visit count, breaking ties by prior then action
    /// score.
    pub fn calculate_ranked_child_info(&self) -> Vec<ChildInfo> {
        let root = self.root;
        let mut scores = [0.0f32; NUM_MOVES];
        self.calculate_child_action_score(root, &mut scores);
        let mut info: Vec<ChildInfo> = (0..NUM_MOVES)
            .map(|i| ChildInfo {
                c: Coord::from_index(i),
                n: self.child_n(root, i),
                p: self.child_p(root, i),
                action_score: scores[i],
            })
            .collect();
        info.sort_by(|a, b| {
            b.n.cmp(&a.n)
                .then(b.p.partial_cmp(&a.p).unwrap_or(std::cmp::Ordering::Equal))
                .then(
                    b.action_score
                        .partial_cmp(&a.action_score)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        info
    }

    /// A human-readable summary of the root for verbose logging.
    pub fn describe(&self) -> String {
        use std::fmt::Write;

        let root = self.root;
        let ranked = self.calculate_ranked_child_info();
        let mut out = format!(
            "Q: {:.4}\nmove : action    Q     U     P   P-Dir    N",
            self.q(root)
        );
        let child_n_sum: f32 = (0..NUM_MOVES).map(|i| self.child_n(root, i) as f32).sum();
        for info in ranked.iter().take(10) {
            if info.n == 0 && child_n_sum > 0.0 {
                break;
            }
            let i = info.c.index();
            write!(
                out,
                "\n{:<5}: {:6.3} {:6.3} {:5.3} {:5.3} {:5.3} {:5}",
                info.c.to_gtp(),
                info.action_score,
                self.child_q(root, i),
                self.child_u(root, i),
                self.child_p(root, i),
                self.child_original_p(root, i),
                info.n,
            )
            .unwrap();
        }
        out
    }

    /// Total number of live nodes, for tests and diagnostics.
    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_KOMI;

    fn uniform_probs() -> Vec<f32> {
        vec![1.0 / NUM_MOVES as f32; NUM_MOVES]
    }

    fn new_tree() -> MctsTree {
        MctsTree::new(Position::new(Color::Black), TreeOptions::default())
    }

    #[test]
    fn test_select_leaf_returns_unexpanded_root() {
        let mut tree = new_tree();
        let leaf = tree.select_leaf(true);
        assert_eq!(leaf, tree.root());
        assert!(!tree.is_expanded(leaf));
    }

    #[test]
    fn test_incorporate_results_expands_and_backs_up() {
        let mut tree = new_tree();
        let leaf = tree.select_leaf(true);
        tree.incorporate_results(leaf, &uniform_probs(), 0.5);
        assert!(tree.is_expanded(leaf));
        assert_eq!(tree.n(tree.root()), 1);
        assert!((tree.q(tree.root()) - 0.25).abs() < 1e-6);

        // Priors are normalized over legal moves.
        let sum: f32 = (0..NUM_MOVES).map(|i| tree.child_p(tree.root(), i)).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_second_incorporate_is_ignored() {
        let mut tree = new_tree();
        let leaf = tree.select_leaf(true);
        tree.incorporate_results(leaf, &uniform_probs(), 0.1);
        let q_before = tree.child_q(tree.root(), 2);
        tree.incorporate_results(leaf, &uniform_probs(), 0.9);
        assert_eq!(tree.child_q(tree.root(), 2), q_before);
    }

    #[test]
    fn test_backup_accumulates_along_path() {
        // Init-to-parent so the child Q arithmetic below stays exact.
        let options = TreeOptions {
            value_init_penalty: 0.0,
            ..TreeOptions::default()
        };
        let mut tree = MctsTree::new(Position::new(Color::Black), options);
        tree.incorporate_results(tree.root(), &uniform_probs(), 0.0);

        let leaf = tree.select_leaf(true);
        assert_ne!(leaf, tree.root());
        assert_eq!(tree.parent(leaf), Some(tree.root()));
        tree.incorporate_results(leaf, &uniform_probs(), -1.0);

        assert_eq!(tree.n(tree.root()), 2);
        // Average of 0, 0, -1.
        assert!((tree.q(tree.root()) + 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(tree.n(leaf), 1);
        assert!((tree.q(leaf) + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_visit_counts_monotonic() {
        let mut tree = new_tree();
        tree.incorporate_results(tree.root(), &uniform_probs(), 0.0);
        let mut prev = vec![0i32; NUM_MOVES];
        for k in 0..20 {
            let leaf = tree.select_leaf(true);
            if tree.game_over(leaf) {
                tree.incorporate_end_game_result(leaf, 1.0);
            } else {
                tree.incorporate_results(leaf, &uniform_probs(), 0.1);
            }
            let mut total = 0;
            for i in 0..NUM_MOVES {
                let n = tree.child_n(tree.root(), i);
                assert!(n >= prev[i], "visit count decreased");
                prev[i] = n;
                total += n;
            }
            assert_eq!(total, k + 1);
        }
    }

    #[test]
    fn test_virtual_loss_balance() {
        let mut tree = new_tree();
        tree.incorporate_results(tree.root(), &uniform_probs(), 0.0);

        let leaf1 = tree.select_leaf(true);
        let w_before_root = tree.w(tree.root());
        let w_before_leaf = tree.w(leaf1);

        tree.add_virtual_loss(leaf1);
        let leaf2 = tree.select_leaf(true);
        // Virtual loss steers the second selection elsewhere.
        assert_ne!(leaf1, leaf2);
        tree.add_virtual_loss(leaf2);

        tree.revert_virtual_loss(leaf1);
        tree.revert_virtual_loss(leaf2);

        assert_eq!(tree.num_virtual_losses(tree.root()), 0);
        assert_eq!(tree.num_virtual_losses(leaf1), 0);
        assert_eq!(tree.num_virtual_losses(leaf2), 0);
        assert_eq!(tree.w(tree.root()), w_before_root);
        assert_eq!(tree.w(leaf1), w_before_leaf);
    }

    #[test]
    fn test_inject_noise_keeps_priors_normalized() {
        let mut tree = new_tree();
        tree.incorporate_results(tree.root(), &uniform_probs(), 0.0);

        let p_before = tree.child_p(tree.root(), 17);
        let mut noise = vec![0.0f32; NUM_MOVES];
        // Lopsided noise, deliberately unnormalized.
        for (i, v) in noise.iter_mut().enumerate() {
            *v = (i % 7) as f32 + 0.1;
        }
        tree.inject_noise(&noise, 0.25);

        let sum: f32 = (0..NUM_MOVES).map(|i| tree.child_p(tree.root(), i)).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_ne!(tree.child_p(tree.root(), 17), p_before);
        // original_P is untouched.
        assert!((tree.child_original_p(tree.root(), 17) - 1.0 / NUM_MOVES as f32).abs() < 1e-6);
    }

    #[test]
    fn test_inject_noise_zero_mix_is_identity() {
        let mut tree = new_tree();
        tree.incorporate_results(tree.root(), &uniform_probs(), 0.0);
        let before: Vec<f32> = (0..NUM_MOVES).map(|i| tree.child_p(tree.root(), i)).collect();
        tree.inject_noise(&uniform_probs(), 0.0);
        let after: Vec<f32> = (0..NUM_MOVES).map(|i| tree.child_p(tree.root(), i)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_play_move_prunes_siblings() {
        let mut tree = new_tree();
        tree.incorporate_results(tree.root(), &uniform_probs(), 0.0);
        for _ in 0..30 {
            let leaf = tree.select_leaf(true);
            if !tree.game_over(leaf) {
                tree.incorporate_results(leaf, &uniform_probs(), 0.0);
            }
        }
        let nodes_before = tree.num_nodes();
        assert!(nodes_before > 2);

        let c = tree.get_most_visited_move(false);
        tree.play_move(c);
        assert_eq!(tree.position(tree.root()).n(), 1);
        // Only the path root -> new root plus the new root's subtree remain.
        assert!(tree.num_nodes() < nodes_before);
    }

    #[test]
    fn test_action_flipping() {
        // No matter who is to play, with identical priors and no value
        // signal, the same move is picked.
        let mut probs = uniform_probs();
        for (i, p) in probs.iter_mut().enumerate() {
            *p += (i % 13) as f32 * 1e-4;
        }

        let mut black = MctsTree::new(Position::new(Color::Black), TreeOptions::default());
        let mut white = MctsTree::new(Position::new(Color::White), TreeOptions::default());
        let b_leaf = black.select_leaf(true);
        black.incorporate_results(b_leaf, &probs, 0.0);
        let w_leaf = white.select_leaf(true);
        white.incorporate_results(w_leaf, &probs, 0.0);

        let b_next = black.select_leaf(true);
        let w_next = white.select_leaf(true);
        assert_eq!(black.leaf_move(b_next), white.leaf_move(w_next));
    }

    #[test]
    fn test_value_init_penalty_to_loss() {
        let mut options = TreeOptions::default();
        options.value_init_penalty = 2.0;
        let mut tree = MctsTree::new(Position::new(Color::Black), options);
        tree.incorporate_results(tree.root(), &uniform_probs(), 0.1);
        let leaf = tree.select_leaf(true);
        // Black to play at root: children are initialized to a loss for
        // Black.
        assert!((tree.q(leaf) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_value_init_penalty_to_parent() {
        let mut options = TreeOptions::default();
        options.value_init_penalty = 0.0;
        let mut tree = MctsTree::new(Position::new(Color::Black), options);
        tree.incorporate_results(tree.root(), &uniform_probs(), 0.1);
        let leaf = tree.select_leaf(true);
        assert!((tree.q(leaf) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_search_pi_normalized() {
        let mut tree = new_tree();
        tree.incorporate_results(tree.root(), &uniform_probs(), 0.0);
        for _ in 0..10 {
            let leaf = tree.select_leaf(true);
            if !tree.game_over(leaf) {
                tree.incorporate_results(leaf, &uniform_probs(), 0.2);
            }
        }
        let pi = tree.calculate_search_pi();
        let sum: f32 = pi.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    #[cfg(feature = "board9x9")]
    fn test_superko() {
        // Moves at the top edge of the board that don't interfere with the
        // kos at the bottom.
        let non_ko_moves = [
            "A9", "B9", "C9", "D9", "E9", "F9", "G9", "H9", "J9", "A8", "B8", "C8", "D8", "E8",
            "F8", "G8", "H8", "J8",
        ];

        let ko_moves = [
            // Create two ko threats on the bottom edge of the board:
            // .........
            // .XO...OX.
            // X.XO.O.OX
            "A1", "F1", "B2", "G2", "C1", "H1", "J1", "D1", "H2", "C2",
            // Capture one ko.
            "G1", "B1", "pass", "H1",
        ];

        // Superko detection inserts hash caches into the tree at regularly
        // spaced depths; nodes without one fall back to a linear walk up the
        // tree. Running the sequence at every starting depth exercises both
        // the linear-scan and cache-lookup paths.
        for prefix_len in 0..non_ko_moves.len() {
            let mut tree = MctsTree::new(Position::new(Color::Black), TreeOptions::default());
            for mv in &non_ko_moves[..prefix_len] {
                tree.play_move(Coord::from_gtp(mv).unwrap());
            }
            for mv in &ko_moves {
                tree.play_move(Coord::from_gtp(mv).unwrap());
            }

            // Ignoring superko, capturing the second ko at C1 looks valid...
            let c1 = Coord::from_gtp("C1").unwrap();
            assert_eq!(
                tree.position(tree.root()).classify_move(c1),
                crate::position::MoveType::Capture
            );
            // ...but it repeats the position before the first ko was taken.
            assert!(!tree.is_legal_move(c1), "prefix_len = {}", prefix_len);

            // Every move that was legal ignoring superko stays legal.
            for i in 0..NUM_MOVES {
                let c = Coord::from_index(i);
                if c == c1 {
                    continue;
                }
                use crate::position::MoveType;
                let basic = tree.position(tree.root()).classify_move(c) != MoveType::Illegal;
                assert_eq!(tree.is_legal_move(c), basic, "move {}", c);
            }
        }
    }

    #[test]
    fn test_scoring_through_tree() {
        let tree = new_tree();
        assert_eq!(
            tree.position(tree.root()).calculate_score(DEFAULT_KOMI),
            -DEFAULT_KOMI
        );
    }
}
