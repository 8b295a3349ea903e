//! Per-game self-play driver.
//!
//! A [`SelfplayGame`] holds the state for one game: an [`MctsTree`], the
//! [`Game`] record and the per-game search options. Its owner calls
//! [`SelfplayGame::select_leaves`], [`SelfplayGame::process_inferences`] and
//! [`SelfplayGame::maybe_play_move`] sequentially each tick; the tree is
//! never mutated concurrently.

use std::time::{Duration, Instant};

use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma};

use crate::cache::{CacheKey, InferenceCache};
use crate::color::Color;
use crate::constants::{DIRICHLET_ALPHA, MIN_PASS_ALIVE_MOVES, NUM_MOVES};
use crate::coord::Coord;
use crate::game::Game;
use crate::mcts::{MctsTree, NodeId};
use crate::model::{MAX_POSITION_HISTORY, ModelInput, ModelOutput};
use crate::symmetry::{NUM_SYMMETRIES, Symmetry};

/// Per-game search options.
#[derive(Clone, Debug)]
pub struct SelfplayGameOptions {
    /// Number of leaves selected (with virtual losses applied) per tick.
    pub num_virtual_losses: usize,
    /// Number of positions to read for a normal move.
    pub num_readouts: usize,
    /// Number of positions to read when playout cap oscillation picks a
    /// "fast" move.
    pub fastplay_readouts: usize,
    /// Fraction of moves that should be fast plays.
    pub fastplay_frequency: f32,
    /// Alpha for the Dirichlet noise injected at the root.
    pub dirichlet_alpha: f32,
    /// Fraction of noise mixed into the root priors. Noise is not injected
    /// for fast plays.
    pub noise_mix: f32,
    /// Route this game's examples to the holdout set.
    pub is_holdout: bool,
    /// Subtract visits from non-best moves before emitting training targets.
    pub target_pruning: bool,
    /// Verbose logging, usually only the first game of the first thread.
    pub verbose: bool,
    /// If false, pass is only read and played when there is no legal
    /// alternative.
    pub allow_pass: bool,
    /// Disallow playing in pass-alive territory once the opponent has
    /// passed this many times in a row.
    pub restrict_pass_alive_play_threshold: i32,
}

impl Default for SelfplayGameOptions {
    fn default() -> SelfplayGameOptions {
        SelfplayGameOptions {
            num_virtual_losses: 8,
            num_readouts: 104,
            fastplay_readouts: 20,
            fastplay_frequency: 0.0,
            dirichlet_alpha: DIRICHLET_ALPHA,
            noise_mix: 0.25,
            is_holdout: false,
            target_pruning: false,
            verbose: false,
            allow_pass: true,
            restrict_pass_alive_play_threshold: 4,
        }
    }
}

/// Everything required to run a single inference and route its result back.
pub struct Inference {
    /// Key under which the result is merged into the cache; `None` when the
    /// position has no unique canonical symmetry and caching is skipped.
    pub cache_key: Option<CacheKey>,
    pub canonical_sym: Option<Symmetry>,
    /// Symmetry the model input was encoded under.
    pub sym: Symmetry,
    pub leaf: NodeId,
    pub input: ModelInput,
    pub output: ModelOutput,
}

/// Counters reported by [`SelfplayGame::select_leaves`].
#[derive(Copy, Clone, Default, Debug)]
pub struct SelectLeavesStats {
    pub num_leaves_queued: usize,
    pub num_nodes_selected: usize,
    pub num_cache_hits: usize,
    pub num_game_over_leaves: usize,
}

impl std::ops::AddAssign for SelectLeavesStats {
    fn add_assign(&mut self, other: SelectLeavesStats) {
        self.num_leaves_queued += other.num_leaves_queued;
        self.num_nodes_selected += other.num_nodes_selected;
        self.num_cache_hits += other.num_cache_hits;
        self.num_game_over_leaves += other.num_game_over_leaves;
    }
}

fn mix_bits(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

const LARGE_PRIME: u64 = 6364136223846793005;

/// Holds all the state for a single self-play game.
pub struct SelfplayGame {
    game_id: usize,
    options: SelfplayGameOptions,
    target_readouts: usize,
    game: Game,
    tree: MctsTree,
    start_time: Instant,
    duration: Duration,
    models_used: Vec<String>,
    rnd: SmallRng,
    /// Mixed with each position's stone hash to pick a per-position random
    /// inference symmetry that is stable within this game.
    inference_symmetry_mix: u64,
    /// Noise can only be injected once the root is expanded, so the first
    /// read of a move sets this and the next `select_leaves` call injects.
    inject_noise_before_next_read: bool,
    /// Fast play is never used for the opening move: it relies on tree
    /// reuse and the tree is empty at the start of the game.
    fastplay: bool,
    /// Consecutive passes by (Black, White). Latches at the restriction
    /// threshold and is never reset afterwards.
    num_consecutive_passes: [i32; 2],
}

impl SelfplayGame {
    pub fn new(
        game_id: usize,
        options: SelfplayGameOptions,
        game: Game,
        tree: MctsTree,
        seed: u64,
    ) -> SelfplayGame {
        let mut rnd = SmallRng::seed_from_u64(seed);
        let inference_symmetry_mix = rnd.random();
        let target_readouts = options.num_readouts;
        SelfplayGame {
            game_id,
            options,
            target_readouts,
            game,
            tree,
            start_time: Instant::now(),
            duration: Duration::ZERO,
            models_used: Vec::new(),
            rnd,
            inference_symmetry_mix,
            inject_noise_before_next_read: false,
            fastplay: false,
            num_consecutive_passes: [0, 0],
        }
    }

    pub fn game_id(&self) -> usize {
        self.game_id
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut Game {
        &mut self.game
    }

    pub fn tree(&self) -> &MctsTree {
        &self.tree
    }

    pub fn options(&self) -> &SelfplayGameOptions {
        &self.options
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Names of the models used for inference, in first-use order.
    pub fn models_used(&self) -> &[String] {
        &self.models_used
    }

    /// Selects up to `num_virtual_losses` leaves to run inference on,
    /// appending an [`Inference`] record per cache miss. Game-over leaves
    /// have their Tromp-Taylor result backed up directly; cache hits are
    /// incorporated immediately. Returns counters for diagnostics.
    pub fn select_leaves(
        &mut self,
        cache: &dyn InferenceCache,
        inferences: &mut Vec<Inference>,
    ) -> SelectLeavesStats {
        // Noise can only be injected once the root has been expanded by a
        // first evaluation.
        if self.inject_noise_before_next_read && self.tree.is_expanded(self.tree.root()) {
            self.inject_noise_before_next_read = false;
            self.inject_noise();
        }

        let root = self.tree.root();
        let root_n = self.tree.position(root).n();
        let mut stats = SelectLeavesStats::default();
        loop {
            let leaf = self.tree.select_leaf(self.options.allow_pass);
            stats.num_nodes_selected += self.tree.position(leaf).n() - root_n;

            if self.tree.game_over(leaf) || self.tree.at_move_limit(leaf) {
                let score = self
                    .tree
                    .position(leaf)
                    .calculate_score(self.game.options().komi);
                let value = if score > 0.0 { 1.0 } else { -1.0 };
                self.tree.incorporate_end_game_result(leaf, value);
                stats.num_game_over_leaves += 1;
            } else {
                if self.maybe_queue_inference(leaf, cache, inferences) {
                    stats.num_leaves_queued += 1;
                } else {
                    stats.num_cache_hits += 1;
                }
                if leaf == root {
                    if !self.fastplay {
                        self.inject_noise_before_next_read = true;
                    }
                    break;
                }
            }

            if stats.num_leaves_queued >= self.options.num_virtual_losses
                || self.tree.n(self.tree.root()) as usize >= self.target_readouts
            {
                break;
            }
        }
        stats
    }

    /// Incorporates evaluated inferences and releases their virtual losses.
    pub fn process_inferences(&mut self, model_name: &str, inferences: &[Inference]) {
        if !model_name.is_empty()
            && self.models_used.last().map(String::as_str) != Some(model_name)
        {
            self.models_used.push(model_name.to_string());
        }

        for inference in inferences {
            self.tree
                .incorporate_results(inference.leaf, &inference.output.policy, inference.output.value);
            self.tree.revert_virtual_loss(inference.leaf);
        }
    }

    /// Plays a move if the tree has performed enough reads, returning false
    /// when more positions must be read first.
    pub fn maybe_play_move(&mut self) -> bool {
        if (self.tree.n(self.tree.root()) as usize) < self.target_readouts {
            return false;
        }

        if self.should_resign() {
            self.game
                .set_game_over_because_of_resign(self.tree.to_play().other());
        } else {
            // Restrict playing in pass-alive territory once the opponent
            // has passed enough times in a row.
            let opponent_idx = if self.tree.to_play() == Color::Black {
                1
            } else {
                0
            };
            let restrict_pass_alive = self.num_consecutive_passes[opponent_idx]
                >= self.options.restrict_pass_alive_play_threshold;

            let c = self.tree.pick_move(&mut self.rnd, restrict_pass_alive);

            if self.options.verbose {
                let position = self.tree.position(self.tree.root());
                info!("\n{}", position.to_pretty_string(false));
                info!(
                    "move: {} captures X: {} O: {}",
                    position.n(),
                    position.num_captures()[0],
                    position.num_captures()[1]
                );
                if !self.fastplay {
                    info!("{}", self.tree.describe());
                }
                info!("played >> {} [{}]", self.tree.to_play(), c);
            }

            let model_str = match self.models_used.last() {
                Some(model) => format!("model: {}\n", model),
                None => String::new(),
            };

            // Prune the emitted visit targets; the move itself was already
            // picked from the raw counts.
            if self.options.target_pruning && !self.fastplay {
                self.tree.reshape_final_visits(restrict_pass_alive);
            }

            let to_play = self.tree.to_play();
            let root = self.tree.root();
            if !self.fastplay && c != Coord::RESIGN {
                let search_pi = self.tree.calculate_search_pi();
                let stones = *self.tree.position(root).stones();
                self.game.add_trainable_move(
                    to_play,
                    c,
                    &stones,
                    model_str,
                    self.tree.q(root),
                    self.tree.n(root),
                    search_pi,
                );
            } else {
                let stones = *self.tree.position(root).stones();
                self.game.add_non_trainable_move(
                    to_play,
                    c,
                    &stones,
                    model_str,
                    self.tree.q(root),
                    self.tree.n(root),
                );
            }

            // Update the consecutive pass counts; they latch once the
            // restriction threshold is hit.
            let mover_idx = if to_play == Color::Black { 0 } else { 1 };
            if self.num_consecutive_passes[mover_idx]
                < self.options.restrict_pass_alive_play_threshold
            {
                if c == Coord::PASS {
                    self.num_consecutive_passes[mover_idx] += 1;
                } else {
                    self.num_consecutive_passes[mover_idx] = 0;
                }
            }

            self.tree.play_move(c);

            // If the whole board is pass-alive, the outcome can't change:
            // play passes until the game is over.
            if self.tree.position(self.tree.root()).n() >= MIN_PASS_ALIVE_MOVES
                && self
                    .tree
                    .position(self.tree.root())
                    .calculate_whole_board_pass_alive()
            {
                while !self.tree.is_game_over() {
                    self.tree.play_move(Coord::PASS);
                }
            }

            let komi = self.game.options().komi;
            if self.tree.is_game_over() {
                let score = self
                    .tree
                    .position(self.tree.root())
                    .calculate_score(komi);
                self.game.set_game_over_because_of_passes(score);
            } else if self.tree.at_move_limit(self.tree.root()) {
                let score = self
                    .tree
                    .position(self.tree.root())
                    .calculate_score(komi);
                self.game.set_game_over_because_move_limit_reached(score);
            }
        }

        if !self.game.game_over() {
            self.fastplay = self.should_fastplay();
            self.inject_noise_before_next_read = !self.fastplay;
            let num_readouts = if self.fastplay {
                self.options.fastplay_readouts
            } else {
                self.options.num_readouts
            };
            self.target_readouts = self.tree.n(self.tree.root()) as usize + num_readouts;
            if !self.fastplay && self.options.fastplay_frequency > 0.0 {
                // A full-readout move after a fast one starts from a clean
                // subtree so fast-play bias doesn't leak into its target.
                self.tree.clear_subtrees();
            }
        } else {
            self.duration = self.start_time.elapsed();
        }

        true
    }

    fn should_fastplay(&mut self) -> bool {
        self.options.fastplay_frequency > 0.0
            && self.rnd.random::<f32>() < self.options.fastplay_frequency
    }

    fn should_resign(&self) -> bool {
        self.game.options().resign_enabled
            && self.tree.q_perspective(self.tree.root()) < self.game.options().resign_threshold
    }

    fn inject_noise(&mut self) {
        // A symmetric Dirichlet sample is a normalized vector of Gamma
        // draws; the tree renormalizes over legal moves anyway, so the raw
        // Gamma draws are enough.
        let gamma = Gamma::<f32>::new(self.options.dirichlet_alpha, 1.0)
            .expect("invalid dirichlet_alpha");
        let mut noise = vec![0.0f32; NUM_MOVES];
        for v in &mut noise {
            *v = gamma.sample(&mut self.rnd);
        }
        self.tree.inject_noise(&noise, self.options.noise_mix);
    }

    /// The symmetry to run inference under for this node's position:
    /// deterministic for a (game, position) pair, uniform across games.
    fn inference_symmetry(&self, leaf: NodeId) -> Symmetry {
        let bits = mix_bits(
            self.tree
                .position(leaf)
                .stone_hash()
                .wrapping_mul(LARGE_PRIME)
                .wrapping_add(self.inference_symmetry_mix),
        );
        Symmetry::from_index((bits % NUM_SYMMETRIES as u64) as usize)
    }

    /// Looks the leaf up in the inference cache. On a hit the cached result
    /// is incorporated directly and no inference is queued; on a miss an
    /// [`Inference`] is appended and a virtual loss applied. Returns true if
    /// an inference was queued.
    fn maybe_queue_inference(
        &mut self,
        leaf: NodeId,
        cache: &dyn InferenceCache,
        inferences: &mut Vec<Inference>,
    ) -> bool {
        let inference_sym = self.inference_symmetry(leaf);
        let canonical_sym = self.tree.canonical_symmetry(leaf);
        let cache_key = canonical_sym
            .map(|sym| CacheKey::new(self.tree.leaf_move(leaf), sym, self.tree.position(leaf)));

        if let (Some(key), Some(sym)) = (cache_key, canonical_sym) {
            let mut cached = ModelOutput::default();
            if cache.try_get(key, sym, inference_sym, &mut cached) {
                self.tree
                    .incorporate_results(leaf, &cached.policy, cached.value);
                return false;
            }
        }

        let mut position_history = Vec::with_capacity(MAX_POSITION_HISTORY);
        let mut node = Some(leaf);
        while let Some(id) = node {
            if position_history.len() == MAX_POSITION_HISTORY {
                break;
            }
            position_history.push(self.tree.position(id).clone());
            node = self.tree.parent(id);
        }

        inferences.push(Inference {
            cache_key,
            canonical_sym,
            sym: inference_sym,
            leaf,
            input: ModelInput {
                sym: inference_sym,
                position_history,
            },
            output: ModelOutput::default(),
        });
        self.tree.add_virtual_loss(leaf);
        true
    }
}
