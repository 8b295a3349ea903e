//! Process-wide self-play orchestration.
//!
//! A [`Selfplayer`] owns the model pool, the shared inference cache, the
//! sharded search executor and the output queue. It starts
//! `selfplay_threads` [`SelfplayThread`]s, each of which plays up to
//! `concurrent_games_per_thread` games concurrently; finished games flow
//! through the output queue to [`OutputThread`]s.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{error, info};

use crate::cache::{
    BasicInferenceCache, InferenceCache, NullInferenceCache, ShardedInferenceCache,
};
use crate::color::Color;
use crate::constants::DIRICHLET_ALPHA;
use crate::executor::{PollThread, ShardedExecutor};
use crate::game::{Game, GameOptions, WinStats, format_win_stats_table};
use crate::mcts::{MctsTree, TreeOptions};
use crate::model::{InferenceBackend, ModelFactory};
use crate::output::{OutputOptions, OutputSink, OutputThread};
use crate::position::Position;
use crate::selfplay::{Inference, SelfplayGame, SelfplayGameOptions};
use crate::watcher::{DirectoryWatcher, ModelPathPattern};

/// Process-wide options, typically parsed from the command line.
#[derive(Clone, Debug)]
pub struct SelfplayOptions {
    /// Model path, or a pattern containing `%d` to follow new generations.
    pub model: String,
    pub cache_size_mb: usize,
    /// Number of ways to shard the inference cache. Clamped so it never
    /// exceeds the number of concurrent games.
    pub cache_shards: usize,
    pub num_readouts: usize,
    pub fastplay_frequency: f32,
    pub fastplay_readouts: usize,
    pub virtual_losses: usize,
    pub dirichlet_alpha: f32,
    pub noise_mix: f32,
    pub value_init_penalty: f32,
    pub target_pruning: bool,
    pub policy_softmax_temp: f32,
    pub allow_pass: bool,
    pub restrict_pass_alive_play_threshold: i32,
    pub selfplay_threads: usize,
    pub parallel_search: usize,
    pub parallel_inference: usize,
    pub concurrent_games_per_thread: usize,
    /// 0 picks a fresh seed per process.
    pub seed: u64,
    pub min_resign_threshold: f32,
    pub max_resign_threshold: f32,
    pub disable_resign_pct: f32,
    pub num_games: usize,
    pub run_forever: bool,
    /// If non-empty, a path polled periodically; its presence aborts the
    /// process.
    pub abort_file: String,
    pub holdout_pct: f32,
    pub output_dir: String,
    pub holdout_dir: String,
    pub sgf_dir: String,
    pub verbose: bool,
    pub output_threads: usize,
    pub komi: f32,
}

impl Default for SelfplayOptions {
    fn default() -> SelfplayOptions {
        SelfplayOptions {
            model: String::new(),
            cache_size_mb: 0,
            cache_shards: 8,
            num_readouts: 104,
            fastplay_frequency: 0.0,
            fastplay_readouts: 20,
            virtual_losses: 8,
            dirichlet_alpha: DIRICHLET_ALPHA,
            noise_mix: 0.25,
            value_init_penalty: 2.0,
            target_pruning: false,
            policy_softmax_temp: 0.98,
            allow_pass: true,
            restrict_pass_alive_play_threshold: 4,
            selfplay_threads: 3,
            parallel_search: 3,
            parallel_inference: 2,
            concurrent_games_per_thread: 1,
            seed: 0,
            min_resign_threshold: -1.0,
            max_resign_threshold: -0.8,
            disable_resign_pct: 0.1,
            num_games: 0,
            run_forever: false,
            abort_file: String::new(),
            holdout_pct: 0.03,
            output_dir: String::new(),
            holdout_dir: String::new(),
            sgf_dir: String::new(),
            verbose: true,
            output_threads: 1,
            komi: crate::constants::DEFAULT_KOMI,
        }
    }
}

struct PlayerState {
    num_games_remaining: usize,
    next_game_id: usize,
    latest_model_name: String,
    win_stats: WinStats,
}

/// The main application object for concurrent self-play.
pub struct Selfplayer {
    options: SelfplayOptions,
    state: Mutex<PlayerState>,
    executor: ShardedExecutor,
    cache: Arc<dyn InferenceCache>,
    factory: Box<dyn ModelFactory>,
    model_pool: (Sender<Box<dyn InferenceBackend>>, Receiver<Box<dyn InferenceBackend>>),
    output_queue: (
        Sender<Option<Box<SelfplayGame>>>,
        Receiver<Option<Box<SelfplayGame>>>,
    ),
}

impl Selfplayer {
    pub fn new(mut options: SelfplayOptions, factory: Box<dyn ModelFactory>) -> Result<Selfplayer> {
        // Conflicting or nonsensical configurations are fatal at startup.
        if options.run_forever {
            if options.num_games != 0 {
                bail!("num_games must not be set if run_forever is true");
            }
        } else if options.num_games == 0 {
            bail!("num_games must be set if run_forever is false");
        }
        if options.model.is_empty() {
            bail!("model must be set");
        }
        if options.min_resign_threshold >= 0.0 || options.max_resign_threshold >= 0.0 {
            bail!("resign thresholds must be negative");
        }
        if options.dirichlet_alpha <= 0.0 {
            bail!("dirichlet_alpha must be positive");
        }
        if !(0.0..=1.0).contains(&options.noise_mix) {
            bail!("noise_mix must be in [0, 1]");
        }
        if options.fastplay_frequency > 0.0 && options.fastplay_readouts == 0 {
            bail!("fastplay_readouts must be set when fastplay_frequency > 0");
        }
        if options.selfplay_threads == 0 || options.parallel_search == 0 {
            bail!("selfplay_threads and parallel_search must be positive");
        }

        // Clamp concurrent games so a single thread doesn't end up playing
        // considerably more games than the others.
        if !options.run_forever {
            let max_per_thread = options.num_games.div_ceil(options.selfplay_threads);
            options.concurrent_games_per_thread =
                options.concurrent_games_per_thread.min(max_per_thread);
        }

        let cache: Arc<dyn InferenceCache> = if options.cache_size_mb > 0 {
            let capacity = BasicInferenceCache::calculate_capacity(options.cache_size_mb);
            let parallel_games = options.selfplay_threads * options.concurrent_games_per_thread;
            let shards = options.cache_shards.clamp(1, parallel_games.max(1));
            info!(
                "will cache up to {} inferences, using roughly {}MB across {} shards",
                capacity, options.cache_size_mb, shards
            );
            Arc::new(ShardedInferenceCache::new(capacity, shards))
        } else {
            Arc::new(NullInferenceCache)
        };

        let executor = ShardedExecutor::new(options.parallel_search);
        Ok(Selfplayer {
            state: Mutex::new(PlayerState {
                num_games_remaining: options.num_games,
                next_game_id: 1,
                latest_model_name: String::new(),
                win_stats: WinStats::default(),
            }),
            executor,
            cache,
            factory,
            model_pool: unbounded(),
            output_queue: unbounded(),
            options,
        })
    }

    pub fn options(&self) -> &SelfplayOptions {
        &self.options
    }

    pub fn cache(&self) -> &dyn InferenceCache {
        &*self.cache
    }

    /// Plays all requested games to completion.
    pub fn run(self: Arc<Self>, example_sink: Option<Arc<dyn OutputSink>>) -> Result<()> {
        let start_time = Instant::now();

        // Watch for the abort file while running forever.
        let mut abort_watcher = if self.options.run_forever && !self.options.abort_file.is_empty()
        {
            let abort_file = self.options.abort_file.clone();
            let mut poller = PollThread::new("abort-watcher", Duration::from_secs(5), move || {
                if std::path::Path::new(&abort_file).exists() {
                    error!("aborting because {} was found", abort_file);
                    std::process::exit(1);
                }
            });
            poller.start();
            Some(poller)
        } else {
            None
        };

        // Load the models; keep the watcher alive for the whole run so new
        // generations keep replacing the pool.
        let _directory_watcher = Selfplayer::initialize_models(&self)?;

        let mut output_threads = Vec::new();
        for i in 0..self.options.output_threads {
            let output = OutputThread::new(
                i,
                OutputOptions {
                    output_dir: self.options.output_dir.clone(),
                    holdout_dir: self.options.holdout_dir.clone(),
                    sgf_dir: self.options.sgf_dir.clone(),
                    verbose: self.options.verbose,
                },
                self.output_queue.1.clone(),
                example_sink.clone(),
            );
            output_threads.push(
                std::thread::Builder::new()
                    .name(format!("output-{}", i))
                    .spawn(move || output.run())?,
            );
        }

        let mut selfplay_threads = Vec::new();
        for i in 0..self.options.selfplay_threads {
            let player = Arc::clone(&self);
            selfplay_threads.push(
                std::thread::Builder::new()
                    .name(format!("selfplay-{}", i))
                    .spawn(move || SelfplayThread::new(i, player).run())?,
            );
        }
        for handle in selfplay_threads {
            handle.join().expect("selfplay thread panicked");
        }

        // Stop the output threads by pushing one null game per thread.
        for _ in 0..self.options.output_threads {
            self.output_queue.0.send(None).unwrap();
        }
        for handle in output_threads {
            handle.join().expect("output thread panicked");
        }
        assert!(self.output_queue.1.is_empty());

        if let Some(watcher) = abort_watcher.as_mut() {
            watcher.join();
        }

        if self.options.cache_size_mb > 0 {
            info!("inference cache stats: {}", self.cache.stats());
        }
        {
            let state = self.state.lock().unwrap();
            info!(
                "\n{}",
                format_win_stats_table(&[(
                    state.latest_model_name.clone(),
                    state.win_stats
                )])
            );
        }
        info!(
            "played all games, total time {:.1} sec",
            start_time.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Creates the model pool. If the model path is a `%d` pattern, a
    /// directory watcher keeps replacing the pool as new generations appear;
    /// the first matching model is waited for.
    fn initialize_models(player: &Arc<Selfplayer>) -> Result<Option<DirectoryWatcher>> {
        let watcher = if ModelPathPattern::is_pattern(&player.options.model) {
            let weak = Arc::downgrade(player);
            let watcher = DirectoryWatcher::new(
                &player.options.model,
                Duration::from_secs(5),
                move |path: &str| {
                    if let Some(player) = weak.upgrade() {
                        player.create_models(path);
                    }
                },
            )?;
            info!(
                "waiting for model to match pattern {}",
                player.options.model
            );
            Some(watcher)
        } else {
            player.create_models(&player.options.model);
            None
        };

        // Sanity-check the pool by cycling one model through it. Blocks
        // until the watcher finds a first model.
        let model = player.acquire_model();
        player.release_model(model);
        Ok(watcher)
    }

    /// Builds `parallel_inference` backend instances for `path` and fills
    /// the pool with them.
    fn create_models(&self, path: &str) {
        info!("loading model {}", path);
        for i in 0..self.options.parallel_inference.max(1) {
            match self.factory.new_backend(path) {
                Ok(model) => {
                    if i == 0 {
                        let mut state = self.state.lock().unwrap();
                        state.latest_model_name = model.name().to_string();
                    }
                    self.model_pool.0.send(model).unwrap();
                }
                Err(e) => {
                    error!("failed to load model {}: {:#}", path, e);
                    return;
                }
            }
        }
    }

    /// Hands out a new game, or `None` when the requested number of games
    /// has been reached.
    pub fn start_new_game(&self, verbose: bool) -> Option<Box<SelfplayGame>> {
        let (game_id, player_name) = {
            let mut state = self.state.lock().unwrap();
            if !self.options.run_forever {
                if state.num_games_remaining == 0 {
                    return None;
                }
                state.num_games_remaining -= 1;
            }
            let game_id = state.next_game_id;
            state.next_game_id += 1;
            (game_id, state.latest_model_name.clone())
        };

        // Per-game lotteries: resignation handicaps and holdout routing.
        let resign_enabled = fastrand::f32() >= self.options.disable_resign_pct;
        let min = self.options.min_resign_threshold.abs();
        let max = self.options.max_resign_threshold.abs();
        let resign_threshold = -(min.min(max) + fastrand::f32() * (min.max(max) - min.min(max)));

        let game_options = GameOptions {
            resign_threshold,
            resign_enabled,
            komi: self.options.komi,
        };
        let tree_options = TreeOptions {
            value_init_penalty: self.options.value_init_penalty,
            policy_softmax_temp: self.options.policy_softmax_temp,
            soft_pick_enabled: true,
            ..TreeOptions::default()
        };
        let game_options_for_selfplay = SelfplayGameOptions {
            num_virtual_losses: self.options.virtual_losses,
            num_readouts: self.options.num_readouts,
            fastplay_readouts: self.options.fastplay_readouts,
            fastplay_frequency: self.options.fastplay_frequency,
            dirichlet_alpha: self.options.dirichlet_alpha,
            noise_mix: self.options.noise_mix,
            is_holdout: fastrand::f32() < self.options.holdout_pct,
            target_pruning: self.options.target_pruning,
            verbose,
            allow_pass: self.options.allow_pass,
            restrict_pass_alive_play_threshold: self.options.restrict_pass_alive_play_threshold,
        };

        // A fixed seed controls the moves played while staying distinct per
        // game; seed 0 asks for a fresh seed every game.
        let seed = if self.options.seed != 0 {
            self.options
                .seed
                .wrapping_add(1299283u64.wrapping_mul(game_id as u64))
        } else {
            fastrand::u64(..)
        };

        let game = Game::new(player_name.clone(), player_name, game_options);
        let tree = MctsTree::new(Position::new(Color::Black), tree_options);
        Some(Box::new(SelfplayGame::new(
            game_id,
            game_options_for_selfplay,
            game,
            tree,
            seed,
        )))
    }

    /// Takes a finished game: updates win statistics and forwards it to the
    /// output threads.
    pub fn end_game(&self, selfplay_game: Box<SelfplayGame>) {
        {
            let mut state = self.state.lock().unwrap();
            state.win_stats.update(selfplay_game.game());
        }
        self.output_queue.0.send(Some(selfplay_game)).unwrap();
    }

    /// Runs `f` across the shared sharded executor. Concurrent calls from
    /// different self-play threads serialize (unless `parallel_search == 1`),
    /// pipelining CPU tree search against model inference.
    pub fn execute_sharded<F>(&self, f: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        self.executor.execute(f);
    }

    pub fn num_search_shards(&self) -> usize {
        self.executor.num_shards()
    }

    /// Takes a model from the pool, blocking if none is free.
    pub fn acquire_model(&self) -> Box<dyn InferenceBackend> {
        self.model_pool.1.recv().expect("model pool closed")
    }

    /// Returns a model to the pool, unless a newer generation has been
    /// loaded since it was acquired, in which case the stale model is
    /// dropped and drains out of the pool.
    pub fn release_model(&self, model: Box<dyn InferenceBackend>) {
        let is_current = {
            let state = self.state.lock().unwrap();
            model.name() == state.latest_model_name
        };
        if is_current {
            self.model_pool.0.send(model).unwrap();
        }
    }
}

/// Inferences collected by one search shard, with spans mapping slices of
/// the inference vector back to the games that requested them.
#[derive(Default)]
struct ShardSearch {
    inferences: Vec<Inference>,
    spans: Vec<InferenceSpan>,
}

struct InferenceSpan {
    game_index: usize,
    pos: usize,
    len: usize,
}

/// Plays multiple games concurrently. Per iteration: refill empty game
/// slots, select leaves across the search shards, run one batched
/// inference, merge results through the cache, then play any moves whose
/// visit targets are met.
pub struct SelfplayThread {
    thread_id: usize,
    selfplayer: Arc<Selfplayer>,
    games: Vec<Mutex<Option<Box<SelfplayGame>>>>,
    searches: Vec<Mutex<ShardSearch>>,
    num_games_finished: usize,
}

impl SelfplayThread {
    pub fn new(thread_id: usize, selfplayer: Arc<Selfplayer>) -> SelfplayThread {
        let num_games = selfplayer.options().concurrent_games_per_thread;
        let num_shards = selfplayer.num_search_shards();
        SelfplayThread {
            thread_id,
            selfplayer,
            games: (0..num_games).map(|_| Mutex::new(None)).collect(),
            searches: (0..num_shards).map(|_| Mutex::new(ShardSearch::default())).collect(),
            num_games_finished: 0,
        }
    }

    pub fn run(mut self) {
        while !self.games.is_empty() {
            self.start_new_games();
            if self.games.is_empty() {
                break;
            }
            self.select_leaves();
            let model_name = self.run_inferences();
            self.process_inferences(&model_name);
            self.play_moves();
        }
        info!(
            "selfplay thread {} played {} games",
            self.thread_id, self.num_games_finished
        );
    }

    /// Replaces finished game slots with fresh games; when no games remain
    /// to start, the slot is dropped instead.
    fn start_new_games(&mut self) {
        let mut i = 0;
        while i < self.games.len() {
            let is_empty = self.games[i].get_mut().unwrap().is_none();
            if is_empty {
                let verbose =
                    self.selfplayer.options().verbose && self.thread_id == 0 && i == 0;
                match self.selfplayer.start_new_game(verbose) {
                    Some(game) => {
                        *self.games[i].get_mut().unwrap() = Some(game);
                    }
                    None => {
                        // No more games to play; drop the empty slot by
                        // swapping the last one in and re-inspecting index i.
                        self.games.swap_remove(i);
                        continue;
                    }
                }
            }
            i += 1;
        }
    }

    /// Selects leaves for all games across the search shards. Each shard
    /// claims games off a shared counter and appends into its own inference
    /// vector.
    fn select_leaves(&mut self) {
        let game_idx = AtomicUsize::new(0);
        let games = &self.games;
        let searches = &self.searches;
        let cache = self.selfplayer.cache();

        self.selfplayer.execute_sharded(|shard, num_shards| {
            debug_assert_eq!(num_shards, searches.len());
            let mut search = searches[shard].lock().unwrap();
            search.inferences.clear();
            search.spans.clear();

            loop {
                let i = game_idx.fetch_add(1, Ordering::SeqCst);
                if i >= games.len() {
                    break;
                }
                let mut slot = games[i].lock().unwrap();
                let Some(game) = slot.as_mut() else { continue };

                let pos = search.inferences.len();
                let ShardSearch {
                    inferences, spans, ..
                } = &mut *search;
                let stats = game.select_leaves(cache, inferences);
                if stats.num_leaves_queued > 0 {
                    spans.push(InferenceSpan {
                        game_index: i,
                        pos,
                        len: stats.num_leaves_queued,
                    });
                }
            }
        });
    }

    /// Runs one batched inference over every leaf selected this tick.
    /// Returns the name of the model that ran it.
    fn run_inferences(&mut self) -> String {
        let mut inputs = Vec::new();
        for search in &mut self.searches {
            let search = search.get_mut().unwrap();
            for inference in &mut search.inferences {
                inputs.push(std::mem::take(&mut inference.input));
            }
        }
        if inputs.is_empty() {
            return String::new();
        }

        let mut outputs = vec![Default::default(); inputs.len()];
        let mut model = self.selfplayer.acquire_model();
        let model_name = model.run_many(&inputs, &mut outputs);
        self.selfplayer.release_model(model);

        let mut results = outputs.into_iter();
        for search in &mut self.searches {
            let search = search.get_mut().unwrap();
            for inference in &mut search.inferences {
                inference.output = results.next().unwrap();
            }
        }
        model_name
    }

    /// Merges every result into the cache (averaging across symmetries),
    /// then feeds each game its span of inferences.
    fn process_inferences(&mut self, model_name: &str) {
        let cache = self.selfplayer.cache();
        for search in &mut self.searches {
            let search = search.get_mut().unwrap();
            for inference in &mut search.inferences {
                if let (Some(key), Some(canonical_sym)) =
                    (inference.cache_key, inference.canonical_sym)
                {
                    cache.merge(key, canonical_sym, inference.sym, &mut inference.output);
                }
            }
        }

        for shard in 0..self.searches.len() {
            let search = std::mem::take(self.searches[shard].get_mut().unwrap());
            for span in &search.spans {
                let mut slot = self.games[span.game_index].lock().unwrap();
                let game = slot.as_mut().expect("span for missing game");
                game.process_inferences(
                    model_name,
                    &search.inferences[span.pos..span.pos + span.len],
                );
            }
            *self.searches[shard].get_mut().unwrap() = search;
        }
    }

    /// Advances every game that has reached its readout target; finished
    /// games are handed back to the selfplayer.
    fn play_moves(&mut self) {
        for slot in &mut self.games {
            let slot = slot.get_mut().unwrap();
            let Some(game) = slot.as_mut() else { continue };
            if !game.maybe_play_move() {
                continue;
            }
            if game.options().verbose && self.selfplayer.options().cache_size_mb > 0 {
                info!("inference cache stats: {}", self.selfplayer.cache().stats());
            }
            if game.game().game_over() {
                let finished = slot.take().unwrap();
                self.num_games_finished += 1;
                self.selfplayer.end_game(finished);
            }
        }
    }
}
