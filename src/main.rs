//! Tengen: concurrent self-play for an AlphaZero-style Go player.
//!
//! ## Usage
//!
//! - `tengen selfplay --model <path> --num-games 16` - Play games with the
//!   built-in fake backend (real runtimes plug in as `ModelFactory`
//!   implementations)
//! - `tengen demo` - Run a short search demo

use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use tengen::color::Color;
use tengen::constants::{DEFAULT_KOMI, DIRICHLET_ALPHA, NUM_MOVES};
use tengen::mcts::{MctsTree, TreeOptions};
use tengen::model::FakeModelFactory;
use tengen::player::{Selfplayer, SelfplayOptions};
use tengen::position::Position;

/// Tengen: an inference-driven MCTS self-play engine for Go
#[derive(Parser)]
#[command(name = "tengen")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Play self-play games concurrently, writing SGFs and training data
    Selfplay(SelfplayArgs),
    /// Run a short demo of the search
    Demo,
}

#[derive(Args)]
struct SelfplayArgs {
    /// Model path; a "%d" in the basename follows new generations
    #[arg(long)]
    model: String,

    /// Output directory for training examples ("$MODEL" is substituted)
    #[arg(long, default_value = "")]
    output_dir: String,

    /// Directory for held-out validation examples
    #[arg(long, default_value = "")]
    holdout_dir: String,

    /// Directory for SGF records
    #[arg(long, default_value = "")]
    sgf_dir: String,

    /// Total number of games to play; mutually exclusive with --run-forever
    #[arg(long, default_value_t = 0)]
    num_games: usize,

    /// Keep playing games until aborted
    #[arg(long, default_value_t = false)]
    run_forever: bool,

    /// If this file appears, the process aborts (with --run-forever)
    #[arg(long, default_value = "")]
    abort_file: String,

    /// Number of games each selfplay thread plays concurrently
    #[arg(long, default_value_t = 1)]
    parallel_games: usize,

    /// Number of threads tree search is sharded across
    #[arg(long, default_value_t = default_parallel_search())]
    parallel_search: usize,

    /// Number of model instances in the inference pool
    #[arg(long, default_value_t = 2)]
    parallel_inference: usize,

    /// Number of threads running batches of selfplay games
    #[arg(long, default_value_t = 3)]
    selfplay_threads: usize,

    /// Readouts per move
    #[arg(long, default_value_t = 104)]
    num_readouts: usize,

    /// Leaves selected per game per tick
    #[arg(long, default_value_t = 8)]
    virtual_losses: usize,

    /// Fraction of moves played with reduced readouts
    #[arg(long, default_value_t = 0.0)]
    fastplay_frequency: f32,

    /// Readouts for fast-played moves
    #[arg(long, default_value_t = 20)]
    fastplay_readouts: usize,

    /// Dirichlet noise concentration
    #[arg(long, default_value_t = DIRICHLET_ALPHA)]
    dirichlet_alpha: f32,

    /// Fraction of noise mixed into the root priors
    #[arg(long, default_value_t = 0.25)]
    noise_mix: f32,

    /// Value initialization penalty: 0 = init-to-parent, 2 = init-to-loss
    #[arg(long, default_value_t = 2.0)]
    value_init_penalty: f32,

    /// Exponent applied to visit counts during soft picks
    #[arg(long, default_value_t = 0.98)]
    policy_softmax_temp: f32,

    /// Subtract visits from non-best moves before emitting targets
    #[arg(long, default_value_t = false)]
    target_pruning: bool,

    /// Fraction of games held out for validation
    #[arg(long, default_value_t = 0.03)]
    holdout_pct: f32,

    /// Lower bound of the per-game resign threshold range
    #[arg(long, default_value_t = -1.0)]
    min_resign_threshold: f32,

    /// Upper bound of the per-game resign threshold range
    #[arg(long, default_value_t = -0.8)]
    max_resign_threshold: f32,

    /// Fraction of games played with resignation disabled
    #[arg(long, default_value_t = 0.1)]
    disable_resign_pct: f32,

    /// If false, pass is only read when there is no legal alternative
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    allow_pass: bool,

    /// Opponent passes before play is restricted to non-pass-alive points
    #[arg(long, default_value_t = 4)]
    restrict_pass_alive_play_threshold: i32,

    /// Inference cache size; 0 disables the cache
    #[arg(long, default_value_t = 0)]
    cache_size_mb: usize,

    /// Number of independently locked cache shards
    #[arg(long, default_value_t = 8)]
    cache_shards: usize,

    /// Random seed controlling the moves played; 0 means time-based
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Komi
    #[arg(long, default_value_t = DEFAULT_KOMI)]
    komi: f32,

    /// Number of threads writing outputs
    #[arg(long, default_value_t = 1)]
    output_threads: usize,

    /// Log boards and search statistics for the first game
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    verbose: bool,
}

/// Tree search parallelism defaults to the core count, capped at the same
/// small fan-out the rest of the pipeline assumes.
fn default_parallel_search() -> usize {
    num_cpus::get().clamp(1, 3)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Selfplay(args)) => run_selfplay(args),
        Some(Commands::Demo) | None => {
            run_demo();
            Ok(())
        }
    }
}

fn run_selfplay(args: SelfplayArgs) -> Result<()> {
    let options = SelfplayOptions {
        model: args.model,
        cache_size_mb: args.cache_size_mb,
        cache_shards: args.cache_shards,
        num_readouts: args.num_readouts,
        fastplay_frequency: args.fastplay_frequency,
        fastplay_readouts: args.fastplay_readouts,
        virtual_losses: args.virtual_losses,
        dirichlet_alpha: args.dirichlet_alpha,
        noise_mix: args.noise_mix,
        value_init_penalty: args.value_init_penalty,
        target_pruning: args.target_pruning,
        policy_softmax_temp: args.policy_softmax_temp,
        allow_pass: args.allow_pass,
        restrict_pass_alive_play_threshold: args.restrict_pass_alive_play_threshold,
        selfplay_threads: args.selfplay_threads,
        parallel_search: args.parallel_search,
        parallel_inference: args.parallel_inference,
        concurrent_games_per_thread: args.parallel_games,
        seed: args.seed,
        min_resign_threshold: args.min_resign_threshold,
        max_resign_threshold: args.max_resign_threshold,
        disable_resign_pct: args.disable_resign_pct,
        num_games: args.num_games,
        run_forever: args.run_forever,
        abort_file: args.abort_file,
        holdout_pct: args.holdout_pct,
        output_dir: args.output_dir,
        holdout_dir: args.holdout_dir,
        sgf_dir: args.sgf_dir,
        verbose: args.verbose,
        output_threads: args.output_threads,
        komi: args.komi,
    };

    // The built-in factory fabricates deterministic backends; linking a real
    // neural runtime means swapping in its ModelFactory here.
    let factory = Box::new(FakeModelFactory::new());
    let player = Arc::new(Selfplayer::new(options, factory)?);
    player.run(None)
}

fn run_demo() {
    println!("Tengen: MCTS self-play engine for Go\n");

    let mut tree = MctsTree::new(Position::new(Color::Black), TreeOptions::default());
    let probs = vec![1.0 / NUM_MOVES as f32; NUM_MOVES];

    println!("Running 200 readouts with uniform priors...");
    for _ in 0..200 {
        let leaf = tree.select_leaf(true);
        if tree.game_over(leaf) {
            tree.incorporate_end_game_result(leaf, -1.0);
        } else {
            tree.incorporate_results(leaf, &probs, 0.0);
        }
    }

    let best = tree.get_most_visited_move(false);
    println!("Most visited move: {}", best);
    println!("{}", tree.describe());
}
