//! Output stage: consumes completed games and hands them to sinks.
//!
//! The core emits SGF itself and builds [`TrainingExample`] values from
//! trainable moves; serialization of examples is delegated to an external
//! [`OutputSink`]. Output directories may embed a `$MODEL` token (replaced
//! by a sanitized model name) and are bucketed into per-UTC-hour
//! subdirectories.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use log::{error, info};

use crate::color::Color;
use crate::game::Game;
use crate::position::Stones;
use crate::selfplay::SelfplayGame;
use crate::sgf;

/// One training example per trainable move: the board before the move, the
/// search target and the final outcome.
pub struct TrainingExample<'a> {
    pub stones: &'a Stones,
    pub search_pi: &'a [f32],
    /// -1 or +1 from Black's perspective.
    pub outcome: f32,
    pub color: Color,
    pub komi: f32,
    pub model_name: &'a str,
}

/// Builds the training examples for a completed game.
pub fn trainable_examples<'a>(game: &'a Game, model_name: &'a str) -> Vec<TrainingExample<'a>> {
    game.moves()
        .iter()
        .filter(|m| m.trainable)
        .map(|m| TrainingExample {
            stones: &m.stones,
            search_pi: m.search_pi.as_deref().expect("trainable move without pi"),
            outcome: game.result(),
            color: m.color,
            komi: game.options().komi,
            model_name,
        })
        .collect()
}

/// Capability for serializing training examples; the concrete format
/// (TFRecord etc.) lives outside the core.
pub trait OutputSink: Send + Sync {
    fn write_examples(
        &self,
        dir: &Path,
        output_name: &str,
        examples: &[TrainingExample<'_>],
    ) -> Result<()>;
}

/// Replaces `$MODEL` with a sanitized model name and appends the UTC hour
/// subdirectory.
pub fn expand_output_dir(root: &str, model_name: &str, now: DateTime<Utc>) -> PathBuf {
    let clean_model: String = model_name
        .chars()
        .map(|ch| if matches!(ch, ':' | '/' | '.') { '_' } else { ch })
        .collect();
    let processed = root.replace("$MODEL", &clean_model);
    Path::new(&processed).join(now.format("%Y-%m-%d-%H").to_string())
}

/// `hostname-pid-gameid`, unique enough across a fleet of workers.
pub fn output_name(game_id: usize) -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}-{}", hostname, std::process::id(), game_id)
}

fn write_sgf_file(dir: &Path, name: &str, game: &Game, write_comments: bool) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;
    let path = dir.join(format!("{}.sgf", name));
    std::fs::write(&path, sgf::game_to_sgf(game, write_comments))
        .with_context(|| format!("writing {:?}", path))
}

/// Destination directories for completed games.
#[derive(Clone, Default, Debug)]
pub struct OutputOptions {
    pub output_dir: String,
    pub holdout_dir: String,
    pub sgf_dir: String,
    pub verbose: bool,
}

/// Consumes completed games from the output queue and writes SGFs and
/// training examples. The queue closes (or delivers `None`) when self-play
/// is done.
pub struct OutputThread {
    thread_id: usize,
    options: OutputOptions,
    queue: Receiver<Option<Box<SelfplayGame>>>,
    example_sink: Option<std::sync::Arc<dyn OutputSink>>,
}

impl OutputThread {
    pub fn new(
        thread_id: usize,
        options: OutputOptions,
        queue: Receiver<Option<Box<SelfplayGame>>>,
        example_sink: Option<std::sync::Arc<dyn OutputSink>>,
    ) -> OutputThread {
        OutputThread {
            thread_id,
            options,
            queue,
            example_sink,
        }
    }

    pub fn run(mut self) {
        loop {
            match self.queue.recv() {
                Ok(Some(game)) => self.write_outputs(*game),
                Ok(None) | Err(_) => break,
            }
        }
        log::debug!("output thread {} stopping", self.thread_id);
    }

    fn write_outputs(&mut self, mut selfplay_game: SelfplayGame) {
        let now = Utc::now();
        let name = output_name(selfplay_game.game_id());
        let model_name = selfplay_game
            .models_used()
            .last()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        if self.options.verbose {
            let game = selfplay_game.game();
            info!(
                "{} played {} moves in {:.1}s",
                game.result_string(),
                game.num_moves(),
                selfplay_game.duration().as_secs_f64()
            );
            if let Some((mv, q)) = game.find_bleakest_move() {
                info!("bleakest eval: move={} Q={:.3}", mv, q);
            }
            if let Some(mv) = game.find_bad_resign_move() {
                info!("bad resign: move={} Q={:.3}", mv, game.moves()[mv].q);
            }
        }

        // Training examples go to either the holdout or the main output
        // directory. A failed write is logged but not fatal.
        let example_dir = if selfplay_game.options().is_holdout {
            &self.options.holdout_dir
        } else {
            &self.options.output_dir
        };
        if !example_dir.is_empty() {
            if let Some(sink) = &self.example_sink {
                let dir = expand_output_dir(example_dir, &model_name, now);
                let examples = trainable_examples(selfplay_game.game(), &model_name);
                if let Err(e) = sink.write_examples(&dir, &name, &examples) {
                    error!("failed to write examples for {}: {:#}", name, e);
                }
            }
        }

        if !self.options.sgf_dir.is_empty() {
            let models = selfplay_game.models_used().join(", ");
            selfplay_game
                .game_mut()
                .add_comment(&format!("Inferences: {}", models));

            let game = selfplay_game.game();
            let base = expand_output_dir(&self.options.sgf_dir, &model_name, now);
            for (sub, comments) in [("clean", false), ("full", true)] {
                if let Err(e) = write_sgf_file(&base.join(sub), &name, game, comments) {
                    error!("failed to write sgf for {}: {:#}", name, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_expand_output_dir() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 17, 30, 0).unwrap();
        let dir = expand_output_dir("out/$MODEL/games", "models/000042.pb", now);
        assert_eq!(
            dir,
            Path::new("out/models_000042_pb/games/2024-03-05-17")
        );
    }

    #[test]
    fn test_expand_output_dir_without_token() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 3, 0, 0).unwrap();
        let dir = expand_output_dir("plain", "m", now);
        assert_eq!(dir, Path::new("plain/2024-03-05-03"));
    }

    #[test]
    fn test_output_name_contains_game_id() {
        assert!(output_name(37).ends_with("-37"));
    }

    #[test]
    fn test_trainable_examples_skip_fast_plays() {
        use crate::constants::{NUM_MOVES, NUM_POINTS};
        use crate::coord::Coord;
        use crate::game::GameOptions;
        use crate::stone::Stone;

        let mut game = Game::new("m".into(), "m".into(), GameOptions::default());
        let stones = [Stone::default(); NUM_POINTS];
        game.add_trainable_move(
            Color::Black,
            Coord::from_index(0),
            &stones,
            String::new(),
            0.1,
            8,
            vec![1.0 / NUM_MOVES as f32; NUM_MOVES],
        );
        game.add_non_trainable_move(
            Color::White,
            Coord::from_index(1),
            &stones,
            String::new(),
            0.0,
            2,
        );
        game.set_game_over_because_of_passes(-3.5);

        let examples = trainable_examples(&game, "model");
        assert_eq!(examples.len(), 1);
        assert_eq!(examples[0].outcome, -1.0);
        assert_eq!(examples[0].color, Color::Black);
    }
}
