//! The full history of a single game.

use crate::color::Color;
use crate::constants::{DEFAULT_KOMI, NUM_MOVES};
use crate::coord::Coord;
use crate::position::Stones;

/// Game-specific options.
#[derive(Clone, Debug)]
pub struct GameOptions {
    pub resign_threshold: f32,
    /// A separate flag instead of setting `resign_threshold` to -1 for games
    /// with resignation disabled, so that games where the eventual winner
    /// would have incorrectly resigned early can still be reported.
    pub resign_enabled: bool,
    pub komi: f32,
}

impl Default for GameOptions {
    fn default() -> GameOptions {
        GameOptions {
            resign_threshold: -0.95,
            resign_enabled: true,
            komi: DEFAULT_KOMI,
        }
    }
}

/// A single played move with everything needed to build a training example.
pub struct Move {
    pub color: Color,
    pub c: Coord,
    /// Root Q at the time the move was played, Black-perspective.
    pub q: f32,
    /// Root visit count when the move was played.
    pub n: i32,
    /// Comment attached to this move in SGF output.
    pub comment: String,
    /// Search visit distribution; present only for trainable moves.
    pub search_pi: Option<Vec<f32>>,
    /// True if this move should be emitted as a training example. Fast-play
    /// moves are recorded but not trained on.
    pub trainable: bool,
    /// Stones on the board before the move was played, used to build
    /// training features after the game finishes.
    pub stones: Box<Stones>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GameOverReason {
    BothPassed,
    OpponentResigned,
    MoveLimitReached,
}

/// Holds the move history and terminal state of one game.
pub struct Game {
    options: GameOptions,
    black_name: String,
    white_name: String,
    moves: Vec<Move>,
    comment: String,
    game_over: bool,
    game_over_reason: Option<GameOverReason>,
    /// -1, 0 or +1 from Black's perspective.
    result: f32,
    result_string: String,
}

impl Game {
    pub fn new(black_name: String, white_name: String, options: GameOptions) -> Game {
        Game {
            options,
            black_name,
            white_name,
            moves: Vec::new(),
            comment: String::new(),
            game_over: false,
            game_over_reason: None,
            result: 0.0,
            result_string: String::new(),
        }
    }

    /// Formats a score the way game results are written: `B+3.5`, `W+0.5`.
    pub fn format_score(score: f32) -> String {
        if score > 0.0 {
            format!("B+{}", score)
        } else {
            format!("W+{}", -score)
        }
    }

    pub fn options(&self) -> &GameOptions {
        &self.options
    }

    pub fn black_name(&self) -> &str {
        &self.black_name
    }

    pub fn white_name(&self) -> &str {
        &self.white_name
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    pub fn num_moves(&self) -> usize {
        self.moves.len()
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn game_over(&self) -> bool {
        self.game_over
    }

    pub fn game_over_reason(&self) -> GameOverReason {
        assert!(self.game_over);
        self.game_over_reason.unwrap()
    }

    /// Game result from Black's perspective. Panics if the game isn't over.
    pub fn result(&self) -> f32 {
        assert!(self.game_over);
        self.result
    }

    pub fn result_string(&self) -> &str {
        assert!(self.game_over);
        &self.result_string
    }

    /// Appends to the game-level comment emitted at the start of the SGF.
    pub fn add_comment(&mut self, comment: &str) {
        if self.comment.is_empty() {
            self.comment = comment.to_string();
        } else {
            self.comment.push('\n');
            self.comment.push_str(comment);
        }
    }

    /// Records a move whose search distribution becomes a training target.
    #[allow(clippy::too_many_arguments)]
    pub fn add_trainable_move(
        &mut self,
        color: Color,
        c: Coord,
        stones: &Stones,
        comment: String,
        q: f32,
        n: i32,
        search_pi: Vec<f32>,
    ) {
        debug_assert_eq!(search_pi.len(), NUM_MOVES);
        self.moves.push(Move {
            color,
            c,
            q,
            n,
            comment,
            search_pi: Some(search_pi),
            trainable: true,
            stones: Box::new(*stones),
        });
    }

    /// Records a move without a training target (fast plays, resignations).
    pub fn add_non_trainable_move(
        &mut self,
        color: Color,
        c: Coord,
        stones: &Stones,
        comment: String,
        q: f32,
        n: i32,
    ) {
        self.moves.push(Move {
            color,
            c,
            q,
            n,
            comment,
            search_pi: None,
            trainable: false,
            stones: Box::new(*stones),
        });
    }

    fn sign_of(score: f32) -> f32 {
        if score > 0.0 {
            1.0
        } else if score < 0.0 {
            -1.0
        } else {
            0.0
        }
    }

    pub fn set_game_over_because_of_passes(&mut self, score: f32) {
        self.game_over = true;
        self.game_over_reason = Some(GameOverReason::BothPassed);
        self.result = Game::sign_of(score);
        self.result_string = Game::format_score(score);
    }

    pub fn set_game_over_because_of_resign(&mut self, winner: Color) {
        self.game_over = true;
        self.game_over_reason = Some(GameOverReason::OpponentResigned);
        match winner {
            Color::Black => {
                self.result = 1.0;
                self.result_string = "B+R".to_string();
            }
            Color::White => {
                self.result = -1.0;
                self.result_string = "W+R".to_string();
            }
            Color::Empty => panic!("game cannot be won by Empty"),
        }
    }

    pub fn set_game_over_because_move_limit_reached(&mut self, score: f32) {
        self.game_over = true;
        self.game_over_reason = Some(GameOverReason::MoveLimitReached);
        self.result = Game::sign_of(score);
        self.result_string = Game::format_score(score);
    }

    /// The move where the eventual winner's Q was bleakest, from the
    /// winner's perspective. Only meaningful for completed games played with
    /// resignation disabled.
    pub fn find_bleakest_move(&self) -> Option<(usize, f32)> {
        if !self.game_over || self.moves.is_empty() {
            return None;
        }
        if matches!(
            self.game_over_reason,
            Some(GameOverReason::OpponentResigned)
        ) {
            // Quitters don't know how bad it could have been.
            return None;
        }

        let winner_sign = self.result.signum();
        if winner_sign == 0.0 {
            return None;
        }
        let mut bleakest = 0;
        let mut bleakest_q = f32::INFINITY;
        for (i, m) in self.moves.iter().enumerate() {
            let q = m.q * winner_sign;
            if q < bleakest_q {
                bleakest = i;
                bleakest_q = q;
            }
        }
        Some((bleakest, bleakest_q))
    }

    /// The first move where the eventual winner's perspective Q crossed the
    /// resign threshold, i.e. a would-have-been bad resignation. Only
    /// meaningful when resignation was disabled.
    pub fn find_bad_resign_move(&self) -> Option<usize> {
        if !self.game_over || self.options.resign_enabled {
            return None;
        }
        for (i, m) in self.moves.iter().enumerate() {
            let q_perspective = if m.color == Color::Black { m.q } else { -m.q };
            if q_perspective < self.options.resign_threshold {
                if (m.q < 0.0) != (self.result < 0.0) {
                    return Some(i);
                }
                break;
            }
        }
        None
    }
}

/// Win counts bucketed by color and game-over reason.
#[derive(Clone, Copy, Default, Debug)]
pub struct ColorWinStats {
    pub both_passed: u32,
    pub opponent_resigned: u32,
    pub move_limit_reached: u32,
}

impl ColorWinStats {
    pub fn total(&self) -> u32 {
        self.both_passed + self.opponent_resigned + self.move_limit_reached
    }
}

/// Aggregated win statistics, reported at shutdown.
#[derive(Clone, Copy, Default, Debug)]
pub struct WinStats {
    pub black_wins: ColorWinStats,
    pub white_wins: ColorWinStats,
}

impl WinStats {
    pub fn update(&mut self, game: &Game) {
        let stats = if game.result() > 0.0 {
            &mut self.black_wins
        } else {
            &mut self.white_wins
        };
        match game.game_over_reason() {
            GameOverReason::BothPassed => stats.both_passed += 1,
            GameOverReason::OpponentResigned => stats.opponent_resigned += 1,
            GameOverReason::MoveLimitReached => stats.move_limit_reached += 1,
        }
    }
}

/// Renders per-model win statistics as an aligned table.
pub fn format_win_stats_table(stats: &[(String, WinStats)]) -> String {
    let name_length = stats.iter().map(|(name, _)| name.len()).max().unwrap_or(4).max(4);
    let mut result = String::new();
    result.push_str(&format!(
        "{:width$}   Black   Black   Black   Black   White   White   White   White\n",
        "",
        width = name_length
    ));
    result.push_str(&format!(
        "{:width$}   total   passes  resign  m.lmt.  total   passes  resign  m.lmt.",
        "",
        width = name_length
    ));
    for (name, s) in stats {
        let b = &s.black_wins;
        let w = &s.white_wins;
        result.push_str(&format!(
            "\n{:<width$} {:7} {:7} {:7} {:7} {:7} {:7} {:7} {:7}",
            name,
            b.total(),
            b.both_passed,
            b.opponent_resigned,
            b.move_limit_reached,
            w.total(),
            w.both_passed,
            w.opponent_resigned,
            w.move_limit_reached,
            width = name_length
        ));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NUM_POINTS;
    use crate::stone::Stone;

    fn empty_stones() -> Stones {
        [Stone::default(); NUM_POINTS]
    }

    #[test]
    fn test_format_score() {
        assert_eq!(Game::format_score(12.5), "B+12.5");
        assert_eq!(Game::format_score(-0.5), "W+0.5");
    }

    #[test]
    fn test_result_by_passes() {
        let mut game = Game::new("m".into(), "m".into(), GameOptions::default());
        game.set_game_over_because_of_passes(3.5);
        assert_eq!(game.result(), 1.0);
        assert_eq!(game.result_string(), "B+3.5");
        assert_eq!(game.game_over_reason(), GameOverReason::BothPassed);
    }

    #[test]
    fn test_result_by_resign() {
        let mut game = Game::new("m".into(), "m".into(), GameOptions::default());
        game.set_game_over_because_of_resign(Color::White);
        assert_eq!(game.result(), -1.0);
        assert_eq!(game.result_string(), "W+R");
    }

    #[test]
    fn test_bleakest_move() {
        let mut options = GameOptions::default();
        options.resign_enabled = false;
        let mut game = Game::new("m".into(), "m".into(), options);
        let stones = empty_stones();
        for (i, q) in [0.1f32, -0.4, 0.2, -0.1].iter().enumerate() {
            let color = if i % 2 == 0 {
                Color::Black
            } else {
                Color::White
            };
            game.add_non_trainable_move(color, Coord::PASS, &stones, String::new(), *q, 10);
        }
        game.set_game_over_because_of_passes(5.0);
        // Black won; the bleakest point for Black was Q = -0.4 at move 1.
        let (idx, q) = game.find_bleakest_move().unwrap();
        assert_eq!(idx, 1);
        assert!((q + 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_win_stats() {
        let mut stats = WinStats::default();
        let mut game = Game::new("m".into(), "m".into(), GameOptions::default());
        game.set_game_over_because_of_passes(2.5);
        stats.update(&game);
        let mut game2 = Game::new("m".into(), "m".into(), GameOptions::default());
        game2.set_game_over_because_of_resign(Color::White);
        stats.update(&game2);

        assert_eq!(stats.black_wins.total(), 1);
        assert_eq!(stats.white_wins.opponent_resigned, 1);

        let table = format_win_stats_table(&[("model".to_string(), stats)]);
        assert!(table.contains("model"));
        assert!(table.contains("Black"));
    }
}
