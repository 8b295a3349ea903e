//! SGF serialization.
//!
//! The engine emits SGF; full parsing belongs to external front-ends. A
//! minimal main-line parser is provided so tests (and replay tooling) can
//! verify round trips.

use crate::color::Color;
use crate::constants::N;
use crate::coord::Coord;
use crate::game::Game;

pub const PROGRAM_IDENTIFIER: &str = concat!("tengen-", env!("CARGO_PKG_VERSION"));

/// A main-line move with an optional comment.
#[derive(Clone, Debug, PartialEq)]
pub struct MoveWithComment {
    pub color: Color,
    pub c: Coord,
    pub comment: String,
}

/// Header fields for an emitted SGF.
#[derive(Clone, Debug)]
pub struct CreateSgfOptions {
    pub black_name: String,
    pub white_name: String,
    pub ruleset: String,
    pub komi: f32,
    pub result: String,
    pub game_comment: String,
}

impl Default for CreateSgfOptions {
    fn default() -> CreateSgfOptions {
        CreateSgfOptions {
            black_name: PROGRAM_IDENTIFIER.to_string(),
            white_name: PROGRAM_IDENTIFIER.to_string(),
            ruleset: "Chinese".to_string(),
            komi: crate::constants::DEFAULT_KOMI,
            result: String::new(),
            game_comment: String::new(),
        }
    }
}

/// Escapes `]` and `\` in SGF text property values.
fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == ']' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn unescape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for ch in s.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Serializes a game's main line to an SGF string.
pub fn create_sgf_string(moves: &[MoveWithComment], options: &CreateSgfOptions) -> String {
    use std::fmt::Write;

    let mut out = format!(
        "(;GM[1]FF[4]CA[UTF-8]AP[{}]RU[{}]SZ[{}]KM[{}]PW[{}]PB[{}]RE[{}]",
        PROGRAM_IDENTIFIER,
        options.ruleset,
        N,
        options.komi,
        escape_text(&options.white_name),
        escape_text(&options.black_name),
        escape_text(&options.result),
    );
    if !options.game_comment.is_empty() {
        write!(out, "C[{}]", escape_text(&options.game_comment)).unwrap();
    }

    for m in moves {
        debug_assert!(m.color == Color::Black || m.color == Color::White);
        let color = if m.color == Color::Black { "B" } else { "W" };
        write!(out, "\n;{}[{}]", color, m.c.to_sgf()).unwrap();
        if !m.comment.is_empty() {
            write!(out, "C[{}]", escape_text(&m.comment)).unwrap();
        }
    }
    out.push_str(")\n");
    out
}

/// Builds the SGF for a completed game. With `write_comments`, the resign
/// threshold and each move's comment are attached.
pub fn game_to_sgf(game: &Game, write_comments: bool) -> String {
    let log_names = game.black_name() != game.white_name();
    let moves: Vec<MoveWithComment> = game
        .moves()
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let mut comment = String::new();
            if write_comments {
                if i == 0 {
                    comment = format!(
                        "Resign Threshold: {}\n{}",
                        game.options().resign_threshold,
                        m.comment
                    );
                } else if log_names {
                    let name = if m.color == Color::Black {
                        game.black_name()
                    } else {
                        game.white_name()
                    };
                    comment = format!("{}\n{}", name, m.comment);
                } else {
                    comment = m.comment.clone();
                }
            }
            MoveWithComment {
                color: m.color,
                c: m.c,
                comment,
            }
        })
        .collect();

    let options = CreateSgfOptions {
        black_name: game.black_name().to_string(),
        white_name: game.white_name().to_string(),
        komi: game.options().komi,
        result: game.result_string().to_string(),
        game_comment: game.comment().to_string(),
        ..Default::default()
    };
    create_sgf_string(&moves, &options)
}

/// Parses the main line of an SGF produced by [`create_sgf_string`]:
/// `B`/`W` move nodes and their comments. Game-level properties other than
/// the first node's comment are skipped. Variations are not followed.
pub fn parse_main_line(sgf: &str) -> Option<Vec<MoveWithComment>> {
    let mut moves = Vec::new();
    let bytes = sgf.as_bytes();
    let mut i = 0;
    let mut depth = 0;

    // Reads a bracketed property value starting at `[`, returning the
    // unescaped contents and the index one past the closing `]`.
    fn read_value(bytes: &[u8], start: usize) -> Option<(String, usize)> {
        if bytes.get(start) != Some(&b'[') {
            return None;
        }
        let mut j = start + 1;
        let mut escaped = false;
        while j < bytes.len() {
            match bytes[j] {
                b'\\' if !escaped => escaped = true,
                b']' if !escaped => {
                    let raw = std::str::from_utf8(&bytes[start + 1..j]).ok()?;
                    return Some((unescape_text(raw), j + 1));
                }
                _ => escaped = false,
            }
            j += 1;
        }
        None
    }

    while i < bytes.len() {
        match bytes[i] {
            b'(' => {
                depth += 1;
                // Only the main line is followed.
                if depth > 1 {
                    return Some(moves);
                }
                i += 1;
            }
            b')' => return Some(moves),
            b'B' | b'W'
                if bytes.get(i + 1) == Some(&b'[')
                    && i > 0
                    && (bytes[i - 1] == b';' || bytes[i - 1].is_ascii_whitespace()) =>
            {
                let color = if bytes[i] == b'B' {
                    Color::Black
                } else {
                    Color::White
                };
                let (value, next) = read_value(bytes, i + 1)?;
                let c = Coord::from_sgf(&value)?;
                let mut comment = String::new();
                // An optional comment property follows the move.
                let mut j = next;
                if bytes.get(j) == Some(&b'C') && bytes.get(j + 1) == Some(&b'[') {
                    let (text, after) = read_value(bytes, j + 1)?;
                    comment = text;
                    j = after;
                }
                moves.push(MoveWithComment { color, c, comment });
                i = j;
            }
            _ => {
                // Skip over any other property value so stray B[/W[ text
                // inside comments can't be misread as moves.
                if bytes[i] == b'[' {
                    let (_, next) = read_value(bytes, i)?;
                    i = next;
                } else {
                    i += 1;
                }
            }
        }
    }
    Some(moves)
}
