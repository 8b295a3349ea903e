//! Input feature encoding.
//!
//! Builds the model input tensor for a batch of positions. Two feature sets
//! are supported:
//!
//! - AGZ (17 planes): for each of the most recent 8 plies, {my stones,
//!   their stones}; then one plane that is all ones iff Black is to play.
//! - mlperf07 (13 planes): 4 plies of {my, their} stones, the to-play
//!   plane, three liberty-count planes {==1, ==2, >=3} and a would-capture
//!   plane marking empty legal points that would capture.
//!
//! History planes are filled most-recent-first and padded with zeros when
//! fewer plies exist. The input's dihedral symmetry is applied while
//! writing; backends undo it on the policy they return.

use crate::color::Color;
use crate::constants::NUM_POINTS;
use crate::coord::Coord;
use crate::model::{DType, FeatureDescriptor, FeatureKind, Layout, ModelInput, Tensor};
use crate::position::MoveType;

/// Encodes a whole batch into a single contiguous tensor.
pub fn encode_batch(descriptor: &FeatureDescriptor, inputs: &[ModelInput]) -> Tensor {
    let num_planes = descriptor.kind.num_planes();
    let stride = num_planes * NUM_POINTS;
    match descriptor.dtype {
        DType::U8 => {
            let mut data = vec![0u8; inputs.len() * stride];
            for (i, input) in inputs.iter().enumerate() {
                encode_input(descriptor, input, &mut data[i * stride..(i + 1) * stride]);
            }
            Tensor::U8(data)
        }
        DType::F32 => {
            let mut data = vec![0.0f32; inputs.len() * stride];
            for (i, input) in inputs.iter().enumerate() {
                encode_input(descriptor, input, &mut data[i * stride..(i + 1) * stride]);
            }
            Tensor::F32(data)
        }
    }
}

/// Encodes one input into a zeroed `num_planes * NUM_POINTS` slice.
fn encode_input<T: Copy + From<u8>>(
    descriptor: &FeatureDescriptor,
    input: &ModelInput,
    out: &mut [T],
) {
    let num_planes = descriptor.kind.num_planes();
    debug_assert_eq!(out.len(), num_planes * NUM_POINTS);
    assert!(
        !input.position_history.is_empty(),
        "inference input without a position"
    );

    let sym = input.sym;
    let layout = descriptor.layout;
    let one: T = T::from(1u8);

    // Writes `1` into (plane, point) honoring layout and input symmetry.
    let set = |plane: usize, point: usize, out: &mut [T]| {
        let t = sym.apply_coord(Coord::from_index(point)).index();
        let idx = match layout {
            Layout::Nhwc => t * num_planes + plane,
            Layout::Nchw => plane * NUM_POINTS + t,
        };
        out[idx] = one;
    };

    let position = &input.position_history[0];
    let my_color = position.to_play();
    let their_color = my_color.other();
    let history_len = descriptor.kind.position_history_len();

    // Stone history planes, most-recent-first, zero-padded.
    let n = input.position_history.len().min(history_len);
    for (j, past) in input.position_history[..n].iter().enumerate() {
        for (i, stone) in past.stones().iter().enumerate() {
            if stone.color() == my_color {
                set(2 * j, i, out);
            } else if stone.color() == their_color {
                set(2 * j + 1, i, out);
            }
        }
    }

    // To-play plane: all ones iff Black to play.
    let to_play_plane = 2 * history_len;
    if my_color == Color::Black {
        for i in 0..NUM_POINTS {
            set(to_play_plane, i, out);
        }
    }

    if descriptor.kind == FeatureKind::Mlperf07 {
        // Liberty planes for the current position.
        let libs_base = to_play_plane + 1;
        for i in 0..NUM_POINTS {
            match position.num_chain_liberties(i) {
                0 => {}
                1 => set(libs_base, i, out),
                2 => set(libs_base + 1, i, out),
                _ => set(libs_base + 2, i, out),
            }
        }

        // Would-capture plane: empty legal points whose play captures.
        let capture_plane = libs_base + 3;
        for i in 0..NUM_POINTS {
            let c = Coord::from_index(i);
            if position.legal_move(c) && position.classify_move(c) == MoveType::Capture {
                set(capture_plane, i, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;
    use crate::symmetry::Symmetry;

    fn input_for(position: Position) -> ModelInput {
        ModelInput {
            sym: Symmetry::Identity,
            position_history: vec![position],
        }
    }

    fn agz_f32(inputs: &[ModelInput]) -> Vec<f32> {
        let descriptor = FeatureDescriptor {
            kind: FeatureKind::Agz,
            layout: Layout::Nhwc,
            dtype: DType::F32,
        };
        match encode_batch(&descriptor, inputs) {
            Tensor::F32(v) => v,
            Tensor::U8(_) => unreachable!(),
        }
    }

    #[test]
    fn test_agz_empty_board_black_to_play() {
        let features = agz_f32(&[input_for(Position::new(Color::Black))]);
        assert_eq!(features.len(), 17 * NUM_POINTS);
        // Only the to-play plane (index 16 of each point) is set.
        let expected_sum = NUM_POINTS as f32;
        assert_eq!(features.iter().sum::<f32>(), expected_sum);
        assert_eq!(features[16], 1.0);
        assert_eq!(features[0], 0.0);
    }

    #[test]
    fn test_agz_white_to_play_has_zero_to_play_plane() {
        let features = agz_f32(&[input_for(Position::new(Color::White))]);
        assert_eq!(features.iter().sum::<f32>(), 0.0);
    }

    #[test]
    fn test_history_planes_most_recent_first() {
        let mut older = Position::new(Color::Black);
        older.play_move(Coord::from_gtp("D4").unwrap(), None, None);
        // older: black D4, white to play.
        let mut newer = older.clone();
        newer.play_move(Coord::from_gtp("E5").unwrap(), None, None);
        // newer: black D4, white E5, black to play.

        let input = ModelInput {
            sym: Symmetry::Identity,
            position_history: vec![newer, older],
        };
        let features = agz_f32(&[input]);

        let d4 = Coord::from_gtp("D4").unwrap().index();
        let e5 = Coord::from_gtp("E5").unwrap().index();
        // Plane 0: my (black) stones now.
        assert_eq!(features[d4 * 17], 1.0);
        // Plane 1: their (white) stones now.
        assert_eq!(features[e5 * 17 + 1], 1.0);
        // Plane 2: my stones one ply ago; D4 was black then too.
        assert_eq!(features[d4 * 17 + 2], 1.0);
        // Plane 3: their stones one ply ago; E5 wasn't placed yet.
        assert_eq!(features[e5 * 17 + 3], 0.0);
        // Planes beyond the available history are zero padded.
        assert_eq!(features[d4 * 17 + 4], 0.0);
    }

    #[test]
    fn test_symmetry_moves_stone_plane() {
        let mut pos = Position::new(Color::White);
        let c = Coord::from_row_col(0, 1);
        pos.play_move(c, None, None);

        let input = ModelInput {
            sym: Symmetry::Rot180,
            position_history: vec![pos],
        };
        let features = agz_f32(&[input]);

        // The white stone is "their" stone (black to play now), plane 1,
        // written at the rotated coordinate.
        let t = Symmetry::Rot180.apply_coord(c).index();
        assert_eq!(features[t * 17 + 1], 1.0);
        assert_eq!(features[c.index() * 17 + 1], 0.0);
    }

    #[test]
    fn test_mlperf07_planes() {
        // One white stone in atari, black to play.
        let pos = Position::from_text_board(
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
        let descriptor = FeatureDescriptor {
            kind: FeatureKind::Mlperf07,
            layout: Layout::Nchw,
            dtype: DType::U8,
        };
        let input = input_for(pos);
        let features = match encode_batch(&descriptor, std::slice::from_ref(&input)) {
            Tensor::U8(v) => v,
            Tensor::F32(_) => unreachable!(),
        };
        assert_eq!(features.len(), 13 * NUM_POINTS);

        let e4 = Coord::from_gtp("E4").unwrap().index();
        let e3 = Coord::from_gtp("E3").unwrap().index();
        let d4 = Coord::from_gtp("D4").unwrap().index();
        // Plane 9 (libs == 1): the white E4 stone is in atari.
        assert_eq!(features[9 * NUM_POINTS + e4], 1);
        // D4 black stone has 3 liberties: plane 11.
        assert_eq!(features[11 * NUM_POINTS + d4], 1);
        // Plane 12: playing E3 captures.
        assert_eq!(features[12 * NUM_POINTS + e3], 1);
        // To-play plane is all ones (black to play).
        let to_play_sum: u32 = features[8 * NUM_POINTS..9 * NUM_POINTS]
            .iter()
            .map(|&v| v as u32)
            .sum();
        assert_eq!(to_play_sum, NUM_POINTS as u32);
    }

    #[test]
    fn test_batch_layout() {
        let inputs = vec![
            input_for(Position::new(Color::Black)),
            input_for(Position::new(Color::White)),
        ];
        let features = agz_f32(&inputs);
        assert_eq!(features.len(), 2 * 17 * NUM_POINTS);
        // First input: to-play plane set; second: all zeros.
        let first: f32 = features[..17 * NUM_POINTS].iter().sum();
        let second: f32 = features[17 * NUM_POINTS..].iter().sum();
        assert_eq!(first, NUM_POINTS as f32);
        assert_eq!(second, 0.0);
    }
}
