//! Packed stone representation.

use crate::color::Color;
use crate::group::GroupId;

/// Either a stone on the board or, when `is_empty() == true`, an empty point.
///
/// Packed into 16 bits: the low 2 bits hold the color, the high 14 bits hold
/// the id of the group the stone belongs to. An empty point is all-zero.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Stone(u16);

impl Stone {
    #[inline]
    pub fn new(color: Color, group_id: GroupId) -> Stone {
        debug_assert!(color != Color::Empty);
        Stone(color as u16 | (group_id << 2))
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn color(self) -> Color {
        Color::from_u8((self.0 & 3) as u8)
    }

    #[inline]
    pub fn group_id(self) -> GroupId {
        self.0 >> 2
    }
}

impl std::fmt::Debug for Stone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "Stone(empty)")
        } else {
            write!(f, "Stone({} g{})", self.color(), self.group_id())
        }
    }
}
