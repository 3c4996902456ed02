//! Block points, the only safety mechanism in the model.
//!
//! A block point sits at a position on an edge and seals travel in one or
//! both directions. Train scopes brake for foreign block points ahead of
//! them; switches and bumpers seal their unavailable edges with them.

use super::position::Position;
use super::types::{BlockDirection, BlockPointId, Direction};

#[derive(Debug, Clone, PartialEq)]
pub struct BlockPoint {
    pub id: BlockPointId,
    pub blocked: BlockDirection,
    pub position: Position,
}

impl BlockPoint {
    pub(crate) fn new(id: BlockPointId, blocked: BlockDirection, position: Position) -> Self {
        Self {
            id,
            blocked,
            position,
        }
    }

    /// Whether a traversal in `direction` over this point's edge is sealed.
    pub fn obstructs(&self, direction: Direction) -> bool {
        match self.blocked {
            BlockDirection::All => true,
            BlockDirection::Positive => direction == Direction::Positive,
            BlockDirection::Negative => direction == Direction::Negative,
        }
    }
}
