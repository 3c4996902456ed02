//! Positions on the track graph and walks across it.
//!
//! A [`Position`] is an edge id plus an offset along the edge's stored
//! orientation. Construction normalizes out-of-range offsets across edge
//! boundaries, so a held position is always inside its edge. [`EdgeWalk`]
//! enumerates successive edges from a position or an edge, flipping its
//! direction whenever the next edge is oriented against the walk.

use ordered_float::OrderedFloat;

use super::network::{Edge, Network};
use super::types::{Direction, EdgeId, ModelError};

use std::sync::Arc;

/// Step budget for a single normalization; exceeding it means the graph is
/// degenerate (e.g. a ring of zero-progress boundary hops).
const MAX_NORMALIZE_STEPS: usize = 1024;

/// Step budget for a single walk; long enough for any sane layout.
const MAX_WALK_STEPS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub edge: EdgeId,
    pub offset: f64,
}

impl Position {
    /// Builds a position, pulling an out-of-range offset across edge
    /// boundaries until it lands inside an edge. At a dead end or in front
    /// of a switch set against the motion the offset clamps at the boundary
    /// (biased inward by epsilon on the far end).
    pub fn new(net: &Network, edge: EdgeId, offset: f64) -> Result<Self, ModelError> {
        let mut position = Self { edge, offset };
        position.normalize(net)?;
        Ok(position)
    }

    /// This position shifted by `delta` along the stored orientation,
    /// normalized across boundaries.
    pub fn shifted(&self, net: &Network, delta: f64) -> Result<Self, ModelError> {
        Position::new(net, self.edge, self.offset + delta)
    }

    fn normalize(&mut self, net: &Network) -> Result<(), ModelError> {
        let eps = net.config().epsilon;
        for _ in 0..MAX_NORMALIZE_STEPS {
            let edge = net.edge(self.edge)?;
            if self.offset >= 0.0 && self.offset < edge.length {
                return Ok(());
            }
            if self.offset < 0.0 {
                match net.previous_edge(&edge) {
                    Some(prev) if prev.first_node == edge.first_node => {
                        // The neighbor points away from us; mirror.
                        self.offset = -self.offset;
                        self.edge = prev.id;
                    }
                    Some(prev) if prev.second_node == edge.first_node => {
                        self.offset += prev.length - eps;
                        self.edge = prev.id;
                    }
                    _ => {
                        self.offset = 0.0;
                        return Ok(());
                    }
                }
            } else {
                match net.next_edge(&edge) {
                    Some(next) if next.first_node == edge.second_node => {
                        self.offset -= edge.length;
                        self.edge = next.id;
                    }
                    Some(next) if next.second_node == edge.second_node => {
                        // The neighbor points towards us; mirror from its
                        // far end.
                        self.offset = next.length - (self.offset - edge.length) - eps;
                        self.edge = next.id;
                    }
                    _ => {
                        self.offset = edge.length - eps;
                        return Ok(());
                    }
                }
            }
        }
        Err(ModelError::WalkDiverged)
    }

    pub fn is_valid(&self, net: &Network) -> bool {
        match net.edge(self.edge) {
            Ok(edge) => self.offset >= 0.0 && self.offset < edge.length,
            Err(_) => false,
        }
    }

    /// Whether two normalized positions denote the same point.
    pub fn coincides(&self, net: &Network, other: &Position) -> bool {
        self.edge == other.edge && (self.offset - other.offset).abs() < net.config().epsilon
    }

    /// Directed distance from this position to `other`, walking in
    /// `direction` relative to this edge's orientation. Returns `None` when
    /// `other` is not reachable within `border` model meters.
    pub fn distance_to(
        &self,
        net: &Network,
        other: &Position,
        border: f64,
        direction: Direction,
    ) -> Option<f64> {
        let eps = net.config().epsilon;
        let mut other_is_behind = false;
        if self.edge == other.edge {
            match direction {
                Direction::Positive if self.offset <= other.offset => {
                    return Some(other.offset - self.offset);
                }
                Direction::Negative if other.offset <= self.offset => {
                    return Some(self.offset - other.offset);
                }
                // Same edge but behind us: only a full loop reaches it.
                _ => other_is_behind = true,
            }
        }
        let other_length = net.edge(other.edge).ok()?.length;
        let mut walk = EdgeWalk::from_position(net, self, direction).ok()?;
        let mut current = walk.next()?;
        let mut found = None;
        while current.accumulated <= border + other_length + eps {
            if current.edge.id == other.edge && !other_is_behind {
                let mut length = current.accumulated;
                match current.direction {
                    Direction::Positive => length += other.offset - other_length,
                    Direction::Negative => length -= other.offset,
                }
                found = Some(length);
                break;
            }
            current = walk.next()?;
            other_is_behind = false;
        }
        found.filter(|length| *length <= border + eps)
    }

    /// Shortest undirected distance to `other` within `border`.
    pub fn distance_to_either(&self, net: &Network, other: &Position, border: f64) -> Option<f64> {
        if self.edge == other.edge {
            return Some((self.offset - other.offset).abs());
        }
        let forward = self.distance_to(net, other, border, Direction::Positive);
        let backward = self.distance_to(net, other, border, Direction::Negative);
        forward
            .into_iter()
            .chain(backward)
            .map(OrderedFloat)
            .min()
            .map(|d| d.0)
    }
}

/// One edge of a walk: the edge, the direction it is traversed in, and the
/// distance from the walk origin to the edge's far end.
pub struct WalkStep {
    pub edge: Arc<Edge>,
    pub direction: Direction,
    pub accumulated: f64,
}

/// Iterator over successive edges of the graph.
///
/// The walk ends at an unbound node, in front of a switch set against the
/// motion, when the next edge does not link back to the current one, or
/// when the step budget runs out.
pub struct EdgeWalk<'a> {
    net: &'a Network,
    current: Option<Arc<Edge>>,
    direction: Direction,
    accumulated: f64,
    steps: usize,
}

impl<'a> EdgeWalk<'a> {
    /// Walk starting on a whole edge; the first step accumulates its full
    /// length.
    pub fn from_edge(net: &'a Network, edge: Arc<Edge>, direction: Direction) -> Self {
        let accumulated = edge.length;
        Self {
            net,
            current: Some(edge),
            direction,
            accumulated,
            steps: 0,
        }
    }

    /// Walk starting at a position; the first step accumulates only the
    /// remaining length on the start edge.
    pub fn from_position(
        net: &'a Network,
        position: &Position,
        direction: Direction,
    ) -> Result<Self, ModelError> {
        let edge = net.edge(position.edge)?;
        let accumulated = match direction {
            Direction::Positive => edge.length - position.offset,
            Direction::Negative => position.offset,
        };
        Ok(Self {
            net,
            current: Some(edge),
            direction,
            accumulated,
            steps: 0,
        })
    }

    pub fn has_next(&self) -> bool {
        self.current.is_some()
    }

    fn links_back(&self, next: &Edge, current: &Edge) -> bool {
        if let Some(onward) = self.net.next_edge(next) {
            if onward.id == current.id {
                return true;
            }
        }
        if let Some(backward) = self.net.previous_edge(next) {
            if backward.id == current.id {
                return true;
            }
        }
        false
    }

    /// Direction the walk continues in on `next`: away from the boundary it
    /// shares with `current`.
    fn continuation_direction(&self, next: &Edge, current: &Edge) -> Direction {
        let mut direction = Direction::Negative;
        if let Some(onward) = self.net.next_edge(next) {
            if onward.id == current.id {
                direction = Direction::Negative;
            }
        }
        if let Some(backward) = self.net.previous_edge(next) {
            if backward.id == current.id {
                direction = Direction::Positive;
            }
        }
        direction
    }
}

impl Iterator for EdgeWalk<'_> {
    type Item = WalkStep;

    fn next(&mut self) -> Option<WalkStep> {
        let edge = self.current.take()?;
        let step = WalkStep {
            edge: edge.clone(),
            direction: self.direction,
            accumulated: self.accumulated,
        };
        self.steps += 1;
        if self.steps < MAX_WALK_STEPS {
            let next = match self.direction {
                Direction::Positive => self.net.next_edge(&edge),
                Direction::Negative => self.net.previous_edge(&edge),
            };
            if let Some(next) = next {
                // Asymmetric links happen at switches: the branch continues
                // onto the stem, but the stem currently runs to the other
                // branch. The walk must not cross there.
                if self.links_back(&next, &edge) {
                    self.direction = self.continuation_direction(&next, &edge);
                    self.accumulated += next.length;
                    self.current = Some(next);
                }
            }
        }
        Some(step)
    }
}
