//! Core types for the railway model
//!
//! Typed ids for every arena entity, direction conventions, and the
//! immutable process configuration.

use thiserror::Error;

/// A wrapper type for node ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// A wrapper type for edge ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

/// A wrapper type for track-segment ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub usize);

/// A wrapper type for block-point ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPointId(pub usize);

/// A wrapper type for vehicle ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VehicleId(pub usize);

/// A wrapper type for train-scope ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub usize);

/// Travel direction relative to an edge's stored orientation.
///
/// `Positive` runs from the edge's first node towards its second node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Positive => Direction::Negative,
            Direction::Negative => Direction::Positive,
        }
    }
}

/// The direction(s) a block point seals against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockDirection {
    Positive,
    Negative,
    All,
}

/// The branch a switch is currently set to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchBranch {
    Left,
    Right,
}

impl SwitchBranch {
    pub fn other(self) -> SwitchBranch {
        match self {
            SwitchBranch::Left => SwitchBranch::Right,
            SwitchBranch::Right => SwitchBranch::Left,
        }
    }
}

/// Immutable process configuration, supplied once at startup and passed to
/// constructors instead of living in global mutable state.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Model scale factor (real meters per model meter), e.g. 160 for N gauge
    pub scale: f64,
    /// Tolerance distance in model meters, used as the brake-curve standoff
    /// and as the proximity-search radius
    pub tolerance_distance: f64,
    /// Position comparison tolerance in model meters
    pub epsilon: f64,
    /// Number of discrete commandable DCC speed levels
    pub speed_steps: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            scale: 160.0,
            tolerance_distance: 0.3,
            epsilon: 1e-7,
            speed_steps: 128,
        }
    }
}

/// Errors raised by the railway model.
///
/// Structural violations (corrupt scope geometry, diverged walks, missing
/// arena entries) are fatal for the affected operation and halt a running
/// control loop. Operational rejections (busy switch, moving scope, loop
/// already running) are expected and recoverable.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("node {0:?} is already bound to two track segments")]
    NodeAlreadyBound(NodeId),
    #[error("node {0:?} is still bound to a track segment")]
    NodeInUse(NodeId),
    #[error("segment {0:?} is not a switch")]
    NotASwitch(SegmentId),
    #[error("the active branch of switch {0:?} is occupied")]
    SwitchBusy(SegmentId),
    #[error("a train scope still occupies segment {0:?}")]
    SegmentOccupied(SegmentId),
    #[error("train scope {0:?} already runs a control loop")]
    AlreadyRunning(ScopeId),
    #[error("cannot invert the direction of a moving train scope")]
    MovingScope,
    #[error("coupling and decoupling of train scopes is not supported")]
    CouplingUnsupported,
    #[error("train scope {0:?} holds more than one vehicle")]
    ScopeNotSingleton(ScopeId),
    #[error("positional information of train scope {0:?} is inconsistent")]
    InvalidScope(ScopeId),
    #[error("graph walk exceeded its step budget")]
    WalkDiverged,
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("unknown edge {0:?}")]
    UnknownEdge(EdgeId),
    #[error("unknown segment {0:?}")]
    UnknownSegment(SegmentId),
    #[error("unknown train scope {0:?}")]
    UnknownScope(ScopeId),
    #[error("no vehicle with index {0} in this train scope")]
    UnknownVehicle(usize),
    #[error("no balise with address {0}")]
    UnknownBalise(u16),
}
