//! The railway model: track topology, positions, train scopes, balises.

pub mod balise;
pub mod block_point;
pub mod network;
pub mod position;
pub mod railway;
pub mod scope;
pub mod types;
pub mod vehicle;

pub use balise::Balise;
pub use block_point::BlockPoint;
pub use network::{Edge, Network, Node, Segment, SegmentKind};
pub use position::{EdgeWalk, Position, WalkStep};
pub use railway::Railway;
pub use scope::{ScopeStatus, TrainScope};
pub use types::{
    BlockDirection, BlockPointId, Direction, EdgeId, ModelConfig, ModelError, NodeId, ScopeId,
    SegmentId, SwitchBranch, VehicleId,
};
pub use vehicle::{LocomotiveState, SpeedProfile, Vehicle, VehicleKind};
