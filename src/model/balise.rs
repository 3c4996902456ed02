//! Balises: fixed reference points that correct dead-reckoning drift.
//!
//! A balise sits at a known position and is triggered when a vehicle's
//! reader passes over it. The trigger handler searches the vicinity for
//! the vehicle that most plausibly caused it and snaps that vehicle onto
//! the balise.

use std::collections::HashSet;

use super::network::Network;
use super::position::{EdgeWalk, Position};
use super::types::{Direction, EdgeId, ModelError};

#[derive(Debug, Clone)]
pub struct Balise {
    pub address: u16,
    pub position: Position,
}

/// Search radius around a balise trigger.
///
/// At least the tolerance distance; near an edge boundary the radius
/// widens up to twice that so the search still reaches across the
/// boundary the causing vehicle may have just crossed.
pub(crate) fn search_radius(net: &Network, position: &Position) -> Result<f64, ModelError> {
    let edge = net.edge(position.edge)?;
    let tolerance = net.config().tolerance_distance;
    let farther_end = position.offset.max(edge.length - position.offset);
    Ok(tolerance.max((2.0 * tolerance).min(farther_end)))
}

/// All edges within `radius` of `position`, walking both ways.
pub(crate) fn edges_in_region(
    net: &Network,
    position: &Position,
    radius: f64,
) -> Result<HashSet<EdgeId>, ModelError> {
    let mut edges = HashSet::new();
    edges.insert(position.edge);
    for direction in [Direction::Positive, Direction::Negative] {
        let mut walk = EdgeWalk::from_position(net, position, direction)?;
        let mut step = match walk.next() {
            Some(step) => step,
            None => continue,
        };
        while step.accumulated < radius && walk.has_next() {
            edges.insert(step.edge.id);
            step = match walk.next() {
                Some(step) => step,
                None => break,
            };
        }
        edges.insert(step.edge.id);
    }
    Ok(edges)
}
