//! Balise triggers and dead-reckoning correction.

use std::sync::Arc;

use rail_control::hardware::MockControlUnit;
use rail_control::model::{
    Direction, EdgeId, ModelConfig, ModelError, Position, Railway, SegmentId,
};
use rail_control::store::MemoryStore;

fn railway() -> Railway {
    Railway::new(
        ModelConfig::default(),
        Arc::new(MockControlUnit::new()),
        Arc::new(MemoryStore::new()),
    )
}

fn ring(railway: &Railway) -> Vec<SegmentId> {
    let net = railway.network();
    let nodes: Vec<_> = (0..5).map(|_| net.add_node()).collect();
    (0..5)
        .map(|i| {
            net.add_track(nodes[i], nodes[(i + 1) % 5], 1.0, 50.0)
                .unwrap()
        })
        .collect()
}

fn edge_of(railway: &Railway, segment: SegmentId) -> EdgeId {
    railway.network().segment(segment).unwrap().current_edge()
}

#[test]
fn trigger_snaps_the_vehicle_forward_onto_the_balise() {
    let railway = railway();
    let tracks = ring(&railway);
    let net = railway.network().clone();
    let edge = edge_of(&railway, tracks[0]);

    let start = Position::new(&net, edge, 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let balise = Position::new(&net, edge, 0.53).unwrap();
    railway.add_balise(7, balise);

    let corrected = railway.trigger_balise(7).unwrap();
    assert_eq!(corrected, Some(id));

    let scope = railway.scope(id).unwrap();
    let middle = scope.vehicles()[0].middle;
    assert_eq!(middle.edge, edge);
    assert!((middle.offset - 0.53).abs() < 1e-6);
    assert!(scope.check_valid(&net));
}

#[test]
fn trigger_snaps_the_vehicle_backward_onto_the_balise() {
    let railway = railway();
    let tracks = ring(&railway);
    let net = railway.network().clone();
    let edge = edge_of(&railway, tracks[0]);

    let start = Position::new(&net, edge, 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    railway.add_balise(7, Position::new(&net, edge, 0.4).unwrap());

    railway.trigger_balise(7).unwrap();

    let scope = railway.scope(id).unwrap();
    let middle = scope.vehicles()[0].middle;
    assert_eq!(middle.edge, edge);
    assert!((middle.offset - 0.4).abs() < 1e-6);
    // The corrected scope still faces the same way.
    assert_eq!(
        scope.front().blocked,
        rail_control::model::BlockDirection::Negative
    );
    assert!(scope.check_valid(&net));
}

#[test]
fn trigger_reaches_across_an_edge_boundary() {
    let railway = railway();
    let tracks = ring(&railway);
    let net = railway.network().clone();
    let t1 = edge_of(&railway, tracks[0]);
    let t2 = edge_of(&railway, tracks[1]);

    // The vehicle has drifted onto the next edge; the widened search
    // radius near the boundary still finds it.
    let start = Position::new(&net, t2, 0.2).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    railway.add_balise(7, Position::new(&net, t1, 0.95).unwrap());

    let corrected = railway.trigger_balise(7).unwrap();
    assert_eq!(corrected, Some(id));

    let scope = railway.scope(id).unwrap();
    let middle = scope.vehicles()[0].middle;
    assert_eq!(middle.edge, t1);
    assert!((middle.offset - 0.95).abs() < 1e-6);
    assert!(scope.check_valid(&net));
}

#[test]
fn trigger_without_a_nearby_vehicle_is_dropped() {
    let railway = railway();
    let tracks = ring(&railway);
    let net = railway.network().clone();

    let start = Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap();
    let before = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .map(|id| railway.scope(id).unwrap().vehicles()[0].middle)
        .unwrap();
    railway.add_balise(7, Position::new(&net, edge_of(&railway, tracks[2]), 0.5).unwrap());

    assert_eq!(railway.trigger_balise(7).unwrap(), None);
    // Nothing moved.
    let after = railway.scopes()[0].vehicles()[0].middle;
    assert_eq!(before.edge, after.edge);
    assert_eq!(before.offset, after.offset);
}

#[test]
fn unknown_balise_address_is_an_error() {
    let railway = railway();
    ring(&railway);
    assert!(matches!(
        railway.trigger_balise(99),
        Err(ModelError::UnknownBalise(99))
    ));
}

#[test]
fn balises_can_be_removed() {
    let railway = railway();
    let tracks = ring(&railway);
    let net = railway.network().clone();
    railway.add_balise(7, Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap());

    railway.remove_balise(7).unwrap();
    assert!(matches!(
        railway.trigger_balise(7),
        Err(ModelError::UnknownBalise(7))
    ));
    assert!(matches!(
        railway.remove_balise(7),
        Err(ModelError::UnknownBalise(7))
    ));
}
