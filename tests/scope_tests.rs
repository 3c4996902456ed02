//! Train scope behavior: bracketing, speed control, braking, switches.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rail_control::hardware::{Command, ControlUnit, MockControlUnit};
use rail_control::model::scope::{
    acceleration_distance, brake_curve_speed, BRAKE_ACCELERATION, DRIVE_ACCELERATION,
};
use rail_control::model::{
    BlockDirection, Direction, EdgeId, ModelConfig, ModelError, Position, Railway, ScopeStatus,
    SegmentId, SwitchBranch, TrainScope,
};
use rail_control::store::MemoryStore;

const DT: f64 = 0.1;

fn railway() -> (Railway, Arc<MockControlUnit>) {
    let control = Arc::new(MockControlUnit::new());
    let railway = Railway::new(
        ModelConfig::default(),
        control.clone(),
        Arc::new(MemoryStore::new()),
    );
    (railway, control)
}

fn ring(railway: &Railway, max_speed: f64) -> Vec<SegmentId> {
    let net = railway.network();
    let nodes: Vec<_> = (0..5).map(|_| net.add_node()).collect();
    (0..5)
        .map(|i| {
            net.add_track(nodes[i], nodes[(i + 1) % 5], 1.0, max_speed)
                .unwrap()
        })
        .collect()
}

fn edge_of(railway: &Railway, segment: SegmentId) -> EdgeId {
    railway.network().segment(segment).unwrap().current_edge()
}

#[test]
fn scope_brackets_its_vehicle() {
    let (railway, _) = railway();
    let tracks = ring(&railway, 50.0);
    let net = railway.network().clone();
    let edge = edge_of(&railway, tracks[0]);

    let start = Position::new(&net, edge, 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    let front = scope.front();
    let back = scope.back();
    assert_eq!(front.position.edge, edge);
    assert!((front.position.offset - 0.55).abs() < 1e-9);
    assert_eq!(front.blocked, BlockDirection::Negative);
    assert_eq!(back.position.edge, edge);
    assert!((back.position.offset - 0.45).abs() < 1e-9);
    assert_eq!(back.blocked, BlockDirection::Positive);

    // Standing still, everything from the brake-curve front to the back
    // fits on the starting edge.
    assert_eq!(scope.entered_edges().len(), 1);
    assert!(scope.entered_edges().contains(&edge));
    assert!(scope.check_valid(&net));
}

#[test]
fn train_accelerates_up_to_the_edge_limit() {
    let (railway, control) = railway();
    let tracks = ring(&railway, 8.0);
    let net = railway.network().clone();
    let start = Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    let limit = 8.0 / 160.0;
    // From rest, one tick gains exactly one acceleration step.
    let first = scope.tick(&net, control.as_ref(), DT).unwrap();
    let step = (DRIVE_ACCELERATION * DT / 160.0).min(160.0 / 160.0);
    assert!((first - step).abs() < 1e-12, "first tick gave {}", first);

    let mut previous = first;
    for _ in 0..400 {
        let speed = scope.tick(&net, control.as_ref(), DT).unwrap();
        // Acceleration-limited ramp, then flat at the edge limit.
        assert!(speed + 1e-12 >= previous);
        assert!(speed <= limit + 1e-9);
        previous = speed;
    }
    assert!((scope.current_speed() - limit).abs() < 0.002);
    assert!(scope.check_valid(&net));
}

#[test]
fn train_stops_short_of_a_block_point() {
    let (railway, control) = railway();
    let tracks = ring(&railway, 50.0);
    let net = railway.network().clone();
    let t2 = edge_of(&railway, tracks[1]);
    let stop = Position::new(&net, t2, 0.5).unwrap();
    net.create_block_point(BlockDirection::All, stop).unwrap();

    let start = Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    for _ in 0..600 {
        scope.tick(&net, control.as_ref(), DT).unwrap();
    }

    // The train creeps to a halt one tolerance distance short of the
    // block point and never reaches it.
    assert!(scope.current_speed() < 0.02);
    let front = scope.front();
    assert_eq!(front.position.edge, t2);
    assert!(front.position.offset < 0.21, "front at {}", front.position.offset);
    assert!(front.position.offset > 0.1);
    assert!(scope.check_valid(&net));
}

#[test]
fn train_stops_behind_a_standing_wagon() {
    let (railway, control) = railway();
    let tracks = ring(&railway, 50.0);
    let net = railway.network().clone();
    let t3 = edge_of(&railway, tracks[2]);

    let wagon_middle = Position::new(&net, t3, 0.5).unwrap();
    railway
        .spawn_wagon("flat car", 0.2, 80.0, wagon_middle, Direction::Positive)
        .unwrap();

    let start = Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    for _ in 0..600 {
        scope.tick(&net, control.as_ref(), DT).unwrap();
    }

    // The wagon's back block point sits at 0.4; the train halts one
    // tolerance distance before it.
    assert!(scope.current_speed() < 0.02);
    let front = scope.front();
    assert_eq!(front.position.edge, t3);
    assert!(front.position.offset < 0.11, "front at {}", front.position.offset);
    assert!(scope.check_valid(&net));
}

#[test]
fn occupied_switch_rejects_a_throw() {
    let (railway, _) = railway();
    let net = railway.network().clone();
    let a = net.add_node();
    let b = net.add_node();
    let l = net.add_node();
    let r = net.add_node();
    let approach = net.add_track(a, b, 1.0, 50.0).unwrap();
    let switch = net.add_switch(b, l, r, 1.0, 1.0, 50.0, 50.0).unwrap();

    // The brake-curve front reaches past the switch onto the active
    // branch, so the scope occupies it.
    let start = Position::new(&net, edge_of(&railway, approach), 0.9).unwrap();
    railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();

    assert!(!net.switch_possible(switch).unwrap());
    match net.switch_track(switch) {
        Err(ModelError::SwitchBusy(id)) => assert_eq!(id, switch),
        other => panic!("expected SwitchBusy, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn clear_switch_throws_and_commands_the_station() {
    let (railway, control) = railway();
    let net = railway.network().clone();
    let a = net.add_node();
    let b = net.add_node();
    let l = net.add_node();
    let r = net.add_node();
    let approach = net.add_track(a, b, 1.0, 50.0).unwrap();
    let switch = net.add_switch(b, l, r, 1.0, 1.0, 50.0, 50.0).unwrap();

    // The whole scope, brake curve included, stays on the approach track.
    let start = Position::new(&net, edge_of(&railway, approach), 0.3).unwrap();
    railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();

    assert!(net.switch_possible(switch).unwrap());
    let branch = railway.throw_switch(switch).unwrap();
    assert_eq!(branch, SwitchBranch::Right);
    assert!(control
        .commands()
        .contains(&Command::Switch(switch, SwitchBranch::Right)));
}

#[test]
fn train_on_the_inactive_branch_drives_off_outward() {
    let (railway, control) = railway();
    let net = railway.network().clone();
    let a = net.add_node();
    let b = net.add_node();
    let l = net.add_node();
    let r = net.add_node();
    let d = net.add_node();
    net.add_track(a, b, 1.0, 50.0).unwrap();
    let switch = net.add_switch(b, l, r, 1.0, 1.0, 50.0, 50.0).unwrap();
    let exit = net.add_track(r, d, 50.0, 50.0).unwrap();

    // Left starts active, so the right branch carries the seal. A train
    // standing on it and facing away from the switch is not sealed in.
    let right_branch = net.segment(switch).unwrap().edges()[1];
    let start = Position::new(&net, right_branch, 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    for _ in 0..300 {
        scope.tick(&net, control.as_ref(), DT).unwrap();
    }
    assert!(scope.current_speed() > 0.05, "train stuck behind its own seal");
    assert_eq!(scope.front().position.edge, edge_of(&railway, exit));
    assert!(scope.check_valid(&net));
}

#[test]
fn standing_train_inverts_its_direction() {
    let (railway, control) = railway();
    let tracks = ring(&railway, 50.0);
    let net = railway.network().clone();
    let edge = edge_of(&railway, tracks[0]);
    let start = Position::new(&net, edge, 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    scope.invert_direction(&net).unwrap();
    let front = scope.front();
    assert_eq!(front.blocked, BlockDirection::Positive);
    assert!((front.position.offset - 0.45).abs() < 1e-9);
    assert!(scope.check_valid(&net));

    // Driving now moves the front the other way along the edge.
    scope.tick(&net, control.as_ref(), DT).unwrap();
    scope.tick(&net, control.as_ref(), DT).unwrap();
    assert!(scope.front().position.offset < 0.45);
}

#[test]
fn moving_train_refuses_to_invert() {
    let (railway, control) = railway();
    let tracks = ring(&railway, 50.0);
    let net = railway.network().clone();
    let start = Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    for _ in 0..10 {
        scope.tick(&net, control.as_ref(), DT).unwrap();
    }
    assert!(scope.current_speed() > 0.0);
    assert!(matches!(
        scope.invert_direction(&net),
        Err(ModelError::MovingScope)
    ));
}

#[test]
fn coupling_is_rejected() {
    let (railway, _) = railway();
    let tracks = ring(&railway, 50.0);
    let net = railway.network().clone();
    let a = Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap();
    let b = Position::new(&net, edge_of(&railway, tracks[2]), 0.5).unwrap();
    let first = railway
        .spawn_locomotive("br185", 0.1, 160.0, a, Direction::Positive, 185)
        .unwrap();
    let second = railway
        .spawn_wagon("flat car", 0.2, 80.0, b, Direction::Positive)
        .unwrap();
    let first = railway.scope(first).unwrap();
    let second = railway.scope(second).unwrap();

    assert!(matches!(
        TrainScope::couple(&first, &second),
        Err(ModelError::CouplingUnsupported)
    ));
    assert!(matches!(
        first.decouple(0),
        Err(ModelError::CouplingUnsupported)
    ));
}

#[test]
fn removing_a_scope_releases_the_track() {
    let (railway, _) = railway();
    let tracks = ring(&railway, 50.0);
    let net = railway.network().clone();
    let edge_id = edge_of(&railway, tracks[0]);
    let start = Position::new(&net, edge_id, 0.5).unwrap();
    let id = railway
        .spawn_wagon("flat car", 0.2, 80.0, start, Direction::Positive)
        .unwrap();

    let edge = net.edge(edge_id).unwrap();
    assert!(edge.is_occupied());
    assert!(!edge.block_points().is_empty());

    railway.remove_scope(id).unwrap();
    assert!(!edge.is_occupied());
    assert!(edge.block_points().is_empty());
    assert!(railway.scope(id).is_err());
}

#[test]
fn speed_feedback_overrides_dead_reckoning() {
    let (railway, _) = railway();
    let tracks = ring(&railway, 50.0);
    let net = railway.network().clone();
    let start = Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    railway.apply_speed_feedback(185, 10).unwrap();
    // Linear default profile: level 10 is 9 * 3 real m/s, scaled.
    let expected = 9.0 * 3.0 / 160.0;
    assert!((scope.current_speed() - expected).abs() < 1e-9);
}

#[test]
fn tick_commands_the_lowest_level_reaching_the_computed_speed() {
    let (railway, control) = railway();
    let tracks = ring(&railway, 50.0);
    let net = railway.network().clone();
    let start = Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    let mut speed = 0.0;
    for _ in 0..50 {
        speed = scope.tick(&net, control.as_ref(), DT).unwrap();
    }
    let commanded = control.speed(185).unwrap();
    let vehicles = scope.vehicles();
    let profile = &vehicles[0].locomotive().unwrap().profile;
    // Rounded up: the commanded level reaches the computed speed, and
    // the level below it does not.
    assert!(speed > 0.0);
    assert!(commanded > 0);
    assert!(profile.speed_at(commanded) + 1e-12 >= speed);
    assert!(profile.speed_at(commanded - 1) < speed);
    assert!(commanded < profile.levels());
}

#[test]
fn decoder_feedback_loop_gets_the_train_moving() {
    let (railway, control) = railway();
    let tracks = ring(&railway, 8.0);
    let net = railway.network().clone();
    let start = Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    // Close the loop the station does: every commanded level is echoed
    // back and adopted as the modeled speed. The reconciled speed must
    // not pin the train at the zero levels of the profile.
    for _ in 0..200 {
        scope.tick(&net, control.as_ref(), DT).unwrap();
        let level = control.speed(185).unwrap();
        railway.apply_speed_feedback(185, level).unwrap();
    }
    assert!(scope.current_speed() > 0.01, "train never started moving");
    let front = scope.front();
    assert!(
        front.position.edge != edge_of(&railway, tracks[0]) || (front.position.offset - 0.55).abs() > 0.1,
        "front never left its starting position"
    );
    assert!(scope.check_valid(&net));
}

#[test]
fn control_loop_runs_and_stops() {
    let (railway, _) = railway();
    let tracks = ring(&railway, 50.0);
    let net = railway.network().clone();
    let start = Position::new(&net, edge_of(&railway, tracks[0]), 0.5).unwrap();
    let id = railway
        .spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, 185)
        .unwrap();
    let scope = railway.scope(id).unwrap();

    railway.start_all().unwrap();
    assert!(scope.is_running());
    thread::sleep(Duration::from_millis(400));
    assert!(scope.current_speed() > 0.0);

    railway.stop_all();
    assert!(!scope.is_running());
    assert_eq!(scope.status(), ScopeStatus::Stopped);
    assert!(scope.check_valid(&net));
}

#[test]
fn brake_curve_math_is_consistent() {
    let scale = 160.0;
    // Longer braking distances admit higher entry speeds.
    let mut previous = 0.0;
    for step in 1..20 {
        let speed = brake_curve_speed(step as f64 * 0.1, 0.0, BRAKE_ACCELERATION, scale);
        assert!(speed > previous);
        previous = speed;
    }
    // The distance needed to brake from a speed admits exactly that
    // speed again.
    for step in 1..10 {
        let speed = step as f64 * 0.02;
        let distance = acceleration_distance(speed, 0.0, BRAKE_ACCELERATION, scale);
        let back = brake_curve_speed(distance, 0.0, BRAKE_ACCELERATION, scale);
        assert!((back - speed).abs() < 1e-9);
    }
    // Zero or negative distance falls through to the bypass speed.
    assert_eq!(brake_curve_speed(0.0, 0.25, BRAKE_ACCELERATION, scale), 0.25);
}
