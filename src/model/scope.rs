//! Train scopes: coupled vehicle groups and their control loops.
//!
//! A scope owns the vehicles of one train, brackets them between a front
//! and a back block point, and maintains a brake-curve front block point
//! ahead of the train that other trains brake for. The control loop dead
//! reckons the front forward, re-derives everything else from it, computes
//! the admissible speed and commands the locomotives.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::hardware::ControlUnit;

use super::block_point::BlockPoint;
use super::network::Network;
use super::position::{EdgeWalk, Position, WalkStep};
use super::types::{BlockDirection, Direction, EdgeId, ModelError, ScopeId};
use super::vehicle::Vehicle;

/// Service braking deceleration in real meters per second squared.
pub const BRAKE_ACCELERATION: f64 = 0.7;
/// Traction acceleration in real meters per second squared.
pub const DRIVE_ACCELERATION: f64 = 0.5;
/// Control loop period.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Per-vehicle step budget when matching vehicles to walk edges; a single
/// vehicle spanning more edges than this means corrupt geometry.
const VEHICLE_SPAN_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    Ready,
    Running,
    Stopped,
}

/// Speed reachable at the start of a braking distance `distance` that ends
/// at `bypass_speed`, all in model meters (per second); the physics runs in
/// real units via `scale`.
pub fn brake_curve_speed(distance: f64, bypass_speed: f64, deceleration: f64, scale: f64) -> f64 {
    if distance <= 0.0 {
        return bypass_speed;
    }
    let real_distance = distance * scale;
    let real_end = bypass_speed * scale;
    (2.0 * real_distance * deceleration + real_end * real_end).sqrt() / scale
}

/// Distance needed to change between two model speeds at `acceleration`,
/// in model meters.
pub fn acceleration_distance(speed: f64, start_speed: f64, acceleration: f64, scale: f64) -> f64 {
    if speed <= start_speed {
        return 0.0;
    }
    let real = speed * scale;
    let real_start = start_speed * scale;
    0.5 * ((real * real - real_start * real_start) / acceleration) / scale
}

fn blocked_against(travel: Direction) -> BlockDirection {
    match travel {
        Direction::Positive => BlockDirection::Negative,
        Direction::Negative => BlockDirection::Positive,
    }
}

struct ScopeState {
    status: ScopeStatus,
    front: BlockPoint,
    back: BlockPoint,
    brake_curve_front: BlockPoint,
    /// Front to back
    vehicles: Vec<Vehicle>,
    entered: HashSet<EdgeId>,
    /// Model meters per second
    current_speed: f64,
}

pub struct TrainScope {
    pub id: ScopeId,
    state: Mutex<ScopeState>,
    alive: AtomicBool,
    shutdown: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TrainScope {
    /// Builds a scope around a single vehicle. `facing` points from the
    /// vehicle's middle towards its front, relative to the middle edge's
    /// orientation.
    pub fn around(
        net: &Network,
        id: ScopeId,
        vehicle: Vehicle,
        facing: Direction,
    ) -> Result<TrainScope, ModelError> {
        let half = vehicle.length / 2.0;
        let delta = match facing {
            Direction::Positive => half,
            Direction::Negative => -half,
        };
        let front_position = vehicle.middle.shifted(net, delta)?;
        let mut walk = EdgeWalk::from_position(net, &vehicle.middle, facing)?;
        let mut step = walk.next().ok_or(ModelError::InvalidScope(id))?;
        let mut guard = 0;
        while step.edge.id != front_position.edge {
            step = walk.next().ok_or(ModelError::InvalidScope(id))?;
            guard += 1;
            if guard >= VEHICLE_SPAN_LIMIT {
                return Err(ModelError::InvalidScope(id));
            }
        }
        let front = net.create_block_point(blocked_against(step.direction), front_position)?;
        // Back and brake-curve front start as stand-ins at the front; the
        // organise pass below derives the real ones.
        let back = net.create_block_point(front.blocked, front.position)?;
        let brake_curve_front = net.create_block_point(front.blocked, front.position)?;

        let scope = TrainScope {
            id,
            state: Mutex::new(ScopeState {
                status: ScopeStatus::Ready,
                front: front.clone(),
                back,
                brake_curve_front,
                vehicles: vec![vehicle],
                entered: HashSet::new(),
                current_speed: 0.0,
            }),
            alive: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
        };
        {
            let mut state = scope.state.lock().unwrap();
            scope.organise(net, &mut state, front)?;
        }
        debug!("created train scope {:?}", id);
        Ok(scope)
    }

    fn travel_direction(&self, front: &BlockPoint) -> Result<Direction, ModelError> {
        match front.blocked {
            BlockDirection::Negative => Ok(Direction::Positive),
            BlockDirection::Positive => Ok(Direction::Negative),
            BlockDirection::All => Err(ModelError::InvalidScope(self.id)),
        }
    }

    /// A shift of `distance` along the travel direction, as a raw offset
    /// delta relative to the front edge's orientation.
    fn travel_delta(travel: Direction, distance: f64) -> f64 {
        match travel {
            Direction::Positive => distance,
            Direction::Negative => -distance,
        }
    }

    /// Re-derives every position in the scope from `new_front`, replacing
    /// the previous front, back and brake-curve front block points, and
    /// reconciles edge occupancy. Fails if the result is inconsistent.
    fn organise(
        &self,
        net: &Network,
        state: &mut ScopeState,
        new_front: BlockPoint,
    ) -> Result<(), ModelError> {
        let scope_length = self.organise_vehicles(net, state, &new_front)?;
        self.organise_back(net, state, new_front, scope_length)?;
        self.organise_brake_curve(net, state)?;
        self.organise_entered(net, state)?;
        if !self.state_valid(net, state) {
            return Err(ModelError::InvalidScope(self.id));
        }
        Ok(())
    }

    /// Walks from the front towards the tail, placing every vehicle middle
    /// at its cumulative offset and re-deriving its count direction.
    /// Returns the total train length.
    fn organise_vehicles(
        &self,
        net: &Network,
        state: &mut ScopeState,
        new_front: &BlockPoint,
    ) -> Result<f64, ModelError> {
        let travel = self.travel_direction(new_front)?;
        let mut walk = EdgeWalk::from_position(net, &new_front.position, travel.opposite())?;
        let mut step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
        let mut offset = 0.0;
        for vehicle in state.vehicles.iter_mut() {
            offset += vehicle.length / 2.0;
            vehicle.middle = new_front
                .position
                .shifted(net, Self::travel_delta(travel, -offset))?;
            let mut guard = 0;
            while step.edge.id != vehicle.middle.edge {
                step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
                guard += 1;
                if guard >= VEHICLE_SPAN_LIMIT {
                    return Err(ModelError::InvalidScope(self.id));
                }
            }
            // The tail walk runs against travel, so the vehicle faces the
            // other way.
            vehicle.count_direction = step.direction.opposite();
            offset += vehicle.length / 2.0;
        }
        Ok(offset)
    }

    /// Places the back block point one train length behind the new front
    /// and swaps both into the state, deleting the replaced points.
    fn organise_back(
        &self,
        net: &Network,
        state: &mut ScopeState,
        new_front: BlockPoint,
        scope_length: f64,
    ) -> Result<(), ModelError> {
        let travel = self.travel_direction(&new_front)?;
        let back_position = new_front
            .position
            .shifted(net, Self::travel_delta(travel, -scope_length))?;
        let mut walk = EdgeWalk::from_position(net, &new_front.position, travel.opposite())?;
        let mut step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
        while step.edge.id != back_position.edge {
            step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
        }
        // The back seals against travel: its blocked direction is the
        // direction the scope travels in, expressed on the back edge.
        let new_back =
            net.create_block_point(blocked_against(step.direction), back_position)?;

        let old_back = std::mem::replace(&mut state.back, new_back);
        if new_front.id != state.front.id {
            let old_front = std::mem::replace(&mut state.front, new_front);
            net.remove_block_point(&old_front)?;
        }
        net.remove_block_point(&old_back)?;
        Ok(())
    }

    fn intended_brake_curve_distance(&self, net: &Network, state: &ScopeState) -> f64 {
        acceleration_distance(
            state.current_speed,
            0.0,
            BRAKE_ACCELERATION,
            net.config().scale,
        ) + net.config().tolerance_distance
    }

    /// Places the brake-curve front one braking distance (plus the
    /// tolerance standoff) ahead of the front.
    fn organise_brake_curve(
        &self,
        net: &Network,
        state: &mut ScopeState,
    ) -> Result<(), ModelError> {
        let intended = self.intended_brake_curve_distance(net, state);
        let front = state.front.clone();
        let travel = self.travel_direction(&front)?;
        let target = front
            .position
            .shifted(net, Self::travel_delta(travel, intended))?;
        let mut walk = EdgeWalk::from_position(net, &front.position, travel)?;
        let mut step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
        while step.edge.id != target.edge {
            step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
        }
        let new_point = net.create_block_point(blocked_against(step.direction), target)?;
        let old = std::mem::replace(&mut state.brake_curve_front, new_point);
        net.remove_block_point(&old)?;
        Ok(())
    }

    /// Marks every edge between the brake-curve front and the back as
    /// entered by this scope, releasing edges the scope has left.
    fn organise_entered(&self, net: &Network, state: &mut ScopeState) -> Result<(), ModelError> {
        let walk_direction = match state.brake_curve_front.blocked {
            BlockDirection::Negative => Direction::Negative,
            BlockDirection::Positive => Direction::Positive,
            BlockDirection::All => return Err(ModelError::InvalidScope(self.id)),
        };
        let mut walk =
            EdgeWalk::from_position(net, &state.brake_curve_front.position, walk_direction)?;
        let back_edge = state.back.position.edge;
        let mut covered = HashSet::new();
        loop {
            let step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
            covered.insert(step.edge.id);
            if step.edge.id == back_edge {
                break;
            }
        }
        for edge_id in &covered {
            net.edge(*edge_id)?.enter(self.id);
        }
        for edge_id in state.entered.difference(&covered) {
            if let Ok(edge) = net.edge(*edge_id) {
                edge.leave(self.id);
            }
        }
        state.entered = covered;
        Ok(())
    }

    /// Cross-checks every vehicle middle and the back against positions
    /// independently re-derived from the front.
    fn state_valid(&self, net: &Network, state: &ScopeState) -> bool {
        if state.vehicles.is_empty() {
            return false;
        }
        let travel = match self.travel_direction(&state.front) {
            Ok(travel) => travel,
            Err(_) => return false,
        };
        let mut offset = 0.0;
        for vehicle in &state.vehicles {
            offset += vehicle.length / 2.0;
            let expected = match state
                .front
                .position
                .shifted(net, Self::travel_delta(travel, -offset))
            {
                Ok(position) => position,
                Err(_) => return false,
            };
            if !vehicle.middle.coincides(net, &expected) {
                return false;
            }
            offset += vehicle.length / 2.0;
        }
        let expected = match state
            .front
            .position
            .shifted(net, Self::travel_delta(travel, -offset))
        {
            Ok(position) => position,
            Err(_) => return false,
        };
        state.back.position.coincides(net, &expected)
    }

    /// Dead reckons the front forward by the distance covered this tick
    /// and installs the new front block point. The old front is removed by
    /// the following organise pass.
    fn advance_front(
        &self,
        net: &Network,
        state: &ScopeState,
        dt: f64,
    ) -> Result<BlockPoint, ModelError> {
        let traveled = state.current_speed * dt;
        let travel = self.travel_direction(&state.front)?;
        let target = state
            .front
            .position
            .shifted(net, Self::travel_delta(travel, traveled))?;
        let mut walk = EdgeWalk::from_position(net, &state.front.position, travel)?;
        let mut step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
        while step.edge.id != target.edge {
            step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
        }
        net.create_block_point(blocked_against(step.direction), target)
    }

    fn max_speed_of_vehicles(&self, net: &Network, state: &ScopeState) -> f64 {
        let scale = net.config().scale;
        state
            .vehicles
            .iter()
            .map(|vehicle| vehicle.max_speed / scale)
            .fold(f64::MAX, f64::min)
    }

    fn max_speed_of_speed_limits(&self, state: &ScopeState) -> f64 {
        state
            .vehicles
            .iter()
            .filter_map(|vehicle| vehicle.locomotive())
            .map(|loco| loco.profile.speed_at(loco.speed_limit_level))
            .fold(f64::MAX, f64::min)
    }

    /// Speed limit from the edges under and ahead of the train: edges the
    /// train is on limit directly, edges up to the brake-curve front limit
    /// through the brake curve towards them.
    fn max_speed_of_edges(&self, net: &Network, state: &ScopeState) -> Result<f64, ModelError> {
        let scale = net.config().scale;
        let eps = net.config().epsilon;
        let walk_direction = match state.back.blocked {
            BlockDirection::Negative => Direction::Negative,
            BlockDirection::Positive => Direction::Positive,
            BlockDirection::All => return Err(ModelError::InvalidScope(self.id)),
        };
        // The back seals against travel, so its blocked direction IS the
        // travel direction on the back edge.
        let mut walk = EdgeWalk::from_position(net, &state.back.position, walk_direction)?;
        let mut max_speed = f64::MAX;
        let mut step;
        loop {
            step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
            max_speed = max_speed.min(step.edge.max_speed / scale);
            if step.edge.id == state.front.position.edge {
                break;
            }
        }
        if state.front.position.edge == state.brake_curve_front.position.edge {
            return Ok(max_speed);
        }
        let border = acceleration_distance(
            state.current_speed,
            0.0,
            BRAKE_ACCELERATION,
            scale,
        ) + eps;
        loop {
            step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
            // Near boundary of the edge, seen from the approaching train.
            let entry = match step.direction {
                Direction::Positive => Position {
                    edge: step.edge.id,
                    offset: 0.0,
                },
                Direction::Negative => Position {
                    edge: step.edge.id,
                    offset: step.edge.length - eps,
                },
            };
            if let Some(distance) = state
                .front
                .position
                .distance_to_either(net, &entry, border)
            {
                let reachable =
                    brake_curve_speed(distance, step.edge.max_speed / scale, BRAKE_ACCELERATION, scale);
                max_speed = max_speed.min(reachable);
            }
            if step.edge.id == state.brake_curve_front.position.edge {
                break;
            }
        }
        Ok(max_speed)
    }

    /// Whether the brake-curve front sits behind the front on the same
    /// edge; on short rings the brake curve can lap the whole layout.
    fn brake_curve_behind_front(&self, state: &ScopeState) -> bool {
        let front = &state.front;
        let brake = &state.brake_curve_front;
        if front.position.edge != brake.position.edge {
            return false;
        }
        match front.blocked {
            BlockDirection::Negative => brake.position.offset <= front.position.offset,
            BlockDirection::Positive => brake.position.offset >= front.position.offset,
            BlockDirection::All => false,
        }
    }

    fn distance_ahead_of_front(
        &self,
        net: &Network,
        state: &ScopeState,
        target: &Position,
    ) -> Result<Option<f64>, ModelError> {
        let travel = self.travel_direction(&state.front)?;
        let border =
            self.intended_brake_curve_distance(net, state) + 2.0 * net.config().tolerance_distance;
        Ok(state
            .front
            .position
            .distance_to(net, target, border, travel))
    }

    /// Speed admissible so the train can stop `tolerance_distance` short
    /// of `target`.
    fn speed_to_stop_before(
        &self,
        net: &Network,
        state: &ScopeState,
        target: &Position,
    ) -> Result<f64, ModelError> {
        let remaining = match self.distance_ahead_of_front(net, state, target)? {
            Some(distance) => distance - net.config().tolerance_distance,
            None => return Ok(f64::MAX),
        };
        Ok(brake_curve_speed(
            remaining,
            0.0,
            BRAKE_ACCELERATION,
            net.config().scale,
        ))
    }

    /// Constraint from a single block point encountered at `step`.
    fn speed_for_block_point(
        &self,
        net: &Network,
        state: &ScopeState,
        block: &BlockPoint,
        step: &WalkStep,
    ) -> Result<f64, ModelError> {
        debug_assert_eq!(block.position.edge, step.edge.id);
        if block.id == state.brake_curve_front.id {
            // Our own horizon only binds once the intended brake distance
            // no longer fits in front of it.
            let intended = self.intended_brake_curve_distance(net, state);
            let actual = self.distance_ahead_of_front(net, state, &block.position)?;
            return match actual {
                Some(distance) if intended > distance + net.config().epsilon => {
                    self.speed_to_stop_before(net, state, &block.position)
                }
                _ => Ok(f64::MAX),
            };
        }
        if block.obstructs(step.direction) {
            self.speed_to_stop_before(net, state, &block.position)
        } else {
            Ok(f64::MAX)
        }
    }

    /// Searches forward from the front for the first obstructing block
    /// point, up to the brake-curve front.
    fn max_speed_of_block_points(
        &self,
        net: &Network,
        state: &ScopeState,
    ) -> Result<f64, ModelError> {
        let travel = self.travel_direction(&state.front)?;
        let mut walk = EdgeWalk::from_position(net, &state.front.position, travel)?;
        let mut step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
        let mut max_speed = f64::MAX;
        let mut reached_horizon = false;
        for block in step.edge.block_points() {
            if block.id == state.back.id {
                continue;
            }
            if block.id == state.brake_curve_front.id && self.brake_curve_behind_front(state) {
                // Lapped ring: the horizon is geometrically behind us.
                continue;
            }
            max_speed = max_speed.min(self.speed_for_block_point(net, state, &block, &step)?);
            if block.id == state.brake_curve_front.id {
                reached_horizon = true;
            }
        }
        while !reached_horizon && max_speed == f64::MAX {
            step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
            for block in step.edge.block_points() {
                max_speed = max_speed.min(self.speed_for_block_point(net, state, &block, &step)?);
                if block.id == state.brake_curve_front.id {
                    reached_horizon = true;
                }
            }
        }
        Ok(max_speed)
    }

    /// The admissible speed this tick: the minimum of acceleration-limited
    /// growth, vehicle mechanics, operator limits, edge limits and block
    /// points.
    fn calculate_max_speed(
        &self,
        net: &Network,
        state: &ScopeState,
        dt: f64,
    ) -> Result<f64, ModelError> {
        let scale = net.config().scale;
        let accelerated = (state.current_speed * scale + DRIVE_ACCELERATION * dt) / scale;
        let mut max_speed = accelerated;
        max_speed = max_speed.min(self.max_speed_of_vehicles(net, state));
        max_speed = max_speed.min(self.max_speed_of_speed_limits(state));
        max_speed = max_speed.min(self.max_speed_of_edges(net, state)?);
        max_speed = max_speed.min(self.max_speed_of_block_points(net, state)?);
        Ok(max_speed)
    }

    /// One control step: advance the front by the distance covered since
    /// the last step, re-derive the scope, compute the admissible speed,
    /// command the locomotives, and move the brake-curve front to match
    /// the new speed. Returns the speed that was set.
    pub fn tick(
        &self,
        net: &Network,
        control: &dyn ControlUnit,
        dt: f64,
    ) -> Result<f64, ModelError> {
        let mut state = self.state.lock().unwrap();
        let new_front = self.advance_front(net, &state, dt)?;
        self.organise(net, &mut state, new_front)?;
        let speed = self.calculate_max_speed(net, &state, dt)?;
        state.current_speed = speed;
        for vehicle in &state.vehicles {
            if let Some(loco) = vehicle.locomotive() {
                let level = loco.profile.level_for(speed);
                if let Err(err) = control.set_speed(loco.address, level) {
                    warn!(
                        "scope {:?}: speed command for locomotive {} failed: {}",
                        self.id, loco.address, err
                    );
                }
            }
        }
        // The brake curve grows or shrinks with the speed just set.
        self.organise_brake_curve(net, &mut state)?;
        trace!("scope {:?} ticked, speed {:.4}", self.id, speed);
        Ok(speed)
    }

    /// Spawns the periodic control loop. A scope without a locomotive has
    /// nothing to command and stays in `Ready`.
    pub fn start_control_loop(
        self: &Arc<Self>,
        net: Arc<Network>,
        control: Arc<dyn ControlUnit>,
    ) -> Result<(), ModelError> {
        if self.alive.load(Ordering::Acquire) {
            return Err(ModelError::AlreadyRunning(self.id));
        }
        let has_locomotive = {
            let state = self.state.lock().unwrap();
            state.vehicles.iter().any(Vehicle::is_locomotive)
        };
        if !has_locomotive {
            debug!("scope {:?} has no locomotive, not starting", self.id);
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Release);
        self.alive.store(true, Ordering::Release);
        self.state.lock().unwrap().status = ScopeStatus::Running;
        let scope = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("scope-{}", self.id.0))
            .spawn(move || scope.run_control_loop(net, control))
            .map_err(|err| {
                error!("failed to spawn control loop for scope {:?}: {}", self.id, err);
                self.alive.store(false, Ordering::Release);
                self.state.lock().unwrap().status = ScopeStatus::Stopped;
                ModelError::InvalidScope(self.id)
            })?;
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn run_control_loop(self: Arc<Self>, net: Arc<Network>, control: Arc<dyn ControlUnit>) {
        debug!("control loop of scope {:?} started", self.id);
        let mut last = Instant::now();
        loop {
            thread::sleep(TICK_INTERVAL);
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let has_locomotive = {
                let state = self.state.lock().unwrap();
                state.vehicles.iter().any(Vehicle::is_locomotive)
            };
            if !has_locomotive {
                break;
            }
            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f64();
            last = now;
            if let Err(err) = self.tick(&net, control.as_ref(), dt) {
                error!("control loop of scope {:?} halted: {}", self.id, err);
                break;
            }
        }
        self.alive.store(false, Ordering::Release);
        self.state.lock().unwrap().status = ScopeStatus::Stopped;
        debug!("control loop of scope {:?} terminated", self.id);
    }

    /// Signals the control loop to stop and waits for it.
    pub fn stop_control_loop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.state.lock().unwrap().status = ScopeStatus::Stopped;
    }

    /// Swaps front and back: the train now travels the other way. Only a
    /// standing train may be inverted.
    pub fn invert_direction(&self, net: &Network) -> Result<(), ModelError> {
        let mut state = self.state.lock().unwrap();
        if state.current_speed > net.config().epsilon {
            return Err(ModelError::MovingScope);
        }
        let state = &mut *state;
        std::mem::swap(&mut state.front, &mut state.back);
        state.vehicles.reverse();
        let front = state.front.clone();
        self.organise(net, state, front)
    }

    /// Snaps the vehicle at `index` onto `target` and shifts the whole
    /// scope by the same amount, correcting accumulated dead-reckoning
    /// drift.
    pub fn reposition_vehicle(
        &self,
        net: &Network,
        index: usize,
        target: Position,
    ) -> Result<(), ModelError> {
        let mut state = self.state.lock().unwrap();
        let vehicle = state
            .vehicles
            .get(index)
            .ok_or(ModelError::UnknownVehicle(index))?;
        let border = net.config().tolerance_distance * 10.0;
        let along = vehicle
            .middle
            .distance_to(net, &target, border, vehicle.count_direction);
        let against = vehicle.middle.distance_to(
            net,
            &target,
            border,
            vehicle.count_direction.opposite(),
        );
        let travel = self.travel_direction(&state.front)?;
        let (distance, forwards) = match (along, against) {
            (Some(a), Some(b)) if a <= b => (a, true),
            (Some(a), None) => (a, true),
            (None, Some(b)) => (b, false),
            (Some(_), Some(b)) => (b, false),
            (None, None) => {
                warn!(
                    "scope {:?}: reported position is out of correction range",
                    self.id
                );
                return Ok(());
            }
        };
        let (delta, walk_direction) = if forwards {
            (Self::travel_delta(travel, distance), travel)
        } else {
            (Self::travel_delta(travel, -distance), travel.opposite())
        };
        let front_target = state.front.position.shifted(net, delta)?;
        let mut walk = EdgeWalk::from_position(net, &state.front.position, walk_direction)?;
        let mut step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
        while step.edge.id != front_target.edge {
            step = walk.next().ok_or(ModelError::InvalidScope(self.id))?;
        }
        // Moving backwards the front still faces travel, so the blocked
        // side comes out inverted relative to the walk.
        let blocked = if forwards {
            blocked_against(step.direction)
        } else {
            match step.direction {
                Direction::Positive => BlockDirection::Positive,
                Direction::Negative => BlockDirection::Negative,
            }
        };
        let new_front = net.create_block_point(blocked, front_target)?;
        self.organise(net, &mut state, new_front)?;
        debug!(
            "scope {:?}: corrected by {:.4} model meters ({})",
            self.id,
            distance,
            if forwards { "ahead" } else { "behind" }
        );
        Ok(())
    }

    /// Coupling two scopes into one train is not supported; the command
    /// station gives no feedback about mechanical coupling success.
    pub fn couple(_first: &TrainScope, _second: &TrainScope) -> Result<(), ModelError> {
        Err(ModelError::CouplingUnsupported)
    }

    /// See [`TrainScope::couple`].
    pub fn decouple(&self, _at: usize) -> Result<(), ModelError> {
        Err(ModelError::CouplingUnsupported)
    }

    /// Tears the scope down, releasing its block points and edge
    /// occupancy, and hands back its single vehicle. Scopes with several
    /// vehicles cannot be dissolved while coupling is unsupported.
    pub fn dissolve(&self, net: &Network) -> Result<Vehicle, ModelError> {
        if self.alive.load(Ordering::Acquire) {
            return Err(ModelError::AlreadyRunning(self.id));
        }
        let mut state = self.state.lock().unwrap();
        if state.vehicles.len() != 1 {
            return Err(ModelError::ScopeNotSingleton(self.id));
        }
        net.remove_block_point(&state.front)?;
        net.remove_block_point(&state.back)?;
        net.remove_block_point(&state.brake_curve_front)?;
        for edge_id in state.entered.drain() {
            if let Ok(edge) = net.edge(edge_id) {
                edge.leave(self.id);
            }
        }
        state.status = ScopeStatus::Stopped;
        Ok(state.vehicles.remove(0))
    }

    pub fn status(&self) -> ScopeStatus {
        self.state.lock().unwrap().status
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn current_speed(&self) -> f64 {
        self.state.lock().unwrap().current_speed
    }

    pub fn front(&self) -> BlockPoint {
        self.state.lock().unwrap().front.clone()
    }

    pub fn back(&self) -> BlockPoint {
        self.state.lock().unwrap().back.clone()
    }

    pub fn brake_curve_front(&self) -> BlockPoint {
        self.state.lock().unwrap().brake_curve_front.clone()
    }

    pub fn vehicles(&self) -> Vec<Vehicle> {
        self.state.lock().unwrap().vehicles.clone()
    }

    pub fn entered_edges(&self) -> HashSet<EdgeId> {
        self.state.lock().unwrap().entered.clone()
    }

    /// Public consistency check over the current state.
    pub fn check_valid(&self, net: &Network) -> bool {
        let state = self.state.lock().unwrap();
        self.state_valid(net, &state)
    }

    pub fn has_locomotive(&self, address: u16) -> bool {
        let state = self.state.lock().unwrap();
        state
            .vehicles
            .iter()
            .filter_map(Vehicle::locomotive)
            .any(|loco| loco.address == address)
    }

    /// Adopts a speed level confirmed by the command station; the model's
    /// speed follows the profile's idea of that level.
    pub fn apply_speed_feedback(&self, address: u16, level: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        let mut confirmed = None;
        for vehicle in state.vehicles.iter_mut() {
            if let Some(loco) = vehicle.locomotive_mut() {
                if loco.address == address {
                    let level = level.min(loco.profile.levels() - 1);
                    loco.speed_level = level;
                    confirmed = Some(loco.profile.speed_at(level));
                }
            }
        }
        if let Some(speed) = confirmed {
            state.current_speed = speed;
            true
        } else {
            false
        }
    }

    pub fn apply_direction_feedback(&self, address: u16, forward: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        for vehicle in state.vehicles.iter_mut() {
            if let Some(loco) = vehicle.locomotive_mut() {
                if loco.address == address {
                    loco.decoder_forward = forward;
                    return true;
                }
            }
        }
        false
    }

    pub fn set_speed_limit(&self, address: u16, level: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        for vehicle in state.vehicles.iter_mut() {
            if let Some(loco) = vehicle.locomotive_mut() {
                if loco.address == address {
                    loco.speed_limit_level = level.min(loco.profile.levels() - 1);
                    return true;
                }
            }
        }
        false
    }

    /// Folds a speed measurement into the addressed locomotive's profile.
    pub fn record_speed_measurement(&self, address: u16, level: usize, speed: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        for vehicle in state.vehicles.iter_mut() {
            if let Some(loco) = vehicle.locomotive_mut() {
                if loco.address == address {
                    loco.profile.record_measurement(level, speed);
                    return true;
                }
            }
        }
        false
    }
}
