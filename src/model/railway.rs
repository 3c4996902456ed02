//! Top-level facade: the network, the scopes, the balises and the link to
//! the command station.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use ordered_float::OrderedFloat;

use crate::hardware::ControlUnit;
use crate::store::{EntityKind, Store};

use super::balise::{self, Balise};
use super::network::Network;
use super::position::Position;
use super::scope::TrainScope;
use super::types::{
    Direction, ModelConfig, ModelError, ScopeId, SegmentId, SwitchBranch, VehicleId,
};
use super::vehicle::{LocomotiveState, SpeedProfile, Vehicle, VehicleKind};

pub struct Railway {
    network: Arc<Network>,
    control: Arc<dyn ControlUnit>,
    store: Arc<dyn Store>,
    scopes: Mutex<HashMap<ScopeId, Arc<TrainScope>>>,
    balises: Mutex<HashMap<u16, Balise>>,
    next_id: Mutex<usize>,
}

impl Railway {
    /// Vehicle and scope ids resume past whatever the store still holds,
    /// mirroring what the network does for its own entities.
    pub fn new(config: ModelConfig, control: Arc<dyn ControlUnit>, store: Arc<dyn Store>) -> Self {
        let mut next_id = 0;
        for kind in [EntityKind::Vehicle, EntityKind::Scope] {
            if let Some(highest) = store.enumerate(kind).last() {
                next_id = next_id.max(highest + 1);
            }
        }
        Self {
            network: Arc::new(Network::new(config, store.clone())),
            control,
            store,
            scopes: Mutex::new(HashMap::new()),
            balises: Mutex::new(HashMap::new()),
            next_id: Mutex::new(next_id),
        }
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn control(&self) -> &Arc<dyn ControlUnit> {
        &self.control
    }

    fn allocate_id(&self) -> usize {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    fn place_vehicle(
        &self,
        vehicle: Vehicle,
        facing: Direction,
    ) -> Result<ScopeId, ModelError> {
        let vehicle_id = vehicle.id;
        let scope_id = ScopeId(self.allocate_id());
        let scope = TrainScope::around(&self.network, scope_id, vehicle, facing)?;
        self.scopes.lock().unwrap().insert(scope_id, Arc::new(scope));
        self.store.notify_created(EntityKind::Vehicle, vehicle_id.0);
        self.store.notify_created(EntityKind::Scope, scope_id.0);
        Ok(scope_id)
    }

    /// Places a locomotive on the layout, wrapped in its own scope. The
    /// decoder state is primed from the command station where reachable.
    pub fn spawn_locomotive(
        &self,
        name: &str,
        length: f64,
        max_speed: f64,
        middle: Position,
        facing: Direction,
        address: u16,
    ) -> Result<ScopeId, ModelError> {
        let profile = SpeedProfile::linear(self.network.config());
        let speed_level = self.control.speed(address).unwrap_or(0);
        let decoder_forward = self.control.direction(address).unwrap_or(true);
        let vehicle = Vehicle {
            id: VehicleId(self.allocate_id()),
            name: name.to_string(),
            length,
            max_speed,
            middle,
            count_direction: facing,
            kind: VehicleKind::Locomotive(LocomotiveState {
                address,
                speed_limit_level: profile.levels() - 1,
                profile,
                speed_level,
                decoder_forward,
            }),
        };
        info!("spawning locomotive {} (address {})", name, address);
        self.place_vehicle(vehicle, facing)
    }

    /// Places an unpowered wagon on the layout, wrapped in its own scope.
    pub fn spawn_wagon(
        &self,
        name: &str,
        length: f64,
        max_speed: f64,
        middle: Position,
        facing: Direction,
    ) -> Result<ScopeId, ModelError> {
        let vehicle = Vehicle {
            id: VehicleId(self.allocate_id()),
            name: name.to_string(),
            length,
            max_speed,
            middle,
            count_direction: facing,
            kind: VehicleKind::Wagon,
        };
        info!("spawning wagon {}", name);
        self.place_vehicle(vehicle, facing)
    }

    pub fn scope(&self, id: ScopeId) -> Result<Arc<TrainScope>, ModelError> {
        self.scopes
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(ModelError::UnknownScope(id))
    }

    pub fn scopes(&self) -> Vec<Arc<TrainScope>> {
        self.scopes.lock().unwrap().values().cloned().collect()
    }

    /// Dissolves a stopped single-vehicle scope and removes it.
    pub fn remove_scope(&self, id: ScopeId) -> Result<(), ModelError> {
        let scope = self.scope(id)?;
        let vehicle = scope.dissolve(&self.network)?;
        self.scopes.lock().unwrap().remove(&id);
        self.store.notify_deleted(EntityKind::Vehicle, vehicle.id.0);
        self.store.notify_deleted(EntityKind::Scope, id.0);
        info!("removed scope {:?} ({})", id, vehicle.name);
        Ok(())
    }

    pub fn start_all(&self) -> Result<(), ModelError> {
        for scope in self.scopes() {
            scope.start_control_loop(self.network.clone(), self.control.clone())?;
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for scope in self.scopes() {
            scope.stop_control_loop();
        }
    }

    /// Throws a switch in the model and forwards the new state to the
    /// command station. A rejected throw leaves both untouched.
    pub fn throw_switch(&self, id: SegmentId) -> Result<SwitchBranch, ModelError> {
        let branch = self.network.switch_track(id)?;
        if let Err(err) = self.control.set_switch(id, branch) {
            warn!("switch command for {:?} failed: {}", id, err);
        }
        Ok(branch)
    }

    pub fn add_balise(&self, address: u16, position: Position) {
        self.balises
            .lock()
            .unwrap()
            .insert(address, Balise { address, position });
        self.store.notify_created(EntityKind::Balise, address as usize);
    }

    pub fn remove_balise(&self, address: u16) -> Result<(), ModelError> {
        self.balises
            .lock()
            .unwrap()
            .remove(&address)
            .ok_or(ModelError::UnknownBalise(address))?;
        self.store.notify_deleted(EntityKind::Balise, address as usize);
        Ok(())
    }

    /// Handles a balise trigger: finds the nearest vehicle of any scope
    /// occupying an edge near the balise and snaps it onto the balise. A
    /// trigger with no plausible cause is logged and dropped.
    pub fn trigger_balise(&self, address: u16) -> Result<Option<ScopeId>, ModelError> {
        let balise = self
            .balises
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .ok_or(ModelError::UnknownBalise(address))?;
        let radius = balise::search_radius(&self.network, &balise.position)?;
        let region = balise::edges_in_region(&self.network, &balise.position, radius)?;

        let mut candidates = std::collections::HashSet::new();
        for edge_id in &region {
            if let Ok(edge) = self.network.edge(*edge_id) {
                candidates.extend(edge.occupants());
            }
        }

        let mut nearest: Option<(OrderedFloat<f64>, ScopeId, usize)> = None;
        for scope_id in candidates {
            let scope = match self.scope(scope_id) {
                Ok(scope) => scope,
                Err(_) => continue,
            };
            for (index, vehicle) in scope.vehicles().iter().enumerate() {
                if let Some(distance) =
                    balise
                        .position
                        .distance_to_either(&self.network, &vehicle.middle, radius)
                {
                    let entry = (OrderedFloat(distance), scope_id, index);
                    if nearest.map_or(true, |best| entry.0 < best.0) {
                        nearest = Some(entry);
                    }
                }
            }
        }

        match nearest {
            Some((distance, scope_id, index)) => {
                let scope = self.scope(scope_id)?;
                scope.reposition_vehicle(&self.network, index, balise.position)?;
                info!(
                    "balise {} corrected scope {:?} by {:.4} model meters",
                    address, scope_id, distance.0
                );
                Ok(Some(scope_id))
            }
            None => {
                warn!("balise {} triggered without a plausible cause", address);
                Ok(None)
            }
        }
    }

    /// Routes station feedback to the scope owning the addressed
    /// locomotive.
    pub fn apply_speed_feedback(&self, address: u16, level: usize) -> Result<(), ModelError> {
        for scope in self.scopes() {
            if scope.apply_speed_feedback(address, level) {
                return Ok(());
            }
        }
        warn!("speed feedback for unknown locomotive address {}", address);
        Ok(())
    }

    pub fn apply_direction_feedback(&self, address: u16, forward: bool) -> Result<(), ModelError> {
        for scope in self.scopes() {
            if scope.apply_direction_feedback(address, forward) {
                return Ok(());
            }
        }
        warn!(
            "direction feedback for unknown locomotive address {}",
            address
        );
        Ok(())
    }

    /// Adopts a switch state reported by the command station.
    pub fn apply_switch_feedback(
        &self,
        id: SegmentId,
        branch: SwitchBranch,
    ) -> Result<(), ModelError> {
        self.network.set_switch(id, branch)
    }

    pub fn record_speed_measurement(
        &self,
        address: u16,
        level: usize,
        speed: f64,
    ) -> Result<(), ModelError> {
        for scope in self.scopes() {
            if scope.record_speed_measurement(address, level, speed) {
                return Ok(());
            }
        }
        warn!(
            "speed measurement for unknown locomotive address {}",
            address
        );
        Ok(())
    }

    /// Logs a one-line status for every scope.
    pub fn print_summary(&self) {
        for scope in self.scopes() {
            let front = scope.front();
            info!(
                "scope {:?}: {:?}, speed {:.4} m/s, front at {:?}+{:.4}",
                scope.id,
                scope.status(),
                scope.current_speed(),
                front.position.edge,
                front.position.offset
            );
        }
    }

    /// Stops every control loop and cuts decoder speeds at the station.
    pub fn emergency_stop(&self) {
        if let Err(err) = self.control.emergency_stop() {
            warn!("emergency stop command failed: {}", err);
        }
        self.stop_all();
    }
}
