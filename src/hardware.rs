//! Hardware abstraction for the digital command station.
//!
//! The model only ever talks to the layout through the [`ControlUnit`]
//! trait. A command failure is reported to the caller but never mutates the
//! model; the model catches up when the station's feedback arrives.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::model::types::{SegmentId, SwitchBranch};

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("control unit is not reachable")]
    Unreachable,
    #[error("unknown locomotive address {0}")]
    UnknownAddress(u16),
    #[error("no switch actuator for segment {0:?}")]
    UnknownSwitch(SegmentId),
    #[error("track power is off")]
    PowerOff,
}

/// Commands towards and state queries against the command station.
///
/// Speed levels are the station's discrete DCC levels, not physical speeds.
pub trait ControlUnit: Send + Sync {
    fn set_speed(&self, address: u16, level: usize) -> Result<(), HardwareError>;
    fn speed(&self, address: u16) -> Result<usize, HardwareError>;
    fn set_direction(&self, address: u16, forward: bool) -> Result<(), HardwareError>;
    fn direction(&self, address: u16) -> Result<bool, HardwareError>;
    fn set_switch(&self, switch: SegmentId, branch: SwitchBranch) -> Result<(), HardwareError>;
    fn switch_state(&self, switch: SegmentId) -> Result<SwitchBranch, HardwareError>;
    fn set_track_power(&self, on: bool) -> Result<(), HardwareError>;
    fn emergency_stop(&self) -> Result<(), HardwareError>;
}

/// Every command a [`MockControlUnit`] has accepted, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Speed(u16, usize),
    TrainDirection(u16, bool),
    Switch(SegmentId, SwitchBranch),
    TrackPower(bool),
    EmergencyStop,
}

#[derive(Default)]
struct MockState {
    speeds: HashMap<u16, usize>,
    directions: HashMap<u16, bool>,
    switches: HashMap<SegmentId, SwitchBranch>,
    track_power: bool,
    commands: Vec<Command>,
}

/// In-memory command station used by tests and the demo binary.
///
/// Accepts every command, remembers the resulting state and keeps a command
/// log for assertions. Unknown addresses read back as level 0, forward.
#[derive(Default)]
pub struct MockControlUnit {
    inner: Mutex<MockState>,
}

impl MockControlUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.inner.lock().unwrap().commands.clear();
    }
}

impl ControlUnit for MockControlUnit {
    fn set_speed(&self, address: u16, level: usize) -> Result<(), HardwareError> {
        let mut state = self.inner.lock().unwrap();
        state.speeds.insert(address, level);
        state.commands.push(Command::Speed(address, level));
        Ok(())
    }

    fn speed(&self, address: u16) -> Result<usize, HardwareError> {
        let state = self.inner.lock().unwrap();
        Ok(state.speeds.get(&address).copied().unwrap_or(0))
    }

    fn set_direction(&self, address: u16, forward: bool) -> Result<(), HardwareError> {
        let mut state = self.inner.lock().unwrap();
        state.directions.insert(address, forward);
        state.commands.push(Command::TrainDirection(address, forward));
        Ok(())
    }

    fn direction(&self, address: u16) -> Result<bool, HardwareError> {
        let state = self.inner.lock().unwrap();
        Ok(state.directions.get(&address).copied().unwrap_or(true))
    }

    fn set_switch(&self, switch: SegmentId, branch: SwitchBranch) -> Result<(), HardwareError> {
        let mut state = self.inner.lock().unwrap();
        state.switches.insert(switch, branch);
        state.commands.push(Command::Switch(switch, branch));
        Ok(())
    }

    fn switch_state(&self, switch: SegmentId) -> Result<SwitchBranch, HardwareError> {
        let state = self.inner.lock().unwrap();
        state
            .switches
            .get(&switch)
            .copied()
            .ok_or(HardwareError::UnknownSwitch(switch))
    }

    fn set_track_power(&self, on: bool) -> Result<(), HardwareError> {
        let mut state = self.inner.lock().unwrap();
        state.track_power = on;
        state.commands.push(Command::TrackPower(on));
        Ok(())
    }

    fn emergency_stop(&self) -> Result<(), HardwareError> {
        let mut state = self.inner.lock().unwrap();
        for level in state.speeds.values_mut() {
            *level = 0;
        }
        state.commands.push(Command::EmergencyStop);
        Ok(())
    }
}
