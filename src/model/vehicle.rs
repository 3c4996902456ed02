//! Vehicles and the locomotive speed profile.
//!
//! A locomotive's decoder maps discrete DCC levels to physical speeds in a
//! way only measurement reveals. [`SpeedProfile`] starts from a linear
//! guess and refines itself from reported measurements, staying monotonic
//! so level lookup by speed stays well defined.

use super::position::Position;
use super::types::{Direction, ModelConfig, VehicleId};

/// Moving-average window for profile measurements.
pub const PROFILE_WINDOW: i32 = 100;

/// Maps DCC speed levels to model speeds (model meters per second).
///
/// `windows[i]` counts the measurements behind `speeds[i]`; -1 marks an
/// interpolated entry, 0 an untouched initial guess beyond level 0.
#[derive(Debug, Clone)]
pub struct SpeedProfile {
    speeds: Vec<f64>,
    windows: Vec<i32>,
}

impl SpeedProfile {
    /// Initial guess: level 0 is a hard stop, each further level adds
    /// 3 real m/s converted to model scale.
    pub fn linear(config: &ModelConfig) -> Self {
        let mut speeds = Vec::with_capacity(config.speed_steps);
        let mut windows = vec![0; config.speed_steps];
        for level in 0..config.speed_steps {
            let speed = if level == 0 {
                0.0
            } else {
                (level as f64 - 1.0) * 3.0 / config.scale
            };
            speeds.push(speed);
        }
        // Level 0 is definitionally zero and never adjusted away.
        windows[0] = PROFILE_WINDOW;
        Self { speeds, windows }
    }

    pub fn levels(&self) -> usize {
        self.speeds.len()
    }

    pub fn speed_at(&self, level: usize) -> f64 {
        let level = level.min(self.speeds.len() - 1);
        self.speeds[level]
    }

    /// Lowest level whose profile speed reaches `speed`, or the top level
    /// if none does. Rounding up keeps a small requested speed from
    /// collapsing onto the zero levels at the bottom of the profile.
    pub fn level_for(&self, speed: f64) -> usize {
        for (level, profile_speed) in self.speeds.iter().enumerate() {
            if *profile_speed >= speed {
                return level;
            }
        }
        self.speeds.len() - 1
    }

    /// Folds a measured speed for `level` into the profile, then repairs
    /// monotonicity and re-interpolates the gaps between measured levels.
    pub fn record_measurement(&mut self, level: usize, speed: f64) {
        if level == 0 || level >= self.speeds.len() {
            return;
        }
        let window = self.windows[level];
        if window <= 0 {
            self.speeds[level] = speed;
            self.windows[level] = 1;
        } else if window < PROFILE_WINDOW {
            self.speeds[level] =
                (self.speeds[level] * window as f64 + speed) / (window as f64 + 1.0);
            self.windows[level] = window + 1;
        } else {
            self.speeds[level] =
                (self.speeds[level] * (PROFILE_WINDOW as f64 - 1.0) + speed) / PROFILE_WINDOW as f64;
        }
        self.repair_monotonic();
        self.interpolate_gaps();
    }

    fn measured_levels(&self) -> Vec<usize> {
        self.windows
            .iter()
            .enumerate()
            .filter(|(_, w)| **w > 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Bubble the measured values (with their windows) into ascending
    /// order; a fresh outlier measurement can land below an older, heavier
    /// neighbor.
    fn repair_monotonic(&mut self) {
        let measured = self.measured_levels();
        loop {
            let mut swapped = false;
            for pair in measured.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                if self.speeds[a] > self.speeds[b] {
                    self.speeds.swap(a, b);
                    self.windows.swap(a, b);
                    swapped = true;
                }
            }
            if !swapped {
                break;
            }
        }
    }

    /// Linear interpolation between neighboring measured levels.
    fn interpolate_gaps(&mut self) {
        let measured = self.measured_levels();
        for pair in measured.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if b - a < 2 {
                continue;
            }
            let span = (b - a) as f64;
            let step = (self.speeds[b] - self.speeds[a]) / span;
            for level in (a + 1)..b {
                self.speeds[level] = self.speeds[a] + step * (level - a) as f64;
                self.windows[level] = -1;
            }
        }
    }
}

/// Locomotive-specific state: decoder address, calibration profile and the
/// levels last confirmed by the command station.
#[derive(Debug, Clone)]
pub struct LocomotiveState {
    pub address: u16,
    pub profile: SpeedProfile,
    /// Level last confirmed by station feedback
    pub speed_level: usize,
    /// Operator-imposed level cap
    pub speed_limit_level: usize,
    pub decoder_forward: bool,
}

#[derive(Debug, Clone)]
pub enum VehicleKind {
    Wagon,
    Locomotive(LocomotiveState),
}

/// A physical vehicle, tracked by the position of its middle.
///
/// `count_direction` is the edge-relative direction from the vehicle's
/// middle towards its train's front, maintained by the owning scope.
#[derive(Debug, Clone)]
pub struct Vehicle {
    pub id: VehicleId,
    pub name: String,
    /// Vehicle length in model meters
    pub length: f64,
    /// Mechanical speed limit in real meters per second
    pub max_speed: f64,
    pub middle: Position,
    pub count_direction: Direction,
    pub kind: VehicleKind,
}

impl Vehicle {
    pub fn is_locomotive(&self) -> bool {
        matches!(self.kind, VehicleKind::Locomotive(_))
    }

    pub fn locomotive(&self) -> Option<&LocomotiveState> {
        match &self.kind {
            VehicleKind::Locomotive(state) => Some(state),
            VehicleKind::Wagon => None,
        }
    }

    pub fn locomotive_mut(&mut self) -> Option<&mut LocomotiveState> {
        match &mut self.kind {
            VehicleKind::Locomotive(state) => Some(state),
            VehicleKind::Wagon => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_profile_is_monotonic_and_starts_at_zero() {
        let profile = SpeedProfile::linear(&ModelConfig::default());
        assert_eq!(profile.speed_at(0), 0.0);
        for level in 1..profile.levels() {
            assert!(profile.speed_at(level) >= profile.speed_at(level - 1));
        }
    }

    #[test]
    fn level_for_rounds_up_to_the_next_reachable_speed() {
        let profile = SpeedProfile::linear(&ModelConfig::default());
        let speed = profile.speed_at(10) + 1e-9;
        let level = profile.level_for(speed);
        assert!(profile.speed_at(level) >= speed);
        assert_eq!(level, 11);
        assert_eq!(profile.level_for(0.0), 0);
        // Levels 0 and 1 both map to zero; a tiny requested speed must
        // still command a moving level.
        let crawl = profile.level_for(0.001);
        assert!(profile.speed_at(crawl) > 0.0);
        assert_eq!(crawl, 2);
        // Beyond the profile top, command the top level.
        let top = profile.levels() - 1;
        assert_eq!(profile.level_for(profile.speed_at(top) + 1.0), top);
    }

    #[test]
    fn measurement_updates_level_and_interpolates_gap() {
        let config = ModelConfig::default();
        let mut profile = SpeedProfile::linear(&config);
        profile.record_measurement(10, 0.5);
        assert!((profile.speed_at(10) - 0.5).abs() < 1e-12);
        // Levels between 0 and 10 are interpolated between the two
        // measured anchors.
        let expected = 0.5 * 5.0 / 10.0;
        assert!((profile.speed_at(5) - expected).abs() < 1e-12);
        for level in 1..=10 {
            assert!(profile.speed_at(level) >= profile.speed_at(level - 1));
        }
    }

    #[test]
    fn outlier_measurement_keeps_profile_monotonic() {
        let config = ModelConfig::default();
        let mut profile = SpeedProfile::linear(&config);
        profile.record_measurement(5, 0.4);
        profile.record_measurement(10, 0.1);
        for level in 1..profile.levels() {
            assert!(profile.speed_at(level) >= profile.speed_at(level - 1));
        }
    }

    #[test]
    fn moving_average_converges_on_repeated_measurements() {
        let config = ModelConfig::default();
        let mut profile = SpeedProfile::linear(&config);
        for _ in 0..50 {
            profile.record_measurement(20, 0.8);
        }
        assert!((profile.speed_at(20) - 0.8).abs() < 0.05);
    }
}
