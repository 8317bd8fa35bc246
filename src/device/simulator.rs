//! Per-point value generation.
//!
//! Each enabled point carries a strategy and its waveform state; the
//! runtime ticks the simulator once per second and writes every produced
//! value through the normal edit path so the protocol adapter observes
//! the change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::point::Point;
use crate::core::signal::PointId;

/// Value-generation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulateMethod {
    Random,
    AutoIncrement,
    AutoDecrement,
    SineWave,
    Ramp,
    Pulse,
}

impl std::str::FromStr for SimulateMethod {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Random" => Ok(Self::Random),
            "AutoIncrement" => Ok(Self::AutoIncrement),
            "AutoDecrement" => Ok(Self::AutoDecrement),
            "SineWave" => Ok(Self::SineWave),
            "Ramp" => Ok(Self::Ramp),
            "Pulse" => Ok(Self::Pulse),
            _ => Err(()),
        }
    }
}

/// Hard clamp of the random strategy regardless of configured limits.
const RANDOM_CLAMP: f64 = 100_000.0;

/// Waveform state of one simulated point.
struct SimState {
    method: SimulateMethod,
    enabled: bool,
    /// Maximum increment/decrement per tick.
    step: i64,
    /// Waveform period in seconds.
    cycle_s: f64,
    phase: f64,
    /// Seconds the pulse stays high inside each period.
    pulse_width_s: f64,
    /// Seconds a ramp takes to reach its target.
    ramp_time_s: f64,
    ramp_start: Option<Instant>,
    ramp_from: f64,
    ramp_target: f64,
}

impl SimState {
    fn new(method: SimulateMethod, step: i64) -> Self {
        Self {
            method,
            enabled: false,
            step: step.max(1),
            cycle_s: 60.0,
            phase: 0.0,
            pulse_width_s: 1.0,
            ramp_time_s: 5.0,
            ramp_start: None,
            ramp_from: 0.0,
            ramp_target: 0.0,
        }
    }
}

/// Snapshot of a point's simulation setup for the operator API.
#[derive(Debug, Clone, Serialize)]
pub struct SimPointInfo {
    pub code: String,
    pub name: String,
    pub slave_id: u8,
    pub reg_addr: String,
    pub function_code: u8,
    pub decode_code: u8,
    pub value: f64,
    pub method: SimulateMethod,
    pub step: i64,
    pub enabled: bool,
    pub frame_type: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mul_coe: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_coe: Option<f64>,
}

/// The simulation engine of one device.
#[derive(Default)]
pub struct Simulator {
    points: Mutex<HashMap<PointId, (Arc<Point>, SimState)>>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a point under the given strategy (disabled until enabled).
    pub fn add_point(&self, point: Arc<Point>, method: SimulateMethod, step: i64) {
        self.points
            .lock()
            .unwrap()
            .insert(point.id(), (point, SimState::new(method, step)));
    }

    /// Stop tracking a point.
    pub fn remove_point(&self, id: PointId) {
        self.points.lock().unwrap().remove(&id);
    }

    /// Drop every tracked point.
    pub fn clear(&self) {
        self.points.lock().unwrap().clear();
    }

    pub fn set_enabled(&self, code: &str, enabled: bool) -> bool {
        self.with_state(code, |point, state| {
            state.enabled = enabled;
            point.set_simulated(enabled);
        })
    }

    pub fn set_all_enabled(&self, enabled: bool) {
        for (point, state) in self.points.lock().unwrap().values_mut() {
            state.enabled = enabled;
            point.set_simulated(enabled);
        }
    }

    pub fn set_method(&self, code: &str, method: SimulateMethod) -> bool {
        self.with_state(code, |_, state| {
            state.method = method;
            state.ramp_start = None;
        })
    }

    pub fn set_all_methods(&self, method: SimulateMethod) {
        for (_, state) in self.points.lock().unwrap().values_mut() {
            state.method = method;
            state.ramp_start = None;
        }
    }

    pub fn set_step(&self, code: &str, step: i64) -> bool {
        self.with_state(code, |_, state| state.step = step.max(1))
    }

    /// Simulation range lives on the point itself.
    pub fn set_range(&self, code: &str, min_limit: f64, max_limit: f64) -> bool {
        self.with_state(code, |point, _| point.set_limits(min_limit, max_limit))
    }

    /// Inspect one tracked point.
    pub fn point_info(&self, code: &str) -> Option<SimPointInfo> {
        let points = self.points.lock().unwrap();
        let (point, state) = points.values().find(|(p, _)| p.code() == code)?;
        let scaled = point.kind().is_scaled();
        Some(SimPointInfo {
            code: point.code().to_string(),
            name: point.name(),
            slave_id: point.slave_id(),
            reg_addr: point.hex_address(),
            function_code: point.function_code(),
            decode_code: point.decode_code(),
            value: if scaled {
                point.real_value()
            } else {
                point.raw_value() as f64
            },
            method: state.method,
            step: state.step,
            enabled: state.enabled,
            frame_type: point.kind().frame_type(),
            mul_coe: scaled.then(|| point.scaling().mul_coe),
            add_coe: scaled.then(|| point.scaling().add_coe),
        })
    }

    fn with_state(&self, code: &str, f: impl FnOnce(&Arc<Point>, &mut SimState)) -> bool {
        let mut points = self.points.lock().unwrap();
        match points.values_mut().find(|(p, _)| p.code() == code) {
            Some((point, state)) => {
                let point = point.clone();
                f(&point, state);
                true
            }
            None => false,
        }
    }

    /// Produce the next value of every enabled point.
    ///
    /// Returns `(code, engineering value)` pairs; the runtime writes them
    /// through the normal edit path.
    pub fn tick(&self) -> Vec<(String, f64)> {
        let now = Instant::now();
        let mut output = Vec::new();
        let mut points = self.points.lock().unwrap();
        for (point, state) in points.values_mut() {
            if !state.enabled {
                continue;
            }
            let next = if point.kind().is_binary() {
                next_binary(point, state)
            } else {
                next_analog(point, state, now)
            };
            if let Some(value) = next {
                output.push((point.code().to_string(), value));
            }
        }
        output
    }
}

fn next_binary(point: &Point, state: &SimState) -> Option<f64> {
    let mut rng = rand::thread_rng();
    match state.method {
        SimulateMethod::Random => {
            // Flip with probability one half.
            if rng.gen_bool(0.5) {
                Some((1 - point.raw_value().clamp(0, 1)) as f64)
            } else {
                None
            }
        }
        SimulateMethod::Pulse => {
            let period = state.cycle_s.max(1.0) as u64;
            let in_pulse =
                (chrono::Utc::now().timestamp() as u64 % period) < state.pulse_width_s as u64;
            Some(in_pulse as i64 as f64)
        }
        // The remaining waveforms have no binary meaning.
        _ => None,
    }
}

fn next_analog(point: &Point, state: &mut SimState, now: Instant) -> Option<f64> {
    let scaling = point.scaling();
    let (min, max) = (scaling.min_limit, scaling.max_limit);
    let mut rng = rand::thread_rng();

    match state.method {
        SimulateMethod::Random => {
            let low = min.max(-RANDOM_CLAMP);
            let high = max.min(RANDOM_CLAMP);
            if low >= high {
                return None;
            }
            Some(rng.gen_range(low..=high))
        }
        SimulateMethod::AutoIncrement => {
            let step = rng.gen_range(1..=state.step) as f64;
            let value = point.real_value() + step;
            Some(if value <= max { value } else { min })
        }
        SimulateMethod::AutoDecrement => {
            let step = rng.gen_range(1..=state.step) as f64;
            let value = point.real_value() - step;
            Some(if value >= min { value } else { max })
        }
        SimulateMethod::SineWave => {
            let amplitude = (max - min) / 2.0;
            let mid = (max + min) / 2.0;
            let t = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
            let angle =
                2.0 * std::f64::consts::PI * (t % state.cycle_s) / state.cycle_s + state.phase;
            Some(mid + amplitude * angle.sin())
        }
        SimulateMethod::Ramp => {
            match state.ramp_start {
                None => {
                    state.ramp_start = Some(now);
                    state.ramp_from = point.real_value();
                    state.ramp_target = rng.gen_range(min.min(max)..=max.max(min));
                    None
                }
                Some(start) => {
                    let elapsed = now.duration_since(start).as_secs_f64();
                    if elapsed >= state.ramp_time_s {
                        // Target reached; a fresh target is picked next tick.
                        state.ramp_start = None;
                        Some(state.ramp_target)
                    } else {
                        let progress = elapsed / state.ramp_time_s;
                        Some(state.ramp_from + (state.ramp_target - state.ramp_from) * progress)
                    }
                }
            }
        }
        SimulateMethod::Pulse => {
            let period = state.cycle_s.max(1.0) as u64;
            let in_pulse =
                (chrono::Utc::now().timestamp() as u64 % period) < state.pulse_width_s as u64;
            Some(if in_pulse { max } else { min })
        }
    }
}

/// The runtime's tick period.
pub fn tick_period() -> Duration {
    crate::config::SIMULATION_TICK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::PointKind;

    fn analog(code: &str, min_limit: f64, max_limit: f64) -> Arc<Point> {
        Point::builder(PointKind::Analog, code, 1, 0, 3)
            .decode_code(0x41)
            .scaling(1.0, 0.0)
            .limits(min_limit, max_limit)
            .build()
    }

    #[test]
    fn test_random_stays_in_limits() {
        let sim = Simulator::new();
        let p = analog("a", 10.0, 20.0);
        sim.add_point(p.clone(), SimulateMethod::Random, 1);
        sim.set_enabled("a", true);

        for _ in 0..50 {
            for (code, value) in sim.tick() {
                assert_eq!(code, "a");
                assert!((10.0..=20.0).contains(&value), "value {value}");
            }
        }
    }

    #[test]
    fn test_auto_increment_wraps_to_min() {
        let sim = Simulator::new();
        let p = analog("a", 0.0, 10.0);
        p.set_real_value(10.0);
        sim.add_point(p.clone(), SimulateMethod::AutoIncrement, 1);
        sim.set_enabled("a", true);

        let out = sim.tick();
        assert_eq!(out.len(), 1);
        // 10 + 1 exceeds the limit, so the value wraps to the minimum.
        assert_eq!(out[0].1, 0.0);
    }

    #[test]
    fn test_auto_decrement_wraps_to_max() {
        let sim = Simulator::new();
        let p = analog("a", 0.0, 10.0);
        sim.add_point(p.clone(), SimulateMethod::AutoDecrement, 3);
        sim.set_enabled("a", true);

        let out = sim.tick();
        assert_eq!(out[0].1, 10.0);
    }

    #[test]
    fn test_sine_wave_stays_in_band() {
        let sim = Simulator::new();
        let p = analog("a", -50.0, 50.0);
        sim.add_point(p.clone(), SimulateMethod::SineWave, 1);
        sim.set_enabled("a", true);

        let out = sim.tick();
        assert_eq!(out.len(), 1);
        assert!((-50.0..=50.0).contains(&out[0].1));
    }

    #[test]
    fn test_pulse_emits_limit_values() {
        let sim = Simulator::new();
        let p = analog("a", 1.0, 9.0);
        sim.add_point(p.clone(), SimulateMethod::Pulse, 1);
        sim.set_enabled("a", true);

        let out = sim.tick();
        assert!(out[0].1 == 1.0 || out[0].1 == 9.0);
    }

    #[test]
    fn test_disabled_points_do_not_tick() {
        let sim = Simulator::new();
        sim.add_point(analog("a", 0.0, 1.0), SimulateMethod::Random, 1);
        assert!(sim.tick().is_empty());
    }

    #[test]
    fn test_binary_waveforms_skip_unsupported_methods() {
        let sim = Simulator::new();
        let p = Point::builder(PointKind::Signal, "s", 1, 1, 1).build();
        sim.add_point(p, SimulateMethod::SineWave, 1);
        sim.set_enabled("s", true);
        assert!(sim.tick().is_empty());
    }

    #[test]
    fn test_point_info_snapshot() {
        let sim = Simulator::new();
        let p = analog("a", 0.0, 100.0);
        sim.add_point(p, SimulateMethod::Ramp, 5);
        sim.set_step("a", 7);

        let info = sim.point_info("a").unwrap();
        assert_eq!(info.method, SimulateMethod::Ramp);
        assert_eq!(info.step, 7);
        assert!(!info.enabled);
        assert_eq!(info.mul_coe, Some(1.0));
    }
}
