//! Shared physical model behind the simulated devices.
//!
//! Devices on a real instrument are coupled through physics: the FPGA fires
//! camera triggers when the Y stage crosses encoder positions, the camera
//! counts those triggers as captured bundles, a pump plunger takes time to
//! travel. [`SimBench`] owns one [`BenchState`] that every simulated port
//! reads and mutates, driven by `tokio::time::Instant` so tests can run on
//! paused virtual time.

use crate::devices::BenchDevice;
use crate::port::{PortHandle, SimPort};
use parking_lot::Mutex;
use seq_core::config::{InstrumentConfig, ENDPOINTS};
use seq_core::device::DeviceKind;
use seq_core::error::{SeqError, SeqResult};
use seq_core::serial::DynSerial;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Ambient flowcell temperature (°C).
pub const AMBIENT_TEMPERATURE: f64 = 22.0;
/// Heating/cooling rate of the flowcell holders (°C/s).
pub const TEMPERATURE_RAMP: f64 = 2.0;
/// Time a selector valve needs to rotate to a new port.
pub const VALVE_ROTATION: Duration = Duration::from_millis(150);
/// Time a pump needs to initialize its plunger.
pub const PUMP_INIT: Duration = Duration::from_millis(200);
/// Objective DAC position after power-up.
pub const OBJECTIVE_HOME: i64 = 65_535;
/// Objective DAC counts travelled per second for one `ZSTEP` unit
/// (262 counts/µm, 1288471 units per mm/s).
pub const OBJECTIVE_COUNTS_PER_ZSTEP: f64 = 262_000.0 / 1_288_471.0;

// =============================================================================
// Stage axis
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct Axis {
    origin: i64,
    origin_at: Instant,
    pub(crate) target: i64,
    pub(crate) velocity: f64,
    moving: bool,
    pub(crate) servo: bool,
    stall_at: Option<i64>,
}

impl Axis {
    fn new(now: Instant) -> Self {
        Self {
            origin: 0,
            origin_at: now,
            target: 0,
            velocity: 0.0,
            moving: false,
            servo: false,
            stall_at: None,
        }
    }

    fn unclamped(&self, now: Instant) -> i64 {
        if !self.moving {
            return self.origin;
        }
        let span = (self.target - self.origin).abs();
        let travelled = (self.velocity * now.duration_since(self.origin_at).as_secs_f64()) as i64;
        self.origin + (self.target - self.origin).signum() * travelled.min(span)
    }

    fn stall_on_path(&self, position: i64) -> Option<i64> {
        let stall = self.stall_at?;
        let (lo, hi) = if self.origin <= position {
            (self.origin, position)
        } else {
            (position, self.origin)
        };
        (self.moving && lo <= stall && stall <= hi && stall != self.origin).then_some(stall)
    }

    pub(crate) fn position(&self, now: Instant) -> i64 {
        let position = self.unclamped(now);
        self.stall_on_path(position).unwrap_or(position)
    }

    pub(crate) fn is_moving(&self, now: Instant) -> bool {
        if !self.moving {
            return false;
        }
        let position = self.unclamped(now);
        self.stall_on_path(position).is_some() || position != self.target
    }

    /// Freeze the current position as the new motion origin.
    fn rebase(&mut self, now: Instant) {
        self.origin = self.position(now);
        self.origin_at = now;
        self.moving = false;
    }

    pub(crate) fn go(&mut self, now: Instant, target: i64) {
        self.rebase(now);
        self.target = target;
        self.moving = self.velocity > 0.0 && target != self.origin;
    }

    /// Change velocity; a move in progress continues from where it is.
    pub(crate) fn set_velocity(&mut self, now: Instant, velocity: f64) {
        let resume = self.moving;
        self.rebase(now);
        self.velocity = velocity;
        if resume {
            self.go(now, self.target);
        }
    }

    pub(crate) fn stop(&mut self, now: Instant) {
        self.rebase(now);
        self.target = self.origin;
    }

    pub(crate) fn reset(&mut self, now: Instant) {
        self.stop(now);
        self.servo = false;
    }
}

// =============================================================================
// Camera + FPGA trigger
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CameraMode {
    Tdi,
    Area,
}

#[derive(Debug, Clone)]
pub(crate) struct CameraSim {
    pub(crate) mode: CameraMode,
    pub(crate) hardware_trigger: bool,
    pub(crate) armed: Option<(u32, u32)>,
    pub(crate) capturing: bool,
    pub(crate) frames: u32,
    pub(crate) tick_baseline: u32,
    pub(crate) overrun: bool,
    pub(crate) overrun_after: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct OpticsSim {
    pub(crate) filters: [u8; 2],
    pub(crate) shutter_open: bool,
    pub(crate) led_on: bool,
    /// (start, pitch, count)
    pub(crate) trigger: Option<(i64, i64, u32)>,
    pub(crate) drop_after: Option<u32>,
}

impl OpticsSim {
    /// Triggers fired for a stage at `position` (bundles completed).
    pub(crate) fn ticks(&self, position: i64) -> u32 {
        let Some((start, pitch, count)) = self.trigger else {
            return 0;
        };
        if pitch <= 0 || position < start {
            return 0;
        }
        let fired = ((position - start) / pitch).min(i64::from(count)) as u32;
        self.drop_after.map_or(fired, |n| fired.min(n))
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct LaserSim {
    pub(crate) emitting: bool,
    pub(crate) power_mw: f64,
}

// =============================================================================
// Fluidics
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct PumpSim {
    pub(crate) plunger: u32,
    /// (from, to, started, finishes)
    pub(crate) stroke: Option<(u32, u32, Instant, Instant)>,
    pub(crate) stalled: bool,
}

impl PumpSim {
    pub(crate) fn position(&self, now: Instant) -> u32 {
        match self.stroke {
            Some((from, to, started, finishes)) => {
                let total = finishes.duration_since(started).as_secs_f64();
                let done = if total <= 0.0 {
                    1.0
                } else {
                    (now.duration_since(started).as_secs_f64() / total).min(1.0)
                };
                let done = if self.stalled { done.min(0.5) } else { done };
                let delta = (f64::from(to) - f64::from(from)) * done;
                (f64::from(from) + delta).round() as u32
            }
            None => self.plunger,
        }
    }

    pub(crate) fn busy(&mut self, now: Instant) -> bool {
        match self.stroke {
            Some((_, _, _, finishes)) if self.stalled || now < finishes => true,
            Some((_, to, _, _)) => {
                self.plunger = to;
                self.stroke = None;
                false
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ValveSim {
    pub(crate) port: u8,
    pub(crate) settles_at: Instant,
}

#[derive(Debug, Clone)]
pub(crate) struct HolderSim {
    from: f64,
    from_at: Instant,
    setpoint: f64,
    pub(crate) frozen: bool,
}

impl HolderSim {
    pub(crate) fn temperature(&self, now: Instant) -> f64 {
        if self.frozen {
            return self.from;
        }
        let step = TEMPERATURE_RAMP * now.duration_since(self.from_at).as_secs_f64();
        let gap = self.setpoint - self.from;
        self.from + gap.signum() * step.min(gap.abs())
    }

    pub(crate) fn set(&mut self, now: Instant, setpoint: f64) {
        self.from = self.temperature(now);
        self.from_at = now;
        self.setpoint = setpoint;
    }
}

// =============================================================================
// Bench state
// =============================================================================

/// Everything the simulated devices share.
#[derive(Debug)]
pub(crate) struct BenchState {
    pub(crate) frame_width: u32,
    pub(crate) pump_steps: u32,
    pub(crate) valve_ports: u8,
    pub(crate) stage_x: Axis,
    pub(crate) stage_y: Axis,
    pub(crate) camera: CameraSim,
    pub(crate) optics: OpticsSim,
    /// Objective focus drive, in DAC counts
    pub(crate) objective: Axis,
    pub(crate) lasers: BTreeMap<String, LaserSim>,
    pub(crate) pumps: BTreeMap<String, PumpSim>,
    pub(crate) valves: BTreeMap<String, ValveSim>,
    pub(crate) holders: [HolderSim; 2],
    pub(crate) shutoff_open: bool,
}

impl BenchState {
    fn new(config: &InstrumentConfig, now: Instant) -> Self {
        let holder = HolderSim {
            from: AMBIENT_TEMPERATURE,
            from_at: now,
            setpoint: AMBIENT_TEMPERATURE,
            frozen: false,
        };
        let mut lasers = BTreeMap::new();
        let mut pumps = BTreeMap::new();
        let mut valves = BTreeMap::new();
        for (endpoint, kind) in ENDPOINTS {
            match kind {
                DeviceKind::Laser => {
                    lasers.insert(endpoint.to_string(), LaserSim::default());
                }
                DeviceKind::Pump => {
                    pumps.insert(
                        endpoint.to_string(),
                        PumpSim {
                            plunger: 0,
                            stroke: None,
                            stalled: false,
                        },
                    );
                }
                DeviceKind::Valve => {
                    valves.insert(
                        endpoint.to_string(),
                        ValveSim {
                            port: 1,
                            settles_at: now,
                        },
                    );
                }
                _ => {}
            }
        }

        Self {
            frame_width: config.camera.frame_width,
            pump_steps: config.fluidics.pump_steps,
            valve_ports: config.fluidics.valve_ports,
            stage_x: Axis::new(now),
            stage_y: Axis::new(now),
            camera: CameraSim {
                mode: CameraMode::Tdi,
                hardware_trigger: true,
                armed: None,
                capturing: false,
                frames: 0,
                tick_baseline: 0,
                overrun: false,
                overrun_after: None,
            },
            optics: OpticsSim::default(),
            objective: Axis {
                origin: OBJECTIVE_HOME,
                target: OBJECTIVE_HOME,
                ..Axis::new(now)
            },
            lasers,
            pumps,
            valves,
            holders: [holder.clone(), holder],
            shutoff_open: false,
        }
    }

    pub(crate) fn axis_mut(&mut self, kind: DeviceKind) -> &mut Axis {
        match kind {
            DeviceKind::StageX => &mut self.stage_x,
            _ => &mut self.stage_y,
        }
    }

    /// Bundles captured so far; advances the camera's counter.
    pub(crate) fn camera_frames(&mut self, now: Instant) -> u32 {
        let camera = &mut self.camera;
        if camera.capturing && camera.hardware_trigger {
            let ticks = self.optics.ticks(self.stage_y.position(now));
            let captured = ticks.saturating_sub(camera.tick_baseline);
            camera.frames = camera.frames.max(captured);
        }
        if let Some((bundles, _)) = camera.armed {
            camera.frames = camera.frames.min(bundles);
        }
        if let Some(limit) = camera.overrun_after {
            if camera.frames > limit {
                camera.frames = limit;
                camera.overrun = true;
            }
        }
        camera.frames
    }
}

// =============================================================================
// SimBench
// =============================================================================

/// A complete simulated instrument.
///
/// ```rust,ignore
/// let bench = SimBench::new(&config);
/// let port = bench.open("stage_y")?;          // DynSerial for a driver
/// bench.handle("stage_y").unwrap().count("G"); // inspect traffic
/// bench.stall_stage(DeviceKind::StageY, 1_500); // inject physics faults
/// ```
#[derive(Clone)]
pub struct SimBench {
    state: Arc<Mutex<BenchState>>,
    handles: Arc<Mutex<BTreeMap<String, PortHandle>>>,
}

impl SimBench {
    pub fn new(config: &InstrumentConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState::new(config, Instant::now()))),
            handles: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Open the simulated port wired to `endpoint`.
    pub fn open(&self, endpoint: &str) -> SeqResult<DynSerial> {
        let kind = ENDPOINTS
            .iter()
            .find(|(name, _)| *name == endpoint)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| SeqError::Io(format!("no simulated device on {}", endpoint)))?;

        let device = BenchDevice::new(endpoint, kind, self.state.clone());
        let (port, handle) = SimPort::new(endpoint, device);
        self.handles.lock().insert(endpoint.to_string(), handle);
        Ok(Box::new(port))
    }

    /// Open every endpoint of a fully populated instrument.
    pub fn open_all(&self) -> SeqResult<BTreeMap<String, DynSerial>> {
        ENDPOINTS
            .iter()
            .map(|(endpoint, _)| Ok((endpoint.to_string(), self.open(endpoint)?)))
            .collect()
    }

    /// Traffic/fault handle of an opened endpoint.
    pub fn handle(&self, endpoint: &str) -> Option<PortHandle> {
        self.handles.lock().get(endpoint).cloned()
    }

    /// Total commands received across every opened port.
    pub fn total_commands(&self) -> usize {
        self.handles
            .lock()
            .values()
            .map(|h| h.transcript().len())
            .sum()
    }

    // -- physics faults -------------------------------------------------------

    /// The axis stops physically at `position` and keeps reporting motion.
    pub fn stall_stage(&self, kind: DeviceKind, position: i64) {
        self.state.lock().axis_mut(kind).stall_at = Some(position);
    }

    /// The FPGA stops firing triggers after `n`.
    pub fn drop_triggers_after(&self, n: u32) {
        self.state.lock().optics.drop_after = Some(n);
    }

    /// The camera overruns once more than `n` bundles arrive.
    pub fn overrun_camera_after(&self, n: u32) {
        self.state.lock().camera.overrun_after = Some(n);
    }

    /// The pump plunger jams halfway through its next stroke.
    pub fn stall_pump(&self, endpoint: &str) {
        if let Some(pump) = self.state.lock().pumps.get_mut(endpoint) {
            pump.stalled = true;
        }
    }

    /// The holder of `flowcell` (0 or 1) never leaves its current temperature.
    pub fn freeze_temperature(&self, flowcell: usize) {
        if let Some(holder) = self.state.lock().holders.get_mut(flowcell) {
            holder.frozen = true;
        }
    }

    // -- observations ---------------------------------------------------------

    pub fn stage_position(&self, kind: DeviceKind) -> i64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.axis_mut(kind).position(now)
    }

    pub fn stage_moving(&self, kind: DeviceKind) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.axis_mut(kind).is_moving(now)
    }

    pub fn objective_position(&self) -> i64 {
        let now = Instant::now();
        self.state.lock().objective.position(now)
    }

    pub fn shutter_open(&self) -> bool {
        self.state.lock().optics.shutter_open
    }

    pub fn led_on(&self) -> bool {
        self.state.lock().optics.led_on
    }

    pub fn trigger_armed(&self) -> bool {
        self.state.lock().optics.trigger.is_some()
    }

    pub fn camera_capturing(&self) -> bool {
        self.state.lock().camera.capturing
    }

    pub fn laser_emitting(&self, endpoint: &str) -> bool {
        self.state
            .lock()
            .lasers
            .get(endpoint)
            .is_some_and(|l| l.emitting)
    }

    /// Whether any laser, the LED or the shutter is still energized.
    pub fn optics_energized(&self) -> bool {
        let state = self.state.lock();
        state.optics.shutter_open
            || state.optics.led_on
            || state.lasers.values().any(|l| l.emitting)
    }

    pub fn valve_port(&self, endpoint: &str) -> Option<u8> {
        self.state.lock().valves.get(endpoint).map(|v| v.port)
    }

    pub fn pump_plunger(&self, endpoint: &str) -> Option<u32> {
        let now = Instant::now();
        self.state.lock().pumps.get(endpoint).map(|p| p.position(now))
    }

    pub fn temperature(&self, flowcell: usize) -> Option<f64> {
        let now = Instant::now();
        self.state
            .lock()
            .holders
            .get(flowcell)
            .map(|h| h.temperature(now))
    }

    pub fn shutoff_open(&self) -> bool {
        self.state.lock().shutoff_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn axis_moves_at_velocity_and_stops_at_target() {
        let now = Instant::now();
        let mut axis = Axis::new(now);
        axis.velocity = 1_000.0;
        axis.go(now, 500);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(axis.position(Instant::now()), 250);
        assert!(axis.is_moving(Instant::now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(axis.position(Instant::now()), 500);
        assert!(!axis.is_moving(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn velocity_change_keeps_position() {
        let now = Instant::now();
        let mut axis = Axis::new(now);
        axis.velocity = 1_000.0;
        axis.go(now, 1_000);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(axis.position(Instant::now()), 1_000);

        // Slower velocity after the move has ended: nothing jumps.
        axis.set_velocity(Instant::now(), 10.0);
        assert_eq!(axis.position(Instant::now()), 1_000);
        axis.go(Instant::now(), 2_000);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(axis.position(Instant::now()), 1_010);

        // Velocity change mid-move continues from the current position.
        axis.set_velocity(Instant::now(), 100.0);
        assert_eq!(axis.position(Instant::now()), 1_010);
        assert!(axis.is_moving(Instant::now()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(axis.position(Instant::now()), 1_110);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_axis_keeps_reporting_motion() {
        let now = Instant::now();
        let mut axis = Axis::new(now);
        axis.velocity = 1_000.0;
        axis.stall_at = Some(100);
        axis.go(now, 500);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(axis.position(Instant::now()), 100);
        assert!(axis.is_moving(Instant::now()));
    }

    #[test]
    fn trigger_ticks_follow_position() {
        let optics = OpticsSim {
            trigger: Some((1_000, 80, 4)),
            ..OpticsSim::default()
        };
        assert_eq!(optics.ticks(999), 0);
        assert_eq!(optics.ticks(1_079), 0);
        assert_eq!(optics.ticks(1_080), 1);
        assert_eq!(optics.ticks(5_000), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn temperature_ramps_to_setpoint() {
        let config = InstrumentConfig::default();
        let bench = SimBench::new(&config);
        {
            let now = Instant::now();
            bench.state.lock().holders[0].set(now, 30.0);
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(bench.temperature(0), Some(26.0));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(bench.temperature(0), Some(30.0));
    }
}
