//! Command interpreters of the simulated devices.
//!
//! Each interpreter speaks the same ASCII grammar as the real firmware:
//! `\r`-terminated commands, `\n`-terminated replies, `OK` acknowledgements,
//! `*<value>` query replies and `!<code>` errors.
//!
//! | code | meaning            |
//! |------|--------------------|
//! | 1    | unknown command    |
//! | 2    | argument rejected  |
//! | 3    | busy               |
//! | 4    | not ready          |

use crate::bench::{BenchState, CameraMode, OBJECTIVE_COUNTS_PER_ZSTEP, PUMP_INIT, VALVE_ROTATION};
use crate::port::{SimDevice, SimReply};
use parking_lot::Mutex;
use seq_core::device::DeviceKind;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

const UNKNOWN: u16 = 1;
const REJECTED: u16 = 2;
const BUSY: u16 = 3;
const NOT_READY: u16 = 4;

fn arg<T: FromStr>(tokens: &[&str], index: usize) -> Option<T> {
    tokens.get(index).and_then(|t| t.parse().ok())
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

/// One endpoint of the simulated bench.
pub(crate) struct BenchDevice {
    endpoint: String,
    kind: DeviceKind,
    state: Arc<Mutex<BenchState>>,
    pending_target: i64,
}

impl BenchDevice {
    pub(crate) fn new(endpoint: &str, kind: DeviceKind, state: Arc<Mutex<BenchState>>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            kind,
            state,
            pending_target: 0,
        }
    }

    fn stage(&mut self, state: &mut BenchState, now: Instant, command: &str) -> SimReply {
        let axis = state.axis_mut(self.kind);
        match command {
            "Z" => {
                axis.reset(now);
                SimReply::ok()
            }
            "ON" => {
                axis.servo = true;
                SimReply::ok()
            }
            "MA" => SimReply::ok(),
            "G" | "GH" if !axis.servo => SimReply::error(NOT_READY),
            "G" => {
                axis.go(now, self.pending_target);
                SimReply::ok()
            }
            "GH" => {
                axis.go(now, 0);
                SimReply::ok()
            }
            "S" => {
                axis.stop(now);
                SimReply::ok()
            }
            "R(PA)" => SimReply::value(axis.position(now)),
            "R(MV)" => SimReply::value(flag(axis.is_moving(now))),
            _ => {
                if let Some(v) = command.strip_prefix('V') {
                    match v.parse::<f64>() {
                        Ok(v) if v > 0.0 => {
                            axis.set_velocity(now, v);
                            SimReply::ok()
                        }
                        _ => SimReply::error(REJECTED),
                    }
                } else if let Some(d) = command.strip_prefix('D') {
                    match d.parse::<i64>() {
                        Ok(target) => {
                            self.pending_target = target;
                            SimReply::ok()
                        }
                        Err(_) => SimReply::error(REJECTED),
                    }
                } else {
                    SimReply::error(UNKNOWN)
                }
            }
        }
    }

    fn camera(state: &mut BenchState, now: Instant, tokens: &[&str]) -> SimReply {
        match tokens {
            ["MODE", "TDI"] => {
                state.camera.mode = CameraMode::Tdi;
                SimReply::ok()
            }
            ["MODE", "AREA"] => {
                state.camera.mode = CameraMode::Area;
                SimReply::ok()
            }
            ["MODE?"] => SimReply::Line(
                match state.camera.mode {
                    CameraMode::Tdi => "TDI",
                    CameraMode::Area => "AREA",
                }
                .into(),
            ),
            ["TRIGSRC", "HW"] => {
                state.camera.hardware_trigger = true;
                SimReply::ok()
            }
            ["TRIGSRC", "SW"] => {
                state.camera.hardware_trigger = false;
                SimReply::ok()
            }
            ["ARM", ..] => {
                if state.camera.capturing {
                    return SimReply::error(BUSY);
                }
                match (arg::<u32>(tokens, 1), arg::<u32>(tokens, 2)) {
                    (Some(bundles), Some(height)) if bundles > 0 && height > 0 => {
                        state.camera.armed = Some((bundles, height));
                        state.camera.frames = 0;
                        state.camera.overrun = false;
                        SimReply::ok()
                    }
                    _ => SimReply::error(REJECTED),
                }
            }
            ["START"] => {
                if state.camera.armed.is_none() {
                    return SimReply::error(NOT_READY);
                }
                let position = state.stage_y.position(now);
                state.camera.tick_baseline = state.optics.ticks(position);
                state.camera.capturing = true;
                state.camera.frames = 0;
                SimReply::ok()
            }
            ["TRIG"] => {
                if !state.camera.capturing || state.camera.hardware_trigger {
                    return SimReply::error(NOT_READY);
                }
                state.camera.frames += 1;
                state.camera_frames(now);
                SimReply::ok()
            }
            ["STATUS?"] => {
                let frames = state.camera_frames(now);
                let camera = &state.camera;
                let label = if camera.overrun {
                    "OVERRUN"
                } else if camera.capturing {
                    "CAPTURING"
                } else if camera.armed.is_some() {
                    "ARMED"
                } else {
                    "IDLE"
                };
                SimReply::Line(format!("{} {}", label, frames))
            }
            ["STOP"] => {
                state.camera_frames(now);
                state.camera.capturing = false;
                SimReply::ok()
            }
            ["READ", ..] => {
                let Some((_, height)) = state.camera.armed else {
                    return SimReply::error(NOT_READY);
                };
                match arg::<u32>(tokens, 1) {
                    Some(index) if index < state.camera.frames => {
                        SimReply::Raw(frame_bytes(index, state.frame_width, height))
                    }
                    _ => SimReply::error(REJECTED),
                }
            }
            ["DISARM"] => {
                let camera = &mut state.camera;
                camera.armed = None;
                camera.capturing = false;
                camera.frames = 0;
                camera.overrun = false;
                SimReply::ok()
            }
            _ => SimReply::error(UNKNOWN),
        }
    }

    fn laser(&self, state: &mut BenchState, tokens: &[&str]) -> SimReply {
        let Some(laser) = state.lasers.get_mut(&self.endpoint) else {
            return SimReply::error(UNKNOWN);
        };
        match tokens {
            ["ON"] => {
                laser.emitting = true;
                SimReply::ok()
            }
            ["OFF"] => {
                laser.emitting = false;
                SimReply::ok()
            }
            ["POWER?"] => SimReply::value(format!("{:.1}", laser.power_mw)),
            ["POWER", _] => match arg::<f64>(tokens, 1) {
                Some(mw) if (0.0..=500.0).contains(&mw) => {
                    laser.power_mw = mw;
                    SimReply::ok()
                }
                _ => SimReply::error(REJECTED),
            },
            ["EMIT?"] => SimReply::value(flag(laser.emitting)),
            _ => SimReply::error(UNKNOWN),
        }
    }

    fn optics(state: &mut BenchState, now: Instant, tokens: &[&str]) -> SimReply {
        let optics = &mut state.optics;
        match tokens {
            ["FILTER", wheel, _] => {
                let slot = match *wheel {
                    "G" => 0,
                    "R" => 1,
                    _ => return SimReply::error(REJECTED),
                };
                match arg::<u8>(tokens, 2) {
                    Some(position) => {
                        optics.filters[slot] = position;
                        SimReply::ok()
                    }
                    None => SimReply::error(REJECTED),
                }
            }
            ["SHUTTER", value] => {
                optics.shutter_open = *value == "1";
                SimReply::ok()
            }
            ["LED", value] => {
                optics.led_on = *value == "1";
                SimReply::ok()
            }
            ["TRIGARM", ..] => match (
                arg::<i64>(tokens, 1),
                arg::<i64>(tokens, 2),
                arg::<u32>(tokens, 3),
            ) {
                (Some(start), Some(pitch), Some(count)) if pitch > 0 && count > 0 => {
                    optics.trigger = Some((start, pitch, count));
                    SimReply::ok()
                }
                _ => SimReply::error(REJECTED),
            },
            ["TRIGDISARM"] => {
                optics.trigger = None;
                SimReply::ok()
            }
            ["ZSTEP", _] => match arg::<u32>(tokens, 1) {
                Some(units) if units > 0 => {
                    let velocity = f64::from(units) * OBJECTIVE_COUNTS_PER_ZSTEP;
                    state.objective.set_velocity(now, velocity);
                    SimReply::ok()
                }
                _ => SimReply::error(REJECTED),
            },
            ["ZMV", _] => match arg::<u16>(tokens, 1) {
                Some(target) => {
                    state.objective.go(now, i64::from(target));
                    SimReply::ok()
                }
                None => SimReply::error(REJECTED),
            },
            ["ZDACR"] => SimReply::value(state.objective.position(now)),
            ["STATUS?"] => {
                let ticks = optics.ticks(state.stage_y.position(now));
                let optics = &state.optics;
                SimReply::Line(format!(
                    "SHUTTER={} LED={} TRIG={} TICKS={}",
                    flag(optics.shutter_open),
                    flag(optics.led_on),
                    flag(optics.trigger.is_some()),
                    ticks
                ))
            }
            _ => SimReply::error(UNKNOWN),
        }
    }

    fn pump(&self, state: &mut BenchState, now: Instant, tokens: &[&str]) -> SimReply {
        let max_steps = state.pump_steps;
        let Some(pump) = state.pumps.get_mut(&self.endpoint) else {
            return SimReply::error(UNKNOWN);
        };
        let busy = pump.busy(now);
        match tokens {
            ["STATUS?"] => {
                if busy {
                    SimReply::Line(format!("BUSY {}", pump.position(now)))
                } else {
                    SimReply::Line(format!("IDLE {}", pump.plunger))
                }
            }
            ["STOP"] => {
                pump.plunger = pump.position(now);
                pump.stroke = None;
                SimReply::ok()
            }
            _ if busy => SimReply::error(BUSY),
            ["INIT"] => {
                pump.stroke = Some((pump.plunger, 0, now, now + PUMP_INIT));
                SimReply::ok()
            }
            ["ASPIRATE", ..] | ["DISPENSE", ..] => {
                let (Some(steps), Some(speed)) = (arg::<u32>(tokens, 1), arg::<u32>(tokens, 2))
                else {
                    return SimReply::error(REJECTED);
                };
                let to = if tokens[0] == "ASPIRATE" {
                    pump.plunger.checked_add(steps).filter(|to| *to <= max_steps)
                } else {
                    pump.plunger.checked_sub(steps)
                };
                match to {
                    Some(to) if speed > 0 => {
                        let duration = Duration::from_secs_f64(f64::from(steps) / f64::from(speed));
                        pump.stroke = Some((pump.plunger, to, now, now + duration));
                        SimReply::ok()
                    }
                    _ => SimReply::error(REJECTED),
                }
            }
            _ => SimReply::error(UNKNOWN),
        }
    }

    fn valve(&self, state: &mut BenchState, now: Instant, tokens: &[&str]) -> SimReply {
        let ports = state.valve_ports;
        let Some(valve) = state.valves.get_mut(&self.endpoint) else {
            return SimReply::error(UNKNOWN);
        };
        match tokens {
            ["GO", _] => match arg::<u8>(tokens, 1) {
                Some(port) if (1..=ports).contains(&port) => {
                    if port != valve.port {
                        valve.port = port;
                        valve.settles_at = now + VALVE_ROTATION;
                    }
                    SimReply::ok()
                }
                _ => SimReply::error(REJECTED),
            },
            ["POS?"] => {
                if now < valve.settles_at {
                    SimReply::value(0)
                } else {
                    SimReply::value(valve.port)
                }
            }
            _ => SimReply::error(UNKNOWN),
        }
    }

    fn chemistry(state: &mut BenchState, now: Instant, tokens: &[&str]) -> SimReply {
        match tokens {
            ["FCTEMP", _, _] => {
                match (arg::<usize>(tokens, 1), arg::<f64>(tokens, 2)) {
                    (Some(index), Some(target)) if index < 2 && target.is_finite() => {
                        state.holders[index].set(now, target);
                        SimReply::ok()
                    }
                    _ => SimReply::error(REJECTED),
                }
            }
            ["FCTEMP?", _] => match arg::<usize>(tokens, 1) {
                Some(index) if index < 2 => {
                    SimReply::value(format!("{:.2}", state.holders[index].temperature(now)))
                }
                _ => SimReply::error(REJECTED),
            },
            ["SHUTOFF", value] => {
                state.shutoff_open = *value == "1";
                SimReply::ok()
            }
            ["SHUTOFF?"] => SimReply::value(flag(state.shutoff_open)),
            _ => SimReply::error(UNKNOWN),
        }
    }
}

impl SimDevice for BenchDevice {
    fn respond(&mut self, command: &str) -> SimReply {
        let now = Instant::now();
        let state = self.state.clone();
        let mut state = state.lock();
        let tokens: Vec<&str> = command.split_whitespace().collect();

        let reply = match self.kind {
            DeviceKind::StageX | DeviceKind::StageY => self.stage(&mut state, now, command),
            DeviceKind::Camera => Self::camera(&mut state, now, &tokens),
            DeviceKind::Laser => self.laser(&mut state, &tokens),
            DeviceKind::Optics => Self::optics(&mut state, now, &tokens),
            DeviceKind::Pump => self.pump(&mut state, now, &tokens),
            DeviceKind::Valve => self.valve(&mut state, now, &tokens),
            DeviceKind::Chemistry => Self::chemistry(&mut state, now, &tokens),
        };
        trace!(endpoint = %self.endpoint, command, ?reply, "sim");
        reply
    }
}

/// Deterministic test pattern for frame `index`.
pub fn frame_bytes(index: u32, width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(width as usize * height as usize * 2);
    for row in 0..height {
        for col in 0..width {
            let value = ((index * 31 + row * 7 + col) % 4096) as u16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use crate::bench::SimBench;
    use seq_core::config::InstrumentConfig;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn ask(port: &mut BufReader<seq_core::serial::DynSerial>, command: &str) -> String {
        port.get_mut()
            .write_all(format!("{}\r", command).as_bytes())
            .await
            .unwrap();
        let mut line = String::new();
        port.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn stage_requires_servo_and_moves() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let mut stage = BufReader::new(bench.open("stage_y").unwrap());

        assert_eq!(ask(&mut stage, "G").await, "!4");
        assert_eq!(ask(&mut stage, "ON").await, "OK");
        assert_eq!(ask(&mut stage, "V1000").await, "OK");
        assert_eq!(ask(&mut stage, "D2000").await, "OK");
        assert_eq!(ask(&mut stage, "G").await, "OK");
        assert_eq!(ask(&mut stage, "R(MV)").await, "*1");

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(ask(&mut stage, "R(PA)").await, "*2000");
        assert_eq!(ask(&mut stage, "R(MV)").await, "*0");
    }

    #[tokio::test(start_paused = true)]
    async fn valve_reports_zero_while_rotating() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let mut valve = BufReader::new(bench.open("valve_a").unwrap());

        assert_eq!(ask(&mut valve, "GO 5").await, "OK");
        assert_eq!(ask(&mut valve, "POS?").await, "*0");
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(ask(&mut valve, "POS?").await, "*5");
        assert_eq!(ask(&mut valve, "GO 99").await, "!2");
    }

    #[tokio::test(start_paused = true)]
    async fn pump_stroke_takes_steps_over_speed() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let mut pump = BufReader::new(bench.open("pump_b").unwrap());

        assert_eq!(ask(&mut pump, "ASPIRATE 1000 500").await, "OK");
        assert_eq!(ask(&mut pump, "ASPIRATE 10 500").await, "!3");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(ask(&mut pump, "STATUS?").await.starts_with("BUSY"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ask(&mut pump, "STATUS?").await, "IDLE 1000");
        assert_eq!(ask(&mut pump, "DISPENSE 2000 500").await, "!2");
    }

    #[test]
    fn frame_pattern_has_expected_size() {
        assert_eq!(super::frame_bytes(3, 16, 4).len(), 16 * 4 * 2);
    }
}
