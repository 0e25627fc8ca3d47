//! Scan plans and their up-front validation.
//!
//! A plan is checked against stage travel, camera buffer and imaging
//! configuration before the imager sends a single command, so a bad plan
//! never leaves hardware half configured.

use seq_core::config::{CameraConfig, ImagingConfig, StageConfig, TriggerSource};
use seq_core::error::{SeqError, SeqResult};
use seq_core::limits::{bundle_buffer_bytes, validate_frame_size};
use seq_drivers::laser::MAX_POWER_MW;
use seq_drivers::objective::Z_RANGE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Filter, LED and laser settings applied while a scan is armed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticsSetup {
    pub green_filter: Option<u8>,
    pub red_filter: Option<u8>,
    pub led: bool,
    /// Green laser power (mW); `None` leaves the laser off
    pub green_power_mw: Option<f64>,
    /// Red laser power (mW); `None` leaves the laser off
    pub red_power_mw: Option<f64>,
}

/// One synchronized TDI pass along Stage-Y.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    /// Frames (bundles) to capture
    pub bundles: u32,
    /// TDI lines per frame
    pub frame_height: u32,
    /// Y position where the first bundle starts (steps)
    pub y_start: i64,
    /// Y position the stage travels to (steps)
    pub y_end: i64,
    /// Constant scan velocity (steps/s)
    pub velocity: f64,
    /// Lane position; `None` leaves Stage-X where it is
    #[serde(default)]
    pub x_position: Option<i64>,
    /// Objective focus (DAC counts); `None` leaves it where it is
    #[serde(default)]
    pub z_position: Option<u32>,
    #[serde(default)]
    pub optics: OpticsSetup,
    #[serde(default)]
    pub label: Option<String>,
}

/// Derived quantities of a validated plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanGeometry {
    /// Stage travel per bundle (steps)
    pub pitch: i64,
    /// Time the stage needs to cover one pitch
    pub trigger_period: Duration,
}

impl ScanPlan {
    pub fn travel(&self) -> i64 {
        self.y_end - self.y_start
    }

    /// Y position at which bundle `index` starts.
    pub fn nominal_position(&self, index: u32, pitch: i64) -> i64 {
        self.y_start + i64::from(index) * pitch
    }

    /// Check the plan against every configured limit. Sends nothing.
    pub fn validate(
        &self,
        stage: &StageConfig,
        camera: &CameraConfig,
        imaging: &ImagingConfig,
    ) -> SeqResult<ScanGeometry> {
        let invalid = |msg: String| Err(SeqError::InvalidPlan(msg));

        if self.bundles == 0 {
            return invalid("bundle count must be at least 1".into());
        }
        validate_frame_size(camera.frame_width, self.frame_height)?;
        if self.frame_height > camera.max_frame_height {
            return invalid(format!(
                "frame height {} exceeds camera maximum {}",
                self.frame_height, camera.max_frame_height
            ));
        }
        let buffer = bundle_buffer_bytes(camera.frame_width, self.frame_height, self.bundles)?;
        if buffer > camera.buffer_capacity_bytes {
            return invalid(format!(
                "{} bundles need {} bytes, camera buffer holds {}",
                self.bundles, buffer, camera.buffer_capacity_bytes
            ));
        }

        for (name, position) in [("y_start", self.y_start), ("y_end", self.y_end)] {
            if !stage.y.contains(position) {
                return invalid(format!(
                    "{} {} outside Y travel [{}, {}]",
                    name, position, stage.y.min, stage.y.max
                ));
            }
        }
        if let Some(x) = self.x_position {
            if !stage.x.contains(x) {
                return invalid(format!(
                    "x_position {} outside X travel [{}, {}]",
                    x, stage.x.min, stage.x.max
                ));
            }
        }
        if let Some(z) = self.z_position {
            if !Z_RANGE.contains(&z) {
                return invalid(format!("z_position {} outside {:?}", z, Z_RANGE));
            }
        }
        if self.y_end <= self.y_start {
            return invalid(format!(
                "y_end {} must be beyond y_start {}",
                self.y_end, self.y_start
            ));
        }

        if !(self.velocity.is_finite() && self.velocity > 0.0) {
            return invalid(format!("velocity {} must be positive", self.velocity));
        }
        if self.velocity > stage.max_scan_velocity {
            return invalid(format!(
                "velocity {} exceeds maximum scan velocity {}",
                self.velocity, stage.max_scan_velocity
            ));
        }

        let pitch = (f64::from(self.frame_height) * imaging.units_per_line).round() as i64;
        if pitch < 1 {
            return invalid(format!(
                "frame height {} covers less than one stage step",
                self.frame_height
            ));
        }
        let needed = pitch.saturating_mul(i64::from(self.bundles));
        if self.travel() < needed {
            return invalid(format!(
                "travel {} is shorter than {} bundles of {} steps",
                self.travel(),
                self.bundles,
                pitch
            ));
        }

        for (name, power) in [
            ("green", self.optics.green_power_mw),
            ("red", self.optics.red_power_mw),
        ] {
            if let Some(mw) = power {
                if !(0.0..=MAX_POWER_MW).contains(&mw) {
                    return invalid(format!("{} laser power {} mW outside 0..={}", name, mw, MAX_POWER_MW));
                }
            }
        }

        let Ok(trigger_period) = Duration::try_from_secs_f64(pitch as f64 / self.velocity) else {
            return invalid(format!(
                "velocity {} is too slow for a {} step pitch",
                self.velocity, pitch
            ));
        };
        if imaging.trigger_source == TriggerSource::SoftwareTimer && trigger_period <= imaging.jitter_tolerance {
            return invalid(format!(
                "trigger period {:?} is within the jitter tolerance {:?}",
                trigger_period, imaging.jitter_tolerance
            ));
        }

        Ok(ScanGeometry {
            pitch,
            trigger_period,
        })
    }
}
