//! Instrument configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. built-in defaults (every section is optional)
//! 2. a TOML file
//! 3. environment variables prefixed with `SEQ_`, `__` separating nested keys
//!
//! ```text
//! SEQ_DEVICES__PUMP__TIMEOUT=2s       -> devices.pump.timeout
//! SEQ_IMAGING__TRIGGER_SOURCE=software_timer
//! ```
//!
//! # Example
//! ```no_run
//! use seq_core::config::InstrumentConfig;
//!
//! let config = InstrumentConfig::load_from("config/instrument.toml")?;
//! println!("trigger source: {}", config.imaging.trigger_source);
//! # Ok::<(), seq_core::error::SeqError>(())
//! ```

use crate::device::DeviceKind;
use crate::error::{SeqError, SeqResult};
use crate::limits::validate_frame_size;
use crate::link::LinkSettings;
use crate::retry::{PollPolicy, RetryPolicy};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Endpoint names of a fully populated instrument and the kind wired to each.
pub const ENDPOINTS: [(&str, DeviceKind); 11] = [
    ("stage_x", DeviceKind::StageX),
    ("stage_y", DeviceKind::StageY),
    ("camera", DeviceKind::Camera),
    ("laser_green", DeviceKind::Laser),
    ("laser_red", DeviceKind::Laser),
    ("optics", DeviceKind::Optics),
    ("pump_a", DeviceKind::Pump),
    ("pump_b", DeviceKind::Pump),
    ("valve_a", DeviceKind::Valve),
    ("valve_b", DeviceKind::Valve),
    ("chemistry", DeviceKind::Chemistry),
];

/// Top-level instrument configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub logging: LoggingConfig,
    /// Serial ports keyed by endpoint name (see [`ENDPOINTS`]).
    pub ports: BTreeMap<String, PortConfig>,
    pub devices: DeviceTable,
    pub stage: StageConfig,
    pub camera: CameraConfig,
    pub imaging: ImagingConfig,
    pub fluidics: FluidicsConfig,
}

// =============================================================================
// Logging
// =============================================================================

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable with colors
    #[default]
    Pretty,
    /// Single line
    Compact,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub format: LogFormat,
    /// Log span enter/exit events
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            span_events: false,
        }
    }
}

// =============================================================================
// Ports and per-kind device settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`
    pub path: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_baud() -> u32 {
    9600
}

/// Timeout, retry and polling for one device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Per-transaction response timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    /// Quiet period used to drain stale bytes after an unclean frame
    #[serde(with = "humantime_serde")]
    pub drain_window: Duration,
}

impl DeviceSettings {
    pub fn link(&self) -> LinkSettings {
        LinkSettings {
            timeout: self.timeout,
            retry: self.retry,
            poll: self.poll,
        }
    }

    fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
            drain_window: Duration::from_millis(20),
        }
    }
}

/// `[devices.<kind>]` tables. Missing kinds use their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTable {
    pub stage_x: DeviceSettings,
    pub stage_y: DeviceSettings,
    pub camera: DeviceSettings,
    pub laser: DeviceSettings,
    pub optics: DeviceSettings,
    pub pump: DeviceSettings,
    pub valve: DeviceSettings,
    pub chemistry: DeviceSettings,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self {
            stage_x: DeviceSettings::default(),
            stage_y: DeviceSettings::default(),
            // Frame readouts are large binary transfers.
            camera: DeviceSettings::with_timeout(Duration::from_secs(5)),
            laser: DeviceSettings::default(),
            optics: DeviceSettings::default(),
            pump: DeviceSettings::with_timeout(Duration::from_secs(1)),
            valve: DeviceSettings::with_timeout(Duration::from_secs(1)),
            chemistry: DeviceSettings::default(),
        }
    }
}

impl DeviceTable {
    pub fn get(&self, kind: DeviceKind) -> &DeviceSettings {
        match kind {
            DeviceKind::StageX => &self.stage_x,
            DeviceKind::StageY => &self.stage_y,
            DeviceKind::Camera => &self.camera,
            DeviceKind::Laser => &self.laser,
            DeviceKind::Optics => &self.optics,
            DeviceKind::Pump => &self.pump,
            DeviceKind::Valve => &self.valve,
            DeviceKind::Chemistry => &self.chemistry,
        }
    }
}

// =============================================================================
// Stage
// =============================================================================

/// Inclusive travel range of one axis, in encoder steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisLimits {
    pub min: i64,
    pub max: i64,
}

impl AxisLimits {
    pub fn contains(&self, position: i64) -> bool {
        (self.min..=self.max).contains(&position)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub x: AxisLimits,
    pub y: AxisLimits,
    /// Largest accepted |readback - target| after a move, in steps
    pub settle_tolerance: i64,
    /// Repositioning velocity (steps/s)
    pub moving_velocity: f64,
    /// Fastest accepted imaging velocity (steps/s)
    pub max_scan_velocity: f64,
    pub home_position: i64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            x: AxisLimits {
                min: 0,
                max: 60_000,
            },
            y: AxisLimits {
                min: -7_000_000,
                max: 7_500_000,
            },
            settle_tolerance: 10,
            moving_velocity: 400_000.0,
            max_scan_velocity: 100_000.0,
            home_position: 0,
        }
    }
}

impl StageConfig {
    pub fn limits(&self, kind: DeviceKind) -> AxisLimits {
        match kind {
            DeviceKind::StageX => self.x,
            _ => self.y,
        }
    }
}

// =============================================================================
// Camera / imaging
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Sensor width in pixels
    pub frame_width: u32,
    /// Largest bundle height (lines) the camera accepts
    pub max_frame_height: u32,
    /// On-camera frame buffer capacity
    pub buffer_capacity_bytes: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            frame_width: 4096,
            max_frame_height: 1024,
            buffer_capacity_bytes: 1 << 30,
        }
    }
}

/// What fires the camera during a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// FPGA position compare on the Y encoder; no software in the timing path
    #[default]
    HardwareTick,
    /// Host timer keyed to the expected stage position
    SoftwareTimer,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::HardwareTick => write!(f, "hardware_tick"),
            TriggerSource::SoftwareTimer => write!(f, "software_timer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    pub trigger_source: TriggerSource,
    /// Latest a software trigger may fire after its scheduled time
    #[serde(with = "humantime_serde")]
    pub jitter_tolerance: Duration,
    /// Largest accepted distance between readback and expected trajectory (steps)
    pub position_tolerance: f64,
    /// Stage travel per camera line (steps)
    pub units_per_line: f64,
    /// Interval between position/frame-count checks while scanning
    #[serde(with = "humantime_serde")]
    pub scan_poll_interval: Duration,
    /// A scan fails if no bundle arrives within this window after motion starts
    #[serde(with = "humantime_serde")]
    pub first_bundle_timeout: Duration,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            trigger_source: TriggerSource::HardwareTick,
            jitter_tolerance: Duration::from_millis(2),
            position_tolerance: 5_000.0,
            units_per_line: 10.0,
            scan_poll_interval: Duration::from_millis(20),
            first_bundle_timeout: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Fluidics
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FluidicsConfig {
    /// Ports on each selector valve (1-based)
    pub valve_ports: u8,
    /// Ports that may be selected; others are plumbed shut
    pub enabled_ports: Vec<u8>,
    /// Syringe volume per barrel (µL)
    pub syringe_volume_ul: f64,
    /// Pump steps for one full stroke
    pub pump_steps: u32,
    pub barrels_per_lane: u32,
    /// Fastest flow rate per barrel (µL/min)
    pub max_flow_ul_per_min: f64,
    pub default_pull_rate: f64,
    pub default_push_rate: f64,
    /// Pause between aspirate and dispense of a flow step
    #[serde(with = "humantime_serde")]
    pub flow_wait: Duration,
    /// Accepted |actual - target| temperature (°C)
    pub temperature_tolerance: f64,
    /// Longest wait for a flowcell to reach its incubation temperature
    #[serde(with = "humantime_serde")]
    pub temperature_timeout: Duration,
    /// Added to the computed duration of a pump stroke to form its timeout
    #[serde(with = "humantime_serde")]
    pub step_timeout_margin: Duration,
    /// Interval between completion checks during a step
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
}

impl Default for FluidicsConfig {
    fn default() -> Self {
        Self {
            valve_ports: 24,
            enabled_ports: (1..=24).collect(),
            syringe_volume_ul: 250.0,
            pump_steps: 48_000,
            barrels_per_lane: 1,
            max_flow_ul_per_min: 2_500.0,
            default_pull_rate: 250.0,
            default_push_rate: 2_000.0,
            flow_wait: Duration::from_secs(26),
            temperature_tolerance: 1.0,
            temperature_timeout: Duration::from_secs(600),
            step_timeout_margin: Duration::from_secs(10),
            status_interval: Duration::from_millis(250),
        }
    }
}

// =============================================================================
// Loading and validation
// =============================================================================

impl InstrumentConfig {
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(InstrumentConfig::default()))
    }

    /// Load from a TOML file plus `SEQ_` environment overrides, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> SeqResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SeqError::Configuration(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        Self::extract(
            Self::figment()
                .merge(Toml::file(path))
                .merge(Env::prefixed("SEQ_").split("__")),
        )
    }

    /// Parse a TOML document (no environment overrides), then validate.
    pub fn from_toml_str(toml: &str) -> SeqResult<Self> {
        Self::extract(Self::figment().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> SeqResult<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| SeqError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Settings for one device kind.
    pub fn settings_for(&self, kind: DeviceKind) -> &DeviceSettings {
        self.devices.get(kind)
    }

    pub fn port(&self, endpoint: &str) -> Option<&PortConfig> {
        self.ports.get(endpoint)
    }

    /// Endpoints that have no `[ports.<endpoint>]` entry.
    pub fn missing_ports(&self) -> Vec<&'static str> {
        ENDPOINTS
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| !self.ports.contains_key(*name))
            .collect()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> SeqResult<()> {
        let err = |msg: String| Err(SeqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return err(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        for (endpoint, port) in &self.ports {
            if !ENDPOINTS.iter().any(|(name, _)| name == endpoint) {
                return err(format!("Unknown port endpoint '{}'", endpoint));
            }
            if port.path.is_empty() || port.baud == 0 {
                return err(format!("Port '{}' needs a path and a non-zero baud", endpoint));
            }
        }

        for kind in DeviceKind::ALL {
            let settings = self.settings_for(kind);
            if settings.timeout.is_zero() {
                return err(format!("devices.{}.timeout must be non-zero", kind));
            }
            if settings.poll.max_polls == 0 {
                return err(format!("devices.{}.poll.max_polls must be at least 1", kind));
            }
        }

        let stage = &self.stage;
        for (axis, limits) in [("x", stage.x), ("y", stage.y)] {
            if limits.min >= limits.max {
                return err(format!("stage.{} limits are empty: {:?}", axis, limits));
            }
            if !limits.contains(stage.home_position) {
                return err(format!(
                    "stage.home_position {} outside {} limits",
                    stage.home_position, axis
                ));
            }
        }
        if stage.settle_tolerance < 0 {
            return err("stage.settle_tolerance must be non-negative".into());
        }
        if !(stage.moving_velocity > 0.0 && stage.max_scan_velocity > 0.0) {
            return err("stage velocities must be positive".into());
        }

        let frame = validate_frame_size(self.camera.frame_width, self.camera.max_frame_height)
            .map_err(|e| SeqError::Configuration(format!("camera: {}", e)))?;
        if self.camera.buffer_capacity_bytes < frame.bytes as u64 {
            return err(format!(
                "camera.buffer_capacity_bytes {} cannot hold one {}-byte frame",
                self.camera.buffer_capacity_bytes, frame.bytes
            ));
        }

        let imaging = &self.imaging;
        if !(imaging.units_per_line > 0.0 && imaging.position_tolerance > 0.0) {
            return err("imaging.units_per_line and position_tolerance must be positive".into());
        }
        if imaging.scan_poll_interval.is_zero() {
            return err("imaging.scan_poll_interval must be non-zero".into());
        }

        let fluidics = &self.fluidics;
        if fluidics.enabled_ports.is_empty() {
            return err("fluidics.enabled_ports must not be empty".into());
        }
        if let Some(port) = fluidics
            .enabled_ports
            .iter()
            .find(|p| **p == 0 || **p > fluidics.valve_ports)
        {
            return err(format!(
                "fluidics.enabled_ports contains {} outside 1..={}",
                port, fluidics.valve_ports
            ));
        }
        if !(fluidics.syringe_volume_ul > 0.0 && fluidics.max_flow_ul_per_min > 0.0) {
            return err("fluidics syringe volume and max flow must be positive".into());
        }
        if fluidics.pump_steps == 0 || fluidics.barrels_per_lane == 0 {
            return err("fluidics.pump_steps and barrels_per_lane must be non-zero".into());
        }
        let max_rate = fluidics.max_flow_ul_per_min * f64::from(fluidics.barrels_per_lane);
        for (name, rate) in [
            ("default_pull_rate", fluidics.default_pull_rate),
            ("default_push_rate", fluidics.default_push_rate),
        ] {
            if !(rate > 0.0 && rate <= max_rate) {
                return err(format!("fluidics.{} {} outside (0, {}]", name, rate, max_rate));
            }
        }
        if fluidics.status_interval.is_zero() {
            return err("fluidics.status_interval must be non-zero".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = InstrumentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.imaging.trigger_source, TriggerSource::HardwareTick);
        assert_eq!(config.missing_ports().len(), ENDPOINTS.len());
    }

    #[test]
    fn partial_device_table_keeps_other_defaults() {
        let config = InstrumentConfig::from_toml_str(
            r#"
            [devices.pump]
            timeout = "3s"
            retry = { max_retries = 1, backoff = { kind = "exponential", initial = "50ms", max = "400ms" } }
            "#,
        )
        .unwrap();

        let pump = config.settings_for(DeviceKind::Pump);
        assert_eq!(pump.timeout, Duration::from_secs(3));
        assert_eq!(pump.retry.max_retries, 1);
        assert!(matches!(pump.retry.backoff, Backoff::Exponential { .. }));
        assert_eq!(pump.poll, PollPolicy::default());
        assert_eq!(
            config.settings_for(DeviceKind::Camera).timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn imaging_section_selects_software_timer() {
        let config = InstrumentConfig::from_toml_str(
            r#"
            [imaging]
            trigger_source = "software_timer"
            jitter_tolerance = "500us"
            "#,
        )
        .unwrap();
        assert_eq!(config.imaging.trigger_source, TriggerSource::SoftwareTimer);
        assert_eq!(config.imaging.jitter_tolerance, Duration::from_micros(500));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_port = InstrumentConfig::from_toml_str("[fluidics]\nenabled_ports = [0, 3]");
        assert!(matches!(bad_port, Err(SeqError::Configuration(_))));

        let bad_limits = InstrumentConfig::from_toml_str("[stage]\ny = { min = 10, max = 5 }");
        assert!(bad_limits.is_err());

        let bad_endpoint =
            InstrumentConfig::from_toml_str("[ports.turbo_laser]\npath = \"/dev/null\"");
        assert!(bad_endpoint.is_err());

        let zero_polls = InstrumentConfig::from_toml_str(
            "[devices.valve]\npoll = { interval = \"10ms\", max_polls = 0 }",
        );
        assert!(zero_polls.is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [logging]
            level = "debug"
            format = "json"

            [ports.pump_a]
            path = "/dev/ttyUSB3"
            baud = 9600
            "#
        )
        .unwrap();

        let config = InstrumentConfig::load_from(file.path()).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.port("pump_a").unwrap().path, "/dev/ttyUSB3");
        assert!(!config.missing_ports().contains(&"pump_a"));
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = InstrumentConfig::load_from("/nonexistent/instrument.toml").unwrap_err();
        assert!(matches!(err, SeqError::Configuration(_)));
    }
}
