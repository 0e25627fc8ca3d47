//! Device identity and capability sets.
//!
//! Every physical device on the instrument is identified by a [`DeviceId`]:
//! its [`DeviceKind`] plus the endpoint name it is wired to (`"pump_a"`,
//! `"stage_y"`, ...). The kind determines the capability set the driver
//! exposes. Capabilities are a static table per kind rather than a trait
//! hierarchy, so callers can ask "can this device move?" without downcasting.
//!
//! ```text
//! StageX / StageY  -> Movable, Homeable
//! Camera           -> FrameProducer, Triggerable
//! Laser            -> EmissionControl, PowerControl
//! Optics (FPGA)    -> FilterControl, ShutterControl, LedControl, TriggerGeneration
//! Pump             -> Pumping
//! Valve            -> PortSelection
//! Chemistry        -> TemperatureControl, ShutoffControl
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Device Kind
// =============================================================================

/// The kinds of device the instrument coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// X translation stage (lane selection)
    StageX,
    /// Y translation stage (scan axis)
    StageY,
    /// Line-scan TDI camera
    Camera,
    /// Excitation laser
    Laser,
    /// FPGA-backed optics controller (filters, shutter, LED, position triggers)
    Optics,
    /// Syringe pump
    Pump,
    /// Rotary selector valve
    Valve,
    /// Chemistry microcontroller (temperature, shut-off valve)
    Chemistry,
}

impl DeviceKind {
    /// All kinds, in a stable order.
    pub const ALL: [DeviceKind; 8] = [
        DeviceKind::StageX,
        DeviceKind::StageY,
        DeviceKind::Camera,
        DeviceKind::Laser,
        DeviceKind::Optics,
        DeviceKind::Pump,
        DeviceKind::Valve,
        DeviceKind::Chemistry,
    ];

    /// Configuration key for this kind (`stage_y`, `pump`, ...).
    pub fn key(&self) -> &'static str {
        match self {
            Self::StageX => "stage_x",
            Self::StageY => "stage_y",
            Self::Camera => "camera",
            Self::Laser => "laser",
            Self::Optics => "optics",
            Self::Pump => "pump",
            Self::Valve => "valve",
            Self::Chemistry => "chemistry",
        }
    }

    /// Capability set supported by every device of this kind.
    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Self::StageX | Self::StageY => STAGE_CAPABILITIES,
            Self::Camera => CAMERA_CAPABILITIES,
            Self::Laser => LASER_CAPABILITIES,
            Self::Optics => OPTICS_CAPABILITIES,
            Self::Pump => PUMP_CAPABILITIES,
            Self::Valve => VALVE_CAPABILITIES,
            Self::Chemistry => CHEMISTRY_CAPABILITIES,
        }
    }

    /// Whether this kind supports `capability`.
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Runtime capability flags for device introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Can move to an absolute position at a commanded velocity
    Movable,
    /// Can seek a mechanical home reference
    Homeable,
    /// Produces raw frames into an on-device buffer
    FrameProducer,
    /// Accepts software or hardware triggers
    Triggerable,
    /// Emission on/off
    EmissionControl,
    /// Output power setpoint
    PowerControl,
    /// Emission filter wheels
    FilterControl,
    /// Optical shutter
    ShutterControl,
    /// Illumination LED
    LedControl,
    /// Generates camera triggers from stage encoder ticks
    TriggerGeneration,
    /// Aspirate / dispense fluid
    Pumping,
    /// Selects a fluid port
    PortSelection,
    /// Flowcell temperature regulation
    TemperatureControl,
    /// Reagent shut-off valve
    ShutoffControl,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Movable => "Movable",
            Self::Homeable => "Homeable",
            Self::FrameProducer => "Frame Producer",
            Self::Triggerable => "Triggerable",
            Self::EmissionControl => "Emission Control",
            Self::PowerControl => "Power Control",
            Self::FilterControl => "Filter Control",
            Self::ShutterControl => "Shutter Control",
            Self::LedControl => "LED Control",
            Self::TriggerGeneration => "Trigger Generation",
            Self::Pumping => "Pumping",
            Self::PortSelection => "Port Selection",
            Self::TemperatureControl => "Temperature Control",
            Self::ShutoffControl => "Shut-off Control",
        }
    }
}

static STAGE_CAPABILITIES: &[Capability] = &[Capability::Movable, Capability::Homeable];
static CAMERA_CAPABILITIES: &[Capability] = &[Capability::FrameProducer, Capability::Triggerable];
static LASER_CAPABILITIES: &[Capability] =
    &[Capability::EmissionControl, Capability::PowerControl];
static OPTICS_CAPABILITIES: &[Capability] = &[
    Capability::FilterControl,
    Capability::ShutterControl,
    Capability::LedControl,
    Capability::TriggerGeneration,
];
static PUMP_CAPABILITIES: &[Capability] = &[Capability::Pumping];
static VALVE_CAPABILITIES: &[Capability] = &[Capability::PortSelection];
static CHEMISTRY_CAPABILITIES: &[Capability] =
    &[Capability::TemperatureControl, Capability::ShutoffControl];

// =============================================================================
// Device Identity
// =============================================================================

/// Identity of one physical device: kind plus endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub endpoint: String,
}

impl DeviceId {
    pub fn new(kind: DeviceKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_sets_are_per_kind() {
        assert!(DeviceKind::StageY.supports(Capability::Movable));
        assert!(DeviceKind::StageX.supports(Capability::Homeable));
        assert!(!DeviceKind::Camera.supports(Capability::Movable));
        assert!(DeviceKind::Optics.supports(Capability::TriggerGeneration));
        assert!(DeviceKind::Chemistry.supports(Capability::TemperatureControl));
    }

    #[test]
    fn kind_keys_round_trip_through_serde() {
        for kind in DeviceKind::ALL {
            let encoded = toml::Value::try_from(kind).unwrap();
            assert_eq!(encoded.as_str(), Some(kind.key()));
        }
    }

    #[test]
    fn device_id_display_names_endpoint_and_kind() {
        let id = DeviceId::new(DeviceKind::Pump, "pump_a");
        assert_eq!(id.to_string(), "pump_a (pump)");
    }
}
