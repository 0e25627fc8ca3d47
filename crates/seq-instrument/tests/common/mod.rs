#![allow(dead_code)]

use seq_core::config::InstrumentConfig;
use seq_core::device::{DeviceId, DeviceKind};
use seq_drivers::{Camera, Chemistry, Laser, Objective, Optics, Pump, Stage, Valve};
use seq_instrument::{FlowCell, Imager, ImagerDevices, OpticsSetup, ScanPlan};
use seq_sim::SimBench;
use std::sync::Arc;
use std::time::Duration;

/// Small sensor so readouts stay cheap.
pub fn config() -> InstrumentConfig {
    let mut config = InstrumentConfig::default();
    config.camera.frame_width = 32;
    config.camera.max_frame_height = 64;
    config.camera.buffer_capacity_bytes = 1 << 20;
    config.imaging.position_tolerance = 200.0;
    config.fluidics.temperature_timeout = Duration::from_secs(5);
    config
}

pub fn plan() -> ScanPlan {
    ScanPlan {
        bundles: 4,
        frame_height: 8,
        y_start: 1_000,
        y_end: 2_000,
        velocity: 10_000.0,
        x_position: Some(5_000),
        z_position: None,
        optics: OpticsSetup {
            green_filter: Some(2),
            red_filter: None,
            led: false,
            green_power_mw: Some(50.0),
            red_power_mw: None,
        },
        label: Some("test".into()),
    }
}

pub async fn imager(bench: &SimBench, config: &InstrumentConfig) -> Imager {
    let stage = |kind: DeviceKind, endpoint: &str| {
        Arc::new(Stage::new(
            DeviceId::new(kind, endpoint),
            bench.open(endpoint).unwrap(),
            config.settings_for(kind),
            &config.stage,
        ))
    };
    let laser = |endpoint: &str| {
        Arc::new(Laser::new(
            DeviceId::new(DeviceKind::Laser, endpoint),
            bench.open(endpoint).unwrap(),
            config.settings_for(DeviceKind::Laser),
        ))
    };
    let optics = Arc::new(Optics::new(
        DeviceId::new(DeviceKind::Optics, "optics"),
        bench.open("optics").unwrap(),
        config.settings_for(DeviceKind::Optics),
    ));
    let devices = ImagerDevices {
        stage_x: stage(DeviceKind::StageX, "stage_x"),
        stage_y: stage(DeviceKind::StageY, "stage_y"),
        camera: Arc::new(Camera::new(
            DeviceId::new(DeviceKind::Camera, "camera"),
            bench.open("camera").unwrap(),
            config.settings_for(DeviceKind::Camera),
            &config.camera,
        )),
        objective: Arc::new(Objective::new(optics.clone())),
        optics,
        laser_green: laser("laser_green"),
        laser_red: laser("laser_red"),
    };
    let imager = Imager::new(devices, config);
    imager.initialize().await.unwrap();
    imager
}

pub fn chemistry(bench: &SimBench, config: &InstrumentConfig) -> Arc<Chemistry> {
    Arc::new(Chemistry::new(
        DeviceId::new(DeviceKind::Chemistry, "chemistry"),
        bench.open("chemistry").unwrap(),
        config.settings_for(DeviceKind::Chemistry),
    ))
}

/// Flowcell A (holder 0) on pump_a/valve_a, initialized.
pub async fn flowcell(bench: &SimBench, config: &InstrumentConfig, chemistry: Arc<Chemistry>) -> FlowCell {
    let pump = Arc::new(Pump::new(
        DeviceId::new(DeviceKind::Pump, "pump_a"),
        bench.open("pump_a").unwrap(),
        config.settings_for(DeviceKind::Pump),
        config.fluidics.pump_steps,
    ));
    let valve = Arc::new(Valve::new(
        DeviceId::new(DeviceKind::Valve, "valve_a"),
        bench.open("valve_a").unwrap(),
        config.settings_for(DeviceKind::Valve),
        &config.fluidics.enabled_ports,
    ));
    let flowcell = FlowCell::new("A", 0, pump, valve, chemistry, &config.fluidics);
    flowcell.initialize().await.unwrap();
    flowcell
}
