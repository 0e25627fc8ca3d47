//! Instrument assembly from configuration.

use crate::orchestrator::Orchestrator;
use seq_core::config::InstrumentConfig;
use seq_core::data::FrameSink;
use seq_core::device::{DeviceId, DeviceKind};
use seq_core::error::{SeqError, SeqResult};
use seq_core::serial::DynSerial;
use seq_drivers::{
    AnyDevice, Camera, Chemistry, DeviceSnapshot, Laser, Objective, Optics, Pump, Stage, Valve,
};
use seq_instrument::{FlowCell, Imager, ImagerDevices};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

/// Flowcell name, chemistry holder, pump endpoint, valve endpoint.
pub const FLOWCELLS: [(&str, usize, &str, &str); 2] =
    [("A", 0, "pump_a", "valve_a"), ("B", 1, "pump_b", "valve_b")];

/// The whole machine: one imager, two flowcells, one chemistry controller.
pub struct Instrument {
    config: InstrumentConfig,
    imager: Arc<Imager>,
    chemistry: Arc<Chemistry>,
    flowcells: Vec<Arc<FlowCell>>,
    devices: Vec<AnyDevice>,
}

impl Instrument {
    /// Build every driver on already opened ports, keyed by endpoint name.
    pub fn from_ports(config: InstrumentConfig, mut ports: BTreeMap<String, DynSerial>) -> SeqResult<Self> {
        let mut take = |endpoint: &str| {
            ports.remove(endpoint).ok_or_else(|| {
                SeqError::Configuration(format!("no port for endpoint '{}'", endpoint))
            })
        };
        let settings = |kind: DeviceKind| config.settings_for(kind);

        let stage_x = Arc::new(Stage::new(
            DeviceId::new(DeviceKind::StageX, "stage_x"),
            take("stage_x")?,
            settings(DeviceKind::StageX),
            &config.stage,
        ));
        let stage_y = Arc::new(Stage::new(
            DeviceId::new(DeviceKind::StageY, "stage_y"),
            take("stage_y")?,
            settings(DeviceKind::StageY),
            &config.stage,
        ));
        let camera = Arc::new(Camera::new(
            DeviceId::new(DeviceKind::Camera, "camera"),
            take("camera")?,
            settings(DeviceKind::Camera),
            &config.camera,
        ));
        let optics = Arc::new(Optics::new(
            DeviceId::new(DeviceKind::Optics, "optics"),
            take("optics")?,
            settings(DeviceKind::Optics),
        ));
        let laser_green = Arc::new(Laser::new(
            DeviceId::new(DeviceKind::Laser, "laser_green"),
            take("laser_green")?,
            settings(DeviceKind::Laser),
        ));
        let laser_red = Arc::new(Laser::new(
            DeviceId::new(DeviceKind::Laser, "laser_red"),
            take("laser_red")?,
            settings(DeviceKind::Laser),
        ));
        let chemistry = Arc::new(Chemistry::new(
            DeviceId::new(DeviceKind::Chemistry, "chemistry"),
            take("chemistry")?,
            settings(DeviceKind::Chemistry),
        ));

        let mut devices = vec![
            AnyDevice::Stage(stage_x.clone()),
            AnyDevice::Stage(stage_y.clone()),
            AnyDevice::Camera(camera.clone()),
            AnyDevice::Optics(optics.clone()),
            AnyDevice::Laser(laser_green.clone()),
            AnyDevice::Laser(laser_red.clone()),
            AnyDevice::Chemistry(chemistry.clone()),
        ];

        let mut flowcells = Vec::with_capacity(FLOWCELLS.len());
        for (name, holder, pump_endpoint, valve_endpoint) in FLOWCELLS {
            let pump = Arc::new(Pump::new(
                DeviceId::new(DeviceKind::Pump, pump_endpoint),
                take(pump_endpoint)?,
                settings(DeviceKind::Pump),
                config.fluidics.pump_steps,
            ));
            let valve = Arc::new(Valve::new(
                DeviceId::new(DeviceKind::Valve, valve_endpoint),
                take(valve_endpoint)?,
                settings(DeviceKind::Valve),
                &config.fluidics.enabled_ports,
            ));
            devices.push(AnyDevice::Pump(pump.clone()));
            devices.push(AnyDevice::Valve(valve.clone()));
            flowcells.push(Arc::new(FlowCell::new(
                name,
                holder,
                pump,
                valve,
                chemistry.clone(),
                &config.fluidics,
            )));
        }

        let objective = Arc::new(Objective::new(optics.clone()));
        let imager = Arc::new(Imager::new(
            ImagerDevices {
                stage_x,
                stage_y,
                camera,
                optics,
                objective,
                laser_green,
                laser_red,
            },
            &config,
        ));

        Ok(Self {
            config,
            imager,
            chemistry,
            flowcells,
            devices,
        })
    }

    /// Open every configured serial port and build the instrument.
    #[cfg(feature = "serial")]
    pub async fn open(config: InstrumentConfig) -> SeqResult<Self> {
        use seq_core::config::ENDPOINTS;
        use seq_core::serial::open_serial_async;

        let mut ports: BTreeMap<String, DynSerial> = BTreeMap::new();
        for (endpoint, _) in ENDPOINTS {
            let port = config.port(endpoint).ok_or_else(|| {
                SeqError::Configuration(format!("no [ports.{}] entry", endpoint))
            })?;
            let stream = open_serial_async(&port.path, port.baud, endpoint)
                .await
                .map_err(|e| SeqError::Io(format!("{:#}", e)))?;
            info!(endpoint, path = %port.path, baud = port.baud, "serial port opened");
            ports.insert(endpoint.to_string(), Box::new(stream));
        }
        Self::from_ports(config, ports)
    }

    /// Bring every device to its known start state.
    ///
    /// The chemistry controller goes first (shut-off closed); the imager and
    /// both flowcells then initialise concurrently.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        self.chemistry.initialize().await?;
        let flowcells = futures::future::try_join_all(self.flowcells.iter().map(|fc| fc.initialize()));
        futures::try_join!(self.imager.initialize(), flowcells)?;
        info!(devices = self.devices.len(), "instrument initialised");
        Ok(())
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    pub fn imager(&self) -> &Arc<Imager> {
        &self.imager
    }

    pub fn chemistry(&self) -> &Arc<Chemistry> {
        &self.chemistry
    }

    pub fn flowcells(&self) -> &[Arc<FlowCell>] {
        &self.flowcells
    }

    pub fn flowcell(&self, name: &str) -> Option<&Arc<FlowCell>> {
        self.flowcells.iter().find(|fc| fc.name() == name)
    }

    pub fn devices(&self) -> &[AnyDevice] {
        &self.devices
    }

    pub fn snapshots(&self) -> SeqResult<Vec<DeviceSnapshot>> {
        self.devices.iter().map(AnyDevice::snapshot).collect()
    }

    pub fn orchestrator(&self, sink: Arc<dyn FrameSink>) -> Orchestrator {
        Orchestrator::new(self.imager.clone(), self.flowcells.iter().cloned(), sink)
    }
}
