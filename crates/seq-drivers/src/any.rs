//! Variant-tag dispatch over every driver.
//!
//! Callers that need to treat devices uniformly (initialisation, status
//! snapshots) match on [`AnyDevice`]; domain operations stay on the concrete
//! driver types.

use crate::{Camera, Chemistry, Laser, Optics, Pump, Stage, Valve};
use seq_core::device::{Capability, DeviceId, DeviceKind};
use seq_core::error::{SeqError, SeqResult};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub enum AnyDevice {
    Stage(Arc<Stage>),
    Camera(Arc<Camera>),
    Laser(Arc<Laser>),
    Optics(Arc<Optics>),
    Pump(Arc<Pump>),
    Valve(Arc<Valve>),
    Chemistry(Arc<Chemistry>),
}

/// Serialisable view of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub capabilities: Vec<Capability>,
    /// Believed state as last acknowledged by the hardware
    pub state: serde_json::Value,
}

impl AnyDevice {
    pub fn id(&self) -> &DeviceId {
        match self {
            Self::Stage(d) => d.id(),
            Self::Camera(d) => d.id(),
            Self::Laser(d) => d.id(),
            Self::Optics(d) => d.id(),
            Self::Pump(d) => d.id(),
            Self::Valve(d) => d.id(),
            Self::Chemistry(d) => d.id(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.id().kind
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        self.kind().capabilities()
    }

    pub async fn initialize(&self) -> SeqResult<()> {
        match self {
            Self::Stage(d) => d.initialize().await,
            Self::Camera(d) => d.initialize().await,
            Self::Laser(d) => d.initialize().await,
            Self::Optics(d) => d.initialize().await,
            Self::Pump(d) => d.initialize().await,
            Self::Valve(d) => d.initialize().await,
            Self::Chemistry(d) => d.initialize().await,
        }
    }

    pub fn snapshot(&self) -> SeqResult<DeviceSnapshot> {
        let state = match self {
            Self::Stage(d) => serde_json::to_value(d.state()),
            Self::Camera(d) => serde_json::to_value(d.state()),
            Self::Laser(d) => serde_json::to_value(d.state()),
            Self::Optics(d) => serde_json::to_value(d.state()),
            Self::Pump(d) => serde_json::to_value(d.state()),
            Self::Valve(d) => serde_json::to_value(d.state()),
            Self::Chemistry(d) => serde_json::to_value(d.state()),
        }
        .map_err(|e| SeqError::Io(format!("{}: cannot serialise state: {}", self.id(), e)))?;

        Ok(DeviceSnapshot {
            id: self.id().clone(),
            capabilities: self.capabilities().to_vec(),
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq_core::config::InstrumentConfig;
    use seq_sim::SimBench;

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_capabilities_and_state() {
        let config = InstrumentConfig::default();
        let bench = SimBench::new(&config);
        let valve = AnyDevice::Valve(Arc::new(Valve::new(
            DeviceId::new(DeviceKind::Valve, "valve_a"),
            bench.open("valve_a").unwrap(),
            config.settings_for(DeviceKind::Valve),
            &config.fluidics.enabled_ports,
        )));

        valve.initialize().await.unwrap();
        let snapshot = valve.snapshot().unwrap();
        assert_eq!(snapshot.capabilities, vec![Capability::PortSelection]);
        assert_eq!(snapshot.state["port"], 1);
        assert_eq!(snapshot.state["last_command"], "set_port");
    }
}
