//! Chemistry microcontroller: flowcell holder temperatures and the reagent
//! shut-off valve shared by both flowcells.
//!
//! Protocol:
//! - `FCTEMP <index> <°C>` sets the holder setpoint, `FCTEMP? <index>` -> `*<°C>`
//! - `SHUTOFF 0|1`, `SHUTOFF?` -> `*0|1`
//!
//! Both flowcells draw reagent through the same shut-off valve, so it is
//! reference counted: it opens for the first user and closes after the last.

use crate::ascii::{ack, ascii_link, flag, unexpected_reply, value, AsciiCodec, AsciiRequest};
use parking_lot::Mutex;
use seq_core::config::DeviceSettings;
use seq_core::device::DeviceId;
use seq_core::error::{ProtocolError, SeqError, SeqResult};
use seq_core::link::DeviceLink;
use seq_core::serial::DynSerial;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument};

/// Number of flowcell holders on the controller.
pub const HOLDERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChemistryRequest {
    SetTemperature { holder: usize, celsius: f64 },
    Temperature(usize),
    SetShutoff(bool),
    Shutoff,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChemistryReply {
    Ack,
    Temperature(f64),
    Shutoff(bool),
}

impl AsciiRequest for ChemistryRequest {
    type Reply = ChemistryReply;

    fn operation(&self) -> &'static str {
        match self {
            Self::SetTemperature { .. } => "set_temperature",
            Self::Temperature(_) => "temperature",
            Self::SetShutoff(_) => "set_shutoff",
            Self::Shutoff => "shutoff",
        }
    }

    fn command(&self) -> String {
        match self {
            Self::SetTemperature { holder, celsius } => format!("FCTEMP {} {:.2}", holder, celsius),
            Self::Temperature(holder) => format!("FCTEMP? {}", holder),
            Self::SetShutoff(open) => format!("SHUTOFF {}", u8::from(*open)),
            Self::Shutoff => "SHUTOFF?".into(),
        }
    }

    fn parse(&self, line: &str) -> Result<ChemistryReply, ProtocolError> {
        match self {
            Self::Temperature(_) => value(line).map(ChemistryReply::Temperature),
            Self::Shutoff => flag(line).map(ChemistryReply::Shutoff),
            _ => ack(line).map(|_| ChemistryReply::Ack),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChemistryState {
    pub setpoints: [Option<f64>; HOLDERS],
    pub temperatures: [Option<f64>; HOLDERS],
    pub shutoff_open: Option<bool>,
    pub shutoff_users: usize,
    pub last_command: Option<&'static str>,
}

pub struct Chemistry {
    link: DeviceLink<AsciiCodec<ChemistryRequest>>,
    state: Mutex<ChemistryState>,
    // Serializes open/close decisions of the shared shut-off valve.
    shutoff: AsyncMutex<()>,
}

impl Chemistry {
    pub fn new(id: DeviceId, port: DynSerial, settings: &DeviceSettings) -> Self {
        Self {
            link: ascii_link(id, port, settings),
            state: Mutex::new(ChemistryState::default()),
            shutoff: AsyncMutex::new(()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.link.id()
    }

    pub fn state(&self) -> ChemistryState {
        self.state.lock().clone()
    }

    fn check_holder(&self, holder: usize) -> SeqResult<()> {
        if holder < HOLDERS {
            Ok(())
        } else {
            Err(SeqError::InvalidArgument(format!(
                "{}: no flowcell holder {}",
                self.id(),
                holder
            )))
        }
    }

    /// Close the shut-off valve.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        let _guard = self.shutoff.lock().await;
        self.set_shutoff(false).await?;
        self.state.lock().shutoff_users = 0;
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn set_temperature(&self, holder: usize, celsius: f64) -> SeqResult<()> {
        self.check_holder(holder)?;
        if !celsius.is_finite() {
            return Err(SeqError::InvalidArgument(format!(
                "{}: temperature {} is not a number",
                self.id(),
                celsius
            )));
        }
        self.link
            .request(ChemistryRequest::SetTemperature { holder, celsius })
            .await?;
        let mut state = self.state.lock();
        state.setpoints[holder] = Some(celsius);
        state.last_command = Some("set_temperature");
        Ok(())
    }

    pub async fn temperature(&self, holder: usize) -> SeqResult<f64> {
        self.check_holder(holder)?;
        match self.link.request(ChemistryRequest::Temperature(holder)).await? {
            ChemistryReply::Temperature(celsius) => {
                self.state.lock().temperatures[holder] = Some(celsius);
                Ok(celsius)
            }
            other => Err(unexpected_reply(self.id(), "temperature", other)),
        }
    }

    /// Whether holder `holder` reads within `tolerance` of `target`.
    pub async fn temperature_ok(&self, holder: usize, target: f64, tolerance: f64) -> SeqResult<bool> {
        let actual = self.temperature(holder).await?;
        Ok((actual - target).abs() <= tolerance)
    }

    pub async fn shutoff_open(&self) -> SeqResult<bool> {
        match self.link.request(ChemistryRequest::Shutoff).await? {
            ChemistryReply::Shutoff(open) => Ok(open),
            other => Err(unexpected_reply(self.id(), "shutoff", other)),
        }
    }

    /// Drive the shut-off valve and confirm by readback.
    pub async fn set_shutoff(&self, open: bool) -> SeqResult<()> {
        self.link.request(ChemistryRequest::SetShutoff(open)).await?;
        self.state.lock().last_command = Some("set_shutoff");
        self.link
            .poll_until("set_shutoff", || self.shutoff_open(), |o| *o == open)
            .await?;
        self.state.lock().shutoff_open = Some(open);
        Ok(())
    }

    /// Register a reagent user; the first one opens the shut-off valve.
    pub async fn acquire_shutoff(&self) -> SeqResult<()> {
        let _guard = self.shutoff.lock().await;
        if self.state.lock().shutoff_users == 0 {
            self.set_shutoff(true).await?;
        }
        let users = {
            let mut state = self.state.lock();
            state.shutoff_users += 1;
            state.shutoff_users
        };
        debug!(device = %self.id(), users, "shut-off acquired");
        Ok(())
    }

    /// Drop a reagent user; the last one closes the shut-off valve.
    pub async fn release_shutoff(&self) -> SeqResult<()> {
        let _guard = self.shutoff.lock().await;
        let remaining = {
            let mut state = self.state.lock();
            state.shutoff_users = state.shutoff_users.saturating_sub(1);
            state.shutoff_users
        };
        if remaining == 0 {
            self.set_shutoff(false).await?;
        }
        debug!(device = %self.id(), users = remaining, "shut-off released");
        Ok(())
    }

    /// Drop a reagent user without touching the valve.
    ///
    /// Used when a step fails mid-flow: fluidics are left as last commanded.
    pub fn forget_shutoff(&self) {
        let mut state = self.state.lock();
        state.shutoff_users = state.shutoff_users.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq_core::config::InstrumentConfig;
    use seq_core::device::DeviceKind;
    use seq_sim::SimBench;
    use std::time::Duration;

    fn chemistry(bench: &SimBench) -> Chemistry {
        let config = InstrumentConfig::default();
        Chemistry::new(
            DeviceId::new(DeviceKind::Chemistry, "chemistry"),
            bench.open("chemistry").unwrap(),
            config.settings_for(DeviceKind::Chemistry),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn temperature_ramps_towards_setpoint() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let chemistry = chemistry(&bench);

        chemistry.set_temperature(1, 30.0).await.unwrap();
        assert!(!chemistry.temperature_ok(1, 30.0, 0.5).await.unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(chemistry.temperature_ok(1, 30.0, 0.5).await.unwrap());
        assert_eq!(chemistry.state().setpoints, [None, Some(30.0)]);
        assert!(chemistry.set_temperature(2, 30.0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutoff_is_reference_counted() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let chemistry = chemistry(&bench);
        chemistry.initialize().await.unwrap();

        chemistry.acquire_shutoff().await.unwrap();
        chemistry.acquire_shutoff().await.unwrap();
        assert!(bench.shutoff_open());

        chemistry.release_shutoff().await.unwrap();
        assert!(bench.shutoff_open());
        chemistry.release_shutoff().await.unwrap();
        assert!(!bench.shutoff_open());
        assert_eq!(bench.handle("chemistry").unwrap().count("SHUTOFF 1"), 1);
    }
}
