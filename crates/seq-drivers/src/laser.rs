//! Excitation laser driver.
//!
//! Protocol: `ON`, `OFF`, `POWER <mW>` (0..=500), `POWER?` -> `*<mW>`,
//! `EMIT?` -> `*0|1`. Emission and power changes are confirmed by readback.

use crate::ascii::{ack, ascii_link, flag, unexpected_reply, value, AsciiCodec, AsciiRequest};
use parking_lot::Mutex;
use seq_core::config::DeviceSettings;
use seq_core::device::DeviceId;
use seq_core::error::{ProtocolError, SeqError, SeqResult};
use seq_core::link::DeviceLink;
use seq_core::serial::DynSerial;
use serde::Serialize;
use tracing::instrument;

/// Highest power setpoint the lasers accept (mW).
pub const MAX_POWER_MW: f64 = 500.0;

/// Readback must match the setpoint this closely (mW).
const POWER_TOLERANCE_MW: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LaserRequest {
    On,
    Off,
    SetPower(f64),
    Power,
    Emitting,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LaserReply {
    Ack,
    Power(f64),
    Emitting(bool),
}

impl AsciiRequest for LaserRequest {
    type Reply = LaserReply;

    fn operation(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::SetPower(_) => "set_power",
            Self::Power => "power",
            Self::Emitting => "is_emitting",
        }
    }

    fn command(&self) -> String {
        match self {
            Self::On => "ON".into(),
            Self::Off => "OFF".into(),
            Self::SetPower(mw) => format!("POWER {:.1}", mw),
            Self::Power => "POWER?".into(),
            Self::Emitting => "EMIT?".into(),
        }
    }

    fn parse(&self, line: &str) -> Result<LaserReply, ProtocolError> {
        match self {
            Self::Power => value(line).map(LaserReply::Power),
            Self::Emitting => flag(line).map(LaserReply::Emitting),
            _ => ack(line).map(|_| LaserReply::Ack),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaserState {
    pub emitting: Option<bool>,
    pub power_mw: Option<f64>,
    pub last_command: Option<&'static str>,
}

pub struct Laser {
    link: DeviceLink<AsciiCodec<LaserRequest>>,
    state: Mutex<LaserState>,
}

impl Laser {
    pub fn new(id: DeviceId, port: DynSerial, settings: &DeviceSettings) -> Self {
        Self {
            link: ascii_link(id, port, settings),
            state: Mutex::new(LaserState::default()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.link.id()
    }

    pub fn state(&self) -> LaserState {
        self.state.lock().clone()
    }

    async fn command(&self, request: LaserRequest) -> SeqResult<()> {
        let operation = request.operation();
        self.link.request(request).await?;
        self.state.lock().last_command = Some(operation);
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        self.off().await
    }

    pub async fn is_emitting(&self) -> SeqResult<bool> {
        match self.link.request(LaserRequest::Emitting).await? {
            LaserReply::Emitting(emitting) => Ok(emitting),
            other => Err(unexpected_reply(self.id(), "is_emitting", other)),
        }
    }

    pub async fn power(&self) -> SeqResult<f64> {
        match self.link.request(LaserRequest::Power).await? {
            LaserReply::Power(mw) => Ok(mw),
            other => Err(unexpected_reply(self.id(), "power", other)),
        }
    }

    async fn set_emission(&self, on: bool) -> SeqResult<()> {
        let (request, operation) = if on {
            (LaserRequest::On, "on")
        } else {
            (LaserRequest::Off, "off")
        };
        self.command(request).await?;
        self.link
            .poll_until(operation, || self.is_emitting(), |emitting| *emitting == on)
            .await?;
        self.state.lock().emitting = Some(on);
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn on(&self) -> SeqResult<()> {
        self.set_emission(true).await
    }

    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn off(&self) -> SeqResult<()> {
        self.set_emission(false).await
    }

    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn set_power(&self, mw: f64) -> SeqResult<()> {
        if !(0.0..=MAX_POWER_MW).contains(&mw) {
            return Err(SeqError::InvalidArgument(format!(
                "{}: power {} mW outside 0..={}",
                self.id(),
                mw,
                MAX_POWER_MW
            )));
        }
        self.command(LaserRequest::SetPower(mw)).await?;
        let reported = self.power().await?;
        if (reported - mw).abs() > POWER_TOLERANCE_MW {
            return Err(SeqError::OperationIncomplete {
                device: self.id().clone(),
                operation: "set_power",
                polls: 1,
                detail: format!("readback {} mW, commanded {} mW", reported, mw),
            });
        }
        self.state.lock().power_mw = Some(reported);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq_core::config::InstrumentConfig;
    use seq_core::device::DeviceKind;
    use seq_sim::{Fault, SimBench};

    fn laser(bench: &SimBench) -> Laser {
        let config = InstrumentConfig::default();
        Laser::new(
            DeviceId::new(DeviceKind::Laser, "laser_green"),
            bench.open("laser_green").unwrap(),
            config.settings_for(DeviceKind::Laser),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn emission_is_confirmed_by_readback() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let laser = laser(&bench);

        laser.set_power(120.0).await.unwrap();
        laser.on().await.unwrap();
        assert!(bench.laser_emitting("laser_green"));
        assert_eq!(laser.state().emitting, Some(true));
        assert_eq!(laser.state().power_mw, Some(120.0));

        laser.off().await.unwrap();
        assert!(!bench.laser_emitting("laser_green"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_command_leaves_state_untouched() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let laser = laser(&bench);
        bench.handle("laser_green").unwrap().inject("ON", Fault::DeviceError(2));

        let err = laser.on().await.unwrap_err();
        assert!(matches!(err, SeqError::DeviceFault { code: 2, .. }));
        assert_eq!(laser.state(), LaserState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn power_out_of_range_is_rejected_locally() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let laser = laser(&bench);

        assert!(laser.set_power(501.0).await.is_err());
        assert_eq!(bench.total_commands(), 0);
    }
}
