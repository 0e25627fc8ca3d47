//! Syringe pump driver.
//!
//! Protocol:
//! - `INIT` homes the plunger to 0
//! - `ASPIRATE <steps> <steps/s>` / `DISPENSE <steps> <steps/s>` start a stroke
//! - `STOP` halts the plunger where it is
//! - `STATUS?` -> `IDLE <plunger>` | `BUSY <plunger>`
//!
//! A pump rejects motion commands with `!3` while a stroke is running.
//! Strokes are started here and confirmed by whoever owns the step timeout.

use crate::ascii::{ack, ascii_link, unexpected_reply, AsciiCodec, AsciiRequest};
use parking_lot::Mutex;
use seq_core::config::DeviceSettings;
use seq_core::device::DeviceId;
use seq_core::error::{ProtocolError, SeqError, SeqResult};
use seq_core::link::DeviceLink;
use seq_core::serial::DynSerial;
use serde::Serialize;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PumpStatus {
    pub busy: bool,
    pub plunger: u32,
}

impl PumpStatus {
    fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (label, plunger) = line
            .split_once(' ')
            .ok_or_else(|| ProtocolError::Malformed(format!("bad status line {:?}", line)))?;
        let busy = match label {
            "IDLE" => false,
            "BUSY" => true,
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "IDLE|BUSY".into(),
                    got: other.into(),
                })
            }
        };
        let plunger = plunger
            .trim()
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("bad plunger position in {:?}", line)))?;
        Ok(Self { busy, plunger })
    }
}

/// Direction of a plunger stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stroke {
    Aspirate,
    Dispense,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpRequest {
    Init,
    Move {
        stroke: Stroke,
        steps: u32,
        steps_per_second: u32,
    },
    Stop,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpReply {
    Ack,
    Status(PumpStatus),
}

impl AsciiRequest for PumpRequest {
    type Reply = PumpReply;

    fn operation(&self) -> &'static str {
        match self {
            Self::Init => "initialize",
            Self::Move {
                stroke: Stroke::Aspirate,
                ..
            } => "aspirate",
            Self::Move {
                stroke: Stroke::Dispense,
                ..
            } => "dispense",
            Self::Stop => "stop",
            Self::Status => "status",
        }
    }

    fn command(&self) -> String {
        match self {
            Self::Init => "INIT".into(),
            Self::Move {
                stroke,
                steps,
                steps_per_second,
            } => {
                let verb = match stroke {
                    Stroke::Aspirate => "ASPIRATE",
                    Stroke::Dispense => "DISPENSE",
                };
                format!("{} {} {}", verb, steps, steps_per_second)
            }
            Self::Stop => "STOP".into(),
            Self::Status => "STATUS?".into(),
        }
    }

    fn parse(&self, line: &str) -> Result<PumpReply, ProtocolError> {
        match self {
            Self::Status => PumpStatus::parse(line).map(PumpReply::Status),
            _ => ack(line).map(|_| PumpReply::Ack),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PumpState {
    /// Plunger position from the last idle status
    pub plunger: Option<u32>,
    /// Stroke commanded and not yet confirmed idle
    pub stroke: Option<Stroke>,
    pub initialized: bool,
    pub last_command: Option<&'static str>,
}

pub struct Pump {
    link: DeviceLink<AsciiCodec<PumpRequest>>,
    max_steps: u32,
    state: Mutex<PumpState>,
}

impl Pump {
    pub fn new(id: DeviceId, port: DynSerial, settings: &DeviceSettings, max_steps: u32) -> Self {
        Self {
            link: ascii_link(id, port, settings),
            max_steps,
            state: Mutex::new(PumpState::default()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.link.id()
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn state(&self) -> PumpState {
        self.state.lock().clone()
    }

    async fn command(&self, request: PumpRequest) -> SeqResult<()> {
        let operation = request.operation();
        self.link.request(request).await?;
        self.state.lock().last_command = Some(operation);
        Ok(())
    }

    /// Home the plunger and wait until the pump reports idle at 0.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        self.command(PumpRequest::Init).await?;
        let status = self.wait_idle().await?;
        let mut state = self.state.lock();
        state.initialized = true;
        state.plunger = Some(status.plunger);
        Ok(())
    }

    /// Query the pump. An idle reading updates the believed plunger position.
    pub async fn status(&self) -> SeqResult<PumpStatus> {
        match self.link.request(PumpRequest::Status).await? {
            PumpReply::Status(status) => {
                if !status.busy {
                    let mut state = self.state.lock();
                    state.plunger = Some(status.plunger);
                    state.stroke = None;
                }
                Ok(status)
            }
            other => Err(unexpected_reply(self.id(), "status", other)),
        }
    }

    /// Poll until idle within the device poll budget.
    pub async fn wait_idle(&self) -> SeqResult<PumpStatus> {
        self.link
            .poll_until("wait_idle", || self.status(), |s| !s.busy)
            .await
    }

    fn check_stroke(&self, stroke: Stroke, steps: u32, steps_per_second: u32) -> SeqResult<()> {
        if steps == 0 || steps_per_second == 0 {
            return Err(SeqError::InvalidArgument(format!(
                "{}: {} of {} steps at {} steps/s",
                self.id(),
                stroke_name(stroke),
                steps,
                steps_per_second
            )));
        }
        let Some(plunger) = self.state.lock().plunger else {
            return Ok(());
        };
        let fits = match stroke {
            Stroke::Aspirate => plunger
                .checked_add(steps)
                .is_some_and(|to| to <= self.max_steps),
            Stroke::Dispense => steps <= plunger,
        };
        if fits {
            Ok(())
        } else {
            Err(SeqError::InvalidArgument(format!(
                "{}: {} of {} steps from plunger {} leaves 0..={}",
                self.id(),
                stroke_name(stroke),
                steps,
                plunger,
                self.max_steps
            )))
        }
    }

    async fn start_stroke(&self, stroke: Stroke, steps: u32, steps_per_second: u32) -> SeqResult<()> {
        self.check_stroke(stroke, steps, steps_per_second)?;
        self.command(PumpRequest::Move {
            stroke,
            steps,
            steps_per_second,
        })
        .await?;
        self.state.lock().stroke = Some(stroke);
        debug!(device = %self.id(), ?stroke, steps, steps_per_second, "stroke started");
        Ok(())
    }

    /// Start drawing `steps` into the syringe. Returns once acknowledged.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn aspirate(&self, steps: u32, steps_per_second: u32) -> SeqResult<()> {
        self.start_stroke(Stroke::Aspirate, steps, steps_per_second)
            .await
    }

    /// Start pushing `steps` out of the syringe. Returns once acknowledged.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn dispense(&self, steps: u32, steps_per_second: u32) -> SeqResult<()> {
        self.start_stroke(Stroke::Dispense, steps, steps_per_second)
            .await
    }

    pub async fn stop(&self) -> SeqResult<()> {
        self.command(PumpRequest::Stop).await
    }
}

fn stroke_name(stroke: Stroke) -> &'static str {
    match stroke {
        Stroke::Aspirate => "aspirate",
        Stroke::Dispense => "dispense",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq_core::config::InstrumentConfig;
    use seq_core::device::DeviceKind;
    use seq_core::error::ErrorClass;
    use seq_sim::SimBench;
    use std::time::Duration;

    fn pump(bench: &SimBench) -> Pump {
        let config = InstrumentConfig::default();
        Pump::new(
            DeviceId::new(DeviceKind::Pump, "pump_a"),
            bench.open("pump_a").unwrap(),
            config.settings_for(DeviceKind::Pump),
            config.fluidics.pump_steps,
        )
    }

    #[test]
    fn status_parses_busy_and_idle() {
        assert_eq!(
            PumpStatus::parse("BUSY 120").unwrap(),
            PumpStatus {
                busy: true,
                plunger: 120
            }
        );
        assert!(PumpStatus::parse("IDLE x").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn plunger_is_believed_only_once_idle() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let pump = pump(&bench);
        pump.initialize().await.unwrap();
        assert_eq!(pump.state().plunger, Some(0));

        pump.aspirate(1_000, 500).await.unwrap();
        assert_eq!(pump.state().plunger, Some(0));
        assert_eq!(pump.state().stroke, Some(Stroke::Aspirate));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let status = pump.wait_idle().await.unwrap();
        assert_eq!(status.plunger, 1_000);
        assert_eq!(pump.state().plunger, Some(1_000));
        assert_eq!(pump.state().stroke, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stroke_outside_barrel_is_rejected_locally() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let pump = pump(&bench);
        pump.initialize().await.unwrap();
        let before = bench.total_commands();

        let err = pump.dispense(10, 500).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Usage);
        let err = pump.aspirate(48_001, 500).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Usage);
        assert_eq!(bench.total_commands(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_pump_reports_device_fault() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let pump = pump(&bench);
        pump.initialize().await.unwrap();

        pump.aspirate(4_000, 100).await.unwrap();
        let err = pump.aspirate(10, 100).await.unwrap_err();
        assert!(matches!(err, SeqError::DeviceFault { code: 3, .. }));
    }
}
