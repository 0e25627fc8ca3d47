//! FPGA optics controller: emission filter wheels, shutter, LED and the
//! position-compare trigger generator that fires the camera from Y encoder
//! ticks.
//!
//! Protocol:
//! - `FILTER G|R <slot>`, `SHUTTER 0|1`, `LED 0|1`
//! - `TRIGARM <start> <pitch> <count>`: one trigger every `pitch` steps from
//!   `start`, `count` triggers in total
//! - `TRIGDISARM`
//! - `STATUS?` -> `SHUTTER=<0|1> LED=<0|1> TRIG=<0|1> TICKS=<n>`
//!
//! The objective focus commands (`ZSTEP`, `ZMV`, `ZDACR`) share this link;
//! see [`Objective`](crate::objective::Objective).

use crate::ascii::{ack, ascii_link, unexpected_reply, value, AsciiCodec, AsciiRequest};
use parking_lot::Mutex;
use seq_core::codec::key_values;
use seq_core::config::DeviceSettings;
use seq_core::device::DeviceId;
use seq_core::error::{ProtocolError, SeqError, SeqResult};
use seq_core::link::DeviceLink;
use seq_core::serial::DynSerial;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

/// Emission filter wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterWheel {
    Green,
    Red,
}

impl FilterWheel {
    fn token(&self) -> &'static str {
        match self {
            Self::Green => "G",
            Self::Red => "R",
        }
    }
}

/// Position-compare trigger program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TriggerProgram {
    pub start: i64,
    pub pitch: i64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpticsStatus {
    pub shutter_open: bool,
    pub led_on: bool,
    pub trigger_armed: bool,
    /// Triggers fired since the program was armed
    pub ticks: u32,
}

impl OpticsStatus {
    fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut shutter = None;
        let mut led = None;
        let mut trig = None;
        let mut ticks = None;
        for (key, value) in key_values(line) {
            match key {
                "SHUTTER" => shutter = Some(value == "1"),
                "LED" => led = Some(value == "1"),
                "TRIG" => trig = Some(value == "1"),
                "TICKS" => ticks = value.parse().ok(),
                _ => {}
            }
        }
        match (shutter, led, trig, ticks) {
            (Some(shutter_open), Some(led_on), Some(trigger_armed), Some(ticks)) => Ok(Self {
                shutter_open,
                led_on,
                trigger_armed,
                ticks,
            }),
            _ => Err(ProtocolError::Malformed(format!("incomplete status {:?}", line))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpticsRequest {
    Filter(FilterWheel, u8),
    Shutter(bool),
    Led(bool),
    ArmTrigger(TriggerProgram),
    DisarmTrigger,
    Status,
    /// Objective velocity in `ZSTEP` units
    ObjectiveVelocity(u32),
    ObjectiveMove(u32),
    ObjectivePosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpticsReply {
    Ack,
    Status(OpticsStatus),
    /// Objective DAC readback
    Position(u32),
}

impl AsciiRequest for OpticsRequest {
    type Reply = OpticsReply;

    fn operation(&self) -> &'static str {
        match self {
            Self::Filter(..) => "set_filter",
            Self::Shutter(_) => "set_shutter",
            Self::Led(_) => "set_led",
            Self::ArmTrigger(_) => "arm_trigger",
            Self::DisarmTrigger => "disarm_trigger",
            Self::Status => "status",
            Self::ObjectiveVelocity(_) => "objective_velocity",
            Self::ObjectiveMove(_) => "objective_move",
            Self::ObjectivePosition => "objective_position",
        }
    }

    fn command(&self) -> String {
        match self {
            Self::Filter(wheel, slot) => format!("FILTER {} {}", wheel.token(), slot),
            Self::Shutter(open) => format!("SHUTTER {}", u8::from(*open)),
            Self::Led(on) => format!("LED {}", u8::from(*on)),
            Self::ArmTrigger(p) => format!("TRIGARM {} {} {}", p.start, p.pitch, p.count),
            Self::DisarmTrigger => "TRIGDISARM".into(),
            Self::Status => "STATUS?".into(),
            Self::ObjectiveVelocity(steps) => format!("ZSTEP {}", steps),
            Self::ObjectiveMove(position) => format!("ZMV {}", position),
            Self::ObjectivePosition => "ZDACR".into(),
        }
    }

    fn parse(&self, line: &str) -> Result<OpticsReply, ProtocolError> {
        match self {
            Self::Status => OpticsStatus::parse(line).map(OpticsReply::Status),
            Self::ObjectivePosition => value(line).map(OpticsReply::Position),
            _ => ack(line).map(|_| OpticsReply::Ack),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpticsState {
    pub green_filter: Option<u8>,
    pub red_filter: Option<u8>,
    pub shutter_open: Option<bool>,
    pub led_on: Option<bool>,
    pub trigger: Option<TriggerProgram>,
    pub last_command: Option<&'static str>,
}

pub struct Optics {
    link: DeviceLink<AsciiCodec<OpticsRequest>>,
    state: Mutex<OpticsState>,
}

impl Optics {
    pub fn new(id: DeviceId, port: DynSerial, settings: &DeviceSettings) -> Self {
        Self {
            link: ascii_link(id, port, settings),
            state: Mutex::new(OpticsState::default()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.link.id()
    }

    pub fn state(&self) -> OpticsState {
        self.state.lock().clone()
    }

    pub(crate) fn link(&self) -> &DeviceLink<AsciiCodec<OpticsRequest>> {
        &self.link
    }

    pub(crate) async fn request(&self, request: OpticsRequest) -> SeqResult<OpticsReply> {
        let operation = request.operation();
        let reply = self.link.request(request).await?;
        self.state.lock().last_command = Some(operation);
        Ok(reply)
    }

    async fn command(&self, request: OpticsRequest) -> SeqResult<()> {
        self.request(request).await.map(|_| ())
    }

    /// Close the shutter, switch the LED off and disarm the trigger generator.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        self.de_energize().await?;
        self.disarm_trigger().await
    }

    pub async fn status(&self) -> SeqResult<OpticsStatus> {
        match self.link.request(OpticsRequest::Status).await? {
            OpticsReply::Status(status) => Ok(status),
            other => Err(unexpected_reply(self.id(), "status", other)),
        }
    }

    pub async fn set_filter(&self, wheel: FilterWheel, slot: u8) -> SeqResult<()> {
        self.command(OpticsRequest::Filter(wheel, slot)).await?;
        let mut state = self.state.lock();
        match wheel {
            FilterWheel::Green => state.green_filter = Some(slot),
            FilterWheel::Red => state.red_filter = Some(slot),
        }
        Ok(())
    }

    /// Open or close the shutter and confirm it through the status line.
    pub async fn set_shutter(&self, open: bool) -> SeqResult<()> {
        self.command(OpticsRequest::Shutter(open)).await?;
        self.link
            .poll_until("set_shutter", || self.status(), |s| s.shutter_open == open)
            .await?;
        self.state.lock().shutter_open = Some(open);
        Ok(())
    }

    pub async fn set_led(&self, on: bool) -> SeqResult<()> {
        self.command(OpticsRequest::Led(on)).await?;
        self.link
            .poll_until("set_led", || self.status(), |s| s.led_on == on)
            .await?;
        self.state.lock().led_on = Some(on);
        Ok(())
    }

    /// Program the position-compare trigger generator.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn arm_trigger(&self, program: TriggerProgram) -> SeqResult<()> {
        if program.pitch <= 0 || program.count == 0 {
            return Err(SeqError::InvalidArgument(format!(
                "{}: trigger pitch {} and count {} must be positive",
                self.id(),
                program.pitch,
                program.count
            )));
        }
        self.command(OpticsRequest::ArmTrigger(program)).await?;
        self.link
            .poll_until("arm_trigger", || self.status(), |s| s.trigger_armed)
            .await?;
        self.state.lock().trigger = Some(program);
        Ok(())
    }

    pub async fn disarm_trigger(&self) -> SeqResult<()> {
        self.command(OpticsRequest::DisarmTrigger).await?;
        self.state.lock().trigger = None;
        Ok(())
    }

    /// Shutter closed, LED off.
    ///
    /// Both are attempted even if the first fails; the first error is
    /// returned.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn de_energize(&self) -> SeqResult<()> {
        let shutter = self.set_shutter(false).await;
        let led = self.set_led(false).await;
        if let Err(err) = &shutter {
            warn!(device = %self.id(), error = %err, "shutter did not close");
        }
        shutter.and(led)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq_core::config::InstrumentConfig;
    use seq_core::device::DeviceKind;
    use seq_sim::{Fault, SimBench};

    fn optics(bench: &SimBench) -> Optics {
        let config = InstrumentConfig::default();
        Optics::new(
            DeviceId::new(DeviceKind::Optics, "optics"),
            bench.open("optics").unwrap(),
            config.settings_for(DeviceKind::Optics),
        )
    }

    #[test]
    fn status_line_parses_in_any_order() {
        let status = OpticsStatus::parse("TICKS=7 LED=1 SHUTTER=0 TRIG=1").unwrap();
        assert_eq!(
            status,
            OpticsStatus {
                shutter_open: false,
                led_on: true,
                trigger_armed: true,
                ticks: 7
            }
        );
        assert!(OpticsStatus::parse("SHUTTER=1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutter_and_led_are_confirmed() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let optics = optics(&bench);

        optics.set_filter(FilterWheel::Red, 3).await.unwrap();
        optics.set_shutter(true).await.unwrap();
        optics.set_led(true).await.unwrap();
        assert!(bench.shutter_open() && bench.led_on());
        assert_eq!(optics.state().red_filter, Some(3));

        optics.de_energize().await.unwrap();
        assert!(!bench.optics_energized());
        assert_eq!(optics.state().shutter_open, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn de_energize_still_switches_led_off_when_shutter_fails() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let optics = optics(&bench);
        optics.set_led(true).await.unwrap();
        bench
            .handle("optics")
            .unwrap()
            .inject("SHUTTER", Fault::DeviceError(3));

        assert!(optics.de_energize().await.is_err());
        assert!(!bench.led_on());
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_program_is_validated_and_armed() {
        let bench = SimBench::new(&InstrumentConfig::default());
        let optics = optics(&bench);

        let bad = TriggerProgram {
            start: 0,
            pitch: 0,
            count: 4,
        };
        assert!(optics.arm_trigger(bad).await.is_err());
        assert_eq!(bench.total_commands(), 0);

        let program = TriggerProgram {
            start: 1_000,
            pitch: 80,
            count: 4,
        };
        optics.arm_trigger(program).await.unwrap();
        assert!(bench.trigger_armed());
        optics.disarm_trigger().await.unwrap();
        assert!(!bench.trigger_armed());
    }
}
