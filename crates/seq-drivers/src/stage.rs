//! Stage-X / Stage-Y motion controller driver.
//!
//! Protocol Overview:
//! - Format: ASCII command/response, `\r` terminated, replies `\n` terminated
//! - Set commands acknowledge with `OK`; queries answer `*<value>`
//! - Commands:
//!   - `Z` reset, `ON` servo on, `MA` absolute mode
//!   - `V<steps/s>` velocity, `D<steps>` target, `G` go, `GH` go home, `S` stop
//!   - `R(PA)` position readback, `R(MV)` moving flag
//!
//! Motion is two transactions (set target, go) followed by a post-condition
//! poll: the controller must report "not moving" with the readback inside
//! the settle tolerance before the believed position is updated.

use crate::ascii::{ack, ascii_link, flag, unexpected_reply, value, AsciiCodec, AsciiRequest};
use parking_lot::Mutex;
use seq_core::config::{AxisLimits, DeviceSettings, StageConfig};
use seq_core::device::DeviceId;
use seq_core::error::{ProtocolError, SeqError, SeqResult};
use seq_core::link::DeviceLink;
use seq_core::serial::DynSerial;
use serde::Serialize;
use tracing::{debug, instrument};

// =============================================================================
// Wire adapter
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageRequest {
    Reset,
    ServoOn,
    AbsoluteMode,
    Velocity(f64),
    Target(i64),
    Go,
    Home,
    Stop,
    Position,
    Moving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageReply {
    Ack,
    Position(i64),
    Moving(bool),
}

impl AsciiRequest for StageRequest {
    type Reply = StageReply;

    fn operation(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::ServoOn => "servo_on",
            Self::AbsoluteMode => "absolute_mode",
            Self::Velocity(_) => "set_velocity",
            Self::Target(_) => "set_target",
            Self::Go => "go",
            Self::Home => "home",
            Self::Stop => "stop",
            Self::Position => "position",
            Self::Moving => "is_moving",
        }
    }

    fn command(&self) -> String {
        match self {
            Self::Reset => "Z".into(),
            Self::ServoOn => "ON".into(),
            Self::AbsoluteMode => "MA".into(),
            Self::Velocity(v) => format!("V{}", v),
            Self::Target(p) => format!("D{}", p),
            Self::Go => "G".into(),
            Self::Home => "GH".into(),
            Self::Stop => "S".into(),
            Self::Position => "R(PA)".into(),
            Self::Moving => "R(MV)".into(),
        }
    }

    fn parse(&self, line: &str) -> Result<StageReply, ProtocolError> {
        match self {
            Self::Position => value(line).map(StageReply::Position),
            Self::Moving => flag(line).map(StageReply::Moving),
            _ => ack(line).map(|_| StageReply::Ack),
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Velocity profile of the stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionMode {
    /// Fast repositioning
    Moving,
    /// Constant scan velocity (steps/s)
    Imaging { velocity: f64 },
}

/// Believed stage state: only ever the last acknowledged readback.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageState {
    /// `None` while a move is in flight or before the first readback
    pub position: Option<i64>,
    pub velocity: Option<f64>,
    pub servo_on: bool,
    pub homed: bool,
    pub last_command: Option<&'static str>,
}

/// Driver for one linear stage axis.
pub struct Stage {
    link: DeviceLink<AsciiCodec<StageRequest>>,
    limits: AxisLimits,
    settle_tolerance: i64,
    home_position: i64,
    moving_velocity: f64,
    state: Mutex<StageState>,
}

impl Stage {
    pub fn new(id: DeviceId, port: DynSerial, settings: &DeviceSettings, config: &StageConfig) -> Self {
        let limits = config.limits(id.kind);
        Self {
            link: ascii_link(id, port, settings),
            limits,
            settle_tolerance: config.settle_tolerance,
            home_position: config.home_position,
            moving_velocity: config.moving_velocity,
            state: Mutex::new(StageState::default()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.link.id()
    }

    pub fn limits(&self) -> AxisLimits {
        self.limits
    }

    pub fn moving_velocity(&self) -> f64 {
        self.moving_velocity
    }

    pub fn state(&self) -> StageState {
        self.state.lock().clone()
    }

    async fn command(&self, request: StageRequest) -> SeqResult<()> {
        let operation = request.operation();
        self.link.request(request).await?;
        self.state.lock().last_command = Some(operation);
        Ok(())
    }

    /// Reset, enable the servo, select absolute positioning and home.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        self.command(StageRequest::Reset).await?;
        {
            let mut state = self.state.lock();
            state.servo_on = false;
            state.homed = false;
            state.velocity = None;
            state.position = None;
        }
        self.command(StageRequest::ServoOn).await?;
        self.state.lock().servo_on = true;
        self.command(StageRequest::AbsoluteMode).await?;
        self.set_mode(MotionMode::Moving).await?;
        self.home().await
    }

    /// Set the velocity; not re-sent if the controller already has it.
    pub async fn set_velocity(&self, velocity: f64) -> SeqResult<()> {
        if !(velocity.is_finite() && velocity > 0.0) {
            return Err(SeqError::InvalidArgument(format!(
                "{}: velocity {} must be positive",
                self.id(),
                velocity
            )));
        }
        if self.state.lock().velocity == Some(velocity) {
            return Ok(());
        }
        self.command(StageRequest::Velocity(velocity)).await?;
        self.state.lock().velocity = Some(velocity);
        Ok(())
    }

    pub async fn set_mode(&self, mode: MotionMode) -> SeqResult<()> {
        match mode {
            MotionMode::Moving => self.set_velocity(self.moving_velocity).await,
            MotionMode::Imaging { velocity } => self.set_velocity(velocity).await,
        }
    }

    pub async fn position(&self) -> SeqResult<i64> {
        match self.link.request(StageRequest::Position).await? {
            StageReply::Position(position) => Ok(position),
            other => Err(unexpected_reply(self.id(), "position", other)),
        }
    }

    pub async fn is_moving(&self) -> SeqResult<bool> {
        match self.link.request(StageRequest::Moving).await? {
            StageReply::Moving(moving) => Ok(moving),
            other => Err(unexpected_reply(self.id(), "is_moving", other)),
        }
    }

    pub fn check_target(&self, target: i64) -> SeqResult<()> {
        if self.limits.contains(target) {
            Ok(())
        } else {
            Err(SeqError::InvalidArgument(format!(
                "{}: target {} outside travel [{}, {}]",
                self.id(),
                target,
                self.limits.min,
                self.limits.max
            )))
        }
    }

    /// Command a move at the current velocity without waiting for it.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn start_move(&self, target: i64) -> SeqResult<()> {
        self.check_target(target)?;
        self.command(StageRequest::Target(target)).await?;
        self.command(StageRequest::Go).await?;
        self.state.lock().position = None;
        Ok(())
    }

    /// Poll until the stage stops within tolerance of `target`.
    pub async fn wait_settled(&self, target: i64) -> SeqResult<i64> {
        let tolerance = self.settle_tolerance;
        let (_, position) = self
            .link
            .poll_until(
                "wait_settled",
                || async move {
                    let moving = self.is_moving().await?;
                    let position = self.position().await?;
                    Ok((moving, position))
                },
                |(moving, position)| !moving && (position - target).abs() <= tolerance,
            )
            .await?;
        self.state.lock().position = Some(position);
        debug!(device = %self.id(), position, "settled");
        Ok(position)
    }

    /// Move to `target` at `velocity` and confirm arrival.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn move_to(&self, target: i64, velocity: f64) -> SeqResult<()> {
        self.check_target(target)?;
        self.set_velocity(velocity).await?;
        self.start_move(target).await?;
        self.wait_settled(target).await?;
        Ok(())
    }

    /// Reposition at the fast "moving" velocity.
    pub async fn move_fast(&self, target: i64) -> SeqResult<()> {
        self.move_to(target, self.moving_velocity).await
    }

    /// Seek home. Idempotent: homing an axis already at home changes nothing.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn home(&self) -> SeqResult<()> {
        if self.state.lock().velocity.is_none() {
            self.set_mode(MotionMode::Moving).await?;
        }
        self.command(StageRequest::Home).await?;
        let position = self.wait_settled(self.home_position).await?;
        let mut state = self.state.lock();
        state.homed = true;
        state.position = Some(position);
        Ok(())
    }

    /// Stop immediately and record where the axis came to rest.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn stop(&self) -> SeqResult<i64> {
        self.command(StageRequest::Stop).await?;
        self.link
            .poll_until("stop", || self.is_moving(), |moving| !moving)
            .await?;
        let position = self.position().await?;
        self.state.lock().position = Some(position);
        Ok(position)
    }
}
