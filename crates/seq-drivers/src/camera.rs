//! Line-scan TDI camera driver.
//!
//! Protocol Overview:
//! - Control: ASCII, `\r` terminated commands, `\n` terminated replies
//! - `MODE TDI|AREA`, `MODE?`, `TRIGSRC HW|SW`
//! - `ARM <bundles> <height>`, `START`, `TRIG`, `STOP`, `DISARM`
//! - `STATUS?` -> `IDLE|ARMED|CAPTURING|OVERRUN <frames>`
//! - Readout: `READ <index>` answers exactly `width * height * 2` raw bytes
//!   (16-bit little-endian pixels, row major), no terminator
//!
//! The readout reply is binary, so the camera has its own [`Codec`] that
//! switches to fixed-length framing for `READ` and line framing otherwise.

use crate::ascii::{ack, unexpected_reply, COMMAND_TERMINATOR};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use seq_core::channel::{ResponseMatcher, SerialChannel};
use seq_core::codec::{ascii_line, Codec};
use seq_core::config::{CameraConfig, DeviceSettings, TriggerSource};
use seq_core::data::{BundleMetadata, Frame, FrameBundle};
use seq_core::device::DeviceId;
use seq_core::error::{ProtocolError, SeqError, SeqResult};
use seq_core::limits::{bundle_buffer_bytes, validate_frame_size, MAX_FRAME_BYTES};
use seq_core::link::DeviceLink;
use seq_core::serial::DynSerial;
use serde::Serialize;
use tracing::{debug, info, instrument};

/// Sensor readout mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorMode {
    /// Time-delay integration line scan (imaging)
    Tdi,
    /// Area readout (focus sweeps)
    Area,
}

impl SensorMode {
    fn token(&self) -> &'static str {
        match self {
            Self::Tdi => "TDI",
            Self::Area => "AREA",
        }
    }
}

/// Capture state reported by `STATUS?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Armed,
    Capturing,
    Overrun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CameraStatus {
    pub state: CaptureState,
    /// Bundles captured into the on-camera buffer
    pub frames: u32,
}

impl CameraStatus {
    fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (label, frames) = line
            .split_once(' ')
            .ok_or_else(|| ProtocolError::Malformed(format!("bad status line {:?}", line)))?;
        let state = match label {
            "IDLE" => CaptureState::Idle,
            "ARMED" => CaptureState::Armed,
            "CAPTURING" => CaptureState::Capturing,
            "OVERRUN" => CaptureState::Overrun,
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "IDLE|ARMED|CAPTURING|OVERRUN".into(),
                    got: other.into(),
                })
            }
        };
        let frames = frames
            .trim()
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("bad frame count in {:?}", line)))?;
        Ok(Self { state, frames })
    }
}

// =============================================================================
// Wire adapter
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraRequest {
    SetMode(SensorMode),
    Mode,
    SetTriggerSource(TriggerSource),
    Arm { bundles: u32, height: u32 },
    Start,
    Trigger,
    Status,
    Stop,
    Read { index: u32, bytes: usize },
    Disarm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraReply {
    Ack,
    Mode(SensorMode),
    Status(CameraStatus),
    Frame(Bytes),
}

/// Mixed ASCII / fixed-length binary codec of the camera.
#[derive(Debug, Default)]
pub struct CameraCodec;

impl Codec for CameraCodec {
    type Request = CameraRequest;
    type Reply = CameraReply;

    fn operation(&self, request: &CameraRequest) -> &'static str {
        match request {
            CameraRequest::SetMode(_) => "set_mode",
            CameraRequest::Mode => "mode",
            CameraRequest::SetTriggerSource(_) => "set_trigger_source",
            CameraRequest::Arm { .. } => "arm",
            CameraRequest::Start => "start_capture",
            CameraRequest::Trigger => "trigger",
            CameraRequest::Status => "status",
            CameraRequest::Stop => "stop_capture",
            CameraRequest::Read { .. } => "read_frame",
            CameraRequest::Disarm => "disarm",
        }
    }

    fn encode(&self, request: &CameraRequest) -> Bytes {
        let command = match request {
            CameraRequest::SetMode(mode) => format!("MODE {}", mode.token()),
            CameraRequest::Mode => "MODE?".into(),
            CameraRequest::SetTriggerSource(TriggerSource::HardwareTick) => "TRIGSRC HW".into(),
            CameraRequest::SetTriggerSource(TriggerSource::SoftwareTimer) => "TRIGSRC SW".into(),
            CameraRequest::Arm { bundles, height } => format!("ARM {} {}", bundles, height),
            CameraRequest::Start => "START".into(),
            CameraRequest::Trigger => "TRIG".into(),
            CameraRequest::Status => "STATUS?".into(),
            CameraRequest::Stop => "STOP".into(),
            CameraRequest::Read { index, .. } => format!("READ {}", index),
            CameraRequest::Disarm => "DISARM".into(),
        };
        Bytes::from(format!("{}{}", command, COMMAND_TERMINATOR))
    }

    fn response(&self, request: &CameraRequest) -> ResponseMatcher {
        match request {
            CameraRequest::Read { bytes, .. } => ResponseMatcher::FixedLength(*bytes),
            _ => ResponseMatcher::line(),
        }
    }

    fn decode(&self, request: &CameraRequest, frame: &[u8]) -> Result<CameraReply, ProtocolError> {
        match request {
            CameraRequest::Read { bytes, .. } => {
                if frame.len() != *bytes {
                    return Err(ProtocolError::Malformed(format!(
                        "readout of {} bytes, expected {}",
                        frame.len(),
                        bytes
                    )));
                }
                Ok(CameraReply::Frame(Bytes::copy_from_slice(frame)))
            }
            CameraRequest::Mode => match ascii_line(frame)? {
                "TDI" => Ok(CameraReply::Mode(SensorMode::Tdi)),
                "AREA" => Ok(CameraReply::Mode(SensorMode::Area)),
                other => Err(ProtocolError::Unexpected {
                    expected: "TDI|AREA".into(),
                    got: other.into(),
                }),
            },
            CameraRequest::Status => CameraStatus::parse(ascii_line(frame)?).map(CameraReply::Status),
            _ => ack(ascii_line(frame)?).map(|_| CameraReply::Ack),
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CameraState {
    pub mode: Option<SensorMode>,
    pub trigger_source: Option<TriggerSource>,
    /// (bundles, frame height) of the current arming
    pub armed: Option<(u32, u32)>,
    pub capturing: bool,
    pub frames: u32,
    pub last_command: Option<&'static str>,
}

pub struct Camera {
    link: DeviceLink<CameraCodec>,
    config: CameraConfig,
    state: Mutex<CameraState>,
}

impl Camera {
    pub fn new(id: DeviceId, port: DynSerial, settings: &DeviceSettings, config: &CameraConfig) -> Self {
        let channel = SerialChannel::new(id.endpoint.clone(), port, settings.drain_window)
            .with_max_response_bytes(MAX_FRAME_BYTES);
        Self {
            link: DeviceLink::new(id, channel, CameraCodec, settings.link()),
            config: *config,
            state: Mutex::new(CameraState::default()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.link.id()
    }

    pub fn frame_width(&self) -> u32 {
        self.config.frame_width
    }

    pub fn state(&self) -> CameraState {
        self.state.lock().clone()
    }

    async fn command(&self, request: CameraRequest) -> SeqResult<()> {
        let operation = self.link.codec().operation(&request);
        match self.link.request(request).await? {
            CameraReply::Ack => {
                self.state.lock().last_command = Some(operation);
                Ok(())
            }
            other => Err(unexpected_reply(self.id(), operation, other)),
        }
    }

    /// Disarm, select TDI mode and hardware triggering.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        self.disarm().await?;
        self.set_mode(SensorMode::Tdi).await?;
        self.set_trigger_source(TriggerSource::HardwareTick).await
    }

    /// Select the sensor mode and read it back.
    pub async fn set_mode(&self, mode: SensorMode) -> SeqResult<()> {
        self.command(CameraRequest::SetMode(mode)).await?;
        match self.link.request(CameraRequest::Mode).await? {
            CameraReply::Mode(reported) if reported == mode => {
                self.state.lock().mode = Some(mode);
                Ok(())
            }
            other => Err(unexpected_reply(self.id(), "set_mode", other)),
        }
    }

    pub async fn set_trigger_source(&self, source: TriggerSource) -> SeqResult<()> {
        self.command(CameraRequest::SetTriggerSource(source)).await?;
        self.state.lock().trigger_source = Some(source);
        Ok(())
    }

    /// Reject an arming the camera cannot hold. Sends nothing.
    pub fn check_arming(&self, bundles: u32, height: u32) -> SeqResult<()> {
        if bundles == 0 {
            return Err(SeqError::InvalidPlan("bundle count must be at least 1".into()));
        }
        validate_frame_size(self.config.frame_width, height)?;
        if height > self.config.max_frame_height {
            return Err(SeqError::InvalidPlan(format!(
                "frame height {} exceeds camera maximum {}",
                height, self.config.max_frame_height
            )));
        }
        let needed = bundle_buffer_bytes(self.config.frame_width, height, bundles)?;
        if needed > self.config.buffer_capacity_bytes {
            return Err(SeqError::InvalidPlan(format!(
                "{} bundles need {} bytes, camera buffer holds {}",
                bundles, needed, self.config.buffer_capacity_bytes
            )));
        }
        Ok(())
    }

    /// Arm for `bundles` frames of `height` lines and confirm the camera is armed.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn arm(&self, bundles: u32, height: u32) -> SeqResult<()> {
        self.check_arming(bundles, height)?;
        self.command(CameraRequest::Arm { bundles, height }).await?;
        self.link
            .poll_until("arm", || self.status(), |s| s.state == CaptureState::Armed)
            .await?;
        let mut state = self.state.lock();
        state.armed = Some((bundles, height));
        state.frames = 0;
        Ok(())
    }

    pub async fn start_capture(&self) -> SeqResult<()> {
        self.command(CameraRequest::Start).await?;
        self.state.lock().capturing = true;
        Ok(())
    }

    /// Software trigger: capture one bundle now.
    pub async fn trigger(&self) -> SeqResult<()> {
        self.command(CameraRequest::Trigger).await
    }

    pub async fn status(&self) -> SeqResult<CameraStatus> {
        match self.link.request(CameraRequest::Status).await? {
            CameraReply::Status(status) => {
                self.state.lock().frames = status.frames;
                Ok(status)
            }
            other => Err(unexpected_reply(self.id(), "status", other)),
        }
    }

    /// Stop accepting triggers. Frames already captured stay in the buffer.
    pub async fn stop_capture(&self) -> SeqResult<()> {
        self.command(CameraRequest::Stop).await?;
        self.state.lock().capturing = false;
        Ok(())
    }

    /// Read frame `index` of the current arming out of the camera buffer.
    pub async fn read_frame(&self, index: u32) -> SeqResult<Frame> {
        let Some((_, height)) = self.state.lock().armed else {
            return Err(SeqError::InvalidArgument(format!("{}: read_frame while not armed", self.id())));
        };
        let size = validate_frame_size(self.config.frame_width, height)?;
        let request = CameraRequest::Read {
            index,
            bytes: size.bytes,
        };
        match self.link.request(request).await? {
            CameraReply::Frame(bytes) => Ok(Frame::from_le_bytes(
                index,
                self.config.frame_width,
                height,
                &bytes,
            )),
            other => Err(unexpected_reply(self.id(), "read_frame", other)),
        }
    }

    /// Read frames `0..count` in order.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn read_out(&self, count: u32) -> SeqResult<Vec<Frame>> {
        let mut frames = Vec::with_capacity(count as usize);
        for index in 0..count {
            frames.push(self.read_frame(index).await?);
        }
        debug!(device = %self.id(), count, "read out");
        Ok(frames)
    }

    pub async fn disarm(&self) -> SeqResult<()> {
        self.command(CameraRequest::Disarm).await?;
        let mut state = self.state.lock();
        state.armed = None;
        state.capturing = false;
        state.frames = 0;
        Ok(())
    }

    /// Capture the armed bundle count and read it out.
    ///
    /// With software triggering one `TRIG` is issued per bundle; with hardware
    /// triggering the camera is left to count position ticks. Either way the
    /// call waits for the buffer to fill, stops the capture and returns the
    /// frames. Stage motion is the caller's business.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn trigger_and_collect(&self) -> SeqResult<FrameBundle> {
        let (armed, source) = {
            let state = self.state.lock();
            (state.armed, state.trigger_source)
        };
        let Some((bundles, height)) = armed else {
            return Err(SeqError::InvalidArgument(format!(
                "{}: trigger_and_collect while not armed",
                self.id()
            )));
        };
        let source = source.unwrap_or_default();
        let started_at = Utc::now();

        if !self.state.lock().capturing {
            self.start_capture().await?;
        }
        if source == TriggerSource::SoftwareTimer {
            for _ in 0..bundles {
                self.trigger().await?;
            }
        }
        let status = self
            .link
            .poll_until("trigger_and_collect", || self.status(), |s| {
                s.frames >= bundles || s.state == CaptureState::Overrun
            })
            .await?;
        self.stop_capture().await?;
        if status.state == CaptureState::Overrun {
            return Err(SeqError::OperationIncomplete {
                device: self.id().clone(),
                operation: "trigger_and_collect",
                polls: 1,
                detail: format!("buffer overrun after {} frames", status.frames),
            });
        }

        let frames = self.read_out(bundles).await?;
        info!(device = %self.id(), bundles, "collected");
        Ok(FrameBundle {
            frames,
            metadata: BundleMetadata {
                frame_width: self.config.frame_width,
                frame_height: height,
                bundle_count: bundles,
                trigger_source: source,
                start_position: None,
                end_position: None,
                velocity: None,
                label: None,
                started_at,
                completed_at: Utc::now(),
            },
        })
    }
}
