//! Objective (Z) focus drive on the FPGA optics controller.
//!
//! Protocol (same link as [`Optics`]):
//! - `ZSTEP <n>` sets the velocity, `n = 1288471 * mm/s`
//! - `ZMV <dac>` starts a move, `dac` in `0..=65535`
//! - `ZDACR` -> `*<dac>` reads the DAC position back

use crate::ascii::unexpected_reply;
use crate::optics::{Optics, OpticsReply, OpticsRequest};
use parking_lot::Mutex;
use seq_core::device::DeviceId;
use seq_core::error::{SeqError, SeqResult};
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::instrument;

/// Accepted objective positions (DAC counts).
pub const Z_RANGE: RangeInclusive<u32> = 0..=65_535;

/// `ZSTEP` units per mm/s.
const ZSTEP_PER_MM_S: f64 = 1_288_471.0;

/// Velocity set by [`Objective::initialize`] (mm/s).
pub const DEFAULT_VELOCITY_MM_S: f64 = 5.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ObjectiveState {
    pub position: Option<u32>,
    pub velocity_mm_s: Option<f64>,
}

pub struct Objective {
    optics: Arc<Optics>,
    state: Mutex<ObjectiveState>,
}

impl Objective {
    pub fn new(optics: Arc<Optics>) -> Self {
        Self {
            optics,
            state: Mutex::new(ObjectiveState::default()),
        }
    }

    pub fn id(&self) -> &DeviceId {
        self.optics.id()
    }

    pub fn state(&self) -> ObjectiveState {
        *self.state.lock()
    }

    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        self.set_velocity(DEFAULT_VELOCITY_MM_S).await
    }

    pub async fn set_velocity(&self, mm_per_s: f64) -> SeqResult<()> {
        let steps = (mm_per_s * ZSTEP_PER_MM_S).round();
        if !(mm_per_s.is_finite() && mm_per_s > 0.0 && steps <= f64::from(u32::MAX)) {
            return Err(SeqError::InvalidArgument(format!(
                "{}: objective velocity {} mm/s out of range",
                self.id(),
                mm_per_s
            )));
        }
        self.optics
            .request(OpticsRequest::ObjectiveVelocity(steps as u32))
            .await?;
        self.state.lock().velocity_mm_s = Some(mm_per_s);
        Ok(())
    }

    pub async fn position(&self) -> SeqResult<u32> {
        match self.optics.request(OpticsRequest::ObjectivePosition).await? {
            OpticsReply::Position(position) => Ok(position),
            other => Err(unexpected_reply(self.id(), "objective_position", other)),
        }
    }

    /// Move to `target` and wait until the DAC reads it back.
    #[instrument(skip(self), fields(device = %self.id()), err)]
    pub async fn move_to(&self, target: u32) -> SeqResult<()> {
        if !Z_RANGE.contains(&target) {
            return Err(SeqError::InvalidArgument(format!(
                "{}: objective position {} outside {:?}",
                self.id(),
                target,
                Z_RANGE
            )));
        }
        self.optics
            .request(OpticsRequest::ObjectiveMove(target))
            .await?;
        let position = self
            .optics
            .link()
            .poll_until("objective_move", || self.position(), |p| *p == target)
            .await?;
        self.state.lock().position = Some(position);
        Ok(())
    }
}
