//! Imager - synchronized TDI acquisition.
//!
//! The imager owns the single optics path (camera, FPGA optics, objective,
//! lasers and the two stages). Access goes through [`Imager::acquire`], which hands out
//! an [`ImagerGuard`]; holding the guard is holding the shared resource lock.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  arm ok   ┌───────┐  stage moving  ┌──────────┐  bundles in  ┌──────────┐
//! │ Idle │──────────▶│ Armed │───────────────▶│ Scanning │─────────────▶│ Draining │
//! └──────┘           └───┬───┘                └────┬─────┘              └────┬─────┘
//!    ▲                   │ failure / cancel        │                         │
//!    │                   ▼                         ▼                         │
//!    │               ┌───────┐◀────────────────────┴─────────────────────────┤
//!    │◀── teardown ──│ Error │                                               │
//!    │               └───────┘                                               │
//!    └──────────────────────────────── teardown ◀────────────────────────────┘
//! ```
//!
//! # Triggering
//!
//! With `hardware_tick` (the default) the FPGA fires the camera every
//! `frame_height * units_per_line` encoder steps from `y_start`; no host
//! timing is involved and frame-to-position accuracy is one encoder step.
//! With `software_timer` the host issues `TRIG` at the times the stage is
//! expected to cross those positions; a trigger issued later than
//! `jitter_tolerance` aborts the scan.
//!
//! Teardown (shutter closed, LED off, lasers off, trigger generator and
//! camera disarmed) runs on every exit path, including cancellation.

use crate::plan::{ScanGeometry, ScanPlan};
use chrono::{DateTime, Utc};
use seq_core::cancel::{check_cancelled, run_cancellable, CancellationToken};
use seq_core::config::{CameraConfig, ImagingConfig, InstrumentConfig, StageConfig, TriggerSource};
use seq_core::data::{BundleMetadata, Frame, FrameBundle};
use seq_core::error::{ScanFailure, SeqError, SeqResult};
use seq_drivers::{
    Camera, CaptureState, FilterWheel, Laser, MotionMode, Objective, Optics, SensorMode, Stage,
    TriggerProgram,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Imager state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagerState {
    /// Nothing armed; optics de-energized
    Idle,
    /// Camera, optics and lasers configured for a scan
    Armed,
    /// Stage-Y moving at scan velocity, bundles being captured
    Scanning,
    /// No more triggers; reading the camera buffer out
    Draining,
    /// Scan aborted; teardown in progress
    Error,
}

impl fmt::Display for ImagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImagerState::Idle => write!(f, "idle"),
            ImagerState::Armed => write!(f, "armed"),
            ImagerState::Scanning => write!(f, "scanning"),
            ImagerState::Draining => write!(f, "draining"),
            ImagerState::Error => write!(f, "error"),
        }
    }
}

/// Devices on the optics path.
#[derive(Clone)]
pub struct ImagerDevices {
    pub stage_x: Arc<Stage>,
    pub stage_y: Arc<Stage>,
    pub camera: Arc<Camera>,
    pub optics: Arc<Optics>,
    pub objective: Arc<Objective>,
    pub laser_green: Arc<Laser>,
    pub laser_red: Arc<Laser>,
}

pub struct Imager {
    devices: Mutex<ImagerDevices>,
    stage: StageConfig,
    camera: CameraConfig,
    imaging: ImagingConfig,
    state: watch::Sender<ImagerState>,
}

impl Imager {
    pub fn new(devices: ImagerDevices, config: &InstrumentConfig) -> Self {
        let (state, _) = watch::channel(ImagerState::Idle);
        Self {
            devices: Mutex::new(devices),
            stage: config.stage,
            camera: config.camera,
            imaging: config.imaging,
            state,
        }
    }

    pub fn state(&self) -> ImagerState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ImagerState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ImagerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "imager state");
        }
    }

    /// Wait for exclusive use of the optics path.
    pub async fn acquire(&self, token: &CancellationToken) -> SeqResult<ImagerGuard<'_>> {
        let devices = run_cancellable(token, "acquire_imager", async {
            Ok::<_, SeqError>(self.devices.lock().await)
        })
        .await?;
        debug!("optics path acquired");
        Ok(ImagerGuard {
            imager: self,
            devices,
        })
    }

    /// Acquire the optics path, scan once, release.
    pub async fn scan(&self, plan: &ScanPlan, token: &CancellationToken) -> SeqResult<FrameBundle> {
        let mut guard = self.acquire(token).await?;
        guard.scan(plan, token).await
    }

    /// Initialise every device on the optics path concurrently.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        let devices = self.devices.lock().await;
        futures::try_join!(
            devices.stage_x.initialize(),
            devices.stage_y.initialize(),
            devices.camera.initialize(),
            devices.optics.initialize(),
            devices.objective.initialize(),
            devices.laser_green.initialize(),
            devices.laser_red.initialize(),
        )?;
        Ok(())
    }
}

/// Exclusive access to the optics path. Dropping it releases the lock.
pub struct ImagerGuard<'a> {
    imager: &'a Imager,
    devices: MutexGuard<'a, ImagerDevices>,
}

impl ImagerGuard<'_> {
    pub fn devices(&self) -> &ImagerDevices {
        &self.devices
    }

    /// Run one synchronized scan.
    ///
    /// Returns every planned bundle or an error; never a partial bundle.
    /// A plan that fails validation, or a device that rejects its arming,
    /// leaves the imager `Idle` and returns the error as is. Failures after
    /// arming are reported as [`SeqError::ScanFailed`]; cancellation as
    /// [`SeqError::Cancelled`].
    #[instrument(skip_all, fields(label = ?plan.label, bundles = plan.bundles), err)]
    pub async fn scan(&mut self, plan: &ScanPlan, token: &CancellationToken) -> SeqResult<FrameBundle> {
        let imager = self.imager;
        let geometry = plan.validate(&imager.stage, &imager.camera, &imager.imaging)?;
        check_cancelled(token, "scan")?;
        let clock = ScanClock::start();

        let outcome = run_cancellable(token, "scan", self.execute(plan, geometry, clock)).await;
        let reached = imager.state();
        if outcome.is_err() && reached != ImagerState::Idle {
            imager.set_state(ImagerState::Error);
        }
        let teardown = self.teardown(outcome.is_err()).await;
        imager.set_state(ImagerState::Idle);

        match (outcome, teardown) {
            (Ok((frames, end_position)), Ok(())) => {
                info!(frames = frames.len(), end_position, "scan complete");
                Ok(FrameBundle {
                    frames,
                    metadata: BundleMetadata {
                        frame_width: imager.camera.frame_width,
                        frame_height: plan.frame_height,
                        bundle_count: plan.bundles,
                        trigger_source: imager.imaging.trigger_source,
                        start_position: Some(plan.y_start),
                        end_position: Some(end_position),
                        velocity: Some(plan.velocity),
                        label: plan.label.clone(),
                        started_at: clock.wall,
                        completed_at: clock.now(),
                    },
                })
            }
            (Ok(_), Err(err)) => Err(err.into_scan_failure()),
            (Err(err), teardown) => {
                if let Err(teardown) = teardown {
                    warn!(error = %teardown, "teardown after failed scan was incomplete");
                }
                if reached == ImagerState::Idle {
                    Err(err)
                } else {
                    Err(err.into_scan_failure())
                }
            }
        }
    }

    async fn execute(
        &self,
        plan: &ScanPlan,
        geometry: ScanGeometry,
        clock: ScanClock,
    ) -> SeqResult<(Vec<Frame>, i64)> {
        let imager = self.imager;
        let devices = &*self.devices;
        let source = imager.imaging.trigger_source;

        // Idle -> Armed
        if let Some(x) = plan.x_position {
            devices.stage_x.move_fast(x).await?;
        }
        devices.stage_y.move_fast(plan.y_start).await?;
        if let Some(z) = plan.z_position {
            devices.objective.move_to(z).await?;
        }
        devices.camera.set_mode(SensorMode::Tdi).await?;
        devices.camera.set_trigger_source(source).await?;
        devices.camera.arm(plan.bundles, plan.frame_height).await?;
        devices.camera.start_capture().await?;
        self.arm_optics(plan, geometry).await?;
        imager.set_state(ImagerState::Armed);

        // Armed -> Scanning
        devices
            .stage_y
            .set_mode(MotionMode::Imaging {
                velocity: plan.velocity,
            })
            .await?;
        let motion_started = Instant::now();
        devices.stage_y.start_move(plan.y_end).await?;
        imager.set_state(ImagerState::Scanning);
        self.monitor(plan, geometry).await?;

        // Scanning -> Draining
        imager.set_state(ImagerState::Draining);
        devices.camera.stop_capture().await?;
        if source == TriggerSource::HardwareTick {
            devices.optics.disarm_trigger().await?;
        }
        let end_position = devices.stage_y.stop().await?;
        let mut frames = devices.camera.read_out(plan.bundles).await?;
        let read_out_at = Instant::now();
        for frame in &mut frames {
            frame.nominal_position = Some(plan.nominal_position(frame.index, geometry.pitch));
            // Bundle i is complete once the stage has covered i + 1 pitches.
            let acquired = geometry
                .trigger_period
                .checked_mul(frame.index.saturating_add(1))
                .and_then(|offset| motion_started.checked_add(offset))
                .map_or(read_out_at, |at| at.min(read_out_at));
            frame.timestamp = clock.at(acquired);
        }
        Ok((frames, end_position))
    }

    async fn arm_optics(&self, plan: &ScanPlan, geometry: ScanGeometry) -> SeqResult<()> {
        let devices = &*self.devices;
        let setup = &plan.optics;

        if let Some(slot) = setup.green_filter {
            devices.optics.set_filter(FilterWheel::Green, slot).await?;
        }
        if let Some(slot) = setup.red_filter {
            devices.optics.set_filter(FilterWheel::Red, slot).await?;
        }
        devices.optics.set_led(setup.led).await?;
        devices.optics.set_shutter(true).await?;
        if self.imager.imaging.trigger_source == TriggerSource::HardwareTick {
            devices
                .optics
                .arm_trigger(TriggerProgram {
                    start: plan.y_start,
                    pitch: geometry.pitch,
                    count: plan.bundles,
                })
                .await?;
        }

        for (laser, power) in [
            (&devices.laser_green, setup.green_power_mw),
            (&devices.laser_red, setup.red_power_mw),
        ] {
            if let Some(mw) = power {
                laser.set_power(mw).await?;
                laser.on().await?;
            }
        }
        Ok(())
    }

    /// Watch the scan until every bundle is captured.
    async fn monitor(&self, plan: &ScanPlan, geometry: ScanGeometry) -> SeqResult<()> {
        let imaging = &self.imager.imaging;
        let software = imaging.trigger_source == TriggerSource::SoftwareTimer;
        let started = Instant::now();
        let mut fired = 0u32;
        let mut next_poll = started;

        loop {
            if software {
                while fired < plan.bundles {
                    let due = started + geometry.trigger_period * (fired + 1);
                    let now = Instant::now();
                    if now < due {
                        break;
                    }
                    let late_by = now - due;
                    if late_by > imaging.jitter_tolerance {
                        return Err(SeqError::ScanFailed(ScanFailure::TriggerJitter {
                            late_by,
                            tolerance: imaging.jitter_tolerance,
                        }));
                    }
                    self.devices.camera.trigger().await?;
                    fired += 1;
                }
            }

            if Instant::now() >= next_poll {
                if self.check_progress(plan, geometry, started).await? {
                    return Ok(());
                }
                next_poll = Instant::now() + imaging.scan_poll_interval;
            }

            let wake = if software && fired < plan.bundles {
                next_poll.min(started + geometry.trigger_period * (fired + 1))
            } else {
                next_poll
            };
            tokio::time::sleep_until(wake).await;
        }
    }

    /// One buffer and trajectory check; `true` once every bundle is in.
    async fn check_progress(&self, plan: &ScanPlan, geometry: ScanGeometry, started: Instant) -> SeqResult<bool> {
        let devices = &*self.devices;
        let imaging = &self.imager.imaging;

        let status = devices.camera.status().await?;
        if status.state == CaptureState::Overrun {
            return Err(SeqError::ScanFailed(ScanFailure::BufferOverrun {
                frames: status.frames,
            }));
        }
        if status.frames >= plan.bundles {
            return Ok(true);
        }

        // The first bundle cannot complete before the stage has covered one pitch.
        let elapsed = started.elapsed();
        let first_bundle_deadline = imaging.first_bundle_timeout.saturating_add(geometry.trigger_period);
        if status.frames == 0 && elapsed >= first_bundle_deadline {
            return Err(SeqError::ScanFailed(ScanFailure::NoFirstBundle { waited: elapsed }));
        }

        let position = devices.stage_y.position().await?;
        let expected = (plan.y_start as f64 + plan.velocity * elapsed.as_secs_f64()).min(plan.y_end as f64);
        if (position as f64 - expected).abs() > imaging.position_tolerance {
            return Err(SeqError::ScanFailed(ScanFailure::TrajectoryDivergence {
                expected,
                actual: position,
                tolerance: imaging.position_tolerance,
            }));
        }

        if position >= plan.y_end {
            let status = devices.camera.status().await?;
            if status.frames >= plan.bundles {
                return Ok(true);
            }
            return Err(SeqError::ScanFailed(ScanFailure::Underrun {
                expected: plan.bundles,
                collected: status.frames,
            }));
        }
        debug!(frames = status.frames, position, "scanning");
        Ok(false)
    }

    /// Put the optics path back to a safe state. Every step is attempted.
    async fn teardown(&self, aborted: bool) -> SeqResult<()> {
        let devices = &*self.devices;
        let mut first = None;

        keep_first(&mut first, "optics", devices.optics.de_energize().await);
        keep_first(&mut first, "laser_green", devices.laser_green.off().await);
        keep_first(&mut first, "laser_red", devices.laser_red.off().await);
        if aborted {
            keep_first(&mut first, "trigger", devices.optics.disarm_trigger().await);
            keep_first(
                &mut first,
                "stage_y",
                devices.stage_y.stop().await.map(|_| ()),
            );
        }
        keep_first(&mut first, "camera", devices.camera.disarm().await);

        first.map_or(Ok(()), Err)
    }
}

/// Wall-clock times derived from the runtime clock, anchored at scan start.
#[derive(Debug, Clone, Copy)]
struct ScanClock {
    wall: DateTime<Utc>,
    anchor: Instant,
}

impl ScanClock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            anchor: Instant::now(),
        }
    }

    fn at(&self, instant: Instant) -> DateTime<Utc> {
        chrono::Duration::from_std(instant.saturating_duration_since(self.anchor))
            .ok()
            .and_then(|offset| self.wall.checked_add_signed(offset))
            .unwrap_or(self.wall)
    }

    fn now(&self) -> DateTime<Utc> {
        self.at(Instant::now())
    }
}

fn keep_first(first: &mut Option<SeqError>, step: &'static str, result: SeqResult<()>) {
    if let Err(err) = result {
        warn!(step, error = %err, "teardown step failed");
        first.get_or_insert(err);
    }
}
