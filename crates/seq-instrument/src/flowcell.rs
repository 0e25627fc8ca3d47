//! FlowCell - fluidic step execution for one flowcell.
//!
//! A flowcell owns its pump and selector valve and shares the chemistry
//! controller (holder temperature, reagent shut-off) with the other
//! flowcell. Steps run one at a time per flowcell; a step either completes
//! or fails with the controller state left as last commanded. Fluidics are
//! never torn down here, the orchestrator decides what happens next.

use chrono::Utc;
use seq_core::cancel::{check_cancelled, run_cancellable, sleep_cancellable, CancellationToken};
use seq_core::config::FluidicsConfig;
use seq_core::error::{SeqError, SeqResult};
use seq_drivers::{Chemistry, Pump, Valve};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// One fluidic operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FluidicStep {
    /// Select `port` and draw `volume_ul` into the syringe
    Aspirate {
        port: u8,
        volume_ul: f64,
        /// µL/min; defaults to the configured pull rate
        #[serde(default)]
        rate: Option<f64>,
    },
    /// Push `volume_ul` out of the syringe, through `port` when given,
    /// otherwise through the port already selected
    Dispense {
        #[serde(default)]
        port: Option<u8>,
        volume_ul: f64,
        /// µL/min; defaults to the configured push rate
        #[serde(default)]
        rate: Option<f64>,
    },
    /// Open the shut-off valve, pull reagent from `port` through the
    /// flowcell, pause, push it to waste, close the shut-off valve
    Flow {
        port: u8,
        volume_ul: f64,
        #[serde(default)]
        pull_rate: Option<f64>,
        #[serde(default)]
        push_rate: Option<f64>,
        #[serde(default, with = "humantime_serde")]
        wait: Option<Duration>,
    },
    /// Bring the holder to `temperature` and keep it there for `duration`
    Incubate {
        temperature: f64,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// Wait without pump motion
    Hold {
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
}

impl fmt::Display for FluidicStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aspirate { port, volume_ul, .. } => {
                write!(f, "aspirate {} uL from port {}", volume_ul, port)
            }
            Self::Dispense {
                port: Some(port),
                volume_ul,
                ..
            } => write!(f, "dispense {} uL to port {}", volume_ul, port),
            Self::Dispense { volume_ul, .. } => write!(f, "dispense {} uL", volume_ul),
            Self::Flow { port, volume_ul, .. } => {
                write!(f, "flow {} uL from port {}", volume_ul, port)
            }
            Self::Incubate {
                temperature,
                duration,
            } => write!(f, "incubate at {} C for {:?}", temperature, duration),
            Self::Hold { duration } => write!(f, "hold for {:?}", duration),
        }
    }
}

pub struct FlowCell {
    name: String,
    holder: usize,
    pump: Arc<Pump>,
    valve: Arc<Valve>,
    chemistry: Arc<Chemistry>,
    config: FluidicsConfig,
    // One step at a time.
    busy: Mutex<()>,
}

impl FlowCell {
    /// `holder` is the chemistry controller's index for this flowcell (A=0, B=1).
    pub fn new(
        name: impl Into<String>,
        holder: usize,
        pump: Arc<Pump>,
        valve: Arc<Valve>,
        chemistry: Arc<Chemistry>,
        config: &FluidicsConfig,
    ) -> Self {
        Self {
            name: name.into(),
            holder,
            pump,
            valve,
            chemistry,
            config: config.clone(),
            busy: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pump(&self) -> &Arc<Pump> {
        &self.pump
    }

    pub fn valve(&self) -> &Arc<Valve> {
        &self.valve
    }

    /// Home pump and valve concurrently.
    #[instrument(skip(self), fields(flowcell = %self.name), err)]
    pub async fn initialize(&self) -> SeqResult<()> {
        let _step = self.busy.lock().await;
        futures::try_join!(self.pump.initialize(), self.valve.initialize())?;
        Ok(())
    }

    // -- conversions ----------------------------------------------------------

    /// µL to pump steps. Accepts `(0, syringe volume × barrels]`.
    pub fn steps_from_volume(&self, volume_ul: f64) -> SeqResult<u32> {
        let barrels = f64::from(self.config.barrels_per_lane);
        let max = self.config.syringe_volume_ul * barrels;
        if !(volume_ul > 0.0 && volume_ul <= max) {
            return Err(SeqError::InvalidArgument(format!(
                "flowcell {}: volume {} uL outside (0, {}]",
                self.name, volume_ul, max
            )));
        }
        let per_barrel = volume_ul / barrels;
        let steps = (per_barrel / self.config.syringe_volume_ul * f64::from(self.config.pump_steps)).round();
        Ok((steps as u32).max(1))
    }

    /// µL/min to pump steps/s. Accepts `(0, max flow × barrels]`.
    pub fn steps_per_second(&self, rate_ul_per_min: f64) -> SeqResult<u32> {
        let barrels = f64::from(self.config.barrels_per_lane);
        let max = self.config.max_flow_ul_per_min * barrels;
        if !(rate_ul_per_min > 0.0 && rate_ul_per_min <= max) {
            return Err(SeqError::InvalidArgument(format!(
                "flowcell {}: flow rate {} uL/min outside (0, {}]",
                self.name, rate_ul_per_min, max
            )));
        }
        let per_barrel = rate_ul_per_min / barrels / 60.0;
        let sps = (per_barrel / self.config.syringe_volume_ul * f64::from(self.config.pump_steps)).round();
        Ok((sps as u32).max(1))
    }

    /// Worst-case time for a stroke before it counts as unconfirmed.
    pub fn stroke_timeout(&self, steps: u32, steps_per_second: u32) -> Duration {
        let travel = Duration::from_secs_f64(f64::from(steps) / f64::from(steps_per_second.max(1)));
        travel + self.config.step_timeout_margin
    }

    // -- temperature ------------------------------------------------------------

    pub async fn set_temperature(&self, celsius: f64) -> SeqResult<()> {
        self.chemistry.set_temperature(self.holder, celsius).await
    }

    pub async fn temperature(&self) -> SeqResult<f64> {
        self.chemistry.temperature(self.holder).await
    }

    pub async fn temperature_ok(&self, target: f64, tolerance: f64) -> SeqResult<bool> {
        self.chemistry
            .temperature_ok(self.holder, target, tolerance)
            .await
    }

    // -- steps ------------------------------------------------------------------

    /// Execute one fluidic step to completion.
    ///
    /// Waits for a previous step on this flowcell to finish first.
    #[instrument(skip(self, token), fields(flowcell = %self.name, step = %step), err)]
    pub async fn run_step(&self, step: &FluidicStep, token: &CancellationToken) -> SeqResult<()> {
        let _step = run_cancellable(token, "run_step", async {
            Ok::<_, SeqError>(self.busy.lock().await)
        })
        .await?;
        self.validate(step)?;
        let started = Utc::now();

        let result = match step {
            FluidicStep::Aspirate {
                port,
                volume_ul,
                rate,
            } => {
                let rate = rate.unwrap_or(self.config.default_pull_rate);
                run_cancellable(token, "aspirate", self.aspirate(step, *port, *volume_ul, rate, token)).await
            }
            FluidicStep::Dispense {
                port,
                volume_ul,
                rate,
            } => {
                let rate = rate.unwrap_or(self.config.default_push_rate);
                run_cancellable(token, "dispense", self.dispense(step, *port, *volume_ul, rate, token)).await
            }
            FluidicStep::Flow {
                port,
                volume_ul,
                pull_rate,
                push_rate,
                wait,
            } => {
                let pull = pull_rate.unwrap_or(self.config.default_pull_rate);
                let push = push_rate.unwrap_or(self.config.default_push_rate);
                let wait = wait.unwrap_or(self.config.flow_wait);
                self.flow(step, *port, *volume_ul, (pull, push), wait, token).await
            }
            FluidicStep::Incubate {
                temperature,
                duration,
            } => self.incubate(step, *temperature, *duration, token).await,
            FluidicStep::Hold { duration } => self.hold(*duration, None, token).await,
        };

        if result.is_ok() {
            let took = Utc::now() - started;
            info!(flowcell = %self.name, step = %step, ms = took.num_milliseconds(), "step complete");
        }
        result
    }

    /// Reject out-of-range volumes, rates and ports before any command.
    fn validate(&self, step: &FluidicStep) -> SeqResult<()> {
        match step {
            FluidicStep::Aspirate {
                port,
                volume_ul,
                rate,
            } => {
                self.valve.check_port(*port)?;
                self.steps_from_volume(*volume_ul)?;
                self.steps_per_second(rate.unwrap_or(self.config.default_pull_rate))?;
            }
            FluidicStep::Dispense {
                port,
                volume_ul,
                rate,
            } => {
                if let Some(port) = port {
                    self.valve.check_port(*port)?;
                }
                self.steps_from_volume(*volume_ul)?;
                self.steps_per_second(rate.unwrap_or(self.config.default_push_rate))?;
            }
            FluidicStep::Flow {
                port,
                volume_ul,
                pull_rate,
                push_rate,
                ..
            } => {
                self.valve.check_port(*port)?;
                self.steps_from_volume(*volume_ul)?;
                self.steps_per_second(pull_rate.unwrap_or(self.config.default_pull_rate))?;
                self.steps_per_second(push_rate.unwrap_or(self.config.default_push_rate))?;
            }
            FluidicStep::Incubate { temperature, .. } => {
                if !temperature.is_finite() {
                    return Err(SeqError::InvalidArgument(format!(
                        "flowcell {}: temperature {} is not a number",
                        self.name, temperature
                    )));
                }
            }
            FluidicStep::Hold { .. } => {}
        }
        Ok(())
    }

    async fn aspirate(
        &self,
        step: &FluidicStep,
        port: u8,
        volume_ul: f64,
        rate: f64,
        token: &CancellationToken,
    ) -> SeqResult<()> {
        let steps = self.steps_from_volume(volume_ul)?;
        let sps = self.steps_per_second(rate)?;
        self.valve.set_port(port).await?;
        self.pump.aspirate(steps, sps).await?;
        self.wait_stroke(step, steps, sps, token).await
    }

    async fn dispense(
        &self,
        step: &FluidicStep,
        port: Option<u8>,
        volume_ul: f64,
        rate: f64,
        token: &CancellationToken,
    ) -> SeqResult<()> {
        let steps = self.steps_from_volume(volume_ul)?;
        let sps = self.steps_per_second(rate)?;
        if let Some(port) = port {
            self.valve.set_port(port).await?;
        }
        self.pump.dispense(steps, sps).await?;
        self.wait_stroke(step, steps, sps, token).await
    }

    /// Poll the pump until idle, or fail once the stroke timeout elapses.
    async fn wait_stroke(
        &self,
        step: &FluidicStep,
        steps: u32,
        steps_per_second: u32,
        token: &CancellationToken,
    ) -> SeqResult<()> {
        let timeout = self.stroke_timeout(steps, steps_per_second);
        let started = Instant::now();
        loop {
            sleep_cancellable(token, "fluidic step", self.config.status_interval).await?;
            let status = self.pump.status().await?;
            if !status.busy {
                debug!(flowcell = %self.name, plunger = status.plunger, "stroke complete");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                warn!(flowcell = %self.name, plunger = status.plunger, ?timeout, "stroke not confirmed");
                return Err(self.timed_out(step, timeout));
            }
        }
    }

    /// Rates are (pull, push) in µL/min.
    async fn flow(
        &self,
        step: &FluidicStep,
        port: u8,
        volume_ul: f64,
        (pull, push): (f64, f64),
        wait: Duration,
        token: &CancellationToken,
    ) -> SeqResult<()> {
        check_cancelled(token, "flow")?;
        self.chemistry.acquire_shutoff().await?;
        let body = run_cancellable(token, "flow", async {
            self.aspirate(step, port, volume_ul, pull, token).await?;
            sleep_cancellable(token, "flow", wait).await?;
            self.dispense(step, None, volume_ul, push, token).await
        })
        .await;

        match body {
            Ok(()) => self.chemistry.release_shutoff().await,
            Err(err) => {
                // The valve stays as last commanded; only our claim on it goes.
                self.chemistry.forget_shutoff();
                Err(err)
            }
        }
    }

    async fn incubate(
        &self,
        step: &FluidicStep,
        temperature: f64,
        duration: Duration,
        token: &CancellationToken,
    ) -> SeqResult<()> {
        run_cancellable(token, "incubate", self.set_temperature(temperature)).await?;

        let timeout = self.config.temperature_timeout;
        let tolerance = self.config.temperature_tolerance;
        let started = Instant::now();
        loop {
            let reached = run_cancellable(token, "incubate", self.temperature_ok(temperature, tolerance)).await?;
            if reached {
                break;
            }
            if started.elapsed() >= timeout {
                return Err(self.timed_out(step, timeout));
            }
            sleep_cancellable(token, "incubate", self.config.status_interval).await?;
        }
        info!(flowcell = %self.name, temperature, "temperature reached");

        self.hold(duration, Some((temperature, tolerance)), token).await
    }

    /// Wait `duration`, reading the holder temperature every status interval.
    async fn hold(
        &self,
        duration: Duration,
        target: Option<(f64, f64)>,
        token: &CancellationToken,
    ) -> SeqResult<()> {
        let until = Instant::now() + duration;
        loop {
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            sleep_cancellable(token, "hold", left.min(self.config.status_interval)).await?;
            let actual = run_cancellable(token, "hold", self.temperature()).await?;
            if let Some((target, tolerance)) = target {
                if (actual - target).abs() > tolerance {
                    warn!(flowcell = %self.name, actual, target, "temperature drifted");
                }
            }
        }
    }

    fn timed_out(&self, step: &FluidicStep, timeout: Duration) -> SeqError {
        SeqError::StepTimedOut {
            flowcell: self.name.clone(),
            step: step.to_string(),
            timeout,
        }
    }
}
