//! Orchestrator - runs a step sequence across both flowcells.
//!
//! Steps are grouped by flowcell. Each flowcell works through its own steps
//! in submission order while the other flowcell proceeds concurrently; the
//! only contention point is the imager, whose lock serializes scans.
//!
//! # Failure policy
//!
//! - A failed step stops its flowcell: the remaining steps for that
//!   flowcell are recorded as skipped. The other flowcell carries on.
//! - A fatal error (lost serial link, failed hand-off to the sink) cancels
//!   every flowcell and is reported as [`SequenceReport::first_fatal`].
//! - Optics are torn down by the imager on every exit path. Fluidics stay as
//!   last commanded.

use crate::sequence::{SequenceReport, SequenceStep, StepAction, StepOutcome, StepRecord};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use seq_core::cancel::CancellationToken;
use seq_core::data::FrameSink;
use seq_core::error::{SeqError, SeqResult};
use seq_instrument::{FlowCell, Imager, ScanPlan};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub struct Orchestrator {
    imager: Arc<Imager>,
    flowcells: BTreeMap<String, Arc<FlowCell>>,
    sink: Arc<dyn FrameSink>,
}

impl Orchestrator {
    pub fn new(
        imager: Arc<Imager>,
        flowcells: impl IntoIterator<Item = Arc<FlowCell>>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            imager,
            flowcells: flowcells
                .into_iter()
                .map(|fc| (fc.name().to_string(), fc))
                .collect(),
            sink,
        }
    }

    /// Run `steps` to completion, failure or cancellation.
    ///
    /// Only a sequence naming an unknown flowcell is rejected as a whole;
    /// everything else is reported per step.
    #[instrument(skip_all, fields(steps = steps.len()), err)]
    pub async fn run_sequence(
        &self,
        steps: &[SequenceStep],
        token: &CancellationToken,
    ) -> SeqResult<SequenceReport> {
        let mut lanes: BTreeMap<&str, Vec<(usize, &SequenceStep)>> = BTreeMap::new();
        for (index, step) in steps.iter().enumerate() {
            let Some((name, _)) = self.flowcells.get_key_value(step.flowcell.as_str()) else {
                return Err(SeqError::InvalidArgument(format!(
                    "step {}: unknown flowcell '{}'",
                    index, step.flowcell
                )));
            };
            lanes.entry(name.as_str()).or_default().push((index, step));
        }

        let abort = token.child_token();
        let first_fatal = Mutex::new(None);
        let lanes = lanes
            .into_iter()
            .map(|(name, steps)| self.run_lane(name, steps, &abort, &first_fatal));
        let mut records: Vec<StepRecord> = join_all(lanes).await.into_iter().flatten().collect();
        records.sort_by_key(|r| r.index);

        let report = SequenceReport {
            steps: records,
            first_fatal: first_fatal.into_inner(),
        };
        info!(
            completed = report.completed(),
            total = steps.len(),
            fatal = report.first_fatal.is_some(),
            "sequence finished"
        );
        Ok(report)
    }

    async fn run_lane(
        &self,
        name: &str,
        steps: Vec<(usize, &SequenceStep)>,
        abort: &CancellationToken,
        first_fatal: &Mutex<Option<SeqError>>,
    ) -> Vec<StepRecord> {
        let mut records = Vec::with_capacity(steps.len());
        let mut stopped = false;

        for (index, step) in steps {
            let mut record = StepRecord {
                index,
                flowcell: name.to_string(),
                action: step.action.to_string(),
                outcome: StepOutcome::Skipped,
                started_at: None,
                finished_at: None,
            };
            if stopped {
                records.push(record);
                continue;
            }

            record.started_at = Some(Utc::now());
            let result = self.run_step(name, index, &step.action, abort).await;
            record.finished_at = Some(Utc::now());

            record.outcome = match result {
                Ok(()) => StepOutcome::Completed,
                Err(err) => {
                    stopped = true;
                    if err.is_fatal() {
                        error!(flowcell = name, index, error = %err, "fatal step failure, aborting sequence");
                        first_fatal.lock().get_or_insert_with(|| err.clone());
                        abort.cancel();
                    } else {
                        warn!(flowcell = name, index, error = %err, "step failed, flowcell stopped");
                    }
                    StepOutcome::Failed(err)
                }
            };
            records.push(record);
        }
        records
    }

    async fn run_step(
        &self,
        name: &str,
        index: usize,
        action: &StepAction,
        token: &CancellationToken,
    ) -> SeqResult<()> {
        match action {
            StepAction::Fluidic(step) => {
                let flowcell = self.flowcell(name)?;
                flowcell.run_step(step, token).await
            }
            StepAction::Image(plan) => {
                let mut plan: ScanPlan = plan.clone();
                plan.label.get_or_insert_with(|| format!("{}:{}", name, index));
                let bundle = {
                    let mut imager = self.imager.acquire(token).await?;
                    imager.scan(&plan, token).await?
                };
                self.sink.accept(name, bundle).await
            }
        }
    }

    fn flowcell(&self, name: &str) -> SeqResult<&Arc<FlowCell>> {
        self.flowcells
            .get(name)
            .ok_or_else(|| SeqError::InvalidArgument(format!("unknown flowcell '{}'", name)))
    }
}
