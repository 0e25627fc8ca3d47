//! Sequence steps and the report a run produces.

use chrono::{DateTime, Utc};
use seq_core::error::{SeqError, SeqResult};
use seq_instrument::{FluidicStep, ScanPlan};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// One step of a sequence, addressed to a flowcell.
///
/// ```toml
/// [[steps]]
/// flowcell = "A"
/// fluidic = { op = "flow", port = 3, volume_ul = 100.0 }
///
/// [[steps]]
/// flowcell = "A"
/// image = { bundles = 128, frame_height = 128, y_start = 0, y_end = 200000, velocity = 50000.0 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub flowcell: String,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Run on the flowcell's own pump and valve
    Fluidic(FluidicStep),
    /// Scan the flowcell through the shared optics path
    Image(ScanPlan),
}

impl SequenceStep {
    pub fn fluidic(flowcell: impl Into<String>, step: FluidicStep) -> Self {
        Self {
            flowcell: flowcell.into(),
            action: StepAction::Fluidic(step),
        }
    }

    pub fn image(flowcell: impl Into<String>, plan: ScanPlan) -> Self {
        Self {
            flowcell: flowcell.into(),
            action: StepAction::Image(plan),
        }
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::Fluidic(step) => write!(f, "{}", step),
            StepAction::Image(plan) => write!(
                f,
                "image {} bundles y {}..{}",
                plan.bundles, plan.y_start, plan.y_end
            ),
        }
    }
}

/// A sequence file: `[[steps]]` tables in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub steps: Vec<SequenceStep>,
}

impl Sequence {
    pub fn from_toml_str(toml: &str) -> SeqResult<Self> {
        toml::from_str(toml).map_err(|e| SeqError::Configuration(format!("sequence: {}", e)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> SeqResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SeqError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed,
    Failed(SeqError),
    /// Not run because an earlier step on the same flowcell failed
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// Position in the submitted sequence
    pub index: usize,
    pub flowcell: String,
    pub action: String,
    pub outcome: StepOutcome,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of one `run_sequence` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SequenceReport {
    /// One record per submitted step, in submission order
    pub steps: Vec<StepRecord>,
    /// First error that aborted every flowcell
    pub first_fatal: Option<SeqError>,
}

impl SequenceReport {
    pub fn is_success(&self) -> bool {
        self.steps
            .iter()
            .all(|r| r.outcome == StepOutcome::Completed)
    }

    pub fn completed(&self) -> usize {
        self.steps
            .iter()
            .filter(|r| r.outcome == StepOutcome::Completed)
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&StepRecord, &SeqError)> {
        self.steps.iter().filter_map(|r| match &r.outcome {
            StepOutcome::Failed(err) => Some((r, err)),
            _ => None,
        })
    }

    pub fn for_flowcell<'a>(&'a self, flowcell: &'a str) -> impl Iterator<Item = &'a StepRecord> {
        self.steps.iter().filter(move |r| r.flowcell == flowcell)
    }

    /// The fatal cause if there was one, else the first step failure.
    pub fn into_result(self) -> SeqResult<Self> {
        let first = self
            .first_fatal
            .clone()
            .or_else(|| self.failures().next().map(|(_, err)| err.clone()));
        match first {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sequence_file_parses_both_step_kinds() {
        let sequence = Sequence::from_toml_str(
            r#"
            [[steps]]
            flowcell = "A"
            fluidic = { op = "flow", port = 3, volume_ul = 100.0, wait = "5s" }

            [[steps]]
            flowcell = "B"
            image = { bundles = 4, frame_height = 8, y_start = 1000, y_end = 2000, velocity = 10000.0 }
            "#,
        )
        .unwrap();

        assert_eq!(sequence.steps.len(), 2);
        assert_eq!(
            sequence.steps[0].action,
            StepAction::Fluidic(FluidicStep::Flow {
                port: 3,
                volume_ul: 100.0,
                pull_rate: None,
                push_rate: None,
                wait: Some(Duration::from_secs(5)),
            })
        );
        match &sequence.steps[1].action {
            StepAction::Image(plan) => {
                assert_eq!(plan.bundles, 4);
                assert_eq!(plan.label, None);
            }
            other => panic!("expected an image step, got {:?}", other),
        }
    }

    #[test]
    fn unknown_step_kind_is_a_configuration_error() {
        let err = Sequence::from_toml_str(
            r#"
            [[steps]]
            flowcell = "A"
            pipette = { volume_ul = 1.0 }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SeqError::Configuration(_)));
    }

    #[test]
    fn report_surfaces_fatal_cause_first() {
        let timeout = SeqError::StepTimedOut {
            flowcell: "A".into(),
            step: "hold".into(),
            timeout: Duration::from_secs(1),
        };
        let fatal = SeqError::Io("sink closed".into());
        let report = SequenceReport {
            steps: vec![StepRecord {
                index: 0,
                flowcell: "A".into(),
                action: "hold".into(),
                outcome: StepOutcome::Failed(timeout),
                started_at: None,
                finished_at: None,
            }],
            first_fatal: Some(fatal.clone()),
        };
        assert!(!report.is_success());
        assert_eq!(report.into_result().unwrap_err(), fatal);
    }
}
