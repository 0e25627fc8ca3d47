//! Experiment orchestration for rust-seq.
//!
//! [`Instrument`] assembles every driver from configuration and opened ports;
//! [`Orchestrator`] runs a sequence of fluidic and imaging steps across both
//! flowcells and reports the outcome of every step.
//!
//! # Example
//!
//! ```rust,ignore
//! let instrument = Instrument::open(config).await?;
//! instrument.initialize().await?;
//!
//! let sink = Arc::new(MemorySink::new());
//! let report = instrument
//!     .orchestrator(sink.clone())
//!     .run_sequence(&sequence.steps, &CancellationToken::new())
//!     .await?;
//! ```

pub mod instrument;
pub mod orchestrator;
pub mod sequence;
pub mod sinks;

pub use instrument::{Instrument, FLOWCELLS};
pub use orchestrator::Orchestrator;
pub use sequence::{Sequence, SequenceReport, SequenceStep, StepAction, StepOutcome, StepRecord};
pub use sinks::MemorySink;
