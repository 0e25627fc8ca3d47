//! rust-seq: instrument coordination and synchronized TDI imaging for a
//! dual-flowcell sequencer.
//!
//! | crate | contents |
//! |---|---|
//! | [`seq_core`] | errors, serial command channel, codec contract, configuration |
//! | [`seq_drivers`] | stage, camera, laser, optics, pump, valve, chemistry drivers |
//! | [`seq_sim`] | simulated serial devices and bench physics |
//! | [`seq_instrument`] | imager and flowcell |
//! | [`seq_experiment`] | orchestrator, instrument assembly, frame sinks |
//!
//! This crate re-exports them and adds [`logging`] plus a simulated demo
//! sequence used by the `rust-seq simulate` command.

pub mod demo;
pub mod logging;

pub use seq_core;
pub use seq_drivers;
pub use seq_experiment;
pub use seq_instrument;
pub use seq_sim;

pub use seq_core::{CancellationToken, ErrorClass, ScanFailure, SeqError, SeqResult};
pub use seq_experiment::{Instrument, MemorySink, Orchestrator, SequenceReport, SequenceStep};
