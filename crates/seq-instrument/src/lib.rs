//! Instrument-level coordination built on the device drivers.
//!
//! - [`Imager`]: synchronized TDI acquisition across stages, optics, lasers
//!   and camera, with exclusive ownership of the imaging hardware per scan
//! - [`FlowCell`]: fluidic steps (aspirate, dispense, flow, incubate, hold)
//!   for one flowcell
//! - [`ScanPlan`]: scan parameters validated before any command is sent

pub mod flowcell;
pub mod imager;
pub mod plan;

pub use flowcell::{FlowCell, FluidicStep};
pub use imager::{Imager, ImagerDevices, ImagerGuard, ImagerState};
pub use plan::{OpticsSetup, ScanGeometry, ScanPlan};
