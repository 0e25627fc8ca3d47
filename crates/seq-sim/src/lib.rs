//! Simulated hardware for rust-seq.
//!
//! Provides a complete simulated instrument for tests and the `simulate` CLI
//! mode. Simulated devices speak the same wire protocols as the real
//! firmware, so drivers are exercised end to end through their channels.
//!
//! - [`SimPort`]: an `AsyncRead + AsyncWrite` endpoint answering commands,
//!   recording a transcript and applying injected transport [`Fault`]s
//! - [`SimBench`]: the physical model the devices share (stage motion,
//!   position triggers, camera buffer, pump strokes, valve rotation,
//!   flowcell temperature) plus physics-level fault injection

pub mod bench;
mod devices;
pub mod port;

pub use bench::SimBench;
pub use devices::frame_bytes;
pub use port::{Fault, PortHandle, SimDevice, SimPort, SimReply};
