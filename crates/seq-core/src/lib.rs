//! `seq-core`
//!
//! Core types for the rust-seq instrument engine.
//!
//! This crate provides the building blocks shared by every device driver,
//! the imager, the flowcells and the orchestrator.
//!
//! ## Layers
//!
//! - **[`channel::SerialChannel`]**: one half-duplex command/response
//!   transaction at a time over a serial link
//! - **[`codec::Codec`]**: pluggable wire adapter per device protocol
//! - **[`link::DeviceLink`]**: codec + channel + retry/poll policy; what drivers use
//!
//! ## Key Types
//!
//! - [`SeqError`]: classified engine error (transport, protocol, incomplete, ...)
//! - [`device::DeviceId`] and [`device::Capability`]: device identity and capability sets
//! - [`config::InstrumentConfig`]: figment-loaded configuration
//! - [`data::FrameBundle`]: frames of one scan, handed to a [`data::FrameSink`]

pub mod cancel;
pub mod channel;
pub mod codec;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod limits;
pub mod link;
pub mod retry;
pub mod serial;

pub use cancel::CancellationToken;
pub use error::{ErrorClass, ScanFailure, SeqError, SeqResult};
