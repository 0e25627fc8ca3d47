//! Device drivers for the sequencer.
//!
//! Each driver owns one [`DeviceLink`](seq_core::link::DeviceLink) and the
//! believed state of its device. Drivers expose domain operations (move,
//! arm, aspirate, ...) that decompose into ordered channel transactions plus
//! a post-condition check; believed state changes only after the hardware
//! has acknowledged it.
//!
//! | driver | device |
//! |---|---|
//! | [`Stage`] | X and Y translation stages |
//! | [`Camera`] | line-scan TDI camera |
//! | [`Laser`] | excitation lasers |
//! | [`Optics`] | FPGA optics controller (filters, shutter, LED, triggers) |
//! | [`Objective`] | objective focus (Z) on the FPGA |
//! | [`Pump`] | syringe pumps |
//! | [`Valve`] | rotary selector valves |
//! | [`Chemistry`] | chemistry microcontroller (temperature, shut-off) |

pub mod any;
pub mod ascii;
pub mod camera;
pub mod chemistry;
pub mod laser;
pub mod objective;
pub mod optics;
pub mod pump;
pub mod stage;
pub mod valve;

pub use any::{AnyDevice, DeviceSnapshot};
pub use camera::{Camera, CameraStatus, CaptureState, SensorMode};
pub use chemistry::Chemistry;
pub use laser::Laser;
pub use objective::{Objective, ObjectiveState};
pub use optics::{FilterWheel, Optics, OpticsStatus, TriggerProgram};
pub use pump::{Pump, PumpStatus, Stroke};
pub use stage::{MotionMode, Stage};
pub use valve::Valve;
