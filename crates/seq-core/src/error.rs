//! Error types for the instrument engine.
//!
//! Errors are layered the same way the hardware is:
//!
//! - **[`ProtocolError`]**: a wire adapter could not make sense of a frame, or the
//!   frame carried a device-reported error code.
//! - **[`TransactionError`]**: the outcome of one channel transaction that did not
//!   succeed. Every transaction yields either a payload or exactly one of these.
//! - **[`SeqError`]**: what device operations, the imager, flowcells and the
//!   orchestrator return. Drivers retry transient transaction errors locally and
//!   only escalate to `SeqError` once their retry policy is exhausted.
//!
//! ## Classification
//!
//! | class                | fatal | retried by          | escalated to            |
//! |----------------------|-------|---------------------|-------------------------|
//! | `Transport`          | yes   | never               | aborts whole sequence   |
//! | `Protocol`           | no    | driver (bounded)    | caller                  |
//! | `OperationIncomplete`| no    | caller decides      | caller                  |
//! | `ScanFailed`         | no*   | never               | orchestrator            |
//! | `StepTimedOut`       | no    | orchestrator decides| orchestrator            |
//! | `Cancelled`          | no    | never               | caller                  |
//!
//! \* a scan that failed because of a disconnected link is still fatal, see
//! [`SeqError::is_fatal`].

use crate::device::DeviceId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Adapter / Channel Errors
// =============================================================================

/// Error reported by a wire adapter while decoding a response frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame did not match the expected grammar.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame was well formed but answered something else.
    #[error("unexpected response: expected {expected}, got {got:?}")]
    Unexpected { expected: String, got: String },

    /// Device answered with its own error code.
    #[error("device reported error code {code}")]
    DeviceReported { code: u16 },
}

/// Non-success outcome of a single channel transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// No byte of a response arrived within the transaction timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Partial, garbled or undecodable response.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Device reported an error code.
    #[error("device reported error code {0}")]
    DeviceReported(u16),

    /// The link itself is gone (EOF, broken pipe, unplugged adapter).
    #[error("link disconnected: {0}")]
    Disconnected(String),
}

impl From<ProtocolError> for TransactionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::DeviceReported { code } => TransactionError::DeviceReported(code),
            other => TransactionError::Malformed(other.to_string()),
        }
    }
}

// =============================================================================
// Scan Failures
// =============================================================================

/// Diagnostic cause attached to [`SeqError::ScanFailed`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScanFailure {
    /// Stage position readback left the expected trajectory.
    TrajectoryDivergence {
        expected: f64,
        actual: i64,
        tolerance: f64,
    },
    /// Camera reported a buffer overrun.
    BufferOverrun { frames: u32 },
    /// Stage reached the end position before the plan's bundles were collected.
    Underrun { expected: u32, collected: u32 },
    /// Not a single bundle arrived within the first-bundle window.
    NoFirstBundle { waited: Duration },
    /// A software trigger was issued later than the jitter tolerance allows.
    TriggerJitter { late_by: Duration, tolerance: Duration },
    /// A device failed to acknowledge a command during the scan.
    Device(Box<SeqError>),
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrajectoryDivergence {
                expected,
                actual,
                tolerance,
            } => write!(
                f,
                "stage at {} diverged from expected {:.0} (tolerance {:.0})",
                actual, expected, tolerance
            ),
            Self::BufferOverrun { frames } => {
                write!(f, "camera buffer overrun after {} frames", frames)
            }
            Self::Underrun {
                expected,
                collected,
            } => write!(
                f,
                "stage reached end with {}/{} bundles collected",
                collected, expected
            ),
            Self::NoFirstBundle { waited } => {
                write!(f, "no bundle captured within {:?}", waited)
            }
            Self::TriggerJitter { late_by, tolerance } => write!(
                f,
                "software trigger late by {:?} (tolerance {:?})",
                late_by, tolerance
            ),
            Self::Device(err) => write!(f, "{}", err),
        }
    }
}

// =============================================================================
// Engine Error
// =============================================================================

/// Broad classification of a [`SeqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transport,
    Protocol,
    OperationIncomplete,
    ScanFailed,
    StepTimedOut,
    Cancelled,
    Usage,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Transport => "transport",
            ErrorClass::Protocol => "protocol",
            ErrorClass::OperationIncomplete => "operation_incomplete",
            ErrorClass::ScanFailed => "scan_failed",
            ErrorClass::StepTimedOut => "step_timed_out",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Usage => "usage",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for engine results.
pub type SeqResult<T> = std::result::Result<T, SeqError>;

/// Primary error type of the instrument engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SeqError {
    /// Serial link disconnected. Always fatal, never retried.
    #[error("{device}: transport failure during {operation}: {message}")]
    Transport {
        device: DeviceId,
        operation: &'static str,
        message: String,
    },

    /// Malformed, unexpected or missing responses after the retry budget.
    #[error("{device}: protocol failure during {operation} after {attempts} attempt(s): {message}")]
    Protocol {
        device: DeviceId,
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    /// The device rejected a command with its own error code.
    #[error("{device}: device rejected {operation} with code {code}")]
    DeviceFault {
        device: DeviceId,
        operation: &'static str,
        code: u16,
    },

    /// Post-condition not reached within the poll budget.
    #[error("{device}: {operation} incomplete after {polls} poll(s): {detail}")]
    OperationIncomplete {
        device: DeviceId,
        operation: &'static str,
        polls: u32,
        detail: String,
    },

    /// Acquisition aborted; no frames are returned.
    #[error("scan failed: {0}")]
    ScanFailed(ScanFailure),

    /// A fluidic step was not confirmed within its timeout.
    #[error("flowcell {flowcell}: step {step} not confirmed within {timeout:?}")]
    StepTimedOut {
        flowcell: String,
        step: String,
        timeout: Duration,
    },

    /// Cooperative cancellation was honored.
    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    /// Scan plan rejected before any hardware command.
    #[error("invalid scan plan: {0}")]
    InvalidPlan(String),

    /// Argument outside the accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Port could not be opened or a sink failed to persist a bundle.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SeqError {
    fn from(err: std::io::Error) -> Self {
        SeqError::Io(err.to_string())
    }
}

impl SeqError {
    /// Classification per the engine's error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport { .. } | Self::Io(_) => ErrorClass::Transport,
            Self::Protocol { .. } | Self::DeviceFault { .. } => ErrorClass::Protocol,
            Self::OperationIncomplete { .. } => ErrorClass::OperationIncomplete,
            Self::ScanFailed(_) => ErrorClass::ScanFailed,
            Self::StepTimedOut { .. } => ErrorClass::StepTimedOut,
            Self::Cancelled { .. } => ErrorClass::Cancelled,
            Self::InvalidPlan(_) | Self::InvalidArgument(_) | Self::Configuration(_) => {
                ErrorClass::Usage
            }
        }
    }

    /// Whether this error must abort the whole sequence.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Io(_) => true,
            Self::ScanFailed(ScanFailure::Device(inner)) => inner.is_fatal(),
            _ => false,
        }
    }

    /// Device the error originated from, if any.
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::Transport { device, .. }
            | Self::Protocol { device, .. }
            | Self::DeviceFault { device, .. }
            | Self::OperationIncomplete { device, .. } => Some(device),
            Self::ScanFailed(ScanFailure::Device(inner)) => inner.device(),
            _ => None,
        }
    }

    /// Wrap a device error raised while a scan is active.
    pub fn into_scan_failure(self) -> SeqError {
        match self {
            err @ (Self::ScanFailed(_) | Self::Cancelled { .. }) => err,
            other => Self::ScanFailed(ScanFailure::Device(Box::new(other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn stage() -> DeviceId {
        DeviceId::new(DeviceKind::StageY, "stage_y")
    }

    #[test]
    fn transport_is_fatal_even_inside_scan_failure() {
        let err = SeqError::Transport {
            device: stage(),
            operation: "position",
            message: "EOF".into(),
        };
        assert!(err.is_fatal());

        let wrapped = err.into_scan_failure();
        assert_eq!(wrapped.class(), ErrorClass::ScanFailed);
        assert!(wrapped.is_fatal());
        assert_eq!(wrapped.device(), Some(&stage()));
    }

    #[test]
    fn device_fault_is_classified_as_protocol() {
        let err = SeqError::DeviceFault {
            device: stage(),
            operation: "move_to",
            code: 7,
        };
        assert_eq!(err.class(), ErrorClass::Protocol);
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("code 7"));
    }

    #[test]
    fn cancellation_is_not_rewrapped() {
        let err = SeqError::Cancelled { operation: "scan" }.into_scan_failure();
        assert_eq!(err.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn protocol_error_maps_device_code() {
        let tx: TransactionError = ProtocolError::DeviceReported { code: 12 }.into();
        assert_eq!(tx, TransactionError::DeviceReported(12));

        let tx: TransactionError = ProtocolError::Malformed("junk".into()).into();
        assert!(matches!(tx, TransactionError::Malformed(_)));
    }
}
