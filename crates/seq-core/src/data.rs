//! Frames, frame bundles and the hand-off to image persistence.

use crate::config::TriggerSource;
use crate::error::SeqResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One raw camera frame (a bundle of TDI lines).
///
/// Pixels are 16-bit, row-major, `width * height` long.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Position of the frame within its bundle, starting at 0
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
    /// Stage-Y position the frame was planned for, if known
    pub nominal_position: Option<i64>,
    /// Host time the frame was acquired; the imager replaces the decode
    /// time with the moment the stage completed the frame's pitch
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Decode a little-endian readout.
    pub fn from_le_bytes(index: u32, width: u32, height: u32, bytes: &[u8]) -> Self {
        let pixels = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self {
            index,
            width,
            height,
            pixels,
            nominal_position: None,
            timestamp: Utc::now(),
        }
    }
}

/// Parameters a downstream writer needs to interpret a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub frame_width: u32,
    pub frame_height: u32,
    pub bundle_count: u32,
    pub trigger_source: TriggerSource,
    pub start_position: Option<i64>,
    pub end_position: Option<i64>,
    /// Stage velocity during capture (steps/s)
    pub velocity: Option<f64>,
    /// Free-form tag set by the caller (flowcell, cycle, ...)
    pub label: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Ordered frames produced by one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBundle {
    pub frames: Vec<Frame>,
    pub metadata: BundleMetadata,
}

impl FrameBundle {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Downstream collaborator that takes ownership of completed bundles.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Persist or forward `bundle`. `source` names the flowcell it belongs to.
    async fn accept(&self, source: &str, bundle: FrameBundle) -> SeqResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_readout_decodes_pixels() {
        let frame = Frame::from_le_bytes(0, 2, 1, &[0x01, 0x00, 0x00, 0x01]);
        assert_eq!(frame.pixels, vec![1, 256]);
        assert_eq!((frame.width, frame.height, frame.nominal_position), (2, 1, None));
    }
}
