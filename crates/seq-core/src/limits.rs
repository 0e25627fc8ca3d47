//! Shared hard limits to prevent unbounded allocations.
//!
//! Frame readouts are fixed-length binary transfers whose size is computed
//! from device parameters, so every size is checked before a buffer is
//! allocated or a command is sent.

use crate::error::SeqError;

/// Bytes per pixel of a raw camera frame (16-bit little endian).
pub const BYTES_PER_PIXEL: usize = 2;

/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 65_536;

/// Maximum allowed single frame payload in bytes (default: 256MB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Validated frame sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub pixels: usize,
    pub bytes: usize,
}

/// Validate frame dimensions and calculate pixel/byte sizes safely.
pub fn validate_frame_size(width: u32, height: u32) -> Result<FrameSize, SeqError> {
    if width == 0 || height == 0 {
        return Err(SeqError::InvalidPlan(format!(
            "frame dimensions {}x{} must be non-zero",
            width, height
        )));
    }
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(SeqError::InvalidPlan(format!(
            "frame dimensions {}x{} exceed maximum {}",
            width, height, MAX_FRAME_DIMENSION
        )));
    }

    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| SeqError::InvalidPlan("frame pixel count overflows".into()))?;

    let bytes = pixels
        .checked_mul(BYTES_PER_PIXEL)
        .ok_or_else(|| SeqError::InvalidPlan("frame byte size overflows".into()))?;

    if bytes > MAX_FRAME_BYTES {
        return Err(SeqError::InvalidPlan(format!(
            "frame of {} bytes exceeds limit {}",
            bytes, MAX_FRAME_BYTES
        )));
    }

    Ok(FrameSize { pixels, bytes })
}

/// Total on-camera buffer needed for `bundles` frames of the given size.
pub fn bundle_buffer_bytes(width: u32, height: u32, bundles: u32) -> Result<u64, SeqError> {
    let frame = validate_frame_size(width, height)?;
    (frame.bytes as u64)
        .checked_mul(u64::from(bundles))
        .ok_or_else(|| SeqError::InvalidPlan("camera buffer size overflows".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_is_width_height_times_two() {
        let size = validate_frame_size(4096, 128).unwrap();
        assert_eq!(size.pixels, 4096 * 128);
        assert_eq!(size.bytes, 4096 * 128 * 2);
    }

    #[test]
    fn zero_and_oversized_frames_are_rejected() {
        assert!(validate_frame_size(0, 128).is_err());
        assert!(validate_frame_size(MAX_FRAME_DIMENSION + 1, 1).is_err());
        assert!(validate_frame_size(MAX_FRAME_DIMENSION, MAX_FRAME_DIMENSION).is_err());
    }

    #[test]
    fn buffer_bytes_scale_with_bundles() {
        assert_eq!(bundle_buffer_bytes(64, 8, 10).unwrap(), 64 * 8 * 2 * 10);
    }
}
