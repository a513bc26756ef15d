//! Frame codec adapter: the seam between the relay and the external frame
//! encoder.
//!
//! The relay treats compression as a pure function
//! `compress(raw, width, height, quality) -> bytes` supplied from outside,
//! behind the [`FrameCompressor`] trait. [`CodecAdapter`] wraps whichever
//! implementation the deployment provides, validates the raw buffer
//! against the declared geometry before calling it, and reports the
//! resulting size and compression ratio.
//!
//! Compression failures never stop delivery: the caller's policy is to
//! fall back to forwarding the raw buffer tagged [`FrameCodec::Bgra`].
//! [`PassthroughCompressor`] is the in-tree null implementation, used when
//! compression is disabled and as the default test double.

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::messages::FrameCodec;

/// Bytes per pixel of the raw capture format (BGRA).
pub const BGRA_BYTES_PER_PIXEL: usize = 4;

/// Error type for the compression seam.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The raw buffer does not match `width * height * 4` bytes.
    #[error(
        "frame buffer is {actual} bytes but {width}x{height} BGRA requires {expected}"
    )]
    BufferSizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    /// The external encoder itself failed.
    #[error("encoder failed: {0}")]
    Encoder(String),
}

/// Contract the external frame encoder must satisfy.
///
/// Implementations must be pure with respect to the relay: same input,
/// same output, no retained state the relay needs to manage. `quality`
/// is the JPEG-style 1..=100 scale.
pub trait FrameCompressor: Send + Sync {
    /// Compresses one raw BGRA frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encoder`] when the underlying encoder fails.
    fn compress(
        &self,
        raw: &[u8],
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<Vec<u8>, CodecError>;

    /// Codec tag to stamp on frames this compressor produces.
    fn codec(&self) -> FrameCodec;
}

/// Null compressor: forwards the raw buffer untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCompressor;

impl FrameCompressor for PassthroughCompressor {
    fn compress(
        &self,
        raw: &[u8],
        _width: u32,
        _height: u32,
        _quality: u8,
    ) -> Result<Vec<u8>, CodecError> {
        Ok(raw.to_vec())
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::Bgra
    }
}

/// A wire-ready compressed frame.
#[derive(Debug, Clone)]
pub struct CompressedFrame {
    pub data: Vec<u8>,
    pub codec: FrameCodec,
    /// Size reduction relative to the raw buffer, in percent.
    pub ratio_percent: f64,
}

/// Validating wrapper around a [`FrameCompressor`].
///
/// Cheap to clone; clones share the underlying compressor.
#[derive(Clone)]
pub struct CodecAdapter {
    compressor: Arc<dyn FrameCompressor>,
}

impl CodecAdapter {
    pub fn new(compressor: Arc<dyn FrameCompressor>) -> Self {
        Self { compressor }
    }

    /// Compresses one raw BGRA frame into a wire-ready payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BufferSizeMismatch`] when the buffer length
    /// does not match the declared geometry, or the encoder's own error.
    pub fn compress(
        &self,
        raw: &[u8],
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<CompressedFrame, CodecError> {
        let expected = width as usize * height as usize * BGRA_BYTES_PER_PIXEL;
        if raw.len() != expected {
            return Err(CodecError::BufferSizeMismatch {
                width,
                height,
                expected,
                actual: raw.len(),
            });
        }

        let data = self.compressor.compress(raw, width, height, quality)?;
        let ratio_percent = compression_ratio_percent(raw.len(), data.len());

        tracing::trace!(
            raw_bytes = raw.len(),
            compressed_bytes = data.len(),
            ratio_percent,
            "frame compressed"
        );
        Ok(CompressedFrame {
            data,
            codec: self.compressor.codec(),
            ratio_percent,
        })
    }
}

/// Size reduction of `compressed` relative to `original`, in percent.
/// Negative when the "compressed" output grew.
pub fn compression_ratio_percent(original: usize, compressed: usize) -> f64 {
    if original == 0 {
        return 0.0;
    }
    (original as f64 - compressed as f64) / original as f64 * 100.0
}

/// Rough expected delivery rate for a JPEG stream, used only for
/// operator-facing diagnostics. Control decisions use measured bitrate.
///
/// The estimate assumes an average JPEG frame of
/// `(width * height / 10_000) * (quality / 100)` kilobytes, which tracks
/// typical desktop content at 4:2:0 subsampling.
pub fn estimate_bitrate_kbps(width: u32, height: u32, fps: u32, quality: u8) -> f64 {
    let avg_frame_size_kb = (width as f64 * height as f64 / 10_000.0) * (quality as f64 / 100.0);
    avg_frame_size_kb * fps as f64 * 8.0
}

// ── Tests ─────────────────────────────────────────────────────────────────────
