//! Error taxonomy for the transcoding and capture pipeline.
//!
//! Each failure class gets its own enum so callers can tell an unsupported
//! capture format apart from a stalled seek or an aborted export.

use std::time::Duration;

use thiserror::Error;

use crate::ascii_capture::Container;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("width must be in [{min}, {max}] characters, got {value}")]
    Width { value: u32, min: u32, max: u32 },

    #[error("contrast must be in [{min}, {max}], got {value}")]
    Contrast { value: f32, min: f32, max: f32 },

    #[error("character ramp needs at least 2 glyphs, got {0}")]
    RampTooShort(usize),

    #[error("unknown ramp preset '{0}' (expected short, simple, standard or blocks)")]
    UnknownRamp(String),

    #[error("{field} must be > 0")]
    NotPositive { field: &'static str },

    #[error("failed to read config file: {0}")]
    Read(String),

    #[error("failed to parse config file: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to probe '{path}': {reason}")]
    Probe { path: String, reason: String },

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("seek to {time:.3}s failed: {reason}")]
    SeekFailed { time: f64, reason: String },

    #[error("seek to {time:.3}s did not complete within {waited:?}")]
    SeekTimeout { time: f64, waited: Duration },

    #[error("source refused to start playback: {0}")]
    PlaybackRefused(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to allocate output surface {width}x{height}")]
    SurfaceAllocation { width: u32, height: u32 },

    #[error("font error: {0}")]
    Font(String),

    #[error("failed to encode snapshot: {0}")]
    Snapshot(String),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no supported capture format available (tried: {})", tried.join(", "))]
    UnsupportedFormat { tried: Vec<String> },

    #[error("cannot compile an artifact from zero frames")]
    NoFrames,

    #[error("frame size {got_width}x{got_height} does not match the first frame {width}x{height}")]
    FrameSizeMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("{container} encoder failed: {reason}")]
    Encoder { container: Container, reason: String },

    #[error("ffmpeg unavailable: {0}")]
    FfmpegUnavailable(String),

    #[error("capture has already been finalized")]
    Finalized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    pub fn encoder(container: Container, reason: impl Into<String>) -> Self {
        Self::Encoder {
            container,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export aborted at frame {frame}")]
    Aborted { frame: u32 },

    #[error("export failed at {time:.3}s: {source}")]
    Seek {
        time: f64,
        #[source]
        source: SourceError,
    },

    #[error("export render failed: {0}")]
    Render(#[from] RenderError),

    #[error("export encode failed: {0}")]
    Encode(#[from] CaptureError),

    #[error("source has no duration to export")]
    EmptySource,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("live session has shut down")]
    SessionClosed,
}
