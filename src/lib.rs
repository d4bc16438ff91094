//! Video to ASCII character-grid transcoding, with live playback, stream
//! capture and frame-accurate export.

pub mod ascii_atlas;
pub mod ascii_capture;
pub mod ascii_frame;
pub mod ascii_ramp;
pub mod ascii_render;
pub mod ascii_renderer;
pub mod ascii_sampler;
pub mod ascii_stage;
pub mod ascii_tone;
pub mod config;
pub mod decoding;
pub mod encoding;
pub mod error;
pub mod export;
pub mod playback;
pub mod preview;
pub mod producer;
pub mod source;
