//! Video source abstraction consumed by both drivers.

use std::path::Path;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::SourceError;

/// One decoded RGBA frame. Alpha is carried but ignored by the sampler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl SourceFrame {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, SourceError> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(SourceError::Decode(format!(
                "frame buffer is {} bytes, expected {expected} for {width}x{height}",
                rgba.len()
            )));
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let rgba = [rgb[0], rgb[1], rgb[2], 255].repeat(width as usize * height as usize);
        Self {
            width,
            height,
            rgba,
        }
    }

    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        [self.rgba[idx], self.rgba[idx + 1], self.rgba[idx + 2]]
    }

    pub fn from_image(image: image::DynamicImage) -> Self {
        let rgba = image.into_rgba8();
        let (width, height) = rgba.dimensions();
        Self {
            width,
            height,
            rgba: rgba.into_raw(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Seconds.
    pub duration: f64,
    pub fps: f64,
}

/// A seekable, playable stream of frames.
///
/// `seek` resolves only once the frame at the new position is available,
/// so a caller that awaits it never samples a stale frame.
#[allow(async_fn_in_trait)]
pub trait VideoSource {
    fn info(&self) -> SourceInfo;

    /// Starts or resumes playback. A refusal leaves the source paused.
    fn play(&mut self) -> Result<(), SourceError>;

    fn pause(&mut self);

    fn is_paused(&self) -> bool;

    fn is_ended(&self) -> bool;

    fn current_time(&self) -> f64;

    async fn seek(&mut self, time: f64) -> Result<(), SourceError>;

    /// Frame for the current playback position, if one has been decoded.
    fn current_frame(&mut self) -> Result<Option<&SourceFrame>, SourceError>;
}

/// Wall-clock playback position, anchored on play and frozen on pause.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    playing: bool,
    anchor: Instant,
    anchor_time: f64,
    duration: f64,
    looping: bool,
}

impl PlaybackClock {
    pub fn new(duration: f64, looping: bool) -> Self {
        Self {
            playing: false,
            anchor: Instant::now(),
            anchor_time: 0.0,
            duration: duration.max(0.0),
            looping,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    /// Position in seconds, wrapped when looping and clamped otherwise.
    pub fn now(&self) -> f64 {
        let raw = self.unwrapped();
        if self.duration <= 0.0 {
            return 0.0;
        }
        if self.looping {
            raw.rem_euclid(self.duration)
        } else {
            raw.min(self.duration)
        }
    }

    /// Position without looping applied; keeps growing past the duration.
    pub fn unwrapped(&self) -> f64 {
        if self.playing {
            self.anchor_time + self.anchor.elapsed().as_secs_f64()
        } else {
            self.anchor_time
        }
    }

    pub fn is_finished(&self) -> bool {
        !self.looping && self.unwrapped() >= self.duration
    }

    pub fn play(&mut self) {
        if self.playing {
            return;
        }
        self.playing = true;
        self.anchor = Instant::now();
    }

    pub fn pause(&mut self) {
        if !self.playing {
            return;
        }
        self.anchor_time = self.unwrapped();
        self.playing = false;
    }

    pub fn seek(&mut self, time: f64) {
        self.anchor_time = time.clamp(0.0, self.duration);
        self.anchor = Instant::now();
    }
}

/// A still picture presented as a constant video of fixed duration.
#[derive(Debug, Clone)]
pub struct StillImageSource {
    frame: SourceFrame,
    clock: PlaybackClock,
    fps: f64,
}

impl StillImageSource {
    pub fn new(frame: SourceFrame, duration: f64, looping: bool) -> Self {
        Self {
            frame,
            clock: PlaybackClock::new(duration, looping),
            fps: 30.0,
        }
    }

    pub fn open(path: &Path, duration: f64, looping: bool) -> Result<Self, SourceError> {
        let image = image::open(path).map_err(|error| SourceError::Probe {
            path: path.display().to_string(),
            reason: error.to_string(),
        })?;
        Ok(Self::new(SourceFrame::from_image(image), duration, looping))
    }
}

impl VideoSource for StillImageSource {
    fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.frame.width,
            height: self.frame.height,
            duration: self.clock.duration,
            fps: self.fps,
        }
    }

    fn play(&mut self) -> Result<(), SourceError> {
        if self.clock.is_finished() {
            self.clock.seek(0.0);
        }
        self.clock.play();
        Ok(())
    }

    fn pause(&mut self) {
        self.clock.pause();
    }

    fn is_paused(&self) -> bool {
        !self.clock.is_playing()
    }

    fn is_ended(&self) -> bool {
        self.clock.is_finished()
    }

    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    async fn seek(&mut self, time: f64) -> Result<(), SourceError> {
        self.clock.seek(time);
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Option<&SourceFrame>, SourceError> {
        Ok(Some(&self.frame))
    }
}

/// Picks a source implementation from the file extension.
pub fn is_still_image(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "webp")
}
