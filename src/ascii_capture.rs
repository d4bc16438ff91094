//! Capture sinks: a real-time stream recorder and a frame-accumulating
//! encoder for batch export. Both read the output surface and never
//! mutate it.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use tokio::time::Instant;

use crate::ascii_render::{OutputSurface, BACKGROUND};
use crate::encoding::{EncoderInput, FrameWriter, VideoEncoderBackend};
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    Mp4,
    Webm,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp4 => "video/mp4",
            Self::Webm => "video/webm",
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub container: Container,
    pub codec: &'static str,
}

impl CaptureFormat {
    pub const fn new(container: Container, codec: &'static str) -> Self {
        Self { container, codec }
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.container, self.codec)
    }
}

/// Stream capture candidates, most preferred first.
pub const STREAM_FORMATS: [CaptureFormat; 4] = [
    CaptureFormat::new(Container::Mp4, "libx264"),
    CaptureFormat::new(Container::Mp4, "libopenh264"),
    CaptureFormat::new(Container::Webm, "libvpx-vp9"),
    CaptureFormat::new(Container::Webm, "libvpx"),
];

/// Batch export candidates; WebM first.
pub const EXPORT_FORMATS: [CaptureFormat; 4] = [
    CaptureFormat::new(Container::Webm, "libvpx-vp9"),
    CaptureFormat::new(Container::Webm, "libvpx"),
    CaptureFormat::new(Container::Mp4, "libx264"),
    CaptureFormat::new(Container::Mp4, "libopenh264"),
];

pub const DEFAULT_EXPORT_FILE: &str = "ascii_video.webm";

/// A finished container file held in memory.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub format: CaptureFormat,
    pub bytes: Vec<u8>,
    pub frame_count: u64,
    pub fps: u32,
}

impl Artifact {
    pub fn extension(&self) -> &'static str {
        self.format.container.extension()
    }

    pub fn duration(&self) -> Duration {
        if self.fps == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count as f64 / f64::from(self.fps))
    }

    pub fn write_to(&self, path: &Path) -> Result<(), CaptureError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &self.bytes)?;
        Ok(())
    }

    /// Writes to `dir` under a fresh timestamped name and returns the path.
    /// Never replaces an earlier capture.
    pub fn save_in(&self, dir: &Path) -> Result<PathBuf, CaptureError> {
        Ok(write_unique(dir, "ascii-capture", self.extension(), &self.bytes)?)
    }
}

pub fn timestamped_file_name(prefix: &str, extension: &str) -> String {
    format!("{prefix}-{}.{extension}", Local::now().format("%Y%m%d-%H%M%S-%3f"))
}

/// Creates `<prefix>-<timestamp>.<ext>` in `dir`, adding `-2`, `-3`, ...
/// to the stem while the name is taken.
pub fn write_unique(dir: &Path, prefix: &str, extension: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let name = timestamped_file_name(prefix, extension);
    let stem = name.trim_end_matches(&format!(".{extension}")).to_owned();
    let mut candidate = dir.join(&name);
    let mut attempt = 1_u32;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut file) => {
                file.write_all(bytes)?;
                return Ok(candidate);
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                attempt += 1;
                candidate = dir.join(format!("{stem}-{attempt}.{extension}"));
            }
            Err(error) => return Err(error),
        }
    }
}

/// Anything that consumes rendered surfaces.
pub trait FrameSink {
    fn accept(&mut self, surface: &OutputSurface, timestamp: f64) -> Result<(), CaptureError>;
}

struct Recording {
    writer: Box<dyn FrameWriter>,
    width: u32,
    height: u32,
    started: Instant,
    frames_written: u64,
    held: Vec<u8>,
}

impl Recording {
    fn due_frames(&self, fps: u32) -> u64 {
        let elapsed = self.started.elapsed().as_nanos();
        (elapsed * u128::from(fps) / 1_000_000_000) as u64
    }

    fn flush_until(&mut self, due: u64) -> Result<(), CaptureError> {
        while self.frames_written < due {
            self.writer.write_frame(self.held.clone())?;
            self.frames_written += 1;
        }
        Ok(())
    }
}

/// Records the output surface continuously at a fixed frame rate. The
/// most recent surface is held and repeated until the next one arrives.
pub struct StreamCapture {
    backend: Box<dyn VideoEncoderBackend>,
    fps: u32,
    recording: Option<Recording>,
}

impl StreamCapture {
    pub fn new(backend: Box<dyn VideoEncoderBackend>, fps: u32) -> Self {
        Self {
            backend,
            fps: fps.max(1),
            recording: None,
        }
    }

    pub fn format(&self) -> CaptureFormat {
        self.backend.format()
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Starts recording at the surface's current size. Starting twice is
    /// a no-op.
    pub fn start(&mut self, surface: &OutputSurface) -> Result<(), CaptureError> {
        if self.recording.is_some() {
            return Ok(());
        }
        let (width, height) = (surface.width(), surface.height());
        let writer = self
            .backend
            .open(EncoderInput::RawRgba, width, height, self.fps)?;
        tracing::info!(
            format = %self.backend.format().label(),
            width,
            height,
            fps = self.fps,
            "stream capture started"
        );
        self.recording = Some(Recording {
            writer,
            width,
            height,
            started: Instant::now(),
            frames_written: 0,
            held: surface.data().to_vec(),
        });
        Ok(())
    }

    pub fn record(&mut self, surface: &OutputSurface) -> Result<(), CaptureError> {
        let Some(recording) = self.recording.as_mut() else {
            return Ok(());
        };
        let due = recording.due_frames(self.fps);
        if let Err(error) = recording.flush_until(due) {
            self.abandon();
            return Err(error);
        }
        recording.held = fit_to_canvas(surface, recording.width, recording.height);
        Ok(())
    }

    /// Finalizes the recording. Returns `None` when nothing was recording.
    pub fn stop(&mut self) -> Result<Option<Artifact>, CaptureError> {
        let Some(mut recording) = self.recording.take() else {
            return Ok(None);
        };
        let due = recording.due_frames(self.fps) + 1;
        recording.flush_until(due)?;
        let frame_count = recording.frames_written;
        let bytes = recording.writer.finish()?;
        let artifact = Artifact {
            format: self.backend.format(),
            bytes,
            frame_count,
            fps: self.fps,
        };
        tracing::info!(
            frames = frame_count,
            bytes = artifact.bytes.len(),
            "stream capture stopped"
        );
        Ok(Some(artifact))
    }

    fn abandon(&mut self) {
        if self.recording.take().is_some() {
            tracing::warn!("stream capture abandoned after encoder failure");
        }
    }
}

impl FrameSink for StreamCapture {
    fn accept(&mut self, surface: &OutputSurface, _timestamp: f64) -> Result<(), CaptureError> {
        self.record(surface)
    }
}

/// Copies the surface onto a canvas of the recording size, centered.
fn fit_to_canvas(surface: &OutputSurface, width: u32, height: u32) -> Vec<u8> {
    if surface.width() == width && surface.height() == height {
        return surface.data().to_vec();
    }
    let mut canvas = [BACKGROUND[0], BACKGROUND[1], BACKGROUND[2], 255]
        .repeat(width as usize * height as usize);
    let copy_w = surface.width().min(width);
    let copy_h = surface.height().min(height);
    let src_x = (surface.width() - copy_w) / 2;
    let src_y = (surface.height() - copy_h) / 2;
    let dst_x = (width - copy_w) / 2;
    let dst_y = (height - copy_h) / 2;
    let data = surface.data();
    for row in 0..copy_h {
        let src = (((src_y + row) * surface.width() + src_x) * 4) as usize;
        let dst = (((dst_y + row) * width + dst_x) * 4) as usize;
        let len = (copy_w * 4) as usize;
        canvas[dst..dst + len].copy_from_slice(&data[src..src + len]);
    }
    canvas
}

/// Buffers discrete frames as PNG stills and compiles them into one
/// container on request.
pub struct FrameAccumulator {
    backend: Box<dyn VideoEncoderBackend>,
    fps: u32,
    frames: Vec<Vec<u8>>,
    size: Option<(u32, u32)>,
}

impl FrameAccumulator {
    pub fn new(backend: Box<dyn VideoEncoderBackend>, fps: u32) -> Self {
        Self {
            backend,
            fps: fps.max(1),
            frames: Vec::new(),
            size: None,
        }
    }

    pub fn format(&self) -> CaptureFormat {
        self.backend.format()
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn add_frame(&mut self, surface: &OutputSurface) -> Result<(), CaptureError> {
        let (width, height) = (surface.width(), surface.height());
        match self.size {
            None => self.size = Some((width, height)),
            Some((w, h)) if (w, h) != (width, height) => {
                return Err(CaptureError::FrameSizeMismatch {
                    width: w,
                    height: h,
                    got_width: width,
                    got_height: height,
                });
            }
            Some(_) => {}
        }
        let png = surface.to_png().map_err(|error| {
            CaptureError::encoder(self.backend.format().container, error.to_string())
        })?;
        self.frames.push(png);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.size = None;
    }

    /// Encodes every buffered frame. Zero frames is an error, never an
    /// empty file.
    pub fn compile(&mut self) -> Result<Artifact, CaptureError> {
        let Some((width, height)) = self.size else {
            return Err(CaptureError::NoFrames);
        };
        if self.frames.is_empty() {
            return Err(CaptureError::NoFrames);
        }
        let mut writer = self.backend.open(EncoderInput::Png, width, height, self.fps)?;
        for frame in &self.frames {
            writer.write_frame(frame.clone())?;
        }
        let bytes = writer.finish()?;
        tracing::info!(
            frames = self.frames.len(),
            format = %self.backend.format().label(),
            bytes = bytes.len(),
            "compiled frame accumulator"
        );
        Ok(Artifact {
            format: self.backend.format(),
            bytes,
            frame_count: self.frames.len() as u64,
            fps: self.fps,
        })
    }
}

impl FrameSink for FrameAccumulator {
    fn accept(&mut self, surface: &OutputSurface, _timestamp: f64) -> Result<(), CaptureError> {
        self.add_frame(surface)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default, Clone)]
    struct Written(Arc<Mutex<Vec<Vec<u8>>>>);

    struct MemoryWriter(Written);

    impl FrameWriter for MemoryWriter {
        fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), CaptureError> {
            self.0 .0.lock().expect("lock").push(frame);
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<Vec<u8>, CaptureError> {
            let count = self.0 .0.lock().expect("lock").len() as u32;
            Ok(count.to_le_bytes().to_vec())
        }
    }

    struct MemoryBackend(Written);

    impl VideoEncoderBackend for MemoryBackend {
        fn format(&self) -> CaptureFormat {
            STREAM_FORMATS[2]
        }

        fn open(
            &self,
            _input: EncoderInput,
            _width: u32,
            _height: u32,
            _fps: u32,
        ) -> Result<Box<dyn FrameWriter>, CaptureError> {
            Ok(Box::new(MemoryWriter(self.0.clone())))
        }
    }

    fn backend() -> (Box<dyn VideoEncoderBackend>, Written) {
        let written = Written::default();
        (Box::new(MemoryBackend(written.clone())), written)
    }

    #[test]
    fn stopping_a_capture_that_never_started_is_a_no_op() {
        let (backend, written) = backend();
        let mut capture = StreamCapture::new(backend, 30);
        assert!(capture.stop().expect("stop").is_none());
        assert!(written.0.lock().expect("lock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_capture_paces_frames_on_the_wall_clock() {
        let (backend, written) = backend();
        let mut capture = StreamCapture::new(backend, 30);
        let surface = OutputSurface::new(4, 2).expect("surface");
        capture.start(&surface).expect("start");
        capture.start(&surface).expect("second start is a no-op");

        tokio::time::advance(Duration::from_millis(100)).await;
        capture.record(&surface).expect("record");
        assert_eq!(written.0.lock().expect("lock").len(), 3);

        tokio::time::advance(Duration::from_millis(100)).await;
        let artifact = capture.stop().expect("stop").expect("artifact");
        assert_eq!(artifact.frame_count, 7);
        assert_eq!(artifact.extension(), "webm");
        assert!(!capture.is_recording());
        assert!(capture.stop().expect("stop again").is_none());
    }

    #[test]
    fn resized_surfaces_are_centered_on_the_recording_canvas() {
        let small = OutputSurface::new(2, 2).expect("surface");
        let canvas = fit_to_canvas(&small, 4, 4);
        assert_eq!(canvas.len(), 4 * 4 * 4);
        assert!(canvas.chunks_exact(4).all(|px| px == [0, 0, 0, 255]));

        let large = OutputSurface::new(8, 8).expect("surface");
        assert_eq!(fit_to_canvas(&large, 4, 4).len(), 64);
    }

    #[test]
    fn compiling_zero_frames_is_an_error() {
        let (backend, _) = backend();
        let mut accumulator = FrameAccumulator::new(backend, 15);
        assert!(matches!(accumulator.compile(), Err(CaptureError::NoFrames)));
    }

    #[test]
    fn accumulator_compiles_every_frame() {
        let (backend, written) = backend();
        let mut accumulator = FrameAccumulator::new(backend, 15);
        let surface = OutputSurface::new(6, 10).expect("surface");
        accumulator.add_frame(&surface).expect("frame");
        let artifact = accumulator.compile().expect("single frame compiles");
        assert_eq!(artifact.frame_count, 1);
        assert_eq!(written.0.lock().expect("lock").len(), 1);
        assert!(written.0.lock().expect("lock")[0].starts_with(b"\x89PNG"));
    }

    #[test]
    fn accumulator_rejects_size_changes() {
        let (backend, _) = backend();
        let mut accumulator = FrameAccumulator::new(backend, 15);
        accumulator
            .add_frame(&OutputSurface::new(6, 10).expect("surface"))
            .expect("frame");
        let error = accumulator
            .add_frame(&OutputSurface::new(12, 10).expect("surface"))
            .expect_err("mismatch");
        assert!(matches!(
            error,
            CaptureError::FrameSizeMismatch { got_width: 12, .. }
        ));
    }

    #[test]
    fn timestamped_names_carry_the_extension() {
        let name = timestamped_file_name("ascii-capture", "mp4");
        assert!(name.starts_with("ascii-capture-"));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn repeated_saves_never_overwrite_each_other() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths: Vec<PathBuf> = (0..3)
            .map(|index| {
                write_unique(dir.path(), "ascii-capture", "webm", format!("take-{index}").as_bytes())
                    .expect("write")
            })
            .collect();
        assert_ne!(paths[0], paths[1]);
        assert_ne!(paths[1], paths[2]);
        assert_ne!(paths[0], paths[2]);
        for (index, path) in paths.iter().enumerate() {
            assert_eq!(fs::read(path).expect("read"), format!("take-{index}").into_bytes());
            assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("webm"));
        }
    }
}
