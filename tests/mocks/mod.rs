//! Mock infrastructure for testing
//!
//! A scripted video source that logs every seek and frame read, and an
//! in-memory encoder backend that records what it was fed.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ascii_deck::ascii_capture::{CaptureFormat, Container};
use ascii_deck::encoding::{EncoderInput, FrameWriter, VideoEncoderBackend};
use ascii_deck::error::{CaptureError, SourceError};
use ascii_deck::source::{PlaybackClock, SourceFrame, SourceInfo, VideoSource};

/// Create a solid RGB test frame
pub fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> SourceFrame {
    SourceFrame::solid(width, height, rgb)
}

/// Create a frame with a horizontal luminance gradient
pub fn gradient_frame(width: u32, height: u32) -> SourceFrame {
    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    for _ in 0..height {
        for x in 0..width {
            let v = (x * 255 / (width - 1).max(1)) as u8;
            rgba.extend_from_slice(&[v, v, v, 255]);
        }
    }
    SourceFrame::new(width, height, rgba).expect("gradient frame")
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    SeekStarted(f64),
    SeekCompleted(f64),
    FrameRead(f64),
}

pub type EventLog = Arc<Mutex<Vec<SourceEvent>>>;

/// Video source driven by a [`PlaybackClock`] whose seeks can be delayed,
/// failed or stalled forever.
pub struct ScriptedSource {
    frame: SourceFrame,
    clock: PlaybackClock,
    duration: f64,
    position: f64,
    events: EventLog,
    refuse_play: bool,
    seek_delay: Duration,
    fail_seek_at: Option<f64>,
    stall_seek_at: Option<f64>,
    fail_reads_after: Option<usize>,
    reads: usize,
}

impl ScriptedSource {
    pub fn new(frame: SourceFrame, duration: f64) -> Self {
        Self {
            frame,
            clock: PlaybackClock::new(duration, false),
            duration,
            position: 0.0,
            events: Arc::default(),
            refuse_play: false,
            seek_delay: Duration::from_millis(5),
            fail_seek_at: None,
            stall_seek_at: None,
            fail_reads_after: None,
            reads: 0,
        }
    }

    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    pub fn refusing_play(mut self) -> Self {
        self.refuse_play = true;
        self
    }

    pub fn with_seek_delay(mut self, delay: Duration) -> Self {
        self.seek_delay = delay;
        self
    }

    pub fn failing_seek_at(mut self, time: f64) -> Self {
        self.fail_seek_at = Some(time);
        self
    }

    pub fn stalling_seek_at(mut self, time: f64) -> Self {
        self.stall_seek_at = Some(time);
        self
    }

    /// Frame reads fail with a decode error once `count` have succeeded.
    pub fn failing_reads_after(mut self, count: usize) -> Self {
        self.fail_reads_after = Some(count);
        self
    }

    fn log(&self, event: SourceEvent) {
        self.events.lock().expect("event log").push(event);
    }
}

fn near(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

impl VideoSource for ScriptedSource {
    fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.frame.width,
            height: self.frame.height,
            duration: self.duration,
            fps: 30.0,
        }
    }

    fn play(&mut self) -> Result<(), SourceError> {
        if self.refuse_play {
            return Err(SourceError::PlaybackRefused(
                "autoplay blocked".to_owned(),
            ));
        }
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
        if self.clock.is_playing() {
            self.clock.now()
        } else {
            self.position
        }
    }

    async fn seek(&mut self, time: f64) -> Result<(), SourceError> {
        self.log(SourceEvent::SeekStarted(time));
        if self.stall_seek_at.is_some_and(|at| near(at, time)) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.seek_delay).await;
        if self.fail_seek_at.is_some_and(|at| near(at, time)) {
            return Err(SourceError::SeekFailed {
                time,
                reason: "scripted failure".to_owned(),
            });
        }
        self.position = time;
        self.clock.seek(time);
        self.log(SourceEvent::SeekCompleted(time));
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Option<&SourceFrame>, SourceError> {
        let time = self.current_time();
        if self.fail_reads_after.is_some_and(|count| self.reads >= count) {
            return Err(SourceError::Decode(format!("scripted decode failure at {time:.3}s")));
        }
        self.reads += 1;
        self.log(SourceEvent::FrameRead(time));
        Ok(Some(&self.frame))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedWriter {
    pub input: EncoderInput,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Everything a [`MemoryBackend`] saw.
#[derive(Debug, Default)]
pub struct EncoderLog {
    pub opened: Vec<OpenedWriter>,
    pub frames: Vec<Vec<u8>>,
    pub finished: usize,
}

#[derive(Clone)]
pub struct MemoryBackend {
    format: CaptureFormat,
    log: Arc<Mutex<EncoderLog>>,
    fail_on_frame: Option<usize>,
}

impl MemoryBackend {
    pub fn new(container: Container) -> Self {
        let codec = match container {
            Container::Mp4 => "libx264",
            Container::Webm => "libvpx-vp9",
        };
        Self {
            format: CaptureFormat::new(container, codec),
            log: Arc::default(),
            fail_on_frame: None,
        }
    }

    /// The writer errors once it has been handed `index` frames.
    pub fn failing_on_frame(mut self, index: usize) -> Self {
        self.fail_on_frame = Some(index);
        self
    }

    pub fn log(&self) -> Arc<Mutex<EncoderLog>> {
        self.log.clone()
    }
}

struct MemoryWriter {
    container: Container,
    log: Arc<Mutex<EncoderLog>>,
    fail_on_frame: Option<usize>,
    written: usize,
}

impl FrameWriter for MemoryWriter {
    fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), CaptureError> {
        if self.fail_on_frame == Some(self.written) {
            return Err(CaptureError::encoder(self.container, "scripted encoder failure"));
        }
        self.written += 1;
        self.log.lock().expect("encoder log").frames.push(frame);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>, CaptureError> {
        self.log.lock().expect("encoder log").finished += 1;
        Ok(format!("{}:{}", self.container.extension(), self.written).into_bytes())
    }
}

impl VideoEncoderBackend for MemoryBackend {
    fn format(&self) -> CaptureFormat {
        self.format
    }

    fn open(
        &self,
        input: EncoderInput,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn FrameWriter>, CaptureError> {
        self.log.lock().expect("encoder log").opened.push(OpenedWriter {
            input,
            width,
            height,
            fps,
        });
        Ok(Box::new(MemoryWriter {
            container: self.format.container,
            log: self.log.clone(),
            fail_on_frame: self.fail_on_frame,
            written: 0,
        }))
    }
}
