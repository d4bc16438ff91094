//! Deterministic, seek-driven export.
//!
//! Frame `k` is sampled at `k / fps` for every `k` with `k / fps < duration`.
//! Each seek is awaited (and bounded) before the frame is read, so a sample
//! never comes from a stale position.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use crate::ascii_capture::{Artifact, FrameAccumulator};
use crate::ascii_stage::AsciiStage;
use crate::config::{AsciiConfig, DEFAULT_EXPORT_FPS, DEFAULT_SEEK_TIMEOUT_MS};
use crate::error::{ConfigError, ExportError, SourceError};
use crate::producer::{drive, FrameProducer};
use crate::source::VideoSource;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ExportProgress {
    /// Frames rendered so far.
    pub frame: u32,
    pub total: u32,
    /// Source time of the last rendered frame.
    pub time: f64,
    pub percent: f64,
}

impl ExportProgress {
    fn new(frame: u32, total: u32, time: f64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            f64::from(frame) / f64::from(total) * 100.0
        };
        Self {
            frame,
            total,
            time,
            percent,
        }
    }
}

/// Requests that a running export stop before its next seek.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    flag: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.flag.borrow()
    }
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { flag: Arc::new(tx) }, AbortSignal { flag: rx })
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub fps: u32,
    pub seek_timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            fps: DEFAULT_EXPORT_FPS,
            seek_timeout: Duration::from_millis(DEFAULT_SEEK_TIMEOUT_MS),
        }
    }
}

fn frame_time(index: u32, fps: u32) -> f64 {
    f64::from(index) / f64::from(fps)
}

/// Number of `k >= 0` with `k / fps < duration`.
pub fn frame_total(duration: f64, fps: u32) -> u32 {
    if fps == 0 || !duration.is_finite() || duration <= 0.0 {
        return 0;
    }
    let mut total = (duration * f64::from(fps)).ceil().min(f64::from(u32::MAX)) as u32;
    while total > 0 && frame_time(total - 1, fps) >= duration {
        total -= 1;
    }
    while frame_time(total, fps) < duration {
        total += 1;
    }
    total
}

pub struct BatchProducer<S: VideoSource> {
    source: S,
    stage: AsciiStage,
    config: AsciiConfig,
    fps: u32,
    seek_timeout: Duration,
    index: u32,
    total: u32,
    abort: Option<AbortSignal>,
    progress: watch::Sender<ExportProgress>,
    last_logged_second: Option<u64>,
}

impl<S: VideoSource> BatchProducer<S> {
    /// Takes the source by value; live playback cannot use it meanwhile.
    pub fn new(
        mut source: S,
        stage: AsciiStage,
        config: AsciiConfig,
        options: BatchOptions,
    ) -> Result<Self, ExportError> {
        config.validate()?;
        if options.fps == 0 {
            return Err(ConfigError::NotPositive { field: "fps" }.into());
        }
        let duration = source.info().duration;
        let total = frame_total(duration, options.fps);
        if total == 0 {
            return Err(ExportError::EmptySource);
        }
        source.pause();
        let (progress, _) = watch::channel(ExportProgress::new(0, total, 0.0));
        debug!(duration, fps = options.fps, total, "batch export prepared");
        Ok(Self {
            source,
            stage,
            config,
            fps: options.fps,
            seek_timeout: options.seek_timeout,
            index: 0,
            total,
            abort: None,
            progress,
            last_logged_second: None,
        })
    }

    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    pub fn progress(&self) -> watch::Receiver<ExportProgress> {
        self.progress.subscribe()
    }

    pub fn total_frames(&self) -> u32 {
        self.total
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    async fn seek(&mut self, time: f64) -> Result<(), ExportError> {
        match time::timeout(self.seek_timeout, self.source.seek(time)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ExportError::Seek { time, source }),
            Err(_) => Err(ExportError::Seek {
                time,
                source: SourceError::SeekTimeout {
                    time,
                    waited: self.seek_timeout,
                },
            }),
        }
    }
}

impl<S: VideoSource> FrameProducer for BatchProducer<S> {
    type Error = ExportError;

    async fn next_frame(&mut self) -> Result<Option<f64>, ExportError> {
        if self.index >= self.total {
            return Ok(None);
        }
        if self.index > 0 {
            tokio::task::yield_now().await;
        }
        if self.abort.as_ref().is_some_and(AbortSignal::is_aborted) {
            warn!(frame = self.index, total = self.total, "batch export aborted");
            return Err(ExportError::Aborted { frame: self.index });
        }

        let time = frame_time(self.index, self.fps);
        self.seek(time).await?;
        let frame = self
            .source
            .current_frame()
            .map_err(|source| ExportError::Seek { time, source })?
            .ok_or_else(|| ExportError::Seek {
                time,
                source: SourceError::SeekFailed {
                    time,
                    reason: "no frame available after seek".to_owned(),
                },
            })?;
        self.stage.render_frame(frame, &self.config, time)?;
        self.index += 1;

        let progress = ExportProgress::new(self.index, self.total, time);
        self.progress.send_replace(progress);
        let second = time.floor() as u64;
        if self.last_logged_second != Some(second) {
            self.last_logged_second = Some(second);
            info!(
                frame = progress.frame,
                total = progress.total,
                percent = %format!("{:.1}", progress.percent),
                "exporting"
            );
        }
        Ok(Some(time))
    }

    fn stage(&self) -> &AsciiStage {
        &self.stage
    }
}

/// Renders every frame into `accumulator` and compiles the result. Nothing
/// is compiled when the loop fails; the accumulator is left empty instead.
pub async fn run_batch_export<S: VideoSource>(
    producer: &mut BatchProducer<S>,
    accumulator: &mut FrameAccumulator,
) -> Result<Artifact, ExportError> {
    accumulator.clear();
    let frames = match drive(producer, accumulator).await {
        Ok(frames) => frames,
        Err(error) => {
            accumulator.clear();
            warn!(%error, "batch export failed; no artifact produced");
            return Err(error);
        }
    };
    info!(frames, format = %accumulator.format().label(), "compiling export");
    let artifact = accumulator.compile()?;
    info!(bytes = artifact.bytes.len(), "export complete");
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_total_counts_sample_times_below_duration() {
        assert_eq!(frame_total(2.0, 15), 30);
        assert_eq!(frame_total(1.0, 30), 30);
        assert_eq!(frame_total(0.05, 15), 1);
        assert_eq!(frame_total(2.01, 15), 31);
        assert_eq!(frame_total(0.0, 15), 0);
        assert_eq!(frame_total(f64::NAN, 15), 0);
        assert_eq!(frame_total(3.0, 0), 0);
    }

    #[test]
    fn progress_reports_percentage() {
        let progress = ExportProgress::new(15, 30, 0.9333);
        assert!((progress.percent - 50.0).abs() < 1e-9);
        assert_eq!(ExportProgress::new(0, 0, 0.0).percent, 0.0);
    }

    #[test]
    fn abort_handle_trips_every_signal_clone() {
        let (handle, signal) = abort_pair();
        let other = signal.clone();
        assert!(!signal.is_aborted());
        handle.abort();
        assert!(signal.is_aborted());
        assert!(other.is_aborted());
    }
}
