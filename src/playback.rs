//! Live playback: renders the source once per display tick while playing,
//! with an optional stream capture riding along.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::ascii_capture::{Artifact, StreamCapture};
use crate::ascii_stage::AsciiStage;
use crate::config::AsciiConfig;
use crate::error::{CaptureError, ConfigError, PlaybackError, RenderError};
use crate::preview::TerminalPreview;
use crate::producer::FrameProducer;
use crate::source::VideoSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::Playing => "PLAYING",
            Self::Paused => "PAUSED",
        })
    }
}

enum TickOutcome {
    Skipped,
    Rendered(f64),
    Ended,
}

pub struct LivePlayback<S: VideoSource> {
    source: S,
    stage: AsciiStage,
    config: watch::Receiver<AsciiConfig>,
    state: watch::Sender<PlayerState>,
    ticker: Interval,
    capture: Option<StreamCapture>,
    preview: Option<TerminalPreview>,
    pending_artifact: Option<Artifact>,
}

impl<S: VideoSource> LivePlayback<S> {
    pub fn new(
        source: S,
        stage: AsciiStage,
        config: watch::Receiver<AsciiConfig>,
        refresh_hz: u32,
    ) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(refresh_hz.max(1)));
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let (state, _) = watch::channel(PlayerState::Idle);
        Self {
            source,
            stage,
            config,
            state,
            ticker,
            capture: None,
            preview: None,
            pending_artifact: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stage(&self) -> &AsciiStage {
        &self.stage
    }

    pub fn set_preview(&mut self, preview: TerminalPreview) {
        self.preview = Some(preview);
    }

    /// Notifies subscribers only on an actual transition.
    fn set_state(&self, next: PlayerState) {
        let mut previous = next;
        self.state.send_if_modified(|state| {
            previous = *state;
            *state = next;
            previous != next
        });
        if previous != next {
            info!(from = %previous, to = %next, "player state changed");
        }
    }

    /// A refusal from the source leaves the player `PAUSED` and is returned.
    pub fn play(&mut self) -> Result<(), PlaybackError> {
        match self.source.play() {
            Ok(()) => {
                self.ticker.reset_immediately();
                self.set_state(PlayerState::Playing);
                Ok(())
            }
            Err(error) => {
                self.source.pause();
                self.set_state(PlayerState::Paused);
                warn!(%error, "source refused to play");
                Err(error.into())
            }
        }
    }

    pub fn pause(&mut self) {
        if self.state() == PlayerState::Playing {
            self.source.pause();
            self.set_state(PlayerState::Paused);
        }
    }

    pub fn toggle(&mut self) -> Result<(), PlaybackError> {
        match self.state() {
            PlayerState::Playing => {
                self.pause();
                Ok(())
            }
            PlayerState::Paused | PlayerState::Idle => self.play(),
        }
    }

    /// Cancels the pending tick, finalizes any capture and returns to
    /// `IDLE`.
    pub fn stop(&mut self) -> Result<Option<Artifact>, PlaybackError> {
        self.source.pause();
        self.ticker.reset();
        let artifact = self.stop_capture();
        self.set_state(PlayerState::Idle);
        if let Some(preview) = self.preview.as_mut() {
            let _ = preview.finish();
        }
        artifact
    }

    pub fn is_recording(&self) -> bool {
        self.capture
            .as_ref()
            .is_some_and(StreamCapture::is_recording)
    }

    /// Starts `capture` against the current surface. A capture that is
    /// already running is kept.
    pub fn start_capture(&mut self, mut capture: StreamCapture) -> Result<(), PlaybackError> {
        if self.is_recording() {
            return Ok(());
        }
        capture.start(self.stage.surface())?;
        self.capture = Some(capture);
        Ok(())
    }

    pub fn stop_capture(&mut self) -> Result<Option<Artifact>, PlaybackError> {
        match self.capture.take() {
            Some(mut capture) => Ok(capture.stop()?),
            None => Ok(None),
        }
    }

    /// Artifact finalized because the source ran out.
    pub fn take_artifact(&mut self) -> Option<Artifact> {
        self.pending_artifact.take()
    }

    pub fn snapshot_png(&self) -> Result<Vec<u8>, RenderError> {
        self.stage.snapshot_png()
    }

    pub fn current_text(&self) -> String {
        self.stage.current_text()
    }

    fn tick(&mut self) -> Result<TickOutcome, PlaybackError> {
        if self.state() != PlayerState::Playing {
            return Ok(TickOutcome::Skipped);
        }
        if self.source.is_ended() {
            self.finish_stream()?;
            return Ok(TickOutcome::Ended);
        }
        if self.source.is_paused() {
            return Ok(TickOutcome::Skipped);
        }

        let config = *self.config.borrow();
        let timestamp = self.source.current_time();
        let Some(frame) = self.source.current_frame()? else {
            return Ok(TickOutcome::Skipped);
        };
        self.stage.render_frame(frame, &config, timestamp)?;

        if let Some(capture) = self.capture.as_mut() {
            if let Err(error) = capture.record(self.stage.surface()) {
                self.capture = None;
                return Err(error.into());
            }
        }
        if let Some(preview) = self.preview.as_mut() {
            if let Err(error) = preview.present(&self.stage, config.color) {
                warn!(%error, "terminal preview disabled");
                self.preview = None;
            }
        }
        Ok(TickOutcome::Rendered(timestamp))
    }

    fn finish_stream(&mut self) -> Result<(), PlaybackError> {
        self.ticker.reset();
        info!(time = self.source.current_time(), "source reached end of stream");
        let artifact = self.stop_capture();
        self.set_state(PlayerState::Idle);
        self.pending_artifact = artifact?;
        Ok(())
    }
}

impl<S: VideoSource> FrameProducer for LivePlayback<S> {
    type Error = PlaybackError;

    async fn next_frame(&mut self) -> Result<Option<f64>, PlaybackError> {
        loop {
            if self.state() == PlayerState::Idle {
                return Ok(None);
            }
            self.ticker.tick().await;
            match self.tick()? {
                TickOutcome::Rendered(timestamp) => return Ok(Some(timestamp)),
                TickOutcome::Ended => return Ok(None),
                TickOutcome::Skipped => {}
            }
        }
    }

    fn stage(&self) -> &AsciiStage {
        &self.stage
    }
}

pub type CaptureFactory = Box<dyn FnMut() -> Result<StreamCapture, CaptureError> + Send>;

pub enum LiveCommand {
    Play,
    Pause,
    TogglePause,
    Stop,
    StartCapture(oneshot::Sender<Result<(), PlaybackError>>),
    StopCapture(oneshot::Sender<Result<Option<PathBuf>, PlaybackError>>),
    Snapshot(oneshot::Sender<Result<Vec<u8>, PlaybackError>>),
    CurrentText(oneshot::Sender<String>),
}

/// Control surface for a running [`LiveSession`].
#[derive(Clone)]
pub struct LiveHandle {
    commands: mpsc::Sender<LiveCommand>,
    state: watch::Receiver<PlayerState>,
    config: Arc<watch::Sender<AsciiConfig>>,
}

impl LiveHandle {
    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    /// Receives every state transition.
    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.state.clone()
    }

    pub fn config(&self) -> AsciiConfig {
        *self.config.borrow()
    }

    /// Takes effect on the next sampling pass.
    pub fn set_config(&self, config: AsciiConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config.send_replace(config);
        Ok(())
    }

    pub async fn send(&self, command: LiveCommand) -> Result<(), PlaybackError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PlaybackError::SessionClosed)
    }

    /// For callers outside the runtime, such as a stdin reader thread.
    pub fn send_blocking(&self, command: LiveCommand) -> Result<(), PlaybackError> {
        self.commands
            .blocking_send(command)
            .map_err(|_| PlaybackError::SessionClosed)
    }

    pub async fn play(&self) -> Result<(), PlaybackError> {
        self.send(LiveCommand::Play).await
    }

    pub async fn pause(&self) -> Result<(), PlaybackError> {
        self.send(LiveCommand::Pause).await
    }

    pub async fn stop(&self) -> Result<(), PlaybackError> {
        self.send(LiveCommand::Stop).await
    }

    pub async fn start_capture(&self) -> Result<(), PlaybackError> {
        let (reply, response) = oneshot::channel();
        self.send(LiveCommand::StartCapture(reply)).await?;
        response.await.map_err(|_| PlaybackError::SessionClosed)?
    }

    /// Finalizes the running capture and returns where it was saved.
    pub async fn stop_capture(&self) -> Result<Option<PathBuf>, PlaybackError> {
        let (reply, response) = oneshot::channel();
        self.send(LiveCommand::StopCapture(reply)).await?;
        response.await.map_err(|_| PlaybackError::SessionClosed)?
    }

    pub async fn snapshot(&self) -> Result<Vec<u8>, PlaybackError> {
        let (reply, response) = oneshot::channel();
        self.send(LiveCommand::Snapshot(reply)).await?;
        response.await.map_err(|_| PlaybackError::SessionClosed)?
    }

    pub async fn current_text(&self) -> Result<String, PlaybackError> {
        let (reply, response) = oneshot::channel();
        self.send(LiveCommand::CurrentText(reply)).await?;
        response.await.map_err(|_| PlaybackError::SessionClosed)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub refresh_hz: u32,
    pub autoplay: bool,
    pub record_on_start: bool,
    /// Leave `run` once the source is exhausted instead of idling.
    pub exit_on_end: bool,
    pub output_dir: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            refresh_hz: crate::config::DEFAULT_REFRESH_HZ,
            autoplay: true,
            record_on_start: false,
            exit_on_end: true,
            output_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    pub frames_rendered: u64,
    pub artifacts: Vec<PathBuf>,
    pub capture_failures: u32,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Owns a [`LivePlayback`] and serves [`LiveHandle`] commands until
/// stopped.
pub struct LiveSession<S: VideoSource> {
    playback: LivePlayback<S>,
    commands: mpsc::Receiver<LiveCommand>,
    options: SessionOptions,
    capture_factory: Option<CaptureFactory>,
    deferred_capture: Option<StreamCapture>,
    summary: SessionSummary,
}

impl<S: VideoSource> LiveSession<S> {
    pub fn new(
        source: S,
        stage: AsciiStage,
        config: AsciiConfig,
        options: SessionOptions,
        capture_factory: Option<CaptureFactory>,
    ) -> (Self, LiveHandle) {
        let (config_tx, config_rx) = watch::channel(config);
        let (command_tx, command_rx) = mpsc::channel(16);
        let playback = LivePlayback::new(source, stage, config_rx, options.refresh_hz);
        let handle = LiveHandle {
            commands: command_tx,
            state: playback.subscribe(),
            config: Arc::new(config_tx),
        };
        let session = Self {
            playback,
            commands: command_rx,
            options,
            capture_factory,
            deferred_capture: None,
            summary: SessionSummary::default(),
        };
        (session, handle)
    }

    pub fn set_preview(&mut self, preview: TerminalPreview) {
        self.playback.set_preview(preview);
    }

    pub async fn run(mut self) -> Result<SessionSummary, PlaybackError> {
        if self.options.autoplay {
            if let Err(error) = self.playback.play() {
                warn!(%error, "autoplay refused; waiting for a play command");
            }
        }
        if self.options.record_on_start {
            if let Err(error) = self.start_capture() {
                warn!(%error, "could not start stream capture");
                self.summary.capture_failures += 1;
            }
        }

        let mut commands_open = true;
        loop {
            let playing = self.playback.state() == PlayerState::Playing;
            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if self.handle_command(command) == Flow::Exit {
                            break;
                        }
                    }
                    None => {
                        debug!("all live handles dropped");
                        commands_open = false;
                    }
                },
                produced = self.playback.next_frame(), if playing => match produced {
                    Ok(Some(_)) => self.after_frame(),
                    Ok(None) => {
                        if let Some(artifact) = self.playback.take_artifact() {
                            self.save(artifact)?;
                        }
                        if self.options.exit_on_end {
                            break;
                        }
                    }
                    Err(PlaybackError::Capture(error)) => {
                        warn!(%error, "stream capture failed; playback continues");
                        self.summary.capture_failures += 1;
                    }
                    Err(error) => {
                        self.salvage_capture();
                        return Err(error);
                    }
                },
                else => break,
            }
        }

        let artifact = self.playback.stop()?;
        if let Some(artifact) = artifact {
            self.save(artifact)?;
        }
        self.summary.frames_rendered = self.playback.stage().frames_rendered();
        Ok(self.summary)
    }

    /// Stops playback after a fatal error, still saving whatever the running
    /// capture recorded.
    fn salvage_capture(&mut self) {
        match self.playback.stop() {
            Ok(Some(artifact)) => {
                if let Err(error) = self.save(artifact) {
                    warn!(%error, "could not save stream capture after playback failed");
                }
            }
            Ok(None) => {}
            Err(error) => {
                warn!(%error, "could not finalize stream capture after playback failed");
                self.summary.capture_failures += 1;
            }
        }
    }

    fn after_frame(&mut self) {
        if let Some(capture) = self.deferred_capture.take() {
            if let Err(error) = self.playback.start_capture(capture) {
                warn!(%error, "could not start stream capture");
                self.summary.capture_failures += 1;
            }
        }
    }

    fn start_capture(&mut self) -> Result<(), PlaybackError> {
        if self.playback.is_recording() || self.deferred_capture.is_some() {
            return Ok(());
        }
        let factory = self.capture_factory.as_mut().ok_or_else(|| {
            CaptureError::FfmpegUnavailable("no capture backend configured".to_owned())
        })?;
        let capture = factory()?;
        if self.playback.stage().frames_rendered() == 0 {
            debug!("deferring stream capture until the first frame is rendered");
            self.deferred_capture = Some(capture);
            return Ok(());
        }
        self.playback.start_capture(capture)
    }

    fn stop_capture(&mut self) -> Result<Option<PathBuf>, PlaybackError> {
        self.deferred_capture = None;
        match self.playback.stop_capture()? {
            Some(artifact) => Ok(Some(self.save(artifact)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, artifact: Artifact) -> Result<PathBuf, PlaybackError> {
        let path = artifact.save_in(&self.options.output_dir)?;
        info!(
            path = %path.display(),
            frames = artifact.frame_count,
            mime = artifact.format.container.mime_type(),
            "capture saved"
        );
        self.summary.artifacts.push(path.clone());
        Ok(path)
    }

    fn handle_command(&mut self, command: LiveCommand) -> Flow {
        match command {
            LiveCommand::Play => {
                if let Err(error) = self.playback.play() {
                    warn!(%error, "play refused");
                }
            }
            LiveCommand::Pause => self.playback.pause(),
            LiveCommand::TogglePause => {
                if let Err(error) = self.playback.toggle() {
                    warn!(%error, "play refused");
                }
            }
            LiveCommand::Stop => return Flow::Exit,
            LiveCommand::StartCapture(reply) => {
                let result = self.start_capture();
                if let Err(error) = &result {
                    warn!(%error, "could not start stream capture");
                    self.summary.capture_failures += 1;
                }
                let _ = reply.send(result);
            }
            LiveCommand::StopCapture(reply) => {
                let _ = reply.send(self.stop_capture());
            }
            LiveCommand::Snapshot(reply) => {
                let _ = reply.send(self.playback.snapshot_png().map_err(PlaybackError::from));
            }
            LiveCommand::CurrentText(reply) => {
                let _ = reply.send(self.playback.current_text());
            }
        }
        Flow::Continue
    }
}
