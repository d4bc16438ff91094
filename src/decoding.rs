//! ffprobe/ffmpeg backed [`VideoSource`].
//!
//! Playback streams raw RGBA frames from a long-running ffmpeg child on a
//! reader thread; frames are taken off a bounded channel at the pace of the
//! playback clock. Each seek runs a one-shot ffmpeg child for the target
//! time and resolves only once that frame is in hand.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::mpsc::{self, TryRecvError};
use std::thread::{self, JoinHandle};

use serde::Deserialize;

use crate::config::DEFAULT_DECODE_WIDTH;
use crate::encoding::FfmpegTools;
use crate::error::SourceError;
use crate::source::{
    is_still_image, PlaybackClock, SourceFrame, SourceInfo, StillImageSource, VideoSource,
};

const FALLBACK_FPS: f64 = 30.0;

#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Frames wider than this are scaled down, preserving aspect.
    pub decode_width: u32,
    pub looping: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            decode_width: DEFAULT_DECODE_WIDTH,
            looping: false,
        }
    }
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize, Default)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOut {
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
}

pub fn probe_video(tools: &FfmpegTools, path: &Path) -> Result<SourceInfo, SourceError> {
    let probe_error = |reason: String| SourceError::Probe {
        path: path.display().to_string(),
        reason,
    };
    let out = Command::new(&tools.ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .output()
        .map_err(|error| probe_error(format!("failed to run ffprobe: {error}")))?;
    if !out.status.success() {
        return Err(probe_error(
            String::from_utf8_lossy(&out.stderr).trim().to_owned(),
        ));
    }
    parse_probe_output(&out.stdout).map_err(probe_error)
}

fn parse_probe_output(json: &[u8]) -> Result<SourceInfo, String> {
    let parsed: ProbeOut =
        serde_json::from_slice(json).map_err(|error| format!("ffprobe json parse failed: {error}"))?;
    let stream = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| "no video stream found".to_owned())?;
    let width = stream
        .width
        .filter(|width| *width > 0)
        .ok_or_else(|| "missing video width from ffprobe".to_owned())?;
    let height = stream
        .height
        .filter(|height| *height > 0)
        .ok_or_else(|| "missing video height from ffprobe".to_owned())?;
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(FALLBACK_FPS);
    let duration = stream
        .duration
        .as_deref()
        .or(parsed.format.duration.as_deref())
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|duration| duration.is_finite() && *duration > 0.0)
        .ok_or_else(|| "source has no usable duration".to_owned())?;
    Ok(SourceInfo {
        width,
        height,
        duration,
        fps,
    })
}

/// Parses ffprobe rationals such as `30000/1001`.
fn parse_rate(raw: &str) -> Option<f64> {
    let (num, den) = match raw.split_once('/') {
        Some((num, den)) => (num.parse::<f64>().ok()?, den.parse::<f64>().ok()?),
        None => (raw.parse::<f64>().ok()?, 1.0),
    };
    let rate = num / den;
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

pub fn decode_size(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || max_width == 0 {
        return (width, height);
    }
    let scaled = (u64::from(height) * u64::from(max_width) + u64::from(width) / 2) / u64::from(width);
    (max_width, (scaled as u32).max(1))
}

/// Long-running ffmpeg decode of consecutive frames.
struct FrameStream {
    receiver: mpsc::Receiver<Vec<u8>>,
    worker: Option<JoinHandle<Result<(), String>>>,
    child: Child,
    start_time: f64,
    frames_taken: u64,
}

impl FrameStream {
    fn spawn(
        tools: &FfmpegTools,
        path: &Path,
        start_time: f64,
        size: (u32, u32),
        looping: bool,
    ) -> Result<Self, SourceError> {
        let mut command = Command::new(&tools.ffmpeg);
        command.args(["-hide_banner", "-loglevel", "error"]);
        if looping {
            command.args(["-stream_loop", "-1"]);
        }
        let mut child = command
            .args(["-ss", &format!("{start_time:.6}")])
            .arg("-i")
            .arg(path)
            .args([
                "-an",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &format!("{}x{}", size.0, size.1),
                "-sws_flags",
                "area",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|error| SourceError::PlaybackRefused(format!("failed to spawn ffmpeg decoder: {error}")))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::PlaybackRefused("failed to capture ffmpeg stdout".to_owned()))?;
        let frame_size = size.0 as usize * size.1 as usize * 4;
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);

        let worker = thread::Builder::new()
            .name("ascii-deck-decoder".to_owned())
            .spawn(move || {
                loop {
                    let mut buffer = vec![0u8; frame_size];
                    match stdout.read_exact(&mut buffer) {
                        Ok(()) => {
                            if sender.send(buffer).is_err() {
                                break;
                            }
                        }
                        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => break,
                        Err(error) => return Err(format!("failed to read from ffmpeg: {error}")),
                    }
                }
                Ok(())
            })?;

        tracing::debug!(start_time, width = size.0, height = size.1, looping, "decoder stream started");
        Ok(Self {
            receiver,
            worker: Some(worker),
            child,
            start_time,
            frames_taken: 0,
        })
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(Err(reason)) => tracing::warn!(%reason, "decoder stream ended with an error"),
                Err(_) => tracing::warn!("decoder thread panicked"),
                Ok(Ok(())) => {}
            }
        }
    }
}

/// Where a one-shot decode reads its frame from.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DecodeAnchor {
    /// First frame at or after this time.
    At(f64),
    /// Last frame within this many seconds of the end of the input.
    Tail(f64),
}

/// Seconds decoded from the end when a seek lands past the last frame.
const TAIL_WINDOW_SECS: f64 = 1.0;

impl DecodeAnchor {
    fn args(self, path: &Path, size: (u32, u32)) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-v".into(), "error".into()];
        match self {
            Self::At(time) => args.extend([OsString::from("-ss"), OsString::from(format!("{time:.9}"))]),
            Self::Tail(window) => {
                args.extend([OsString::from("-sseof"), OsString::from(format!("-{window:.9}"))])
            }
        }
        args.push("-i".into());
        args.push(path.as_os_str().to_owned());
        if let Self::At(_) = self {
            args.extend(["-frames:v", "1"].map(OsString::from));
        }
        args.extend(["-an", "-f", "rawvideo", "-pix_fmt", "rgba", "-s"].map(OsString::from));
        args.push(OsString::from(format!("{}x{}", size.0, size.1)));
        args.extend(["-sws_flags", "area", "pipe:1"].map(OsString::from));
        args
    }

    /// The frame's bytes out of ffmpeg's stdout, or `None` when no complete
    /// frame came back.
    fn pick(self, mut stdout: Vec<u8>, frame_len: usize) -> Option<Vec<u8>> {
        let complete = stdout.len().checked_div(frame_len)?;
        if complete == 0 {
            return None;
        }
        let start = match self {
            Self::At(_) => 0,
            Self::Tail(_) => (complete - 1) * frame_len,
        };
        stdout.truncate(start + frame_len);
        Some(stdout.split_off(start))
    }

    /// A seek can land after the last frame when the duration comes from the
    /// container, or when the export rate does not line up with the source
    /// rate. Those targets fall back to the final frame.
    fn fallback(self) -> Option<Self> {
        match self {
            Self::At(_) => Some(Self::Tail(TAIL_WINDOW_SECS)),
            Self::Tail(_) => None,
        }
    }
}

fn decoded_frame(
    anchor: DecodeAnchor,
    output: Output,
    time: f64,
    size: (u32, u32),
) -> Result<Option<SourceFrame>, SourceError> {
    if !output.status.success() {
        return Err(SourceError::SeekFailed {
            time,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    let frame_len = size.0 as usize * size.1 as usize * 4;
    match anchor.pick(output.stdout, frame_len) {
        Some(rgba) => SourceFrame::new(size.0, size.1, rgba).map(Some),
        None => Ok(None),
    }
}

fn no_frame(time: f64) -> SourceError {
    SourceError::SeekFailed {
        time,
        reason: "ffmpeg returned no complete frame".to_owned(),
    }
}

/// Decodes the single frame shown at `time`, blocking the caller.
fn decode_frame_blocking(
    tools: &FfmpegTools,
    path: &Path,
    time: f64,
    size: (u32, u32),
) -> Result<SourceFrame, SourceError> {
    let mut anchor = DecodeAnchor::At(time);
    loop {
        let output = Command::new(&tools.ffmpeg)
            .args(anchor.args(path, size))
            .stdin(Stdio::null())
            .output()
            .map_err(|error| SourceError::SeekFailed {
                time,
                reason: format!("failed to run ffmpeg: {error}"),
            })?;
        if let Some(frame) = decoded_frame(anchor, output, time, size)? {
            return Ok(frame);
        }
        anchor = anchor.fallback().ok_or_else(|| no_frame(time))?;
        tracing::debug!(time, "no frame at the seek target; decoding the final frame");
    }
}

/// Async form of [`decode_frame_blocking`]. Dropping the future kills the
/// ffmpeg child, so a timed-out seek leaves nothing running.
async fn decode_frame(
    tools: &FfmpegTools,
    path: &Path,
    time: f64,
    size: (u32, u32),
) -> Result<SourceFrame, SourceError> {
    let mut anchor = DecodeAnchor::At(time);
    loop {
        let output = tokio::process::Command::new(&tools.ffmpeg)
            .args(anchor.args(path, size))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| SourceError::SeekFailed {
                time,
                reason: format!("failed to run ffmpeg: {error}"),
            })?;
        if let Some(frame) = decoded_frame(anchor, output, time, size)? {
            return Ok(frame);
        }
        anchor = anchor.fallback().ok_or_else(|| no_frame(time))?;
        tracing::debug!(time, "no frame at the seek target; decoding the final frame");
    }
}

pub struct FfmpegSource {
    path: PathBuf,
    tools: FfmpegTools,
    info: SourceInfo,
    size: (u32, u32),
    looping: bool,
    clock: PlaybackClock,
    stream: Option<FrameStream>,
    frame: Option<SourceFrame>,
    exhausted: bool,
}

impl FfmpegSource {
    /// Probes the file and decodes the first frame as a poster.
    pub fn open(tools: FfmpegTools, path: &Path, options: DecodeOptions) -> Result<Self, SourceError> {
        let info = probe_video(&tools, path)?;
        let size = decode_size(info.width, info.height, options.decode_width);
        let poster = decode_frame_blocking(&tools, path, 0.0, size).map_err(|error| SourceError::Probe {
            path: path.display().to_string(),
            reason: error.to_string(),
        })?;
        tracing::info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            duration = info.duration,
            fps = info.fps,
            decode_width = size.0,
            decode_height = size.1,
            "opened video source"
        );
        Ok(Self {
            path: path.to_path_buf(),
            tools,
            info,
            size,
            looping: options.looping,
            clock: PlaybackClock::new(info.duration, options.looping),
            stream: None,
            frame: Some(poster),
            exhausted: false,
        })
    }

    pub fn decode_size(&self) -> (u32, u32) {
        self.size
    }

    fn ensure_stream(&mut self) -> Result<(), SourceError> {
        if self.stream.is_none() {
            let start = self.clock.now();
            let mut stream = FrameStream::spawn(&self.tools, &self.path, start, self.size, self.looping)?;
            stream.start_time = self.clock.unwrapped();
            self.stream = Some(stream);
        }
        Ok(())
    }

    /// Pulls every frame that is due by now, keeping the latest.
    fn drain_due_frames(&mut self) -> Result<(), SourceError> {
        let fps = self.info.fps;
        let now = self.clock.unwrapped();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let due = ((now - stream.start_time).max(0.0) * fps).floor() as u64 + 1;
        while stream.frames_taken < due {
            match stream.receiver.try_recv() {
                Ok(rgba) => {
                    stream.frames_taken += 1;
                    self.frame = Some(SourceFrame::new(self.size.0, self.size.1, rgba)?);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.looping {
                        self.exhausted = true;
                    }
                    self.stream = None;
                    break;
                }
            }
        }
        Ok(())
    }
}

impl VideoSource for FfmpegSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn play(&mut self) -> Result<(), SourceError> {
        if self.is_ended() {
            self.stream = None;
            self.exhausted = false;
            self.clock.seek(0.0);
        }
        self.clock.play();
        if let Err(error) = self.ensure_stream() {
            self.clock.pause();
            return Err(error);
        }
        Ok(())
    }

    fn pause(&mut self) {
        self.clock.pause();
    }

    fn is_paused(&self) -> bool {
        !self.clock.is_playing()
    }

    fn is_ended(&self) -> bool {
        self.exhausted || self.clock.is_finished()
    }

    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    async fn seek(&mut self, time: f64) -> Result<(), SourceError> {
        let time = time.clamp(0.0, self.info.duration);
        self.stream = None;
        let frame = decode_frame(&self.tools, &self.path, time, self.size).await?;
        self.frame = Some(frame);
        self.exhausted = false;
        self.clock.seek(time);
        Ok(())
    }

    fn current_frame(&mut self) -> Result<Option<&SourceFrame>, SourceError> {
        if self.clock.is_playing() && !self.is_ended() {
            self.ensure_stream()?;
            self.drain_due_frames()?;
        }
        Ok(self.frame.as_ref())
    }
}

/// Any input the deck can open: a video file, or a still picture shown for
/// a fixed duration.
pub enum MediaSource {
    Video(FfmpegSource),
    Still(StillImageSource),
}

impl MediaSource {
    /// Still pictures are decoded with the `image` crate and do not need
    /// ffmpeg; anything else goes through ffprobe.
    pub fn open(
        tools: &FfmpegTools,
        path: &Path,
        options: DecodeOptions,
        still_duration: f64,
    ) -> Result<Self, SourceError> {
        if is_still_image(path) {
            tracing::info!(path = %path.display(), duration = still_duration, "opened still image source");
            return Ok(Self::Still(StillImageSource::open(path, still_duration, options.looping)?));
        }
        Ok(Self::Video(FfmpegSource::open(tools.clone(), path, options)?))
    }
}

impl VideoSource for MediaSource {
    fn info(&self) -> SourceInfo {
        match self {
            Self::Video(source) => source.info(),
            Self::Still(source) => source.info(),
        }
    }

    fn play(&mut self) -> Result<(), SourceError> {
        match self {
            Self::Video(source) => source.play(),
            Self::Still(source) => source.play(),
        }
    }

    fn pause(&mut self) {
        match self {
            Self::Video(source) => source.pause(),
            Self::Still(source) => source.pause(),
        }
    }

    fn is_paused(&self) -> bool {
        match self {
            Self::Video(source) => source.is_paused(),
            Self::Still(source) => source.is_paused(),
        }
    }

    fn is_ended(&self) -> bool {
        match self {
            Self::Video(source) => source.is_ended(),
            Self::Still(source) => source.is_ended(),
        }
    }

    fn current_time(&self) -> f64 {
        match self {
            Self::Video(source) => source.current_time(),
            Self::Still(source) => source.current_time(),
        }
    }

    async fn seek(&mut self, time: f64) -> Result<(), SourceError> {
        match self {
            Self::Video(source) => source.seek(time).await,
            Self::Still(source) => source.seek(time).await,
        }
    }

    fn current_frame(&mut self) -> Result<Option<&SourceFrame>, SourceError> {
        match self {
            Self::Video(source) => source.current_frame(),
            Self::Still(source) => source.current_frame(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_output_prefers_stream_values() {
        let json = br#"{
            "streams": [
                {"codec_type": "audio", "duration": "9.0"},
                {"codec_type": "video", "width": 1920, "height": 1080,
                 "avg_frame_rate": "30000/1001", "r_frame_rate": "30/1", "duration": "2.5"}
            ],
            "format": {"duration": "3.0"}
        }"#;
        let info = parse_probe_output(json).expect("probe");
        assert_eq!((info.width, info.height), (1920, 1080));
        assert!((info.fps - 29.97).abs() < 0.01);
        assert_eq!(info.duration, 2.5);
    }

    #[test]
    fn probe_output_falls_back_to_format_duration() {
        let json = br#"{
            "streams": [{"codec_type": "video", "width": 640, "height": 360, "avg_frame_rate": "0/0", "r_frame_rate": "25/1"}],
            "format": {"duration": "4.0"}
        }"#;
        let info = parse_probe_output(json).expect("probe");
        assert_eq!(info.fps, 25.0);
        assert_eq!(info.duration, 4.0);
    }

    #[test]
    fn probe_without_video_is_rejected() {
        let json = br#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "1.0"}}"#;
        assert_eq!(
            parse_probe_output(json).expect_err("no video"),
            "no video stream found"
        );
    }

    #[test]
    fn rates_parse_as_rationals() {
        assert_eq!(parse_rate("25/1"), Some(25.0));
        assert_eq!(parse_rate("24"), Some(24.0));
        assert_eq!(parse_rate("0/0"), None);
    }

    #[test]
    fn seeks_past_the_last_frame_fall_back_to_the_tail() {
        let at = DecodeAnchor::At(1.9667);
        assert_eq!(at.pick(Vec::new(), 16), None);
        assert_eq!(at.pick(vec![0; 10], 16), None);
        let tail = at.fallback().expect("fallback");
        assert_eq!(tail, DecodeAnchor::Tail(TAIL_WINDOW_SECS));
        assert_eq!(tail.fallback(), None);
    }

    #[test]
    fn tail_decode_keeps_the_last_complete_frame() {
        let mut stdout = vec![1; 4];
        stdout.extend([2; 4]);
        stdout.extend([3; 2]);
        assert_eq!(DecodeAnchor::Tail(1.0).pick(stdout.clone(), 4), Some(vec![2; 4]));
        assert_eq!(DecodeAnchor::At(0.5).pick(stdout, 4), Some(vec![1; 4]));
    }

    #[test]
    fn tail_decode_reads_from_the_end_without_a_frame_limit() {
        let args = DecodeAnchor::Tail(1.0).args(Path::new("clip.mp4"), (64, 36));
        let args: Vec<String> = args.iter().map(|arg| arg.to_string_lossy().into_owned()).collect();
        assert!(args.windows(2).any(|pair| pair == ["-sseof", "-1.000000000"]));
        assert!(!args.iter().any(|arg| arg == "-frames:v"));

        let args = DecodeAnchor::At(2.0).args(Path::new("clip.mp4"), (64, 36));
        let args: Vec<String> = args.iter().map(|arg| arg.to_string_lossy().into_owned()).collect();
        assert!(args.windows(2).any(|pair| pair == ["-ss", "2.000000000"]));
        assert!(args.windows(2).any(|pair| pair == ["-frames:v", "1"]));
        assert!(args.windows(2).any(|pair| pair == ["-s", "64x36"]));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abandoned_seek_decode_kills_its_child() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("pid");
        let script = dir.path().join("stalled-ffmpeg");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
        )
        .expect("script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        let tools = FfmpegTools {
            ffmpeg: script,
            ffprobe: PathBuf::from("ffprobe"),
            mode_label: "test",
        };

        let seek = decode_frame(&tools, Path::new("clip.mp4"), 1.0, (4, 4));
        let timed_out = tokio::time::timeout(Duration::from_millis(500), seek).await;
        assert!(timed_out.is_err());

        let pid = std::fs::read_to_string(&pid_file).expect("pid").trim().to_owned();
        let gone = |pid: &str| match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')),
        };
        let mut stopped = false;
        for _ in 0..100 {
            if gone(&pid) {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(stopped, "ffmpeg child {pid} still running");
    }

    #[test]
    fn decode_size_caps_width_and_keeps_aspect() {
        assert_eq!(decode_size(1920, 1080, 640), (640, 360));
        assert_eq!(decode_size(320, 240, 640), (320, 240));
        assert_eq!(decode_size(5000, 1, 640), (640, 1));
    }
}
