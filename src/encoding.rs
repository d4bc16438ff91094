use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::ascii_capture::{CaptureFormat, Container};
use crate::config::ContainerPreference;
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FfmpegMode {
    #[default]
    Auto,
    System,
    Sidecar,
}

/// Resolved ffmpeg/ffprobe executables.
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub mode_label: &'static str,
}

impl FfmpegTools {
    pub fn system() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            mode_label: "system",
        }
    }

    pub fn resolve(mode: FfmpegMode) -> Result<Self, CaptureError> {
        match mode {
            FfmpegMode::System => Ok(Self::system()),
            FfmpegMode::Auto => {
                let system = Self::system();
                if system.is_available() {
                    return Ok(system);
                }
                #[cfg(feature = "sidecar_ffmpeg")]
                {
                    tracing::info!("system ffmpeg not found, falling back to sidecar");
                    Self::sidecar()
                }
                #[cfg(not(feature = "sidecar_ffmpeg"))]
                {
                    Ok(system)
                }
            }
            FfmpegMode::Sidecar => Self::sidecar(),
        }
    }

    #[cfg(feature = "sidecar_ffmpeg")]
    fn sidecar() -> Result<Self, CaptureError> {
        let ffmpeg = ffmpeg_sidecar::paths::ffmpeg_path();
        if !ffmpeg.exists() {
            tracing::info!(path = %ffmpeg.display(), "downloading ffmpeg sidecar binary");
            ffmpeg_sidecar::download::auto_download().map_err(|error| {
                CaptureError::FfmpegUnavailable(format!(
                    "failed to auto-download ffmpeg sidecar binary: {error}"
                ))
            })?;
        }
        Ok(Self {
            ffmpeg,
            ffprobe: ffmpeg_sidecar::ffprobe::ffprobe_path(),
            mode_label: "sidecar",
        })
    }

    #[cfg(not(feature = "sidecar_ffmpeg"))]
    fn sidecar() -> Result<Self, CaptureError> {
        Err(CaptureError::FfmpegUnavailable(
            "sidecar mode requested but ascii-deck was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`.".to_owned(),
        ))
    }

    pub fn is_available(&self) -> bool {
        command_available(&self.ffmpeg, "-version")
    }

    /// Names of the video encoders compiled into this ffmpeg.
    pub fn available_encoders(&self) -> Result<Vec<String>, CaptureError> {
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .output()
            .map_err(|error| self.spawn_error(error))?;
        if !output.status.success() {
            return Err(CaptureError::FfmpegUnavailable(format!(
                "`{} -encoders` exited with {}",
                self.ffmpeg.display(),
                output.status
            )));
        }
        Ok(parse_encoder_list(&String::from_utf8_lossy(&output.stdout)))
    }

    fn spawn_error(&self, error: std::io::Error) -> CaptureError {
        if error.kind() == ErrorKind::NotFound {
            CaptureError::FfmpegUnavailable(format!(
                "ffmpeg executable not found (mode={}, resolved_path={}). Install ffmpeg (system mode) or use sidecar mode with `--features sidecar_ffmpeg`.",
                self.mode_label,
                self.ffmpeg.display()
            ))
        } else {
            CaptureError::Io(error)
        }
    }
}

/// Extracts video encoder names from `ffmpeg -encoders` output.
pub fn parse_encoder_list(text: &str) -> Vec<String> {
    text.lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            flags.starts_with('V').then(|| name.to_owned())
        })
        .collect()
}

/// First candidate whose codec is available, restricted to the preferred
/// container unless the preference is `Auto`.
pub fn negotiate(
    available: &[String],
    candidates: &[CaptureFormat],
    preference: ContainerPreference,
) -> Result<CaptureFormat, CaptureError> {
    let allowed = |format: &CaptureFormat| match preference {
        ContainerPreference::Auto => true,
        ContainerPreference::Mp4 => format.container == Container::Mp4,
        ContainerPreference::Webm => format.container == Container::Webm,
    };
    let considered = candidates.iter().filter(|format| allowed(format));
    let mut tried = Vec::new();
    for format in considered {
        if available.iter().any(|name| name == format.codec) {
            return Ok(*format);
        }
        tried.push(format.label());
    }
    Err(CaptureError::UnsupportedFormat { tried })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderInput {
    /// Raw RGBA frames of a fixed size.
    RawRgba,
    /// One PNG image per frame.
    Png,
}

/// Accepts encoded or raw frames and returns the finished container bytes.
pub trait FrameWriter: Send {
    fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), CaptureError>;
    fn finish(self: Box<Self>) -> Result<Vec<u8>, CaptureError>;
}

/// Opens frame writers for one negotiated format.
pub trait VideoEncoderBackend: Send {
    fn format(&self) -> CaptureFormat;

    fn open(
        &self,
        input: EncoderInput,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn FrameWriter>, CaptureError>;
}

pub struct FfmpegBackend {
    tools: FfmpegTools,
    format: CaptureFormat,
}

impl FfmpegBackend {
    pub fn new(tools: FfmpegTools, format: CaptureFormat) -> Self {
        Self { tools, format }
    }

    pub fn negotiate(
        tools: FfmpegTools,
        candidates: &[CaptureFormat],
        preference: ContainerPreference,
    ) -> Result<Self, CaptureError> {
        let available = tools.available_encoders()?;
        let format = negotiate(&available, candidates, preference)?;
        tracing::info!(format = %format.label(), ffmpeg = %tools.ffmpeg.display(), "negotiated capture format");
        Ok(Self::new(tools, format))
    }
}

impl VideoEncoderBackend for FfmpegBackend {
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
        let args = ffmpeg_args(input, width, height, fps, self.format);
        let pipe = EncoderPipe::spawn(&self.tools, args, self.format.container)?;
        Ok(Box::new(pipe))
    }
}

/// ffmpeg child fed on stdin from a writer thread; the container comes
/// back on stdout and is collected by a second thread.
pub struct EncoderPipe {
    container: Container,
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    writer: Option<JoinHandle<Result<(), String>>>,
    reader: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    child: Child,
    stderr: Option<JoinHandle<Vec<u8>>>,
    args: Vec<String>,
}

impl EncoderPipe {
    pub fn spawn(
        tools: &FfmpegTools,
        args: Vec<String>,
        container: Container,
    ) -> Result<Self, CaptureError> {
        let mut child = Command::new(&tools.ffmpeg)
            .args(args.iter().map(String::as_str))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| tools.spawn_error(error))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::encoder(container, "failed to capture ffmpeg stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::encoder(container, "failed to capture ffmpeg stdout"))?;
        let stderr = match child.stderr.take() {
            Some(pipe) => Some(
                thread::Builder::new()
                    .name("ascii-deck-encoder-log".to_owned())
                    .spawn(move || drain_tail(pipe, STDERR_TAIL_BYTES))?,
            ),
            None => None,
        };

        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);
        let writer = thread::Builder::new()
            .name(format!("ascii-deck-encoder-{}", tools.mode_label))
            .spawn(move || {
                while let Ok(frame) = receiver.recv() {
                    stdin
                        .write_all(&frame)
                        .map_err(|error| format!("failed to write frame to ffmpeg stdin: {error}"))?;
                }
                stdin
                    .flush()
                    .map_err(|error| format!("failed to flush ffmpeg stdin: {error}"))
            })?;
        let reader = thread::Builder::new()
            .name("ascii-deck-encoder-output".to_owned())
            .spawn(move || {
                let mut bytes = Vec::new();
                stdout.read_to_end(&mut bytes)?;
                Ok(bytes)
            })?;

        Ok(Self {
            container,
            sender: Some(sender),
            writer: Some(writer),
            reader: Some(reader),
            child,
            stderr,
            args,
        })
    }
}

impl FrameWriter for EncoderPipe {
    fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), CaptureError> {
        let sender = self.sender.as_ref().ok_or(CaptureError::Finalized)?;
        sender
            .send(frame)
            .map_err(|_| CaptureError::encoder(self.container, "ffmpeg stopped accepting frames"))
    }

    fn finish(mut self: Box<Self>) -> Result<Vec<u8>, CaptureError> {
        drop(self.sender.take());
        let container = self.container;

        let write_result = match self.writer.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err("ffmpeg writer thread panicked".to_owned())),
            None => Ok(()),
        };
        let status = self.child.wait()?;
        let output = match self.reader.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| CaptureError::encoder(container, "ffmpeg output thread panicked"))??,
            None => Vec::new(),
        };
        let stderr_tail = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .map(|bytes| last_n_chars(&String::from_utf8_lossy(&bytes), 500))
            .unwrap_or_default();

        if !status.success() {
            return Err(CaptureError::encoder(
                container,
                format!(
                    "ffmpeg failed with status {status} (args='{}', stderr_tail='{stderr_tail}')",
                    self.args.join(" ")
                ),
            ));
        }
        write_result.map_err(|reason| CaptureError::encoder(container, reason))?;
        if output.is_empty() {
            return Err(CaptureError::encoder(container, "ffmpeg produced no output"));
        }
        Ok(output)
    }
}

impl Drop for EncoderPipe {
    fn drop(&mut self) {
        if self.sender.is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub fn ffmpeg_args(
    input: EncoderInput,
    width: u32,
    height: u32,
    fps: u32,
    format: CaptureFormat,
) -> Vec<String> {
    let mut args = ffmpeg_input_args(input, width, height, fps);
    args.extend(ffmpeg_codec_args(format.codec));
    args.extend(ffmpeg_container_output_args(format.container));
    args.push("pipe:1".to_owned());
    args
}

pub fn ffmpeg_input_args(input: EncoderInput, width: u32, height: u32, fps: u32) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
    ];
    match input {
        EncoderInput::RawRgba => args.extend([
            "-f".to_owned(),
            "rawvideo".to_owned(),
            "-pix_fmt".to_owned(),
            "rgba".to_owned(),
            "-s:v".to_owned(),
            format!("{width}x{height}"),
            "-r".to_owned(),
            fps.to_string(),
        ]),
        EncoderInput::Png => args.extend([
            "-f".to_owned(),
            "image2pipe".to_owned(),
            "-c:v".to_owned(),
            "png".to_owned(),
            "-framerate".to_owned(),
            fps.to_string(),
        ]),
    }
    args.extend(["-i".to_owned(), "-".to_owned(), "-an".to_owned()]);
    args
}

/// yuv420p needs even dimensions; odd surfaces get a black edge.
pub fn ffmpeg_codec_args(codec: &str) -> Vec<String> {
    let mut args = vec![
        "-vf".to_owned(),
        "pad=ceil(iw/2)*2:ceil(ih/2)*2:0:0:color=black".to_owned(),
        "-c:v".to_owned(),
        codec.to_owned(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
    ];
    let tuning: &[&str] = match codec {
        "libx264" => &["-preset", "veryfast", "-crf", "20"],
        "libopenh264" => &["-b:v", "4M"],
        "libvpx-vp9" => &["-b:v", "0", "-crf", "32", "-deadline", "realtime", "-row-mt", "1"],
        "libvpx" => &["-b:v", "2M", "-deadline", "realtime"],
        _ => &[],
    };
    args.extend(tuning.iter().map(|value| (*value).to_owned()));
    args
}

/// mp4 on a pipe has to be fragmented.
pub fn ffmpeg_container_output_args(container: Container) -> Vec<String> {
    match container {
        Container::Mp4 => vec![
            "-movflags".to_owned(),
            "frag_keyframe+empty_moov".to_owned(),
            "-f".to_owned(),
            "mp4".to_owned(),
        ],
        Container::Webm => vec!["-f".to_owned(), "webm".to_owned()],
    }
}

const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Reads `pipe` until it closes, keeping only the last `keep` bytes, so a
/// chatty child never stalls on a full stderr pipe.
fn drain_tail(mut pipe: impl Read, keep: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => {
                tail.extend_from_slice(&chunk[..read]);
                if tail.len() > keep {
                    tail.drain(..tail.len() - keep);
                }
            }
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    tail
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}

pub fn command_available(path: &Path, probe_arg: &str) -> bool {
    Command::new(path)
        .arg(probe_arg)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
