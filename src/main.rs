use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ascii_deck::ascii_capture::{
    timestamped_file_name, write_unique, FrameAccumulator, StreamCapture, DEFAULT_EXPORT_FILE,
    EXPORT_FORMATS, STREAM_FORMATS,
};
use ascii_deck::ascii_ramp::Ramp;
use ascii_deck::ascii_sampler::SampleFilter;
use ascii_deck::ascii_stage::{AsciiStage, StageSettings};
use ascii_deck::config::{
    AsciiConfig, ContainerPreference, DeckConfig, DEFAULT_CAPTURE_FPS, DEFAULT_CELL_SCALE,
    DEFAULT_DECODE_WIDTH, DEFAULT_EXPORT_FPS, DEFAULT_FONT_SIZE, DEFAULT_REFRESH_HZ,
    DEFAULT_SEEK_TIMEOUT_MS,
};
use ascii_deck::decoding::{DecodeOptions, MediaSource};
use ascii_deck::encoding::{FfmpegBackend, FfmpegMode, FfmpegTools, VideoEncoderBackend};
use ascii_deck::error::PlaybackError;
use ascii_deck::export::{abort_pair, run_batch_export, BatchOptions, BatchProducer};
use ascii_deck::playback::{CaptureFactory, LiveCommand, LiveHandle, LiveSession, SessionOptions};
use ascii_deck::preview::TerminalPreview;
use ascii_deck::source::VideoSource;

const PREVIEW_MAX_FPS: u32 = 30;

#[derive(Debug, Parser)]
#[command(name = "ascii-deck")]
#[command(version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("ASCII_DECK_GIT_HASH"), ")"))]
#[command(about = "Play video files as ASCII art, record the output, or export it frame by frame")]
struct Cli {
    /// Enable verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// YAML preset file; command-line flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Where to find ffmpeg and ffprobe
    #[arg(long, value_enum, default_value_t = FfmpegMode::Auto, global = true)]
    ffmpeg: FfmpegMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct RenderArgs {
    /// Character columns
    #[arg(long)]
    width: Option<u32>,

    #[arg(long, allow_hyphen_values = true)]
    contrast: Option<f32>,

    #[arg(long, overrides_with = "no_invert")]
    invert: bool,

    /// Turn inversion off even when the preset file enables it
    #[arg(long, overrides_with = "invert")]
    no_invert: bool,

    /// Per-cell color instead of the green phosphor
    #[arg(long, overrides_with = "no_color")]
    color: bool,

    #[arg(long, overrides_with = "color")]
    no_color: bool,

    /// Ramp preset (short, standard, blocks) or a literal glyph string
    #[arg(long)]
    ramp: Option<String>,

    #[arg(long, value_enum, default_value_t = SampleFilter::Area)]
    filter: SampleFilter,

    /// Built-in glyph cell multiplier (6x10 pixels per unit)
    #[arg(long)]
    cell_scale: Option<u32>,

    /// TTF/OTF font to draw glyphs with instead of the built-in atlas
    #[arg(long)]
    font: Option<PathBuf>,

    #[arg(long)]
    font_size: Option<f32>,

    /// Maximum decode width in pixels
    #[arg(long)]
    decode_width: Option<u32>,

    /// Seconds a still picture plays for
    #[arg(long, default_value_t = 5.0)]
    still_duration: f64,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Play a video live in the terminal, optionally recording the output
    Play {
        input: PathBuf,
        #[command(flatten)]
        render: RenderArgs,
        #[arg(long = "loop")]
        looping: bool,
        /// Start stream capture with the first frame
        #[arg(long)]
        record: bool,
        #[arg(long, value_enum)]
        container: Option<ContainerPreference>,
        #[arg(long)]
        capture_fps: Option<u32>,
        #[arg(long)]
        refresh_hz: Option<u32>,
        /// Directory for captures and snapshots
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Wait for a play command instead of starting immediately
        #[arg(long)]
        paused: bool,
        #[arg(long)]
        no_preview: bool,
        /// Read commands from stdin: p, r, s, snap, text, q
        #[arg(long)]
        controls: bool,
    },
    /// Render every frame at a fixed rate into a video file
    Export {
        input: PathBuf,
        #[command(flatten)]
        render: RenderArgs,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        #[arg(long)]
        fps: Option<u32>,
        #[arg(long)]
        seek_timeout_ms: Option<u64>,
        #[arg(long, value_enum)]
        container: Option<ContainerPreference>,
    },
    /// Render one frame to a PNG
    Snapshot {
        input: PathBuf,
        #[command(flatten)]
        render: RenderArgs,
        /// Source time in seconds
        #[arg(long, default_value_t = 0.0)]
        at: f64,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Print one frame as plain text
    Text {
        input: PathBuf,
        #[command(flatten)]
        render: RenderArgs,
        #[arg(long, default_value_t = 0.0)]
        at: f64,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Print source dimensions, duration and frame rate
    Probe {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let deck = match &cli.config {
        Some(path) => DeckConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DeckConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run(cli.command, cli.ffmpeg, &deck))
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ascii_deck={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands, mode: FfmpegMode, deck: &DeckConfig) -> Result<()> {
    match command {
        Commands::Play {
            input,
            render,
            looping,
            record,
            container,
            capture_fps,
            refresh_hz,
            output_dir,
            paused,
            no_preview,
            controls,
        } => {
            let settings = Resolved::new(deck, &render, looping || deck.looping.unwrap_or(false))?;
            let play = PlayOptions {
                record,
                container: container.or(deck.capture.container).unwrap_or_default(),
                capture_fps: capture_fps.or(deck.capture.fps).unwrap_or(DEFAULT_CAPTURE_FPS),
                session: SessionOptions {
                    refresh_hz: refresh_hz
                        .or(deck.capture.refresh_hz)
                        .unwrap_or(DEFAULT_REFRESH_HZ),
                    autoplay: !paused,
                    record_on_start: record,
                    exit_on_end: !controls,
                    output_dir,
                },
                preview: !no_preview,
                controls,
            };
            run_play(mode, &input, settings, play).await
        }
        Commands::Export {
            input,
            render,
            output,
            fps,
            seek_timeout_ms,
            container,
        } => {
            let settings = Resolved::new(deck, &render, false)?;
            let options = BatchOptions {
                fps: fps.or(deck.export.fps).unwrap_or(DEFAULT_EXPORT_FPS),
                seek_timeout: Duration::from_millis(
                    seek_timeout_ms
                        .or(deck.export.seek_timeout_ms)
                        .unwrap_or(DEFAULT_SEEK_TIMEOUT_MS),
                ),
            };
            let preference = container.or(deck.capture.container).unwrap_or_default();
            run_export(mode, &input, settings, options, preference, output).await
        }
        Commands::Snapshot {
            input,
            render,
            at,
            output,
        } => {
            let settings = Resolved::new(deck, &render, false)?;
            let stage = render_single(mode, &input, &settings, at).await?;
            let png = stage.snapshot_png()?;
            let path =
                output.unwrap_or_else(|| PathBuf::from(timestamped_file_name("ascii-snapshot", "png")));
            write_file(&path, &png)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Commands::Text {
            input,
            render,
            at,
            output,
        } => {
            let settings = Resolved::new(deck, &render, false)?;
            let stage = render_single(mode, &input, &settings, at).await?;
            let text = stage.current_text();
            match output {
                Some(path) => {
                    write_file(&path, text.as_bytes())?;
                    println!("Wrote {}", path.display());
                }
                None => println!("{text}"),
            }
            Ok(())
        }
        Commands::Probe { input, json } => run_probe(mode, &input, json),
    }
}

/// `--x` / `--no-x` pair; `None` leaves the preset value alone.
fn switch(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (false, true) => Some(false),
        (false, false) => None,
    }
}

/// Flags layered over the preset file.
struct Resolved {
    ascii: AsciiConfig,
    stage: StageSettings,
    decode: DecodeOptions,
    still_duration: f64,
}

impl Resolved {
    fn new(deck: &DeckConfig, args: &RenderArgs, looping: bool) -> Result<Self> {
        let mut ascii = deck.ascii();
        if let Some(width) = args.width {
            ascii.width = width;
        }
        if let Some(contrast) = args.contrast {
            ascii.contrast = contrast;
        }
        if let Some(inverted) = switch(args.invert, args.no_invert) {
            ascii.inverted = inverted;
        }
        if let Some(color) = switch(args.color, args.no_color) {
            ascii.color = color;
        }
        ascii.validate()?;

        let ramp = match &args.ramp {
            Some(raw) => Ramp::resolve(raw)?,
            None => deck.ramp()?,
        };
        let cell_scale = args.cell_scale.or(deck.cell_scale).unwrap_or(DEFAULT_CELL_SCALE);
        let font_size = args.font_size.or(deck.font_size).unwrap_or(DEFAULT_FONT_SIZE);
        if cell_scale == 0 {
            bail!("--cell-scale must be > 0");
        }
        if !font_size.is_finite() || font_size <= 0.0 {
            bail!("--font-size must be > 0");
        }
        if !args.still_duration.is_finite() || args.still_duration <= 0.0 {
            bail!("--still-duration must be > 0");
        }

        Ok(Self {
            ascii,
            stage: StageSettings {
                ramp,
                filter: args.filter,
                cell_scale,
                font: args.font.clone().or_else(|| deck.font.clone()),
                font_size,
            },
            decode: DecodeOptions {
                decode_width: args
                    .decode_width
                    .or(deck.decode_width)
                    .unwrap_or(DEFAULT_DECODE_WIDTH)
                    .max(1),
                looping,
            },
            still_duration: args.still_duration,
        })
    }
}

fn open_source(tools: &FfmpegTools, input: &Path, settings: &Resolved) -> Result<MediaSource> {
    MediaSource::open(tools, input, settings.decode, settings.still_duration)
        .with_context(|| format!("failed to open {}", input.display()))
}

struct PlayOptions {
    record: bool,
    container: ContainerPreference,
    capture_fps: u32,
    session: SessionOptions,
    preview: bool,
    controls: bool,
}

async fn run_play(
    mode: FfmpegMode,
    input: &Path,
    settings: Resolved,
    options: PlayOptions,
) -> Result<()> {
    let tools = FfmpegTools::resolve(mode)?;
    let source = open_source(&tools, input, &settings)?;
    let stage = AsciiStage::from_settings(&settings.stage)?;
    if options.capture_fps == 0 {
        bail!("--capture-fps must be > 0");
    }

    let capture_fps = options.capture_fps;
    let preference = options.container;
    let factory: CaptureFactory = Box::new(move || {
        let backend = FfmpegBackend::negotiate(tools.clone(), &STREAM_FORMATS, preference)?;
        Ok(StreamCapture::new(Box::new(backend), capture_fps))
    });

    let output_dir = options.session.output_dir.clone();
    let (mut session, handle) =
        LiveSession::new(source, stage, settings.ascii, options.session, Some(factory));
    if options.preview {
        session.set_preview(TerminalPreview::stdout(PREVIEW_MAX_FPS));
    }
    if options.record {
        info!("recording from the first rendered frame");
    }

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted; stopping playback");
            let _ = interrupt.stop().await;
        }
    });
    if options.controls {
        spawn_stdin_controls(handle.clone(), output_dir);
    }

    let summary = session.run().await.context("playback failed")?;
    info!(
        frames = summary.frames_rendered,
        captures = summary.artifacts.len(),
        capture_failures = summary.capture_failures,
        "playback finished"
    );
    for path in &summary.artifacts {
        println!("Saved {}", path.display());
    }
    Ok(())
}

fn request<T>(
    handle: &LiveHandle,
    command: impl FnOnce(oneshot::Sender<T>) -> LiveCommand,
) -> Result<T, PlaybackError> {
    let (reply, response) = oneshot::channel();
    handle.send_blocking(command(reply))?;
    response.blocking_recv().map_err(|_| PlaybackError::SessionClosed)
}

fn spawn_stdin_controls(handle: LiveHandle, output_dir: PathBuf) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let result = match line.trim() {
                "" | "p" | "pause" | "play" => handle.send_blocking(LiveCommand::TogglePause),
                "r" | "record" => request(&handle, LiveCommand::StartCapture).and_then(|started| started),
                "s" | "stop-record" => request(&handle, LiveCommand::StopCapture)
                    .and_then(|saved| saved)
                    .map(|saved| match saved {
                        Some(path) => info!(path = %path.display(), "capture saved"),
                        None => info!("no capture was running"),
                    }),
                "snap" => request(&handle, LiveCommand::Snapshot)
                    .and_then(|png| png)
                    .and_then(|png| {
                        let path = write_unique(&output_dir, "ascii-snapshot", "png", &png)
                            .map_err(|error| PlaybackError::Capture(error.into()))?;
                        info!(path = %path.display(), "snapshot saved");
                        Ok(())
                    }),
                "text" => request(&handle, LiveCommand::CurrentText).and_then(|text| {
                    let path = write_unique(&output_dir, "ascii-text", "txt", text.as_bytes())
                        .map_err(|error| PlaybackError::Capture(error.into()))?;
                    info!(path = %path.display(), "text frame saved");
                    Ok(())
                }),
                "q" | "quit" => {
                    let _ = handle.send_blocking(LiveCommand::Stop);
                    break;
                }
                other => {
                    warn!(command = other, "unknown control (p, r, s, snap, text, q)");
                    Ok(())
                }
            };
            match result {
                Ok(()) => {}
                Err(PlaybackError::SessionClosed) => break,
                Err(error) => warn!(%error, "control command failed"),
            }
        }
    });
}

async fn run_export(
    mode: FfmpegMode,
    input: &Path,
    settings: Resolved,
    options: BatchOptions,
    preference: ContainerPreference,
    output: Option<PathBuf>,
) -> Result<()> {
    let tools = FfmpegTools::resolve(mode)?;
    let backend = FfmpegBackend::negotiate(tools.clone(), &EXPORT_FORMATS, preference)
        .context("no encoder available for export")?;
    let container = backend.format().container;
    let output = output
        .unwrap_or_else(|| Path::new(DEFAULT_EXPORT_FILE).with_extension(container.extension()));

    let source = open_source(&tools, input, &settings)?;
    let stage = AsciiStage::from_settings(&settings.stage)?;
    let (abort, signal) = abort_pair();
    let mut producer =
        BatchProducer::new(source, stage, settings.ascii, options)?.with_abort(signal);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });

    info!(
        input = %input.display(),
        frames = producer.total_frames(),
        fps = options.fps,
        "starting export"
    );
    let mut accumulator = FrameAccumulator::new(Box::new(backend), options.fps);
    let artifact = run_batch_export(&mut producer, &mut accumulator)
        .await
        .context("export failed")?;
    artifact.write_to(&output)?;
    println!(
        "Wrote {} ({} frames, {})",
        output.display(),
        artifact.frame_count,
        container.mime_type()
    );
    Ok(())
}

/// Seeks to `at` and renders exactly one frame.
async fn render_single(
    mode: FfmpegMode,
    input: &Path,
    settings: &Resolved,
    at: f64,
) -> Result<AsciiStage> {
    if !at.is_finite() || at < 0.0 {
        bail!("--at must be a non-negative number of seconds");
    }
    let tools = FfmpegTools::resolve(mode)?;
    let mut source = open_source(&tools, input, settings)?;
    let mut stage = AsciiStage::from_settings(&settings.stage)?;
    let at = at.min(source.info().duration);
    let waited = Duration::from_millis(DEFAULT_SEEK_TIMEOUT_MS);
    tokio::time::timeout(waited, source.seek(at))
        .await
        .with_context(|| format!("seek to {at:.3}s timed out"))?
        .with_context(|| format!("seek to {at:.3}s failed"))?;
    let frame = source
        .current_frame()?
        .with_context(|| format!("no frame decoded at {at:.3}s"))?;
    stage.render_frame(frame, &settings.ascii, at)?;
    Ok(stage)
}

fn run_probe(mode: FfmpegMode, input: &Path, json: bool) -> Result<()> {
    let tools = FfmpegTools::resolve(mode)?;
    let source = MediaSource::open(&tools, input, DecodeOptions::default(), 0.0)
        .with_context(|| format!("failed to probe {}", input.display()))?;
    let info = source.info();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!(
            "{}x{}, {:.3} s, {:.2} fps",
            info.width, info.height, info.duration, info.fps
        );
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}
