use std::io::Write;
use std::time::Duration;

use tokio::time::Instant;

use crate::ascii_render::{RenderedCell, MONO_FOREGROUND};
use crate::ascii_stage::AsciiStage;

const CURSOR_HOME: &str = "\x1b[H";
const CLEAR_SCREEN: &str = "\x1b[2J";
const RESET: &str = "\x1b[0m";

/// Mirrors the character grid into a terminal with ANSI truecolor codes.
pub struct TerminalPreview {
    out: Box<dyn Write + Send>,
    min_interval: Duration,
    last_present: Option<Instant>,
    cleared: bool,
}

impl TerminalPreview {
    pub fn new(out: Box<dyn Write + Send>, max_fps: u32) -> Self {
        Self {
            out,
            min_interval: Duration::from_secs_f64(1.0 / f64::from(max_fps.max(1))),
            last_present: None,
            cleared: false,
        }
    }

    pub fn stdout(max_fps: u32) -> Self {
        Self::new(Box::new(std::io::stdout()), max_fps)
    }

    /// Writes the stage's current grid unless the last write was too recent.
    pub fn present(&mut self, stage: &AsciiStage, color: bool) -> std::io::Result<()> {
        let now = Instant::now();
        if let Some(last) = self.last_present {
            if now.duration_since(last) < self.min_interval {
                return Ok(());
            }
        }
        self.last_present = Some(now);

        let renderer = stage.renderer();
        let mut frame = String::new();
        if !self.cleared {
            frame.push_str(CLEAR_SCREEN);
            self.cleared = true;
        }
        frame.push_str(CURSOR_HOME);
        frame.push_str(&ansi_frame(renderer.cells(), renderer.dims().cols as usize, color));
        self.out.write_all(frame.as_bytes())?;
        self.out.flush()
    }

    pub fn finish(&mut self) -> std::io::Result<()> {
        self.out.write_all(RESET.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

fn color_code(rgb: [u8; 3]) -> String {
    format!("\x1b[38;2;{};{};{}m", rgb[0], rgb[1], rgb[2])
}

/// ANSI text for one grid; the color escape is emitted only when it
/// changes.
pub fn ansi_frame(cells: &[RenderedCell], cols: usize, color: bool) -> String {
    if cols == 0 {
        return String::new();
    }
    let mut out = String::with_capacity(cells.len() * 2);
    if !color {
        out.push_str(&color_code(MONO_FOREGROUND));
    }
    for row in cells.chunks(cols) {
        let mut current: Option<[u8; 3]> = None;
        for cell in row {
            if color && current != Some(cell.color) {
                out.push_str(&color_code(cell.color));
                current = Some(cell.color);
            }
            out.push(cell.glyph);
        }
        out.push_str("\r\n");
    }
    out.push_str(RESET);
    out
}
