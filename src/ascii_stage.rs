use std::path::PathBuf;

use crate::ascii_frame::AsciiFrame;
use crate::ascii_ramp::Ramp;
use crate::ascii_render::{FrameRenderer, OutputSurface};
use crate::ascii_renderer::{BitmapPainter, FontPainter, GlyphPainter};
use crate::ascii_sampler::{GridDims, GridSampler, SampleFilter};
use crate::config::{AsciiConfig, DEFAULT_CELL_SCALE, DEFAULT_FONT_SIZE};
use crate::error::RenderError;
use crate::source::SourceFrame;

#[derive(Debug, Clone)]
pub struct StageSettings {
    pub ramp: Ramp,
    pub filter: SampleFilter,
    pub cell_scale: u32,
    pub font: Option<PathBuf>,
    pub font_size: f32,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            ramp: Ramp::standard(),
            filter: SampleFilter::Area,
            cell_scale: DEFAULT_CELL_SCALE,
            font: None,
            font_size: DEFAULT_FONT_SIZE,
        }
    }
}

/// Sampler, renderer and output surface for one pipeline. Whichever driver
/// holds the stage owns the surface; capture sinks only read it.
pub struct AsciiStage {
    sampler: GridSampler,
    renderer: FrameRenderer,
    surface: OutputSurface,
    frames_rendered: u64,
    last_timestamp: Option<f64>,
}

impl AsciiStage {
    pub fn new(painter: Box<dyn GlyphPainter>, ramp: Ramp, filter: SampleFilter) -> Result<Self, RenderError> {
        let renderer = FrameRenderer::new(painter, ramp);
        let (cell_width, cell_height) = renderer.cell_size();
        Ok(Self {
            sampler: GridSampler::new(filter),
            renderer,
            surface: OutputSurface::new(cell_width, cell_height)?,
            frames_rendered: 0,
            last_timestamp: None,
        })
    }

    pub fn from_settings(settings: &StageSettings) -> Result<Self, RenderError> {
        let painter: Box<dyn GlyphPainter> = match &settings.font {
            Some(path) => {
                tracing::debug!(font = %path.display(), size = settings.font_size, "loading glyph font");
                Box::new(FontPainter::from_path(path, settings.font_size)?)
            }
            None => Box::new(BitmapPainter::new(settings.cell_scale)),
        };
        Self::new(painter, settings.ramp.clone(), settings.filter)
    }

    /// One sampling and render pass. `config` is read once for the whole
    /// frame.
    pub fn render_frame(
        &mut self,
        frame: &SourceFrame,
        config: &AsciiConfig,
        timestamp: f64,
    ) -> Result<(), RenderError> {
        let grid = self.sampler.sample(frame, config.width);
        self.renderer.render(grid, config, &mut self.surface)?;
        self.frames_rendered += 1;
        self.last_timestamp = Some(timestamp);
        Ok(())
    }

    pub fn surface(&self) -> &OutputSurface {
        &self.surface
    }

    pub fn renderer(&self) -> &FrameRenderer {
        &self.renderer
    }

    pub fn set_ramp(&mut self, ramp: Ramp) {
        self.renderer.set_ramp(ramp);
    }

    pub fn dims(&self) -> GridDims {
        self.renderer.dims()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    /// PNG of the current output frame.
    pub fn snapshot_png(&self) -> Result<Vec<u8>, RenderError> {
        self.surface.to_png()
    }

    pub fn current_frame_text(&self) -> AsciiFrame {
        let frame = self.renderer.text_frame();
        match self.last_timestamp {
            Some(timestamp) => frame.with_timestamp(timestamp),
            None => frame,
        }
    }

    /// Current glyph grid, rows separated by newlines.
    pub fn current_text(&self) -> String {
        self.renderer.text_frame().to_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_tracks_frames_and_text() {
        let mut stage = AsciiStage::from_settings(&StageSettings {
            ramp: Ramp::short(),
            cell_scale: 1,
            ..StageSettings::default()
        })
        .expect("stage");
        assert_eq!(stage.current_text(), "");

        let config = AsciiConfig {
            width: 40,
            contrast: 0.0,
            ..AsciiConfig::default()
        };
        let frame = SourceFrame::solid(80, 8, [0, 0, 0]);
        stage.render_frame(&frame, &config, 0.5).expect("render");

        assert_eq!(stage.frames_rendered(), 1);
        assert_eq!(stage.dims(), GridDims { cols: 40, rows: 2 });
        assert_eq!(stage.current_text(), format!("{0}\n{0}", " ".repeat(40)));
        assert_eq!(stage.current_frame_text().timestamp, Some(0.5));
        assert!(stage.snapshot_png().expect("png").starts_with(b"\x89PNG"));
    }

    #[test]
    fn missing_font_file_is_a_render_error() {
        let result = AsciiStage::from_settings(&StageSettings {
            font: Some(PathBuf::from("/nonexistent/font.ttf")),
            ..StageSettings::default()
        });
        assert!(matches!(result, Err(RenderError::Font(_))));
    }
}
