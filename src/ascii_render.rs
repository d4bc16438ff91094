use std::io::Cursor;

use tiny_skia::{Color, Pixmap};

use crate::ascii_frame::AsciiFrame;
use crate::ascii_ramp::Ramp;
use crate::ascii_renderer::GlyphPainter;
use crate::ascii_sampler::{GridDims, SampleGrid};
use crate::ascii_tone::ToneCurve;
use crate::config::AsciiConfig;
use crate::error::RenderError;

/// Phosphor green used for every cell in monochrome mode.
pub const MONO_FOREGROUND: [u8; 3] = [0x33, 0xff, 0x00];
pub const BACKGROUND: [u8; 3] = [0, 0, 0];

/// Pixel surface that is both the visible output and the capture source.
/// The backing pixmap is reallocated only when its dimensions change.
pub struct OutputSurface {
    pixmap: Pixmap,
    allocations: u64,
}

impl OutputSurface {
    pub fn new(width: u32, height: u32) -> Result<Self, RenderError> {
        Ok(Self {
            pixmap: allocate(width, height)?,
            allocations: 1,
        })
    }

    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    /// How many times the backing pixmap has been allocated.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Returns true when the surface had to be reallocated.
    pub fn ensure_size(&mut self, width: u32, height: u32) -> Result<bool, RenderError> {
        if self.pixmap.width() == width && self.pixmap.height() == height {
            return Ok(false);
        }
        self.pixmap = allocate(width, height)?;
        self.allocations += 1;
        tracing::debug!(width, height, "output surface resized");
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.pixmap.fill(Color::from_rgba8(
            BACKGROUND[0],
            BACKGROUND[1],
            BACKGROUND[2],
            255,
        ));
    }

    /// RGBA bytes. Every pixel is opaque, so premultiplied equals straight.
    pub fn data(&self) -> &[u8] {
        self.pixmap.data()
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.pixmap.data_mut()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = ((y * self.width() + x) * 4) as usize;
        let data = self.data();
        [data[idx], data[idx + 1], data[idx + 2], data[idx + 3]]
    }

    pub fn to_png(&self) -> Result<Vec<u8>, RenderError> {
        let image = image::RgbaImage::from_raw(self.width(), self.height(), self.data().to_vec())
            .ok_or_else(|| RenderError::Snapshot("surface buffer has the wrong length".to_owned()))?;
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|error| RenderError::Snapshot(error.to_string()))?;
        Ok(bytes)
    }
}

fn allocate(width: u32, height: u32) -> Result<Pixmap, RenderError> {
    let mut pixmap =
        Pixmap::new(width, height).ok_or(RenderError::SurfaceAllocation { width, height })?;
    pixmap.fill(Color::from_rgba8(BACKGROUND[0], BACKGROUND[1], BACKGROUND[2], 255));
    Ok(pixmap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedCell {
    pub index: u16,
    pub glyph: char,
    pub color: [u8; 3],
}

/// Turns a sample grid into glyphs on an [`OutputSurface`].
pub struct FrameRenderer {
    painter: Box<dyn GlyphPainter>,
    ramp: Ramp,
    dims: GridDims,
    cells: Vec<RenderedCell>,
}

impl FrameRenderer {
    pub fn new(painter: Box<dyn GlyphPainter>, ramp: Ramp) -> Self {
        Self {
            painter,
            ramp,
            dims: GridDims { cols: 0, rows: 0 },
            cells: Vec::new(),
        }
    }

    pub fn ramp(&self) -> &Ramp {
        &self.ramp
    }

    pub fn set_ramp(&mut self, ramp: Ramp) {
        self.ramp = ramp;
    }

    pub fn cell_size(&self) -> (u32, u32) {
        self.painter.cell_size()
    }

    pub fn surface_size(&self, dims: GridDims) -> (u32, u32) {
        let (cell_width, cell_height) = self.cell_size();
        (dims.cols * cell_width, dims.rows * cell_height)
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    /// Cells of the most recent frame, row-major.
    pub fn cells(&self) -> &[RenderedCell] {
        &self.cells
    }

    pub fn cell(&self, col: u32, row: u32) -> RenderedCell {
        self.cells[(row * self.dims.cols + col) as usize]
    }

    pub fn render(
        &mut self,
        grid: &SampleGrid,
        config: &AsciiConfig,
        surface: &mut OutputSurface,
    ) -> Result<(), RenderError> {
        let dims = grid.dims();
        let (width, height) = self.surface_size(dims);
        surface.ensure_size(width, height)?;
        surface.clear();

        self.cells.clear();
        if self.dims != dims {
            self.dims = dims;
            self.cells.reserve(dims.cell_count());
        }

        let tone = ToneCurve::from_config(config);
        let (cell_width, cell_height) = self.cell_size();
        let frame = surface.data_mut();

        for (idx, sample) in grid.cells().iter().enumerate() {
            let cell_tone = tone.cell_tone(sample[0], sample[1], sample[2]);
            let index = self.ramp.index_for_level(cell_tone.level);
            let glyph = self.ramp.glyph(index);
            let color = if config.color {
                cell_tone.rgb
            } else {
                MONO_FOREGROUND
            };
            self.cells.push(RenderedCell {
                index: index as u16,
                glyph,
                color,
            });

            let col = idx as u32 % dims.cols;
            let row = idx as u32 / dims.cols;
            self.painter.draw_glyph(
                frame,
                width,
                height,
                col * cell_width,
                row * cell_height,
                glyph,
                color,
            );
        }
        Ok(())
    }

    /// Glyph grid of the last frame as plain text, ignoring color.
    pub fn text_frame(&self) -> AsciiFrame {
        AsciiFrame::from_glyphs(
            self.dims.cols as usize,
            self.dims.rows as usize,
            self.cells.iter().map(|cell| cell.glyph),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ascii_renderer::BitmapPainter;
    use crate::ascii_sampler::GridSampler;
    use crate::source::SourceFrame;

    fn renderer() -> FrameRenderer {
        FrameRenderer::new(Box::new(BitmapPainter::new(1)), Ramp::short())
    }

    #[test]
    fn surface_matches_grid_times_cell_size() {
        let mut sampler = GridSampler::default();
        let mut renderer = renderer();
        let mut surface = OutputSurface::new(1, 1).expect("surface");
        let frame = SourceFrame::solid(320, 240, [255, 255, 255]);
        let config = AsciiConfig {
            width: 40,
            ..AsciiConfig::default()
        };
        renderer
            .render(sampler.sample(&frame, config.width), &config, &mut surface)
            .expect("render");
        assert_eq!((surface.width(), surface.height()), (40 * 6, 15 * 10));
    }

    #[test]
    fn surface_is_not_reallocated_for_same_dimensions() {
        let mut sampler = GridSampler::default();
        let mut renderer = renderer();
        let mut surface = OutputSurface::new(1, 1).expect("surface");
        let config = AsciiConfig {
            width: 40,
            ..AsciiConfig::default()
        };
        for shade in [0_u8, 90, 180, 255] {
            let frame = SourceFrame::solid(160, 120, [shade, shade, shade]);
            renderer
                .render(sampler.sample(&frame, config.width), &config, &mut surface)
                .expect("render");
        }
        assert_eq!(surface.allocations(), 2);

        let config = AsciiConfig {
            width: 50,
            ..config
        };
        let frame = SourceFrame::solid(160, 120, [1, 2, 3]);
        renderer
            .render(sampler.sample(&frame, config.width), &config, &mut surface)
            .expect("render");
        assert_eq!(surface.allocations(), 3);
    }

    #[test]
    fn background_is_cleared_between_frames() {
        let mut sampler = GridSampler::default();
        let mut renderer = renderer();
        let mut surface = OutputSurface::new(1, 1).expect("surface");
        let config = AsciiConfig {
            width: 40,
            contrast: 0.0,
            ..AsciiConfig::default()
        };
        let white = SourceFrame::solid(80, 40, [255, 255, 255]);
        renderer
            .render(sampler.sample(&white, 40), &config, &mut surface)
            .expect("render");
        assert!(surface.data().chunks_exact(4).any(|px| px[..3] == MONO_FOREGROUND));

        let black = SourceFrame::solid(80, 40, [0, 0, 0]);
        renderer
            .render(sampler.sample(&black, 40), &config, &mut surface)
            .expect("render");
        assert!(surface.data().chunks_exact(4).all(|px| px == [0, 0, 0, 255]));
    }

    #[test]
    fn color_mode_uses_adjusted_cell_color() {
        let mut sampler = GridSampler::default();
        let mut renderer = renderer();
        let mut surface = OutputSurface::new(1, 1).expect("surface");
        let config = AsciiConfig {
            width: 40,
            contrast: 0.0,
            color: true,
            ..AsciiConfig::default()
        };
        let frame = SourceFrame::solid(80, 40, [250, 120, 40]);
        renderer
            .render(sampler.sample(&frame, 40), &config, &mut surface)
            .expect("render");
        assert!(renderer.cells().iter().all(|cell| cell.color == [250, 120, 40]));
    }

    #[test]
    fn text_frame_lists_rows() {
        let mut sampler = GridSampler::default();
        let mut renderer = renderer();
        let mut surface = OutputSurface::new(1, 1).expect("surface");
        let config = AsciiConfig {
            width: 40,
            contrast: 0.0,
            ..AsciiConfig::default()
        };
        let frame = SourceFrame::solid(80, 20, [255, 255, 255]);
        renderer
            .render(sampler.sample(&frame, 40), &config, &mut surface)
            .expect("render");
        let text = renderer.text_frame().to_text();
        assert_eq!(text, vec!["@".repeat(40); 5].join("\n"));
    }

    #[test]
    fn snapshot_is_a_png() {
        let surface = OutputSurface::new(8, 4).expect("surface");
        let png = surface.to_png().expect("png");
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
