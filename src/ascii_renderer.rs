use std::collections::HashMap;
use std::path::Path;

use fontdue::Font;

use crate::ascii_atlas::{BitmapAtlas, CELL_HEIGHT, CELL_WIDTH, GLYPH_HEIGHT, GLYPH_TOP_PAD, GLYPH_WIDTH};
use crate::error::RenderError;

#[derive(Debug, Clone)]
pub struct GlyphBitmap {
    pub width: usize,
    pub height: usize,
    /// Offset from the cell origin.
    pub left: i32,
    pub top: i32,
    pub bitmap: Vec<u8>,
}

/// Draws single glyphs into an RGBA frame at fixed cell size.
pub trait GlyphPainter {
    fn cell_size(&self) -> (u32, u32);

    fn draw_glyph(
        &mut self,
        frame: &mut [u8],
        frame_width: u32,
        frame_height: u32,
        x: u32,
        y: u32,
        glyph: char,
        color: [u8; 3],
    );
}

/// Paints glyphs from the built-in atlas, scaled by an integer factor.
#[derive(Debug, Clone)]
pub struct BitmapPainter {
    atlas: BitmapAtlas,
    scale: u32,
    cache: HashMap<char, GlyphBitmap>,
}

impl BitmapPainter {
    pub fn new(scale: u32) -> Self {
        Self {
            atlas: BitmapAtlas,
            scale: scale.max(1),
            cache: HashMap::new(),
        }
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    fn rasterize(&self, glyph: char) -> GlyphBitmap {
        let width = (GLYPH_WIDTH * self.scale) as usize;
        let height = (GLYPH_HEIGHT * self.scale) as usize;
        let mut bitmap = vec![0_u8; width * height];
        for row in 0..height {
            for col in 0..width {
                let lit = self
                    .atlas
                    .sample(glyph, col as u32 / self.scale, row as u32 / self.scale);
                if lit {
                    bitmap[row * width + col] = 255;
                }
            }
        }
        GlyphBitmap {
            width,
            height,
            left: 0,
            top: (GLYPH_TOP_PAD * self.scale) as i32,
            bitmap,
        }
    }
}

impl GlyphPainter for BitmapPainter {
    fn cell_size(&self) -> (u32, u32) {
        (CELL_WIDTH * self.scale, CELL_HEIGHT * self.scale)
    }

    fn draw_glyph(
        &mut self,
        frame: &mut [u8],
        frame_width: u32,
        frame_height: u32,
        x: u32,
        y: u32,
        glyph: char,
        color: [u8; 3],
    ) {
        if glyph == ' ' {
            return;
        }
        if !self.cache.contains_key(&glyph) {
            let bitmap = self.rasterize(glyph);
            self.cache.insert(glyph, bitmap);
        }
        if let Some(bitmap) = self.cache.get(&glyph) {
            blend_glyph(
                frame,
                frame_width,
                frame_height,
                x as i32 + bitmap.left,
                y as i32 + bitmap.top,
                bitmap,
                [color[0], color[1], color[2], 255],
            );
        }
    }
}

/// Paints glyphs from a TTF/OTF font. Cell width is the advance of 'M',
/// cell height is the font size; glyphs hang from the cell top.
pub struct FontPainter {
    font: Font,
    font_size: f32,
    ascent: f32,
    glyph_cache: HashMap<char, GlyphBitmap>,
}

impl FontPainter {
    pub fn from_bytes(font_bytes: Vec<u8>, font_size: f32) -> Result<Self, RenderError> {
        let font = Font::from_bytes(font_bytes, fontdue::FontSettings::default())
            .map_err(|error| RenderError::Font(error.to_string()))?;
        let ascent = font
            .horizontal_line_metrics(font_size)
            .map(|metrics| metrics.ascent)
            .unwrap_or(font_size * 0.8);
        Ok(Self {
            font,
            font_size,
            ascent,
            glyph_cache: HashMap::new(),
        })
    }

    pub fn from_path(font_path: &Path, font_size: f32) -> Result<Self, RenderError> {
        let font_bytes = std::fs::read(font_path).map_err(|error| {
            RenderError::Font(format!("failed to read {}: {error}", font_path.display()))
        })?;
        Self::from_bytes(font_bytes, font_size)
    }

    pub fn font_size(&self) -> f32 {
        self.font_size
    }

    fn rasterize(&self, glyph: char) -> GlyphBitmap {
        let (metrics, bitmap) = self.font.rasterize(glyph, self.font_size);
        let top = self.ascent - (metrics.ymin as f32 + metrics.height as f32);
        GlyphBitmap {
            width: metrics.width,
            height: metrics.height,
            left: metrics.xmin,
            top: top.round() as i32,
            bitmap,
        }
    }
}

impl GlyphPainter for FontPainter {
    fn cell_size(&self) -> (u32, u32) {
        let metrics = self.font.metrics('M', self.font_size);
        let width = metrics.advance_width.ceil().max(1.0) as u32;
        let height = self.font_size.ceil().max(1.0) as u32;
        (width, height)
    }

    fn draw_glyph(
        &mut self,
        frame: &mut [u8],
        frame_width: u32,
        frame_height: u32,
        x: u32,
        y: u32,
        glyph: char,
        color: [u8; 3],
    ) {
        if glyph.is_whitespace() {
            return;
        }
        if !self.glyph_cache.contains_key(&glyph) {
            let bitmap = self.rasterize(glyph);
            self.glyph_cache.insert(glyph, bitmap);
        }
        let Some(bitmap) = self.glyph_cache.get(&glyph) else {
            return;
        };
        if bitmap.width == 0 || bitmap.height == 0 {
            return;
        }
        blend_glyph(
            frame,
            frame_width,
            frame_height,
            x as i32 + bitmap.left,
            y as i32 + bitmap.top,
            bitmap,
            [color[0], color[1], color[2], 255],
        );
    }
}

pub fn blend_glyph(
    frame: &mut [u8],
    frame_width: u32,
    frame_height: u32,
    x: i32,
    y: i32,
    glyph: &GlyphBitmap,
    color: [u8; 4],
) {
    for row in 0..glyph.height {
        let py = y + row as i32;
        if py < 0 || py >= frame_height as i32 {
            continue;
        }

        for col in 0..glyph.width {
            let px = x + col as i32;
            if px < 0 || px >= frame_width as i32 {
                continue;
            }

            let mask = glyph.bitmap[row * glyph.width + col];
            if mask == 0 {
                continue;
            }

            let alpha = ((u16::from(mask) * u16::from(color[3])) / 255) as u8;
            let idx = ((py as u32 * frame_width + px as u32) * 4) as usize;
            blend_pixel(frame, idx, [color[0], color[1], color[2], alpha]);
        }
    }
}

pub fn blend_pixel(frame: &mut [u8], idx: usize, src: [u8; 4]) {
    let alpha = u16::from(src[3]);
    if alpha == 0 {
        return;
    }

    let inv_alpha = 255_u16.saturating_sub(alpha);

    for channel in 0..3 {
        let dst = u16::from(frame[idx + channel]);
        let src_c = u16::from(src[channel]);
        frame[idx + channel] = ((src_c * alpha + dst * inv_alpha + 127) / 255) as u8;
    }
    frame[idx + 3] = 255;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_cells_scale_with_factor() {
        assert_eq!(BitmapPainter::new(1).cell_size(), (6, 10));
        assert_eq!(BitmapPainter::new(2).cell_size(), (12, 20));
        assert_eq!(BitmapPainter::new(0).cell_size(), (6, 10));
    }

    #[test]
    fn full_block_fills_glyph_area_below_top_pad() {
        let mut painter = BitmapPainter::new(1);
        let (w, h) = painter.cell_size();
        let mut frame = vec![0_u8; (w * h * 4) as usize];
        painter.draw_glyph(&mut frame, w, h, 0, 0, '█', [10, 20, 30]);

        let pixel = |x: u32, y: u32| {
            let idx = ((y * w + x) * 4) as usize;
            [frame[idx], frame[idx + 1], frame[idx + 2], frame[idx + 3]]
        };
        assert_eq!(pixel(0, 0), [0, 0, 0, 0]);
        assert_eq!(pixel(0, 1), [10, 20, 30, 255]);
        assert_eq!(pixel(4, 7), [10, 20, 30, 255]);
        assert_eq!(pixel(5, 1), [0, 0, 0, 0]);
        assert_eq!(pixel(0, 8), [0, 0, 0, 0]);
    }

    #[test]
    fn glyphs_are_clipped_to_the_frame() {
        let mut painter = BitmapPainter::new(2);
        let mut frame = vec![0_u8; 4 * 4 * 4];
        painter.draw_glyph(&mut frame, 4, 4, 2, 2, '█', [255, 255, 255]);
        assert_eq!(frame.len(), 64);
    }

    #[test]
    fn opaque_blend_replaces_destination() {
        let mut frame = vec![50_u8, 60, 70, 255];
        blend_pixel(&mut frame, 0, [200, 100, 0, 255]);
        assert_eq!(frame, vec![200, 100, 0, 255]);
    }

    #[test]
    fn font_painter_rejects_invalid_font_bytes() {
        assert!(matches!(
            FontPainter::from_bytes(vec![0, 1, 2, 3], 12.0),
            Err(RenderError::Font(_))
        ));
    }
}
