use std::fmt;

/// Plain-text glyph grid of one rendered frame, independent of color mode.
#[derive(Debug, Clone, PartialEq)]
pub struct AsciiFrame {
    cols: usize,
    rows: usize,
    glyphs: Vec<char>,
    pub timestamp: Option<f64>,
}

impl AsciiFrame {
    pub fn blank(cols: usize, rows: usize) -> Self {
        Self {
            cols,
            rows,
            glyphs: vec![' '; cols * rows],
            timestamp: None,
        }
    }

    /// Row-major glyphs. Missing cells become spaces and extras are dropped.
    pub fn from_glyphs(cols: usize, rows: usize, glyphs: impl IntoIterator<Item = char>) -> Self {
        let mut grid: Vec<char> = glyphs.into_iter().take(cols * rows).collect();
        grid.resize(cols * rows, ' ');
        Self {
            cols,
            rows,
            glyphs: grid,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn row(&self, index: usize) -> &[char] {
        &self.glyphs[index * self.cols..(index + 1) * self.cols]
    }

    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.rows).map(|row| self.row(row).iter().collect())
    }

    /// Rows joined by `\n`, no trailing newline.
    pub fn to_text(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

impl fmt::Display for AsciiFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}
