use crate::source::SourceFrame;

/// Glyph cells are roughly twice as tall as they are wide.
pub const ASPECT_CORRECTION_NUM: u64 = 1;
pub const ASPECT_CORRECTION_DEN: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDims {
    pub cols: u32,
    pub rows: u32,
}

impl GridDims {
    pub fn cell_count(&self) -> usize {
        self.cols as usize * self.rows as usize
    }
}

/// `rows = floor(cols * source_height / source_width * 0.5)`, at least one.
pub fn grid_dimensions(cols: u32, source_width: u32, source_height: u32) -> GridDims {
    let cols = cols.max(1);
    if source_width == 0 || source_height == 0 {
        return GridDims { cols, rows: 1 };
    }
    let rows = (u64::from(cols) * u64::from(source_height) * ASPECT_CORRECTION_NUM)
        / (u64::from(source_width) * ASPECT_CORRECTION_DEN);
    GridDims {
        cols,
        rows: rows.clamp(1, u64::from(u32::MAX)) as u32,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SampleFilter {
    /// Box filter over each cell's source region.
    #[default]
    Area,
    /// Nearest pixel at the cell center.
    Point,
}

/// Downsampled RGB grid, one entry per character cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleGrid {
    dims: GridDims,
    cells: Vec<[u8; 3]>,
}

impl SampleGrid {
    fn empty() -> Self {
        Self {
            dims: GridDims { cols: 0, rows: 0 },
            cells: Vec::new(),
        }
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn cells(&self) -> &[[u8; 3]] {
        &self.cells
    }

    pub fn cell(&self, col: u32, row: u32) -> [u8; 3] {
        self.cells[(row * self.dims.cols + col) as usize]
    }
}

/// Owns the sample buffer across frames; it is reallocated only when the
/// grid dimensions change.
#[derive(Debug, Clone)]
pub struct GridSampler {
    filter: SampleFilter,
    grid: SampleGrid,
}

impl Default for GridSampler {
    fn default() -> Self {
        Self::new(SampleFilter::Area)
    }
}

impl GridSampler {
    pub fn new(filter: SampleFilter) -> Self {
        Self {
            filter,
            grid: SampleGrid::empty(),
        }
    }

    pub fn filter(&self) -> SampleFilter {
        self.filter
    }

    pub fn grid(&self) -> &SampleGrid {
        &self.grid
    }

    pub fn sample(&mut self, frame: &SourceFrame, cols: u32) -> &SampleGrid {
        let dims = grid_dimensions(cols, frame.width, frame.height);
        if dims != self.grid.dims {
            tracing::debug!(
                cols = dims.cols,
                rows = dims.rows,
                source_width = frame.width,
                source_height = frame.height,
                "resizing sample grid"
            );
            self.grid.dims = dims;
            self.grid.cells.clear();
            self.grid.cells.resize(dims.cell_count(), [0, 0, 0]);
        }

        if frame.width == 0 || frame.height == 0 {
            self.grid.cells.fill([0, 0, 0]);
            return &self.grid;
        }

        for row in 0..dims.rows {
            let (y0, y1) = span(row, dims.rows, frame.height);
            for col in 0..dims.cols {
                let (x0, x1) = span(col, dims.cols, frame.width);
                let value = match self.filter {
                    SampleFilter::Area => area_average(frame, x0, x1, y0, y1),
                    SampleFilter::Point => frame.rgb_at((x0 + x1 - 1) / 2, (y0 + y1 - 1) / 2),
                };
                self.grid.cells[(row * dims.cols + col) as usize] = value;
            }
        }
        &self.grid
    }
}

/// Source pixel range `[start, end)` covered by cell `index` of `count`.
/// Never empty, even when the grid is finer than the source.
fn span(index: u32, count: u32, extent: u32) -> (u32, u32) {
    let start = ((u64::from(index) * u64::from(extent)) / u64::from(count)) as u32;
    let end = ((u64::from(index + 1) * u64::from(extent)) / u64::from(count)) as u32;
    let start = start.min(extent - 1);
    (start, end.max(start + 1).min(extent))
}

fn area_average(frame: &SourceFrame, x0: u32, x1: u32, y0: u32, y1: u32) -> [u8; 3] {
    let mut totals = [0_u64; 3];
    for y in y0..y1 {
        let row_start = (y as usize * frame.width as usize + x0 as usize) * 4;
        let row_end = (y as usize * frame.width as usize + x1 as usize) * 4;
        for pixel in frame.rgba[row_start..row_end].chunks_exact(4) {
            totals[0] += u64::from(pixel[0]);
            totals[1] += u64::from(pixel[1]);
            totals[2] += u64::from(pixel[2]);
        }
    }
    let area = u64::from(x1 - x0) * u64::from(y1 - y0);
    let half = area / 2;
    [
        ((totals[0] + half) / area) as u8,
        ((totals[1] + half) / area) as u8,
        ((totals[2] + half) / area) as u8,
    ]
}
