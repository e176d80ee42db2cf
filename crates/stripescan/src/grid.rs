//! Row-major float grid with a reserved "unknown" sentinel.
//!
//! All code and disparity maps in the pipeline are [`Grid`]s with one band
//! (code values, single-axis disparities, residuals) or two interleaved bands
//! (flow-style (dx, dy) disparity vectors, merged (u, v) code maps).

use crate::error::{Error, Result};

/// Sentinel marking a pixel with no valid value.
///
/// Stored as IEEE +infinity so it survives the PFM/FLO codecs bit-exactly.
/// Pixel-wise operations must propagate it unless a documented fallback
/// (mirroring, zero-substitution, half-occlusion) applies.
pub const UNK: f32 = f32::INFINITY;

/// Scan axis for line-oriented algorithms (hole filling, refinement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    /// The perpendicular axis.
    pub fn orthogonal(self) -> Self {
        match self {
            Axis::X => Axis::Y,
            Axis::Y => Axis::X,
        }
    }

    /// Conventional index used in checkpoint file names (x = 0, y = 1).
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
        }
    }
}

/// One scanline of a grid: `len` elements starting at flat index `start`,
/// `stride` elements apart. Replaces the strided-pointer scans of the
/// reference pixel loops with a bounds-checked abstraction.
#[derive(Debug, Clone, Copy)]
pub struct LineSpan {
    pub start: usize,
    pub stride: usize,
    pub len: usize,
}

/// Rectangular row-major float image, band-interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    width: usize,
    height: usize,
    bands: usize,
    data: Vec<f32>,
}

impl Grid {
    /// Zero-filled grid.
    pub fn new(width: usize, height: usize, bands: usize) -> Self {
        debug_assert!(bands == 1 || bands == 2);
        Self {
            width,
            height,
            bands,
            data: vec![0.0; width * height * bands],
        }
    }

    /// Grid with every element set to `value`.
    pub fn filled(width: usize, height: usize, bands: usize, value: f32) -> Self {
        let mut g = Self::new(width, height, bands);
        g.data.fill(value);
        g
    }

    /// Build from raw row-major band-interleaved data.
    pub fn from_vec(width: usize, height: usize, bands: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), width * height * bands);
        Self {
            width,
            height,
            bands,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.width, self.height, self.bands)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    fn idx(&self, x: usize, y: usize, band: usize) -> usize {
        debug_assert!(x < self.width && y < self.height && band < self.bands);
        (y * self.width + x) * self.bands + band
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, band: usize) -> f32 {
        self.data[self.idx(x, y, band)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, band: usize, value: f32) {
        let i = self.idx(x, y, band);
        self.data[i] = value;
    }

    /// Value at signed coordinates, or `UNK` when out of bounds.
    #[inline]
    pub fn get_checked(&self, x: i64, y: i64, band: usize) -> f32 {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            UNK
        } else {
            self.get(x as usize, y as usize, band)
        }
    }

    /// Fail with [`Error::ShapeMismatch`] unless `other` matches exactly.
    pub fn ensure_same_shape(&self, other: &Grid, context: &'static str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::ShapeMismatch {
                context,
                expected: self.shape(),
                got: other.shape(),
            });
        }
        Ok(())
    }

    /// Number of non-`UNK` pixels in `band`.
    pub fn known_count(&self, band: usize) -> usize {
        let mut n = 0;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y, band) != UNK {
                    n += 1;
                }
            }
        }
        n
    }

    /// All scanlines of `band` along `axis` (row-major order of starts).
    pub fn lines(&self, axis: Axis, band: usize) -> Vec<LineSpan> {
        match axis {
            Axis::X => (0..self.height)
                .map(|y| LineSpan {
                    start: (y * self.width) * self.bands + band,
                    stride: self.bands,
                    len: self.width,
                })
                .collect(),
            Axis::Y => (0..self.width)
                .map(|x| LineSpan {
                    start: x * self.bands + band,
                    stride: self.width * self.bands,
                    len: self.height,
                })
                .collect(),
        }
    }

    /// All scanlines of `band` along the (+1, +1) diagonal, covering every
    /// pixel exactly once. Element k of a line starting at (x0, y0) is
    /// (x0 + k, y0 + k).
    pub fn diagonal_lines_main(&self, band: usize) -> Vec<LineSpan> {
        let (w, h) = (self.width, self.height);
        let stride = (w + 1) * self.bands;
        let mut spans = Vec::with_capacity(w + h - 1);
        for x in 0..w {
            spans.push(LineSpan {
                start: x * self.bands + band,
                stride,
                len: (w - x).min(h),
            });
        }
        for y in 1..h {
            spans.push(LineSpan {
                start: (y * w) * self.bands + band,
                stride,
                len: w.min(h - y),
            });
        }
        spans
    }

    /// All scanlines of `band` along the (-1, +1) diagonal. Element k of a
    /// line starting at (x0, y0) is (x0 - k, y0 + k).
    pub fn diagonal_lines_anti(&self, band: usize) -> Vec<LineSpan> {
        let (w, h) = (self.width, self.height);
        let stride = (w - 1) * self.bands;
        let mut spans = Vec::with_capacity(w + h - 1);
        for x in 0..w {
            spans.push(LineSpan {
                start: x * self.bands + band,
                stride,
                len: (x + 1).min(h),
            });
        }
        for y in 1..h {
            spans.push(LineSpan {
                start: (y * w + w - 1) * self.bands + band,
                stride,
                len: w.min(h - y),
            });
        }
        spans
    }

    /// Copy a scanline into `buf` (resized to the span length).
    pub fn read_line(&self, span: LineSpan, buf: &mut Vec<f32>) {
        buf.clear();
        buf.extend((0..span.len).map(|k| self.data[span.start + k * span.stride]));
    }

    /// Write `buf` back over a scanline.
    pub fn write_line(&mut self, span: LineSpan, buf: &[f32]) {
        debug_assert_eq!(buf.len(), span.len);
        for (k, &v) in buf.iter().enumerate() {
            self.data[span.start + k * span.stride] = v;
        }
    }

    /// Extract one band as a new single-band grid.
    pub fn band(&self, band: usize) -> Grid {
        let mut out = Grid::new(self.width, self.height, 1);
        for y in 0..self.height {
            for x in 0..self.width {
                out.set(x, y, 0, self.get(x, y, band));
            }
        }
        out
    }

    /// Interleave two single-band grids into a two-band grid.
    pub fn merge_bands(x: &Grid, y: &Grid) -> Result<Grid> {
        x.ensure_same_shape(y, "merge_bands")?;
        let mut out = Grid::new(x.width, x.height, 2);
        for yy in 0..x.height {
            for xx in 0..x.width {
                out.set(xx, yy, 0, x.get(xx, yy, 0));
                out.set(xx, yy, 1, y.get(xx, yy, 0));
            }
        }
        Ok(out)
    }

    /// Split a two-band grid into its bands.
    pub fn split_bands(&self) -> (Grid, Grid) {
        debug_assert_eq!(self.bands, 2);
        (self.band(0), self.band(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagonal_spans_cover_every_pixel_once() {
        let g = Grid::new(5, 3, 1);
        for spans in [g.diagonal_lines_main(0), g.diagonal_lines_anti(0)] {
            let mut seen = vec![0usize; 15];
            for s in spans {
                for k in 0..s.len {
                    seen[s.start + k * s.stride] += 1;
                }
            }
            assert!(seen.iter().all(|&c| c == 1));
        }
    }

    #[test]
    fn line_roundtrip_preserves_band_interleaving() {
        let mut g = Grid::new(3, 2, 2);
        g.set(1, 0, 1, 7.0);
        let spans = g.lines(Axis::Y, 1);
        let mut buf = Vec::new();
        g.read_line(spans[1], &mut buf);
        assert_eq!(buf, vec![7.0, 0.0]);
        buf[1] = 9.0;
        g.write_line(spans[1], &buf);
        assert_eq!(g.get(1, 1, 1), 9.0);
        assert_eq!(g.get(1, 1, 0), 0.0);
    }

    #[test]
    fn shape_mismatch_is_detected() {
        let a = Grid::new(4, 4, 1);
        let b = Grid::new(4, 5, 1);
        assert!(a.ensure_same_shape(&b, "test").is_err());
        assert!(a.ensure_same_shape(&a.clone(), "test").is_ok());
    }

    #[test]
    fn out_of_bounds_reads_are_unknown() {
        let g = Grid::filled(2, 2, 1, 1.0);
        assert_eq!(g.get_checked(-1, 0, 0), UNK);
        assert_eq!(g.get_checked(0, 2, 0), UNK);
        assert_eq!(g.get_checked(1, 1, 0), 1.0);
    }
}
