//! Correspondence search between two-band (u, v) code maps.
//!
//! For every pixel of the source map the matcher scans the target map for
//! the pixel with the nearest code pair. A full scan per pixel is hopeless;
//! the [`RangeIndex`] precomputes, for every quantized code pair, the
//! bounding box of target pixels carrying it, so the scan touches only that
//! box (optionally intersected with a caller-supplied search window). Unique
//! best matches get a 2-D sub-pixel correction from local code planes.

use nalgebra::{Matrix2, Vector2};

use crate::codetable::MAX_CODES;
use crate::error::Result;
use crate::grid::{Grid, UNK};

/// Disparity search bounds, in pixels, relative to the source pixel.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct SearchWindow {
    pub dx_min: i32,
    pub dx_max: i32,
    pub dy_min: i32,
    pub dy_max: i32,
}

impl SearchWindow {
    /// The same window seen from the other view.
    pub fn negate(self) -> Self {
        Self {
            dx_min: -self.dx_max,
            dx_max: -self.dx_min,
            dy_min: -self.dy_max,
            dy_max: -self.dy_min,
        }
    }
}

/// Matcher parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MatchConfig {
    /// Maximal allowable Euclidean code distance for a match.
    pub max_diff: f32,
    /// Quantization of the range index (matches the code-table capacity).
    pub num_codes: usize,
    /// Code-cell neighbors folded into each range box: 1, 4 or 8.
    pub blur_neighbors: u8,
    /// Sub-pixel fit: max difference of corner codes from the center code.
    pub subpix_max_diff: f32,
    /// Sub-pixel fit: max RMS plane residual.
    pub subpix_max_resid: f32,
    /// Sub-pixel fit: max magnitude of the applied correction.
    pub subpix_max_correction: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            max_diff: 0.5,
            num_codes: MAX_CODES,
            blur_neighbors: 8,
            subpix_max_diff: 2.0,
            subpix_max_resid: 0.2,
            subpix_max_correction: 0.99,
        }
    }
}

/// Per-code-pair bounding boxes of pixel locations in a code map.
#[derive(Debug, Clone)]
pub struct RangeIndex {
    ncodes: usize,
    rmin: Vec<[i32; 2]>,
    rmax: Vec<[i32; 2]>,
}

impl RangeIndex {
    /// Scan `code` and record, for every rounded (u, v) code pair, the
    /// bounding box of pixels carrying it, then widen each box by its code
    /// cell's neighbors (`blur_neighbors` = 1, 4 or 8) to tolerate sub-pixel
    /// code noise at cell boundaries.
    pub fn build(code: &Grid, ncodes: usize, blur_neighbors: u8) -> Self {
        let (w, h) = (code.width(), code.height());
        let big = (w + h) as i32;
        let n = ncodes * ncodes;
        let mut rmin0 = vec![[big, big]; n];
        let mut rmax0 = vec![[-1, -1]; n];

        for y in 0..h {
            for x in 0..w {
                let u = code.get(x, y, 0);
                let v = code.get(x, y, 1);
                if u == UNK || v == UNK {
                    continue;
                }
                let cu = (u.round() as i64).clamp(0, ncodes as i64 - 1) as usize;
                let cv = (v.round() as i64).clamp(0, ncodes as i64 - 1) as usize;
                let i = cv * ncodes + cu;
                rmin0[i][0] = rmin0[i][0].min(x as i32);
                rmin0[i][1] = rmin0[i][1].min(y as i32);
                rmax0[i][0] = rmax0[i][0].max(x as i32);
                rmax0[i][1] = rmax0[i][1].max(y as i32);
            }
        }

        let mut rmin = rmin0.clone();
        let mut rmax = rmax0.clone();
        if blur_neighbors >= 4 {
            for cv in 0..ncodes {
                let vm = cv.saturating_sub(1);
                let vp = (cv + 1).min(ncodes - 1);
                for cu in 0..ncodes {
                    let um = cu.saturating_sub(1);
                    let up = (cu + 1).min(ncodes - 1);
                    let i = cv * ncodes + cu;
                    let mut neighbors = vec![
                        vm * ncodes + cu,
                        cv * ncodes + um,
                        cv * ncodes + up,
                        vp * ncodes + cu,
                    ];
                    if blur_neighbors >= 8 {
                        neighbors.extend([
                            vm * ncodes + um,
                            vm * ncodes + up,
                            vp * ncodes + um,
                            vp * ncodes + up,
                        ]);
                    }
                    for j in neighbors {
                        for b in 0..2 {
                            rmin[i][b] = rmin[i][b].min(rmin0[j][b]);
                            rmax[i][b] = rmax[i][b].max(rmax0[j][b]);
                        }
                    }
                }
            }
        }

        let index = Self { ncodes, rmin, rmax };
        index.log_stats();
        index
    }

    /// Bounding box for a code pair: (xmin, ymin, xmax, ymax). Empty boxes
    /// come back with max < min.
    pub fn range(&self, cu: usize, cv: usize) -> (i32, i32, i32, i32) {
        let i = cv * self.ncodes + cu;
        (
            self.rmin[i][0],
            self.rmin[i][1],
            self.rmax[i][0],
            self.rmax[i][1],
        )
    }

    fn log_stats(&self) {
        for (b, axis) in [(0, 'x'), (1, 'y')] {
            let mut sum = 0i64;
            let mut max = 0i32;
            let mut n = 0usize;
            for i in 0..self.rmin.len() {
                let d = self.rmax[i][b] - self.rmin[i][b];
                if d >= 0 {
                    sum += d as i64;
                    max = max.max(d);
                    n += 1;
                }
            }
            if n > 0 {
                log::debug!(
                    "range index {axis}: avg {:.2}, max {max} ({:.1}% of code pairs occupied)",
                    sum as f64 / n as f64,
                    100.0 * n as f64 / self.rmin.len() as f64
                );
            }
        }
    }
}

// Least-squares plane z = a*x + b*y + c through four unit-square corner
// values, via the closed-form pseudo-inverse. Rejects the fit when any
// corner strays more than max_diff from the reference f or when val falls
// outside the corner range; otherwise returns (a, b, c, rms residual).
fn fit_corner_plane(
    val: f32,
    f: f32,
    max_diff: f32,
    f00: f32,
    f10: f32,
    f01: f32,
    f11: f32,
) -> Option<(f32, f32, f32, f32)> {
    if (f00 - f).abs() > max_diff
        || (f10 - f).abs() > max_diff
        || (f01 - f).abs() > max_diff
        || (f11 - f).abs() > max_diff
    {
        return None;
    }
    let mi = f00.min(f10).min(f01.min(f11));
    let ma = f00.max(f10).max(f01.max(f11));
    if val < mi || val > ma {
        return None;
    }
    let a = 0.25 * (-2.0 * f00 + 2.0 * f10 - 2.0 * f01 + 2.0 * f11);
    let b = 0.25 * (-2.0 * f00 - 2.0 * f10 + 2.0 * f01 + 2.0 * f11);
    let c = 0.25 * (3.0 * f00 + f10 + f01 - f11);
    let r00 = c - f00;
    let r10 = a + c - f10;
    let r01 = b + c - f01;
    let r11 = a + b + c - f11;
    let resid = ((r00 * r00 + r10 * r10 + r01 * r01 + r11 * r11) / 4.0).sqrt();
    Some((a, b, c, resid))
}

// 2-D sub-pixel correction from the 3x3 code neighborhoods around a match
// (arrays indexed [x][y]). Picks the quadrant by the sign of the code
// residual, fits a plane per band over its four corners, and intersects the
// two iso-code lines. Returns (0, 0) whenever the fit is not trustworthy.
fn subpix2d(vx: f32, vy: f32, fx: &[[f32; 3]; 3], fy: &[[f32; 3]; 3], config: &MatchConfig) -> (f32, f32) {
    let ffx = fx[1][1];
    let ffy = fy[1][1];
    let ix = usize::from(vx > ffx);
    let iy = usize::from(vy > ffy);

    let px = fit_corner_plane(
        vx,
        ffx,
        config.subpix_max_diff,
        fx[ix][iy],
        fx[ix + 1][iy],
        fx[ix][iy + 1],
        fx[ix + 1][iy + 1],
    );
    let py = fit_corner_plane(
        vy,
        ffy,
        config.subpix_max_diff,
        fy[ix][iy],
        fy[ix + 1][iy],
        fy[ix][iy + 1],
        fy[ix + 1][iy + 1],
    );
    let (Some((ax, bx, cx, resx)), Some((ay, by, cy, resy))) = (px, py) else {
        return (0.0, 0.0);
    };
    if resx > config.subpix_max_resid || resy > config.subpix_max_resid {
        return (0.0, 0.0);
    }

    let m = Matrix2::new(ax, bx, ay, by);
    let rhs = Vector2::new(vx - cx, vy - cy);
    let Some(p) = m.lu().solve(&rhs) else {
        return (0.0, 0.0);
    };
    let corx = p[0] + ix as f32 - 1.0;
    let cory = p[1] + iy as f32 - 1.0;
    if corx.abs() > config.subpix_max_correction || cory.abs() > config.subpix_max_correction {
        return (0.0, 0.0);
    }
    (corx, cory)
}

/// Match every pixel of code map `a` against code map `b`, producing a
/// two-band (dx, dy) disparity map. Ties between equally near codes are
/// averaged; unique matches get the sub-pixel correction.
pub fn match_codes(
    a: &Grid,
    b: &Grid,
    window: Option<SearchWindow>,
    config: &MatchConfig,
) -> Result<Grid> {
    a.ensure_same_shape(b, "match_codes")?;
    let (w, h) = (a.width(), a.height());
    let index = RangeIndex::build(b, config.num_codes, config.blur_neighbors);

    let max_diff_sq = config.max_diff * config.max_diff;
    let mut out = Grid::filled(w, h, 2, UNK);
    let mut good = 0usize;
    let mut unique = 0usize;

    for y0 in 0..h {
        for x0 in 0..w {
            let vx = a.get(x0, y0, 0);
            let vy = a.get(x0, y0, 1);
            if vx == UNK || vy == UNK {
                continue;
            }
            let cu = (vx.round() as i64).clamp(0, config.num_codes as i64 - 1) as usize;
            let cv = (vy.round() as i64).clamp(0, config.num_codes as i64 - 1) as usize;
            let (mut rxmin, mut rymin, mut rxmax, mut rymax) = index.range(cu, cv);
            if let Some(win) = window {
                rxmin = rxmin.max(x0 as i32 + win.dx_min);
                rxmax = rxmax.min(x0 as i32 + win.dx_max);
                rymin = rymin.max(y0 as i32 + win.dy_min);
                rymax = rymax.min(y0 as i32 + win.dy_max);
            }
            rxmin = rxmin.max(0);
            rymin = rymin.max(0);
            rxmax = rxmax.min(w as i32 - 1);
            rymax = rymax.min(h as i32 - 1);

            let mut best_dx = 0i64;
            let mut best_dy = 0i64;
            let mut best_cnt = 0usize;
            // only track minima close enough to matter
            let mut best_diff_sq = 2.0 * max_diff_sq;

            for y1 in rymin..=rymax {
                for x1 in rxmin..=rxmax {
                    let du = vx - b.get(x1 as usize, y1 as usize, 0);
                    let dv = vy - b.get(x1 as usize, y1 as usize, 1);
                    let diff_sq = du * du + dv * dv;
                    if diff_sq < best_diff_sq {
                        best_diff_sq = diff_sq;
                        best_dx = (x1 - x0 as i32) as i64;
                        best_dy = (y1 - y0 as i32) as i64;
                        best_cnt = 1;
                    } else if diff_sq == best_diff_sq && best_cnt > 0 {
                        best_dx += (x1 - x0 as i32) as i64;
                        best_dy += (y1 - y0 as i32) as i64;
                        best_cnt += 1;
                    }
                }
            }

            if best_diff_sq > max_diff_sq || best_cnt == 0 {
                continue;
            }
            good += 1;
            if best_cnt == 1 {
                unique += 1;
                let x1 = x0 as i64 + best_dx;
                let y1 = y0 as i64 + best_dy;
                let xs = [(x1 - 1).max(0), x1, (x1 + 1).min(w as i64 - 1)];
                let ys = [(y1 - 1).max(0), y1, (y1 + 1).min(h as i64 - 1)];
                let mut fx = [[0.0f32; 3]; 3];
                let mut fy = [[0.0f32; 3]; 3];
                for (i, &xx) in xs.iter().enumerate() {
                    for (j, &yy) in ys.iter().enumerate() {
                        fx[i][j] = b.get(xx as usize, yy as usize, 0);
                        fy[i][j] = b.get(xx as usize, yy as usize, 1);
                    }
                }
                let (corx, cory) = subpix2d(vx, vy, &fx, &fy, config);
                out.set(x0, y0, 0, best_dx as f32 + corx);
                out.set(x0, y0, 1, best_dy as f32 + cory);
            } else {
                let scale = 1.0 / best_cnt as f32;
                out.set(x0, y0, 0, scale * best_dx as f32);
                out.set(x0, y0, 1, scale * best_dy as f32);
            }
        }
    }

    log::info!(
        "found {good} matches, {unique} unique (maxdiff={})",
        config.max_diff
    );
    Ok(out)
}

/// Compute the reciprocal pair of disparity maps between two code maps.
/// `window` bounds the disparities of the second map relative to the first;
/// the forward direction uses its negation.
pub fn compute_disparities(
    a: &Grid,
    b: &Grid,
    window: Option<SearchWindow>,
    config: &MatchConfig,
) -> Result<(Grid, Grid)> {
    let d0 = match_codes(a, b, window.map(SearchWindow::negate), config)?;
    let d1 = match_codes(b, a, window, config)?;
    Ok((d0, d1))
}
