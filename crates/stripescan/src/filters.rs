//! Disparity- and code-map filters: isolated-pixel consensus filtering,
//! hole-aware median filtering, small-component pruning and plane-model
//! hole filling.

use crate::components::{label_similar_regions, label_unknown_regions, Connectivity};
use crate::grid::{Grid, UNK};
use crate::stats::{fit_plane, median, sorted_quantile};

/// Parameters of the full disparity filter stage, applied in order:
/// y-disparity clamp, median filters, small-component removal, hole filling.
/// Zero sizes and `None` limits disable the respective step.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FilterConfig {
    /// Invalidate x disparities where |dy| exceeds this.
    pub y_disparity_limit: Option<f32>,
    /// Median kernel for the x band (0 or 1 disables).
    pub median_x: usize,
    /// Median kernel for the y band.
    pub median_y: usize,
    /// Remove x-disparity components smaller than this.
    pub min_component_size: usize,
    /// Similarity threshold joining pixels into one component.
    pub component_threshold: f32,
    /// Fill holes of up to this many pixels from a local plane model.
    pub max_hole_size: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            y_disparity_limit: Some(0.75),
            median_x: 3,
            median_y: 0,
            min_component_size: 20,
            component_threshold: 2.0,
            max_hole_size: 200,
        }
    }
}

/// Invalidate pixels whose code value is not corroborated by the window
/// around them: a pixel survives only if at least `fraction` of the known
/// values within `radius` (and at least 3) lie within `max_diff` of it.
/// Returns the number of pixels removed. Band 0 only.
pub fn consensus_filter(grid: &mut Grid, radius: usize, fraction: f32, max_diff: f32) -> usize {
    let (w, h) = (grid.width(), grid.height());
    let r = radius as i64;
    let mut removed = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let p0 = grid.get(x, y, 0);
            if p0 == UNK {
                continue;
            }
            let mut close = 0usize;
            let mut total = 0usize;
            for py in (y as i64 - r).max(0)..=(y as i64 + r).min(h as i64 - 1) {
                for px in (x as i64 - r).max(0)..=(x as i64 + r).min(w as i64 - 1) {
                    if px == x as i64 && py == y as i64 {
                        continue;
                    }
                    let pp = grid.get(px as usize, py as usize, 0);
                    if pp != UNK {
                        total += 1;
                        if (pp - p0).abs() <= max_diff {
                            close += 1;
                        }
                    }
                }
            }
            if (close as f32) < fraction * total as f32 || close < 3 {
                removed.push((x, y));
            }
        }
    }
    for &(x, y) in &removed {
        grid.set(x, y, 0, UNK);
    }
    log::info!(
        "{} pixels filtered ({:.3}%)",
        removed.len(),
        removed.len() as f32 * 100.0 / (w * h) as f32
    );
    removed.len()
}

// 3x3 median with symmetric hole filling: an UNK sample whose opposite
// neighbor is known gets the opposite value reflected across the center
// (when within max_diff), then the middle of the known values is returned,
// averaging across the middle only where adjacent sorted values agree.
// Fewer than 4 known values give UNK.
fn median3x3(v: &mut [f32]) -> f32 {
    const MAX_DIFF: f32 = 2.0;
    if v.len() != 9 {
        // window clipped at the image border, plain median
        v.sort_by(f32::total_cmp);
        return v[v.len() / 2];
    }
    let c = v[4];
    if c != UNK {
        for k in 0..9 {
            let j = 8 - k;
            if j == k {
                continue;
            }
            if v[k] == UNK && v[j] != UNK {
                let d = v[j] - c;
                if d.abs() <= MAX_DIFF {
                    v[k] = c - d;
                }
            }
        }
    }
    v.sort_by(f32::total_cmp);
    let mut k = 9;
    while k > 0 && v[k - 1] == UNK {
        k -= 1;
    }
    if k < 4 {
        return UNK;
    }
    if k % 2 == 0 {
        let (v1, v2) = (v[k / 2 - 1], v[k / 2]);
        if (v1 - v2).abs() <= MAX_DIFF {
            (v1 + v2) / 2.0
        } else {
            v1
        }
    } else {
        let (v1, v2, v3) = (v[k / 2 - 1], v[k / 2], v[k / 2 + 1]);
        let d12 = (v1 - v2).abs();
        let d23 = (v2 - v3).abs();
        if d12 <= MAX_DIFF && d23 <= MAX_DIFF {
            (v1 + v2 + v3) / 3.0
        } else if d12 <= MAX_DIFF {
            (v1 + v2) / 2.0
        } else if d23 <= MAX_DIFF {
            (v2 + v3) / 2.0
        } else {
            v2
        }
    }
}

/// k x k median filter of one band (k odd). Unknown samples participate (a
/// majority-unknown window stays unknown); k == 3 additionally uses the
/// symmetric hole filling of [`median3x3`]. Other bands pass through.
pub fn median_filter(grid: &Grid, band: usize, k: usize) -> Grid {
    let mut out = grid.clone();
    if k <= 1 {
        return out;
    }
    let (w, h) = (grid.width(), grid.height());
    let rad = (k / 2) as i64;
    let mut v = Vec::with_capacity(k * k);
    for y in 0..h {
        for x in 0..w {
            v.clear();
            for yy in (y as i64 - rad).max(0)..=(y as i64 + rad).min(h as i64 - 1) {
                for xx in (x as i64 - rad).max(0)..=(x as i64 + rad).min(w as i64 - 1) {
                    v.push(grid.get(xx as usize, yy as usize, band));
                }
            }
            let m = if k == 3 {
                median3x3(&mut v)
            } else {
                median(&mut v)
            };
            out.set(x, y, band, m);
        }
    }
    out
}

/// Mark x disparities unknown where the y disparity exceeds `y_limit` in
/// magnitude (a symptom of a bad match in near-rectified setups).
pub fn clamp_y_disparity(grid: &mut Grid, y_limit: f32) {
    for y in 0..grid.height() {
        for x in 0..grid.width() {
            let dy = grid.get(x, y, 1);
            if dy != UNK && dy.abs() > y_limit {
                grid.set(x, y, 0, UNK);
            }
        }
    }
}

/// Remove connected components of `band` smaller than `min_size` pixels,
/// where pixels connect when their values differ by at most `threshold`.
pub fn remove_small_components(grid: &mut Grid, band: usize, min_size: usize, threshold: f32) {
    let cm = label_similar_regions(grid, band, threshold);
    for y in 0..grid.height() {
        for x in 0..grid.width() {
            let k = cm.label_at(grid, x, y);
            if k > 0 && cm.components[k as usize].size < min_size {
                grid.set(x, y, band, UNK);
            }
        }
    }
    let n = cm
        .components
        .iter()
        .skip(1)
        .filter(|c| c.size < min_size)
        .count();
    log::info!("{n} / {} components removed", cm.len());
}

/// Fill unknown regions of `band` from a plane fitted to the disparities
/// around them. A hole qualifies when it spans at most `2*sqrt(max_pixels)`
/// per axis and holds at most `max_pixels` pixels; the fit uses a 3..6 pixel
/// border and is accepted when it has at least 10 samples with 75% of
/// residuals within 0.5 and 90% within 1.0. Known border pixels whose
/// residual exceeds the 90% bound are overwritten as outliers. Returns the
/// residual map (plane-fit residuals around processed holes, `UNK`
/// elsewhere; filled holes get their origin corner marked 3.0).
pub fn fill_disparity_holes(grid: &mut Grid, band: usize, max_pixels: usize) -> Grid {
    const Q75_THRESH: f32 = 0.5;
    const Q90_THRESH: f32 = 1.0;
    const MIN_POINTS: usize = 10;
    let max_size = (2.0 * (max_pixels as f32).sqrt()) as usize;

    let (w, h) = (grid.width(), grid.height());
    let cm = label_unknown_regions(grid, band, Connectivity::Four);
    let mut resid_img = Grid::filled(w, h, 1, UNK);
    let mut filled = 0usize;

    for (k, cc) in cm.components.iter().enumerate().skip(1) {
        let dx = cc.x2 - cc.x1;
        let dy = cc.y2 - cc.y1;
        if dx > max_size || dy > max_size || cc.size > max_pixels {
            continue;
        }
        let border_x = 3.max(6usize.saturating_sub(dx));
        let border_y = 3.max(6usize.saturating_sub(dy));
        let x1 = cc.x1.saturating_sub(border_x);
        let x2 = (cc.x2 + border_x).min(w - 1);
        let y1 = cc.y1.saturating_sub(border_y);
        let y2 = (cc.y2 + border_y).min(h - 1);

        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut zs = Vec::new();
        for y in y1..=y2 {
            for x in x1..=x2 {
                let z = grid.get(x, y, band);
                if z != UNK {
                    xs.push((x - x1) as f32);
                    ys.push((y - y1) as f32);
                    zs.push(z);
                }
            }
        }
        let Some((pa, pb, pc)) = fit_plane(&xs, &ys, &zs) else {
            continue;
        };

        let mut res = Vec::new();
        for y in y1..=y2 {
            for x in x1..=x2 {
                let z = grid.get(x, y, band);
                let r = if z != UNK {
                    let z2 = pa * (x - x1) as f32 + pb * (y - y1) as f32 + pc;
                    res.push((z - z2).abs());
                    z - z2
                } else {
                    UNK
                };
                resid_img.set(x, y, 0, r);
            }
        }
        if res.len() < MIN_POINTS {
            continue;
        }
        res.sort_by(f32::total_cmp);
        if sorted_quantile(&res, 75) > Q75_THRESH || sorted_quantile(&res, 90) > Q90_THRESH {
            continue;
        }

        filled += 1;
        for y in y1..=y2 {
            for x in x1..=x2 {
                let z = grid.get(x, y, band);
                let z2 = pa * (x - x1) as f32 + pb * (y - y1) as f32 + pc;
                if z == UNK {
                    // this hole only, not an adjacent one
                    if cm.label_at(grid, x, y) == k as u32 {
                        grid.set(x, y, band, z2);
                    }
                } else if (z - z2).abs() > Q90_THRESH {
                    grid.set(x, y, band, z2); // overwrite border outlier
                }
            }
        }
        resid_img.set(x1, y1, 0, 3.0); // mark success for inspection
    }
    log::info!("{filled} / {} holes filled", cm.len());
    resid_img
}

/// Apply the full filter stage to a two-band disparity map. Returns the
/// hole-fill residual map when hole filling ran.
pub fn run_filter(grid: &mut Grid, config: &FilterConfig) -> Option<Grid> {
    if let Some(limit) = config.y_disparity_limit {
        log::info!("invalidating pixels with |ydisp| > {limit}");
        clamp_y_disparity(grid, limit);
    }
    if config.median_x > 1 {
        log::info!("running {0}x{0} median filter in x", config.median_x);
        *grid = median_filter(grid, 0, config.median_x);
    }
    if config.median_y > 1 {
        log::info!("running {0}x{0} median filter in y", config.median_y);
        *grid = median_filter(grid, 1, config.median_y);
    }
    if config.min_component_size > 0 {
        log::info!(
            "removing components smaller than {} (thresh={})",
            config.min_component_size,
            config.component_threshold
        );
        remove_small_components(grid, 0, config.min_component_size, config.component_threshold);
    }
    if config.max_hole_size > 0 {
        log::info!("filling holes up to {} pixels", config.max_hole_size);
        return Some(fill_disparity_holes(grid, 0, config.max_hole_size));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn consensus_filter_drops_lone_outlier() {
        let mut g = Grid::filled(9, 9, 1, 10.0);
        g.set(4, 4, 0, 50.0);
        let n = consensus_filter(&mut g, 4, 0.25, 4.0);
        assert_eq!(n, 1);
        assert_eq!(g.get(4, 4, 0), UNK);
        assert_eq!(g.get(0, 0, 0), 10.0);
    }

    #[test]
    fn consensus_filter_requires_three_supporters() {
        // value agrees with its only neighbor, but 2 < 3 supporters
        let mut g = Grid::filled(2, 2, 1, UNK);
        g.set(0, 0, 0, 1.0);
        g.set(1, 0, 0, 1.0);
        g.set(0, 1, 0, 1.0);
        consensus_filter(&mut g, 1, 0.0, 4.0);
        assert_eq!(g.get(0, 0, 0), UNK);
    }

    #[test]
    fn median3x3_fills_symmetric_hole() {
        // hole at top-left, opposite (bottom-right) known: reflects to 4.8
        let mut v = [UNK, 5.0, 5.0, 5.0, 5.0, 5.0, 5.0, 5.0, 5.2];
        let m = median3x3(&mut v);
        assert_relative_eq!(m, 5.0, epsilon = 1e-6);
    }

    #[test]
    fn median3x3_gives_unknown_for_sparse_window() {
        // only the corner pair reflects; 3 known values < 4
        let mut v = [UNK, UNK, UNK, UNK, 5.0, UNK, UNK, UNK, 5.0];
        assert_eq!(median3x3(&mut v), UNK);
    }

    #[test]
    fn median_filter_removes_speckle_keeps_edges() {
        let mut g = Grid::new(9, 9, 1);
        for y in 0..9 {
            for x in 0..9 {
                g.set(x, y, 0, if x < 4 { 1.0 } else { 20.0 });
            }
        }
        g.set(2, 2, 0, 99.0);
        let f = median_filter(&g, 0, 3);
        assert_eq!(f.get(2, 2, 0), 1.0);
        // disparity edge survives
        assert_eq!(f.get(3, 5, 0), 1.0);
        assert_eq!(f.get(4, 5, 0), 20.0);
    }

    #[test]
    fn y_clamp_invalidates_x_band_only() {
        let mut g = Grid::new(3, 1, 2);
        g.set(1, 0, 0, 5.0);
        g.set(1, 0, 1, 2.0);
        clamp_y_disparity(&mut g, 0.75);
        assert_eq!(g.get(1, 0, 0), UNK);
        assert_eq!(g.get(1, 0, 1), 2.0);
        assert_eq!(g.get(0, 0, 0), 0.0);
    }

    #[test]
    fn small_components_are_removed() {
        let mut g = Grid::filled(10, 10, 1, UNK);
        for y in 0..10 {
            for x in 0..6 {
                g.set(x, y, 0, 7.0);
            }
        }
        g.set(8, 8, 0, 3.0);
        g.set(9, 8, 0, 3.0);
        remove_small_components(&mut g, 0, 5, 2.0);
        assert_eq!(g.get(8, 8, 0), UNK);
        assert_eq!(g.get(2, 2, 0), 7.0);
    }

    #[test]
    fn planar_hole_is_filled() {
        let mut g = Grid::new(20, 20, 1);
        for y in 0..20 {
            for x in 0..20 {
                g.set(x, y, 0, 0.1 * x as f32 + 5.0);
            }
        }
        for y in 8..11 {
            for x in 8..11 {
                g.set(x, y, 0, UNK);
            }
        }
        let resid = fill_disparity_holes(&mut g, 0, 50);
        assert_relative_eq!(g.get(9, 9, 0), 5.9, epsilon = 1e-3);
        // success marker at window origin (hole bbox minus 4-pixel border)
        assert_eq!(resid.get(4, 4, 0), 3.0);
    }

    #[test]
    fn oversized_hole_is_left_open() {
        let mut g = Grid::new(30, 30, 1);
        for y in 0..30 {
            for x in 0..30 {
                g.set(x, y, 0, 1.0);
            }
        }
        for y in 5..25 {
            for x in 5..25 {
                g.set(x, y, 0, UNK);
            }
        }
        fill_disparity_holes(&mut g, 0, 50);
        assert_eq!(g.get(15, 15, 0), UNK);
    }

    #[test]
    fn hole_on_curved_surface_is_rejected() {
        let mut g = Grid::new(20, 20, 1);
        for y in 0..20 {
            for x in 0..20 {
                let (fx, fy) = (x as f32 - 10.0, y as f32 - 10.0);
                g.set(x, y, 0, 0.3 * (fx * fx + fy * fy));
            }
        }
        g.set(10, 10, 0, UNK);
        fill_disparity_holes(&mut g, 0, 50);
        assert_eq!(g.get(10, 10, 0), UNK);
    }

    #[test]
    fn full_stage_runs_all_steps() {
        let mut g = Grid::new(16, 16, 2);
        for y in 0..16 {
            for x in 0..16 {
                g.set(x, y, 0, 2.0);
            }
        }
        g.set(5, 5, 1, 3.0); // large y disparity
        let resid = run_filter(&mut g, &FilterConfig::default());
        assert!(resid.is_some());
        assert_eq!(g.get(5, 5, 0), 2.0); // y-clamped, then restored by the median
    }
}
