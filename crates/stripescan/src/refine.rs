//! Sub-pixel refinement of decoded code maps.
//!
//! Decoded codes are integer stripe positions; refinement recovers the
//! sub-pixel phase by averaging value differences over a 1-D window along
//! the stripe gradient (tent-weighted, with mirroring across the center when
//! one side is unusable) or by fitting a local plane. The full stage runs
//! filter, hole filling and two refinement passes, checkpointing each
//! intermediate result so the stage can restart from any of them.

use std::path::Path;

use crate::decode::{erase_foreground, fill_code_holes_schedule};
use crate::error::{Error, Result};
use crate::filters::consensus_filter;
use crate::grid::{Axis, Grid, UNK};
use crate::io::{self, Checkpoint};
use crate::stats::fit_plane;

/// Refinement algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RefineMode {
    /// 1-D running average along the axis closest to the stripe gradient.
    DirectionalAverage,
    /// 1-D running average along the gradient snapped to one of the four
    /// principal/diagonal directions.
    AngleAligned,
    /// Local least-squares plane fit, keeping the constant term.
    PlanarFit,
}

/// Parameters of the refinement stage.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RefineConfig {
    pub mode: RefineMode,
    /// Window half-width of the 1-D averaging passes.
    pub radius: usize,
    /// Value-gradient bound of the first pass (along the stripe gradient).
    pub max_gradient_primary: f32,
    /// Bound of the second, perpendicular pass. Much tighter: codes should
    /// be nearly constant along the stripes.
    pub max_gradient_secondary: f32,
    /// Side length of the planar-fit window (odd).
    pub plane_window: usize,
    /// Inliers required before the plane value replaces the pixel.
    pub plane_min_support: usize,
    /// Inlier residual bound of the planar fit.
    pub plane_max_diff: f32,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            mode: RefineMode::DirectionalAverage,
            radius: 7,
            max_gradient_primary: 1.0,
            max_gradient_secondary: 0.1,
            plane_window: 5,
            plane_min_support: 20,
            plane_max_diff: 2.0,
        }
    }
}

// Tent-weighted running average of one scanline. For each center v0, window
// offsets whose value is unknown or further than |r|*max_gradient + 1 from
// v0 fall back to the mirrored offset (with negated difference); offsets
// unusable both ways are skipped. The averaged difference is applied only
// when at least `rad` offsets contributed.
fn refine_line(v: &[f32], f: &mut [f32], rad: usize, max_gradient: f32) {
    debug_assert_eq!(v.len(), f.len());
    let min_support = rad;
    let n = v.len() as i64;
    for x in 0..v.len() {
        let v0 = v[x];
        f[x] = v0;
        if v0 == UNK {
            continue;
        }
        let mut sum = 0.0f32;
        let mut sum_w = 0.0f32;
        let mut cnt = 0usize;
        for r in -(rad as i64)..=rad as i64 {
            let max_diff = r.abs() as f32 * max_gradient + 1.0;
            let w = 1.0 - r.abs() as f32 / (rad as f32 + 1.0);
            let usable = |i: i64| i >= 0 && i < n && (v0 - v[i as usize]).abs() <= max_diff;
            let mut x1 = x as i64 + r;
            let mut mirror = false;
            if !usable(x1) {
                x1 = x as i64 - r;
                mirror = true;
            }
            if !usable(x1) {
                continue;
            }
            let diff = if mirror {
                v0 - v[x1 as usize]
            } else {
                v[x1 as usize] - v0
            };
            sum += w * diff;
            sum_w += w;
            cnt += 1;
        }
        if cnt >= min_support {
            f[x] = v0 + sum / sum_w;
        }
    }
}

fn refine_along_axis(src: &Grid, axis: Axis, rad: usize, max_gradient: f32) -> Grid {
    let mut out = src.clone();
    let mut buf = Vec::new();
    let mut res = Vec::new();
    for span in src.lines(axis, 0) {
        src.read_line(span, &mut buf);
        res.resize(buf.len(), 0.0);
        refine_line(&buf, &mut res, rad, max_gradient);
        out.write_line(span, &res);
    }
    out
}

fn refine_diagonal(src: &Grid, main: bool, rad: usize, max_gradient: f32) -> Grid {
    // neighboring samples are sqrt(2) apart, so shrink the radius and relax
    // the per-step gradient bound
    let rad = (rad as f64 / std::f64::consts::SQRT_2).round() as usize;
    let max_gradient = max_gradient * 2.0;
    let mut out = src.clone();
    let mut buf = Vec::new();
    let mut res = Vec::new();
    let spans = if main {
        src.diagonal_lines_main(0)
    } else {
        src.diagonal_lines_anti(0)
    };
    for span in spans {
        src.read_line(span, &mut buf);
        res.resize(buf.len(), 0.0);
        refine_line(&buf, &mut res, rad, max_gradient);
        out.write_line(span, &res);
    }
    out
}

fn refine_planar(src: &Grid, config: &RefineConfig) -> Grid {
    let rad = (config.plane_window - 1) / 2;
    let (w, h) = (src.width(), src.height());
    let mut out = src.clone();
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut zs = Vec::new();
    for y0 in 0..h {
        for x0 in 0..w {
            xs.clear();
            ys.clear();
            zs.clear();
            for y in y0.saturating_sub(rad)..=(y0 + rad).min(h - 1) {
                for x in x0.saturating_sub(rad)..=(x0 + rad).min(w - 1) {
                    let z = src.get(x, y, 0);
                    if z != UNK {
                        xs.push(x as f32 - x0 as f32);
                        ys.push(y as f32 - y0 as f32);
                        zs.push(z);
                    }
                }
            }
            if let Some((a, b, c)) = fit_plane(&xs, &ys, &zs) {
                let inliers = zs
                    .iter()
                    .zip(xs.iter().zip(ys.iter()))
                    .filter(|&(&z, (&x, &y))| (z - (a * x + b * y + c)).abs() <= config.plane_max_diff)
                    .count();
                if inliers >= config.plane_min_support {
                    out.set(x0, y0, 0, c);
                }
            }
        }
    }
    out
}

/// One refinement pass along the stripe-gradient direction `angle`
/// (radians).
pub fn refine_codes(src: &Grid, angle: f64, max_gradient: f32, config: &RefineConfig) -> Result<Grid> {
    match config.mode {
        RefineMode::DirectionalAverage => {
            let axis = if angle.cos().abs() >= angle.sin().abs() {
                Axis::X
            } else {
                Axis::Y
            };
            Ok(refine_along_axis(src, axis, config.radius, max_gradient))
        }
        RefineMode::AngleAligned => {
            let mut dx = angle.cos().round() as i32;
            let mut dy = angle.sin().round() as i32;
            if dy < 0 {
                dx = -dx;
                dy = -dy;
            }
            match (dx, dy) {
                (1, 0) => Ok(refine_along_axis(src, Axis::X, config.radius, max_gradient)),
                (0, 1) => Ok(refine_along_axis(src, Axis::Y, config.radius, max_gradient)),
                (1, 1) => Ok(refine_diagonal(src, true, config.radius, max_gradient)),
                (-1, 1) => Ok(refine_diagonal(src, false, config.radius, max_gradient)),
                (dx, dy) => Err(Error::UnsupportedDirection { dx, dy }),
            }
        }
        RefineMode::PlanarFit => Ok(refine_planar(src, config)),
    }
}

/// Full post-decode refinement stage.
///
/// Runs consensus filtering, the hole-filling schedule, a refinement pass
/// along `angle` and a tighter pass perpendicular to it, then optionally
/// erases the foreground. Each intermediate result is written to `outdir`
/// under the standard checkpoint name for `direction`, so a rerun can pick
/// up any stage's output from disk.
pub fn refine_pipeline(
    outdir: &Path,
    direction: Axis,
    decoded: &Grid,
    angle: f64,
    mask: Option<&image::GrayImage>,
    config: &RefineConfig,
) -> Result<Grid> {
    let d = direction.index();
    let mut grid = decoded.clone();

    consensus_filter(&mut grid, 4, 0.25, 4.0);
    io::write_pfm(&io::checkpoint_path(outdir, d, Checkpoint::Filtered), &grid)?;

    log::info!("filling code holes");
    fill_code_holes_schedule(&mut grid, direction);
    io::write_pfm(&io::checkpoint_path(outdir, d, Checkpoint::HoleFilled), &grid)?;

    log::info!("refining code values (radius {})", config.radius);
    let pass1 = refine_codes(&grid, angle, config.max_gradient_primary, config)?;
    io::write_pfm(&io::checkpoint_path(outdir, d, Checkpoint::Refined1), &pass1)?;

    let perp = std::f64::consts::FRAC_PI_2 - angle;
    let mut pass2 = refine_codes(&pass1, perp, config.max_gradient_secondary, config)?;
    io::write_pfm(&io::checkpoint_path(outdir, d, Checkpoint::Refined2), &pass2)?;

    if let Some(mask) = mask {
        erase_foreground(&mut pass2, mask)?;
        io::write_pfm(
            &io::checkpoint_path(outdir, d, Checkpoint::ForegroundRemoved),
            &pass2,
        )?;
    }
    Ok(pass2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn constant_line_is_unchanged() {
        let v = [5.0; 9];
        let mut f = [0.0; 9];
        refine_line(&v, &mut f, 3, 1.0);
        assert_eq!(f, v);
    }

    #[test]
    fn staircase_edge_is_smoothed() {
        let v = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut f = [0.0; 6];
        refine_line(&v, &mut f, 2, 1.0);
        // at x=2: offsets +1,+2 see the step, tent weights 2/3 and 1/3
        assert_relative_eq!(f[2], 1.0 / 3.0, epsilon = 1e-6);
        assert_relative_eq!(f[3], 2.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn unknown_center_stays_unknown() {
        let v = [1.0, UNK, 1.0];
        let mut f = [0.0; 3];
        refine_line(&v, &mut f, 1, 1.0);
        assert_eq!(f[1], UNK);
    }

    #[test]
    fn isolated_pixel_keeps_its_value() {
        // all neighbors too far for maxdiff = |r|*0.1 + 1, support fails
        let v = [9.0, 0.0, 9.0, 9.0, 9.0, 0.0, 9.0];
        let mut f = [0.0; 7];
        refine_line(&v, &mut f, 3, 0.1);
        assert_eq!(f[1], 0.0);
    }

    #[test]
    fn directional_mode_picks_dominant_axis() {
        let mut g = Grid::new(6, 6, 1);
        for y in 0..6 {
            for x in 0..6 {
                g.set(x, y, 0, (x / 2) as f32);
            }
        }
        let cfg = RefineConfig {
            radius: 2,
            ..RefineConfig::default()
        };
        // gradient nearly horizontal: refine along X
        let r = refine_codes(&g, 0.1, 1.0, &cfg).unwrap();
        assert!(r.get(1, 0, 0) != g.get(1, 0, 0));
        // rows stay identical to each other
        for x in 0..6 {
            assert_eq!(r.get(x, 0, 0), r.get(x, 5, 0));
        }
    }

    #[test]
    fn angle_aligned_rejects_unsnappable_direction() {
        let g = Grid::new(4, 4, 1);
        let cfg = RefineConfig {
            mode: RefineMode::AngleAligned,
            ..RefineConfig::default()
        };
        let err = refine_codes(&g, std::f64::consts::PI, 1.0, &cfg);
        assert!(matches!(err, Err(Error::UnsupportedDirection { dx: -1, dy: 0 })));
    }

    #[test]
    fn angle_aligned_diagonal_covers_grid() {
        let mut g = Grid::new(8, 8, 1);
        for y in 0..8 {
            for x in 0..8 {
                g.set(x, y, 0, ((x + y) / 2) as f32);
            }
        }
        let cfg = RefineConfig {
            mode: RefineMode::AngleAligned,
            radius: 3,
            ..RefineConfig::default()
        };
        let r = refine_codes(&g, std::f64::consts::FRAC_PI_4, 1.0, &cfg).unwrap();
        assert_eq!(r.shape(), g.shape());
        // anti-diagonals hold constant code, so they must be untouched
        assert_eq!(r.get(0, 4, 0), 2.0);
    }

    #[test]
    fn planar_fit_replaces_center_with_plane_value() {
        let mut g = Grid::new(7, 7, 1);
        for y in 0..7 {
            for x in 0..7 {
                g.set(x, y, 0, 0.5 * x as f32 + 2.0);
            }
        }
        g.set(3, 3, 0, 9.0); // outlier center
        let cfg = RefineConfig {
            mode: RefineMode::PlanarFit,
            plane_min_support: 20,
            ..RefineConfig::default()
        };
        let r = refine_codes(&g, 0.0, 1.0, &cfg).unwrap();
        // outlier only shifts the constant term by 5.5/25
        assert_relative_eq!(r.get(3, 3, 0), 3.72, epsilon = 1e-3);
    }

    #[test]
    fn planar_fit_keeps_value_without_support() {
        let mut g = Grid::filled(7, 7, 1, UNK);
        g.set(3, 3, 0, 4.0);
        g.set(2, 3, 0, 4.0);
        g.set(3, 2, 0, 4.0);
        let cfg = RefineConfig {
            mode: RefineMode::PlanarFit,
            ..RefineConfig::default()
        };
        let r = refine_codes(&g, 0.0, 1.0, &cfg).unwrap();
        assert_eq!(r.get(3, 3, 0), 4.0);
        assert_eq!(r.get(0, 0, 0), UNK);
    }

    #[test]
    fn pipeline_writes_all_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = Grid::new(16, 16, 1);
        for y in 0..16 {
            for x in 0..16 {
                g.set(x, y, 0, x as f32);
            }
        }
        let cfg = RefineConfig {
            radius: 2,
            ..RefineConfig::default()
        };
        let out = refine_pipeline(dir.path(), Axis::X, &g, 0.0, None, &cfg).unwrap();
        assert_eq!(out.shape(), g.shape());
        for stage in [
            Checkpoint::Filtered,
            Checkpoint::HoleFilled,
            Checkpoint::Refined1,
            Checkpoint::Refined2,
        ] {
            assert!(io::checkpoint_path(dir.path(), 0, stage).exists());
        }
        assert!(!io::checkpoint_path(dir.path(), 0, Checkpoint::ForegroundRemoved).exists());
    }
}
