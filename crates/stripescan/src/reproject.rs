//! Projection-matrix recovery and disparity reprojection.
//!
//! A disparity map and the (u, v) code maps of one illumination direction
//! relate through an unknown 3×4 projective mapping M: for a scene point
//! S = [x y d 1]ᵀ the codes satisfy [u v 1]ᵀ ~ M S. Fixing the last entry
//! of M to 1 leaves 11 unknowns, and every valid pixel contributes two
//! linear equations, giving a heavily overconstrained system solved through
//! its normal equations. The fit is repeated on a schedule of shrinking
//! outlier thresholds, excluding the previous round's outliers each time,
//! and the robust matrix then translates the code maps back into a dense
//! reprojected disparity map. Outliers are identified on the recovered
//! disparities, not on the code values.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use nalgebra::{SMatrix, SVector};

use crate::error::{Error, Result};
use crate::grid::{Grid, UNK};
use crate::io::write_pfm;

// Divisors of x/u, y/v and d for better conditioning of the normal equations.
const SCALE: f64 = 1000.0;
const VSCALE: f64 = 1000.0;
const DSCALE: f64 = 100.0;

/// Recovered 3×4 projection matrix, row major, last entry fixed to 1.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Projection(pub [f64; 12]);

impl Projection {
    #[inline]
    fn at(&self, row: usize, col: usize) -> f64 {
        self.0[4 * row + col]
    }

    /// Write the matrix as text, one row of four numbers per line.
    pub fn write_matrix_file(&self, path: &Path) -> Result<()> {
        let mut f = File::create(path)?;
        for row in 0..3 {
            for col in 0..4 {
                write!(f, "{:.12} ", self.at(row, col))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Parameters of the robust reprojection stage.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReprojectConfig {
    /// (sample step, outlier threshold) per robust round. Each round
    /// re-solves with the outliers of the previous round excluded, then
    /// re-marks outliers at the new threshold.
    pub schedule: Vec<(usize, f32)>,
    /// Disparity-difference bound of the before/after comparison statistics.
    pub compare_thresh: f32,
}

impl Default for ReprojectConfig {
    fn default() -> Self {
        Self {
            schedule: vec![(3, 40.0), (2, 5.0), (2, 2.0), (1, 1.0)],
            compare_thresh: 1.0,
        }
    }
}

/// Fit statistics of one [`evaluate_fit`] round, in disparity units.
#[derive(Debug, Clone, Copy)]
pub struct FitStats {
    pub rms_total: f64,
    pub rms_good: f64,
    pub bad_fraction: f64,
}

/// Comparison statistics of two disparity maps (fractions in [0, 1]).
#[derive(Debug, Clone, Copy)]
pub struct CompareStats {
    /// Pixels known in both maps, relative to the full image.
    pub coverage: f64,
    pub rms: f64,
    pub bad_fraction: f64,
}

/// Estimate the projection matrix from every `step`-th pixel inside a
/// `step`-wide margin, skipping pixels marked in `bad` (flat row-major
/// bytes) and pixels with unknown disparity or codes.
///
/// The two equations of a sample with scaled values (x, y, d, u, v) are
///
/// ```text
/// [x y d 1 0 0 0 0 -xu -yu -du] m = u
/// [0 0 0 0 x y d 1 -xv -yv -dv] m = v
/// ```
///
/// accumulated directly into the 11×11 normal equations and solved by LU.
pub fn solve_projection(
    disp: &Grid,
    code_u: &Grid,
    code_v: &Grid,
    bad: &[u8],
    step: usize,
) -> Result<Projection> {
    disp.ensure_same_shape(code_u, "solve_projection")?;
    disp.ensure_same_shape(code_v, "solve_projection")?;
    let (w, h) = (disp.width(), disp.height());

    let mut ata = SMatrix::<f64, 11, 11>::zeros();
    let mut atb = SVector::<f64, 11>::zeros();
    let mut cnt = 0usize;
    let mut cnt_unk_d = 0usize;
    let mut cnt_unk_c = 0usize;
    let mut samples = 0usize;

    let mut y = step;
    while y + step < h {
        let mut x = step;
        while x + step < w {
            let sx = x;
            x += step;
            if bad[y * w + sx] != 0 {
                continue;
            }
            let d = disp.get(sx, y, 0);
            let u = code_u.get(sx, y, 0);
            let v = code_v.get(sx, y, 0);
            cnt += 1;
            if d == UNK {
                cnt_unk_d += 1;
            }
            if u == UNK || v == UNK {
                cnt_unk_c += 1;
            }
            if d == UNK || u == UNK || v == UNK {
                continue;
            }

            let d = d as f64 / DSCALE;
            let u = u as f64 / SCALE;
            let v = v as f64 / VSCALE;
            let xx = sx as f64 / SCALE;
            let yy = y as f64 / SCALE;

            let r0 = SVector::<f64, 11>::from([
                xx,
                yy,
                d,
                1.0,
                0.0,
                0.0,
                0.0,
                0.0,
                -xx * u,
                -yy * u,
                -d * u,
            ]);
            let r1 = SVector::<f64, 11>::from([
                0.0,
                0.0,
                0.0,
                0.0,
                xx,
                yy,
                d,
                1.0,
                -xx * v,
                -yy * v,
                -d * v,
            ]);
            ata += r0 * r0.transpose();
            atb += r0 * u;
            ata += r1 * r1.transpose();
            atb += r1 * v;
            samples += 1;
        }
        y += step;
    }

    if samples == 0 {
        return Err(Error::DegenerateFit {
            context: "solve_projection",
        });
    }
    log::debug!(
        "solve_projection step={step}: {samples} samples, unknown d {:.2}%, unknown code {:.2}%",
        100.0 * cnt_unk_d as f64 / cnt as f64,
        100.0 * cnt_unk_c as f64 / cnt as f64
    );

    let sol = ata.lu().solve(&atb).ok_or(Error::DegenerateFit {
        context: "solve_projection",
    })?;
    let mut m = [1.0f64; 12];
    m[..11].copy_from_slice(sol.as_slice());
    let m = Projection(m);
    for row in 0..3 {
        log::debug!(
            "M[{row}] = {:12.6} {:12.6} {:12.6} {:12.6}",
            m.at(row, 0),
            m.at(row, 1),
            m.at(row, 2),
            m.at(row, 3)
        );
    }
    Ok(m)
}

/// Translate the (u, v) code maps into disparities under `m`. Each pixel has
/// two disparity estimates (one per code axis); they are combined by least
/// squares. Pixels with unknown codes become `UNK`.
pub fn project_disparities(code_u: &Grid, code_v: &Grid, m: &Projection) -> Grid {
    let (w, h) = (code_u.width(), code_u.height());
    let mut out = Grid::new(w, h, 1);

    for y in 0..h {
        for x in 0..w {
            let u = code_u.get(x, y, 0);
            let v = code_v.get(x, y, 0);
            if u == UNK || v == UNK {
                out.set(x, y, 0, UNK);
                continue;
            }
            let u = u as f64 / SCALE;
            let v = v as f64 / VSCALE;
            let xx = x as f64 / SCALE;
            let yy = y as f64 / SCALE;

            let bu = xx * (m.at(2, 0) * u - m.at(0, 0))
                + yy * (m.at(2, 1) * u - m.at(0, 1))
                + (m.at(2, 3) * u - m.at(0, 3));
            let bv = xx * (m.at(2, 0) * v - m.at(1, 0))
                + yy * (m.at(2, 1) * v - m.at(1, 1))
                + (m.at(2, 3) * v - m.at(1, 3));
            let au = -(m.at(2, 2) * u - m.at(0, 2));
            let av = -(m.at(2, 2) * v - m.at(1, 2));

            let dd = (au * bu + av * bv) / (au * au + av * av);
            out.set(x, y, 0, (dd * DSCALE) as f32);
        }
    }
    out
}

/// Reproject under `m` and mark every pixel whose reconstructed disparity
/// misses the measured one by more than `max_err` in `bad` (cleared first).
/// The rms figures cover the surviving pixels only.
pub fn evaluate_fit(
    disp: &Grid,
    code_u: &Grid,
    code_v: &Grid,
    bad: &mut [u8],
    m: &Projection,
    max_err: f32,
) -> FitStats {
    let (w, h) = (disp.width(), disp.height());
    let ndisp = project_disparities(code_u, code_v, m);
    bad.fill(0);

    let mut cnt = 0usize;
    let mut bad_cnt = 0usize;
    let mut sd = 0.0f64;
    for y in 0..h {
        for x in 0..w {
            let d = disp.get(x, y, 0);
            let nd = ndisp.get(x, y, 0);
            if d == UNK || nd == UNK {
                continue;
            }
            cnt += 1;
            let dd = (d - nd) as f64;
            if dd.abs() > max_err as f64 {
                bad_cnt += 1;
                bad[y * w + x] = 1;
            } else {
                sd += dd * dd;
            }
        }
    }

    let stats = if cnt == 0 {
        FitStats {
            rms_total: 0.0,
            rms_good: 0.0,
            bad_fraction: 0.0,
        }
    } else {
        FitStats {
            rms_total: (sd / cnt as f64).sqrt(),
            rms_good: (sd / (cnt - bad_cnt) as f64).sqrt(),
            bad_fraction: bad_cnt as f64 / cnt as f64,
        }
    };
    log::info!(
        "rmstot={:6.2}, rmsgood={:6.2}, bad={:5.2}% (bad thresh={max_err})",
        stats.rms_total,
        stats.rms_good,
        100.0 * stats.bad_fraction
    );
    stats
}

/// Compare two disparity maps pixel-wise, returning statistics and a signed
/// error image (`UNK` where either map is unknown).
pub fn compare_disparities(d0: &Grid, d1: &Grid, bad_thresh: f32) -> (CompareStats, Grid) {
    let (w, h) = (d0.width(), d0.height());
    let mut err = Grid::filled(w, h, 1, UNK);

    let mut cnt = 0usize;
    let mut bad_cnt = 0usize;
    let mut sd = 0.0f64;
    for y in 0..h {
        for x in 0..w {
            let v0 = d0.get(x, y, 0);
            let v1 = d1.get(x, y, 0);
            if v0 == UNK || v1 == UNK {
                continue;
            }
            cnt += 1;
            let diff = v0 - v1;
            sd += (diff as f64) * (diff as f64);
            if diff.abs() > bad_thresh {
                bad_cnt += 1;
            }
            err.set(x, y, 0, diff);
        }
    }

    let stats = CompareStats {
        coverage: cnt as f64 / (w * h) as f64,
        rms: if cnt == 0 { 0.0 } else { (sd / cnt as f64).sqrt() },
        bad_fraction: if cnt == 0 {
            0.0
        } else {
            bad_cnt as f64 / cnt as f64
        },
    };
    (stats, err)
}

fn compare_line(label: &str, stats: &CompareStats, bad_thresh: f32) -> String {
    format!(
        "{label}: compared: {:5.2}   rms: {:5.2}   bad: {:5.2}   badthresh: {bad_thresh}\n",
        100.0 * stats.coverage,
        stats.rms,
        100.0 * stats.bad_fraction
    )
}

fn remove_bad(ndisp: &mut Grid, bad: &[u8]) {
    let (w, h) = (ndisp.width(), ndisp.height());
    for y in 0..h {
        for x in 0..w {
            if bad[y * w + x] != 0 {
                ndisp.set(x, y, 0, UNK);
            }
        }
    }
}

/// Full reprojection stage. `disp` and `code` are two-band flow-style maps
/// of one view (x disparity in band 0, codes in both bands). Recovers the
/// projection matrix over `config.schedule`, writes it to `mat_path`,
/// appends before/after comparison lines to `log_path` (and the signed
/// error image to `err_path` when given), and returns the reprojected
/// disparity map with an all-unknown y band.
pub fn reproject(
    disp: &Grid,
    code: &Grid,
    mat_path: &Path,
    log_path: &Path,
    err_path: Option<&Path>,
    config: &ReprojectConfig,
) -> Result<(Grid, Projection)> {
    disp.ensure_same_shape(code, "reproject")?;
    let (d, _) = disp.split_bands();
    let (code_u, code_v) = code.split_bands();
    let (w, h) = (d.width(), d.height());
    log::info!("reprojecting {w}x{h}, {} rounds", config.schedule.len());

    let mut bad = vec![0u8; w * h];
    let mut m = None;
    for &(step, max_err) in &config.schedule {
        let fit = solve_projection(&d, &code_u, &code_v, &bad, step)?;
        evaluate_fit(&d, &code_u, &code_v, &mut bad, &fit, max_err);
        m = Some(fit);
    }
    let m = m.ok_or(Error::DegenerateFit {
        context: "reproject",
    })?;
    m.write_matrix_file(mat_path)?;

    let mut ndisp = project_disparities(&code_u, &code_v, &m);
    let mut log = File::create(log_path)?;

    let (before, _) = compare_disparities(&d, &ndisp, config.compare_thresh);
    log.write_all(compare_line("before", &before, config.compare_thresh).as_bytes())?;
    remove_bad(&mut ndisp, &bad);
    let (after, err) = compare_disparities(&d, &ndisp, config.compare_thresh);
    log.write_all(compare_line("after ", &after, config.compare_thresh).as_bytes())?;
    if let Some(err_path) = err_path {
        write_pfm(err_path, &err)?;
    }

    let blank = Grid::filled(w, h, 1, UNK);
    Ok((Grid::merge_bands(&ndisp, &blank)?, m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Read;

    const M_TRUE: Projection = Projection([
        1.0, 0.0, 0.1, 0.01, //
        0.0, 1.0, 0.05, 0.02, //
        0.001, 0.002, 0.003, 1.0,
    ]);

    // Synthesize code maps consistent with a disparity map under `m`.
    fn synth(w: usize, h: usize, m: &Projection) -> (Grid, Grid, Grid) {
        let mut disp = Grid::new(w, h, 1);
        let mut cu = Grid::new(w, h, 1);
        let mut cv = Grid::new(w, h, 1);
        for y in 0..h {
            for x in 0..w {
                let d = 10.0 + 0.1 * x as f64 + 0.05 * y as f64;
                let s = [x as f64 / SCALE, y as f64 / SCALE, d / DSCALE, 1.0];
                let mut p = [0.0f64; 3];
                for (i, pi) in p.iter_mut().enumerate() {
                    for (j, sj) in s.iter().enumerate() {
                        *pi += m.at(i, j) * sj;
                    }
                }
                disp.set(x, y, 0, d as f32);
                cu.set(x, y, 0, (SCALE * p[0] / p[2]) as f32);
                cv.set(x, y, 0, (VSCALE * p[1] / p[2]) as f32);
            }
        }
        (disp, cu, cv)
    }

    #[test]
    fn recovers_synthetic_projection() {
        let (disp, cu, cv) = synth(40, 30, &M_TRUE);
        let bad = vec![0u8; 40 * 30];
        let m = solve_projection(&disp, &cu, &cv, &bad, 3).unwrap();
        let ndisp = project_disparities(&cu, &cv, &m);
        for y in (0..30).step_by(7) {
            for x in (0..40).step_by(7) {
                assert_relative_eq!(ndisp.get(x, y, 0), disp.get(x, y, 0), epsilon = 0.05);
            }
        }
    }

    #[test]
    fn unknown_codes_project_to_unknown() {
        let (disp, mut cu, cv) = synth(20, 15, &M_TRUE);
        cu.set(5, 5, 0, UNK);
        let bad = vec![0u8; 20 * 15];
        let m = solve_projection(&disp, &cu, &cv, &bad, 2).unwrap();
        let ndisp = project_disparities(&cu, &cv, &m);
        assert_eq!(ndisp.get(5, 5, 0), UNK);
        assert_ne!(ndisp.get(6, 5, 0), UNK);
    }

    #[test]
    fn bad_pixels_are_excluded_from_the_fit() {
        let (mut disp, cu, cv) = synth(40, 30, &M_TRUE);
        // corrupt one row of disparities
        for x in 0..40 {
            disp.set(x, 15, 0, 500.0);
        }
        let mut bad = vec![0u8; 40 * 30];
        let m = solve_projection(&disp, &cu, &cv, &bad, 1).unwrap();
        let stats = evaluate_fit(&disp, &cu, &cv, &mut bad, &m, 5.0);
        assert!(stats.bad_fraction > 0.0);
        assert!(bad[15 * 40 + 20] != 0);

        // second round without the outliers fits the clean pixels tightly
        let m = solve_projection(&disp, &cu, &cv, &bad, 1).unwrap();
        let ndisp = project_disparities(&cu, &cv, &m);
        assert_relative_eq!(ndisp.get(10, 5, 0), disp.get(10, 5, 0), epsilon = 0.05);
    }

    #[test]
    fn degenerate_input_is_an_error() {
        let disp = Grid::filled(10, 10, 1, UNK);
        let cu = Grid::filled(10, 10, 1, UNK);
        let cv = Grid::filled(10, 10, 1, UNK);
        let bad = vec![0u8; 100];
        assert!(matches!(
            solve_projection(&disp, &cu, &cv, &bad, 2),
            Err(Error::DegenerateFit { .. })
        ));
    }

    #[test]
    fn compare_reports_coverage_rms_and_bad() {
        let mut d0 = Grid::filled(10, 1, 1, 1.0);
        let mut d1 = Grid::filled(10, 1, 1, 1.0);
        d0.set(0, 0, 0, UNK);
        d1.set(9, 0, 0, 4.0); // diff 3, bad at thresh 1
        let (stats, err) = compare_disparities(&d0, &d1, 1.0);
        assert_relative_eq!(stats.coverage, 0.8);
        assert_relative_eq!(stats.bad_fraction, 1.0 / 8.0);
        assert_relative_eq!(stats.rms, (9.0f64 / 8.0).sqrt());
        assert_eq!(err.get(0, 0, 0), UNK);
        assert_eq!(err.get(9, 0, 0), -3.0);
    }

    #[test]
    fn full_stage_writes_matrix_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let (disp, cu, cv) = synth(40, 30, &M_TRUE);
        let blank = Grid::filled(40, 30, 1, UNK);
        let disp2 = Grid::merge_bands(&disp, &blank).unwrap();
        let code2 = Grid::merge_bands(&cu, &cv).unwrap();

        let mat_path = dir.path().join("projmat.txt");
        let log_path = dir.path().join("reproject.log");
        let err_path = dir.path().join("err.pfm");
        let (ndisp, _) = reproject(
            &disp2,
            &code2,
            &mat_path,
            &log_path,
            Some(&err_path),
            &ReprojectConfig::default(),
        )
        .unwrap();

        assert_eq!(ndisp.bands(), 2);
        assert_relative_eq!(ndisp.get(20, 10, 0), disp.get(20, 10, 0), epsilon = 0.05);
        assert_eq!(ndisp.get(20, 10, 1), UNK);

        let mut text = String::new();
        File::open(&mat_path)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        let nums: Vec<f64> = text
            .split_whitespace()
            .map(|t| t.parse().unwrap())
            .collect();
        assert_eq!(nums.len(), 12);
        assert_relative_eq!(nums[11], 1.0, epsilon = 1e-6);

        let mut log = String::new();
        File::open(&log_path)
            .unwrap()
            .read_to_string(&mut log)
            .unwrap();
        assert!(log.contains("before"));
        assert!(log.contains("after"));
        assert!(crate::io::read_pfm(&err_path).is_ok());
    }
}
