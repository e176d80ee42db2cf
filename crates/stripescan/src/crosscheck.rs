//! Bidirectional consistency validation of a reciprocal disparity-map pair.
//!
//! A forward disparity survives when following it into the other map finds a
//! reverse disparity of (nearly) opposite value. The reverse value is read
//! with bilinear interpolation, falling back to the nearest neighbor where
//! that disagrees less, since interpolating across a depth discontinuity
//! manufactures outliers. Surfaces visible in only one view never have a
//! consistent partner; the half-occlusion rule optionally keeps them when
//! the disparity ordering says occlusion (rather than a bad match) explains
//! the mismatch.

use crate::grid::{Grid, UNK};

/// Half-occlusion policy of [`cross_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HalfOcclusion {
    /// Mismatched, out-of-bounds and unknown targets all fail.
    Off,
    /// Source is the left view: keep a mismatch unless the negated forward
    /// disparity exceeds the reverse disparity. Out-of-bounds and unknown
    /// targets count as occluded and pass.
    AllowLeft,
    /// Mirror rule for the right view.
    AllowRight,
}

// Bilinear interpolation with UNK corners replaced by the nearest-neighbor
// value vr.
fn linear_interp(fx: f32, fy: f32, vr: f32, v00: f32, v01: f32, v10: f32, v11: f32) -> f32 {
    if vr == UNK {
        return UNK;
    }
    let v00 = if v00 == UNK { vr } else { v00 };
    let v01 = if v01 == UNK { vr } else { v01 };
    let v10 = if v10 == UNK { vr } else { v10 };
    let v11 = if v11 == UNK { vr } else { v11 };
    (1.0 - fx) * (1.0 - fy) * v00
        + (1.0 - fx) * fy * v01
        + fx * (1.0 - fy) * v10
        + fx * fy * v11
}

/// Cross-check `d0` against `d1`: keep each (dx, dy) of `d0` whose reverse
/// disparity read at the target location is opposite within `thresh`
/// (Euclidean), or which the half-occlusion rule excuses. Failing pixels
/// become `UNK`. With `x_only`, y disparities are ignored (and passed
/// through unchecked).
pub fn cross_check(
    d0: &Grid,
    d1: &Grid,
    thresh: f32,
    x_only: bool,
    half_occ: HalfOcclusion,
) -> Grid {
    let (w, h) = (d0.width(), d0.height());
    let mut out = Grid::filled(w, h, 2, UNK);

    for y in 0..h {
        for x in 0..w {
            let dx0 = d0.get(x, y, 0);
            let mut dy0 = d0.get(x, y, 1);
            let dy0_orig = dy0;

            if dx0 == UNK {
                continue;
            }
            if x_only || dy0 == UNK {
                dy0 = 0.0;
            }

            let xx = x as f32 + dx0;
            let yy = y as f32 + dy0;
            let ixr = xx.round() as i64;
            let iyr = yy.round() as i64;

            if ixr < 0 || ixr >= w as i64 || iyr < 0 || iyr >= h as i64 {
                if half_occ != HalfOcclusion::Off {
                    // mapping out of bounds counts as half-occluded
                    out.set(x, y, 0, dx0);
                }
                continue;
            }

            let ix0 = (xx.floor() as i64).max(0) as usize;
            let iy0 = (yy.floor() as i64).max(0) as usize;
            let ix1 = (ix0 + 1).min(w - 1);
            let iy1 = (iy0 + 1).min(h - 1);
            let fx = xx - ix0 as f32;
            let fy = yy - iy0 as f32;

            let dx1n = d1.get(ixr as usize, iyr as usize, 0);
            let dy1n = d1.get(ixr as usize, iyr as usize, 1);

            let dx1 = linear_interp(
                fx,
                fy,
                dx1n,
                d1.get(ix0, iy0, 0),
                d1.get(ix0, iy1, 0),
                d1.get(ix1, iy0, 0),
                d1.get(ix1, iy1, 0),
            );
            let dy1 = linear_interp(
                fx,
                fy,
                dy1n,
                d1.get(ix0, iy0, 1),
                d1.get(ix0, iy1, 1),
                d1.get(ix1, iy0, 1),
                d1.get(ix1, iy1, 1),
            );

            if dx1 == UNK {
                if half_occ != HalfOcclusion::Off {
                    out.set(x, y, 0, dx0);
                }
                continue;
            }
            let dy1 = if x_only || dy1 == UNK { 0.0 } else { dy1 };

            // forward and reverse disparities should cancel; keep the
            // smaller residual of interpolated and nearest-neighbor reads
            let dx = (dx0 + dx1).abs().min((dx0 + dx1n).abs());
            let dy = (dy0 + dy1).abs().min((dy0 + dy1n).abs());
            let dd = dx * dx + dy * dy;

            let occluded = match half_occ {
                HalfOcclusion::Off => false,
                HalfOcclusion::AllowLeft => -dx0 <= dx1,
                HalfOcclusion::AllowRight => -dx0 >= dx1,
            };
            if dd >= thresh * thresh && !occluded {
                continue;
            }

            out.set(x, y, 0, dx0);
            if !x_only {
                out.set(x, y, 1, dy0_orig); // may be UNK
            }
        }
    }
    out
}

/// Cross-check a reciprocal pair both ways, with mirrored half-occlusion
/// roles when `allow_half_occ` is set.
pub fn cross_check_pair(
    d0: &Grid,
    d1: &Grid,
    thresh: f32,
    x_only: bool,
    allow_half_occ: bool,
) -> (Grid, Grid) {
    log::info!("cross-checking with thresh={thresh}, xonly={x_only}, halfocc={allow_half_occ}");
    let (h0, h1) = if allow_half_occ {
        (HalfOcclusion::AllowLeft, HalfOcclusion::AllowRight)
    } else {
        (HalfOcclusion::Off, HalfOcclusion::Off)
    };
    (
        cross_check(d0, d1, thresh, x_only, h0),
        cross_check(d1, d0, thresh, x_only, h1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn disp_pair(w: usize, h: usize, d: f32) -> (Grid, Grid) {
        let mut d0 = Grid::new(w, h, 2);
        let mut d1 = Grid::new(w, h, 2);
        for y in 0..h {
            for x in 0..w {
                d0.set(x, y, 0, d);
                d1.set(x, y, 0, -d);
            }
        }
        (d0, d1)
    }

    #[test]
    fn consistent_pair_passes() {
        let (d0, d1) = disp_pair(10, 4, 2.0);
        let out = cross_check(&d0, &d1, 0.5, false, HalfOcclusion::Off);
        assert_eq!(out.get(3, 2, 0), 2.0);
        assert_eq!(out.get(3, 2, 1), 0.0);
    }

    #[test]
    fn inconsistent_reverse_disparity_fails() {
        let (d0, mut d1) = disp_pair(10, 4, 2.0);
        for x in 0..10 {
            d1.set(x, 2, 0, -4.0);
        }
        let out = cross_check(&d0, &d1, 0.5, false, HalfOcclusion::Off);
        assert_eq!(out.get(3, 2, 0), UNK);
        assert_eq!(out.get(3, 1, 0), 2.0);
    }

    #[test]
    fn fractional_disparity_uses_interpolation() {
        let mut d0 = Grid::filled(10, 1, 2, 0.0);
        let mut d1 = Grid::filled(10, 1, 2, 0.0);
        d0.set(2, 0, 0, 1.5);
        // reverse map ramps from -1 at x=3 to -2 at x=4; interp at 3.5 = -1.5
        d1.set(3, 0, 0, -1.0);
        d1.set(4, 0, 0, -2.0);
        let out = cross_check(&d0, &d1, 0.25, false, HalfOcclusion::Off);
        assert_relative_eq!(out.get(2, 0, 0), 1.5);
    }

    #[test]
    fn out_of_bounds_target_needs_half_occlusion() {
        let mut d0 = Grid::filled(4, 1, 2, UNK);
        d0.set(3, 0, 0, 5.0);
        let d1 = Grid::filled(4, 1, 2, UNK);
        let off = cross_check(&d0, &d1, 0.5, true, HalfOcclusion::Off);
        assert_eq!(off.get(3, 0, 0), UNK);
        let occ = cross_check(&d0, &d1, 0.5, true, HalfOcclusion::AllowLeft);
        assert_eq!(occ.get(3, 0, 0), 5.0);
    }

    #[test]
    fn unknown_target_needs_half_occlusion() {
        let mut d0 = Grid::filled(6, 1, 2, UNK);
        d0.set(1, 0, 0, 2.0);
        let d1 = Grid::filled(6, 1, 2, UNK);
        assert_eq!(
            cross_check(&d0, &d1, 0.5, true, HalfOcclusion::Off).get(1, 0, 0),
            UNK
        );
        assert_eq!(
            cross_check(&d0, &d1, 0.5, true, HalfOcclusion::AllowRight).get(1, 0, 0),
            2.0
        );
    }

    #[test]
    fn half_occlusion_sign_rule() {
        // forward disparity -5 lands on reverse disparity 3: ordering says
        // bad match for the left view, occlusion would need dx1 >= 5
        let mut d0 = Grid::filled(10, 1, 2, UNK);
        d0.set(7, 0, 0, -5.0);
        let mut d1 = Grid::filled(10, 1, 2, 3.0);
        let out = cross_check(&d0, &d1, 0.5, true, HalfOcclusion::AllowLeft);
        assert_eq!(out.get(7, 0, 0), UNK);

        for x in 0..10 {
            d1.set(x, 0, 0, 7.0);
        }
        let out = cross_check(&d0, &d1, 0.5, true, HalfOcclusion::AllowLeft);
        assert_eq!(out.get(7, 0, 0), -5.0);
    }

    #[test]
    fn unknown_y_component_is_assumed_zero_but_preserved() {
        let mut d0 = Grid::filled(8, 2, 2, UNK);
        d0.set(2, 1, 0, 1.0);
        let mut d1 = Grid::filled(8, 2, 2, UNK);
        d1.set(3, 1, 0, -1.0);
        d1.set(3, 1, 1, 0.0);
        let out = cross_check(&d0, &d1, 0.5, false, HalfOcclusion::Off);
        assert_eq!(out.get(2, 1, 0), 1.0);
        assert_eq!(out.get(2, 1, 1), UNK);
    }

    #[test]
    fn pair_check_mirrors_roles() {
        let (d0, d1) = disp_pair(10, 2, 1.0);
        let (c0, c1) = cross_check_pair(&d0, &d1, 0.5, true, false);
        assert_eq!(c0.get(4, 1, 0), 1.0);
        assert_eq!(c1.get(4, 1, 0), -1.0);
    }
}
