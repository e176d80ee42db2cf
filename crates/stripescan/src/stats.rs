//! Shared robust-statistics helpers: medians, iterated robust averaging and
//! the least-squares plane fit used by refinement and hole filling.

use nalgebra::{Matrix3, Vector3};

use crate::grid::UNK;

/// Median (upper element for even length). Returns `UNK` for an empty slice.
pub fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return UNK;
    }
    values.sort_by(f32::total_cmp);
    values[values.len() / 2]
}

/// Median that averages the central pair for even length.
pub fn median2(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return UNK;
    }
    values.sort_by(f32::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Iterated robust average: repeatedly keep only the values within
/// `max_diff` of the current median until the set is stable, then return
/// their mean. Returns `UNK` when fewer than `min_group` values survive.
pub fn robust_average(values: &[f32], max_diff: f32, min_group: usize) -> f32 {
    let mut nums: Vec<f32> = values.to_vec();
    nums.sort_by(f32::total_cmp);

    let mut stable = 0;
    while nums.len() != stable && !nums.is_empty() {
        stable = nums.len();
        let med = nums[nums.len() / 2];
        nums.retain(|&v| (v - med).abs() <= max_diff);
    }

    if nums.len() < min_group {
        return UNK;
    }
    nums.iter().sum::<f32>() / nums.len() as f32
}

/// Least-squares fit of the plane `z = a*x + b*y + c` through the sample
/// triples. Solves the 3×3 normal equations by LU; returns `None` for a
/// singular system (collinear or insufficient samples).
pub fn fit_plane(xs: &[f32], ys: &[f32], zs: &[f32]) -> Option<(f32, f32, f32)> {
    debug_assert!(xs.len() == ys.len() && ys.len() == zs.len());
    let mut s1 = 0.0f64;
    let (mut sx, mut sy, mut sz) = (0.0f64, 0.0f64, 0.0f64);
    let (mut sxx, mut sxy, mut sxz) = (0.0f64, 0.0f64, 0.0f64);
    let (mut syy, mut syz) = (0.0f64, 0.0f64);
    for k in 0..xs.len() {
        let (x, y, z) = (xs[k] as f64, ys[k] as f64, zs[k] as f64);
        s1 += 1.0;
        sx += x;
        sy += y;
        sz += z;
        sxx += x * x;
        sxy += x * y;
        sxz += x * z;
        syy += y * y;
        syz += y * z;
    }
    let a = Matrix3::new(sxx, sxy, sx, sxy, syy, sy, sx, sy, s1);
    let rhs = Vector3::new(sxz, syz, sz);
    let sol = a.lu().solve(&rhs)?;
    if !(sol[0].is_finite() && sol[1].is_finite() && sol[2].is_finite()) {
        return None;
    }
    Some((sol[0] as f32, sol[1] as f32, sol[2] as f32))
}

/// Index-based quantile over an already sorted slice (matches the
/// `v[pct * n / 100]` convention of the reference statistics).
pub fn sorted_quantile(sorted: &[f32], pct: usize) -> f32 {
    debug_assert!(!sorted.is_empty());
    sorted[(pct * sorted.len() / 100).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn robust_average_rejects_outlier() {
        let vals = [1.0, 1.1, 0.9, 1.05, 10.0];
        let avg = robust_average(&vals, 0.5, 2);
        assert_relative_eq!(avg, (1.0 + 1.1 + 0.9 + 1.05) / 4.0, epsilon = 1e-6);
    }

    #[test]
    fn robust_average_needs_min_group() {
        let vals = [1.0, 9.0, 20.0];
        assert_eq!(robust_average(&vals, 0.5, 2), UNK);
    }

    #[test]
    fn plane_fit_recovers_exact_plane() {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut zs = Vec::new();
        for y in 0..5 {
            for x in 0..5 {
                xs.push(x as f32);
                ys.push(y as f32);
                zs.push(2.0 * x as f32 - 0.5 * y as f32 + 3.0);
            }
        }
        let (a, b, c) = fit_plane(&xs, &ys, &zs).unwrap();
        assert_relative_eq!(a, 2.0, epsilon = 1e-4);
        assert_relative_eq!(b, -0.5, epsilon = 1e-4);
        assert_relative_eq!(c, 3.0, epsilon = 1e-4);
    }

    #[test]
    fn plane_fit_detects_degenerate_input() {
        // all samples on one line: normal matrix is singular
        let xs = [0.0, 1.0, 2.0];
        let ys = [0.0, 0.0, 0.0];
        let zs = [1.0, 2.0, 3.0];
        assert!(fit_plane(&xs, &ys, &zs).is_none());
    }

    #[test]
    fn medians() {
        assert_eq!(median(&mut []), UNK);
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median2(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
    }
}
