//! Merging of disparity maps from repeated matches, multiple viewpoints and
//! multiple illumination directions, with per-pixel quality statistics.

use image::GrayImage;

use crate::error::{Error, Result};
use crate::grid::{Grid, UNK};
use crate::stats::{median2, robust_average};

fn ensure_all_same_shape(first: &Grid, rest: &[Grid], context: &'static str) -> Result<()> {
    for g in rest {
        first.ensure_same_shape(g, context)?;
    }
    Ok(())
}

/// First-stage merge of two-band disparity maps: per band, the mean of the
/// known samples (`UNK` below `min_group`). When any x sample strays more
/// than `max_diff` from the x mean, the x band falls back to the iterated
/// robust average instead.
pub fn merge_disparity_maps(maps: &[Grid], min_group: usize, max_diff: f32) -> Result<Grid> {
    let Some((first, rest)) = maps.split_first() else {
        return Err(Error::EmptyInput);
    };
    ensure_all_same_shape(first, rest, "merge_disparity_maps")?;

    let (w, h) = (first.width(), first.height());
    let mut out = Grid::new(w, h, 2);
    let mut samples = Vec::with_capacity(maps.len());

    for y in 0..h {
        for x in 0..w {
            for band in 0..2 {
                samples.clear();
                samples.extend(
                    maps.iter()
                        .map(|m| m.get(x, y, band))
                        .filter(|&v| v != UNK),
                );
                if samples.len() < min_group {
                    out.set(x, y, band, UNK);
                    continue;
                }
                let mean = samples.iter().sum::<f32>() / samples.len() as f32;
                let value = if band == 0 && samples.iter().any(|&v| (v - mean).abs() > max_diff) {
                    robust_average(&samples, max_diff, min_group)
                } else {
                    mean
                };
                out.set(x, y, band, value);
            }
        }
    }
    Ok(out)
}

/// Final merge with statistics. Collects the x disparities of all view and
/// illumination maps per pixel, picks a reference value (the first-stage
/// merged map, falling back to the median of the view samples, then of all
/// samples), and averages the samples within `max_diff` of it.
///
/// Returns the merged two-band map (y band all `UNK`), the sample standard
/// deviation (`UNK` below 2 samples) and the per-pixel sample count.
pub fn merge_with_stats(
    reference: &Grid,
    view_maps: &[Grid],
    illum_maps: &[Grid],
    max_diff: f32,
) -> Result<(Grid, Grid, GrayImage)> {
    ensure_all_same_shape(reference, view_maps, "merge_with_stats")?;
    ensure_all_same_shape(reference, illum_maps, "merge_with_stats")?;

    let (w, h) = (reference.width(), reference.height());
    let mut out_d = Grid::filled(w, h, 2, UNK);
    let mut out_sd = Grid::filled(w, h, 1, UNK);
    let mut out_n = GrayImage::new(w as u32, h as u32);
    let mut vals = Vec::with_capacity(view_maps.len() + illum_maps.len());

    for y in 0..h {
        for x in 0..w {
            vals.clear();
            vals.extend(
                view_maps
                    .iter()
                    .map(|m| m.get(x, y, 0))
                    .filter(|&v| v != UNK),
            );
            let num_view = vals.len();
            vals.extend(
                illum_maps
                    .iter()
                    .map(|m| m.get(x, y, 0))
                    .filter(|&v| v != UNK),
            );

            let mut md = reference.get(x, y, 0);
            if md == UNK && num_view > 0 {
                md = median2(&mut vals[..num_view].to_vec());
            }
            if md == UNK && !vals.is_empty() {
                md = median2(&mut vals.clone());
            }
            if md == UNK {
                continue;
            }

            // SD of residuals w.r.t. the reference value, for stability
            let mut s = 0.0f32;
            let mut sr = 0.0f64;
            let mut srr = 0.0f64;
            let mut n = 0u32;
            for &d in &vals {
                let r = (d - md) as f64;
                if r.abs() > max_diff as f64 {
                    continue;
                }
                s += d;
                sr += r;
                srr += r * r;
                n += 1;
            }
            if n < 1 {
                continue;
            }
            out_n.put_pixel(x as u32, y as u32, image::Luma([n.min(255) as u8]));
            out_d.set(x, y, 0, s / n as f32);
            out_sd.set(
                x,
                y,
                0,
                if n > 1 {
                    (((srr - sr * sr / n as f64) / (n as f64 - 1.0)).max(0.0)).sqrt() as f32
                } else {
                    UNK
                },
            );
        }
    }
    Ok((out_d, out_sd, out_n))
}

/// Clip merged disparities to `[dmin, dmax]` and reconcile the side-channel
/// maps: unknown disparities get n = 0 and sd = `UNK`; a known disparity
/// with n = 0 (introduced by later filtering) gets n = 1.
pub fn clip_disparities(d: &mut Grid, sd: &mut Grid, n: &mut GrayImage, dmin: f32, dmax: f32) {
    let (w, h) = (d.width(), d.height());
    let mut clipped = 0usize;
    let mut valid = 0usize;
    for y in 0..h {
        for x in 0..w {
            let mut v = d.get(x, y, 0);
            if v != UNK {
                valid += 1;
                if v < dmin || v > dmax {
                    v = UNK;
                    clipped += 1;
                }
            }
            if v == UNK {
                d.set(x, y, 0, UNK);
                d.set(x, y, 1, UNK);
                n.put_pixel(x as u32, y as u32, image::Luma([0]));
                sd.set(x, y, 0, UNK);
            } else if n.get_pixel(x as u32, y as u32).0[0] == 0 {
                n.put_pixel(x as u32, y as u32, image::Luma([1]));
                sd.set(x, y, 0, UNK);
            }
        }
    }
    log::info!(
        "{clipped} pixels ({:.3}% of valid disparities) clipped",
        100.0 * clipped as f32 / valid.max(1) as f32
    );
}

/// Erase both disparity bands where the mask is zero.
pub fn mask_disparities(d: &mut Grid, mask: &GrayImage) -> Result<()> {
    if mask.width() as usize != d.width() || mask.height() as usize != d.height() {
        return Err(Error::ShapeMismatch {
            context: "mask_disparities: mask",
            expected: (d.width(), d.height(), 1),
            got: (mask.width() as usize, mask.height() as usize, 1),
        });
    }
    let mut masked = 0usize;
    let mut valid = 0usize;
    for y in 0..d.height() {
        for x in 0..d.width() {
            if d.get(x, y, 0) == UNK {
                continue;
            }
            valid += 1;
            if mask.get_pixel(x as u32, y as u32).0[0] == 0 {
                masked += 1;
                d.set(x, y, 0, UNK);
                d.set(x, y, 1, UNK);
            }
        }
    }
    log::info!(
        "{masked} pixels ({:.3}% of valid disparities) masked",
        100.0 * masked as f32 / valid.max(1) as f32
    );
    Ok(())
}
