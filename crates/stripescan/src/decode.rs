//! Decoding of thresholded stripe-pattern images into float code maps.
//!
//! Each input image labels every pixel 0 (black), 255 (white) or 128
//! (undecidable). The [`Decoder`] accumulates one bit per image, then looks
//! the resulting bit pattern up in a [`CodeTable`] to produce a single-band
//! [`Grid`] of stripe positions with `UNK` wherever any bit was undecidable
//! or the pattern is not a valid code.

use image::{GrayImage, RgbImage};

use crate::codetable::CodeTable;
use crate::error::{Error, Result};
use crate::grid::{Axis, Grid, UNK};

/// Pixel label in a threshold image meaning "stripe on".
pub const LABEL_ON: u8 = 255;
/// Pixel label meaning "could not threshold this pixel".
pub const LABEL_UNDECIDED: u8 = 128;

/// Accumulates per-pixel bit patterns from a sequence of threshold images.
#[derive(Debug, Clone)]
pub struct Decoder {
    width: usize,
    height: usize,
    value: Vec<u32>,
    unknown: Vec<u32>,
}

impl Decoder {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            value: vec![0; width * height],
            unknown: vec![0; width * height],
        }
    }

    /// Fold one threshold image in as bit `bit` (0 = least significant).
    /// White pixels set the bit in the value pattern, undecided pixels set it
    /// in the unknown pattern, black pixels leave both clear.
    pub fn accumulate_bit(&mut self, image: &GrayImage, bit: u32) -> Result<()> {
        if image.width() as usize != self.width || image.height() as usize != self.height {
            return Err(Error::ShapeMismatch {
                context: "decode: threshold image",
                expected: (self.width, self.height, 1),
                got: (image.width() as usize, image.height() as usize, 1),
            });
        }
        let mask = 1u32 << bit;
        for (i, p) in image.pixels().enumerate() {
            match p.0[0] {
                LABEL_ON => self.value[i] |= mask,
                LABEL_UNDECIDED => self.unknown[i] |= mask,
                _ => {}
            }
        }
        Ok(())
    }

    /// Look accumulated patterns up in `table`. A pixel decodes to `UNK`
    /// when any of its bits was undecided or the pattern is not in the table.
    pub fn decode(&self, table: &CodeTable) -> Grid {
        let mut out = Grid::new(self.width, self.height, 1);
        let data = out.data_mut();
        let mut known = 0usize;
        for i in 0..self.value.len() {
            data[i] = if self.unknown[i] != 0 {
                UNK
            } else {
                match table.position_of(self.value[i]) {
                    Some(pos) => pos as f32,
                    None => UNK,
                }
            };
            if data[i] != UNK {
                known += 1;
            }
        }
        log::info!(
            "decoded {} of {} pixels ({:.1}%)",
            known,
            self.value.len(),
            100.0 * known as f32 / self.value.len() as f32
        );
        out
    }
}

// Fill runs of UNK in one scanline when the run is short and the bracketing
// known values agree. Line start and end never qualify (no bracket there).
fn fill_holes_line(buf: &mut [f32], max_width: usize, max_border_diff: f32) {
    let mut old_v = UNK;
    let mut cnt = 0usize;
    for x in 0..buf.len() {
        let v = buf[x];
        if v != UNK {
            if cnt > 0 && cnt <= max_width && (v - old_v).abs() <= max_border_diff {
                let fill = 0.5 * (v + old_v);
                for k in 1..=cnt {
                    buf[x - k] = fill;
                }
            }
            cnt = 0;
            old_v = v;
        } else {
            cnt += 1;
        }
    }
}

/// Fill short `UNK` runs along `axis` in band 0, averaging the run's two
/// neighbors when they differ by at most `max_border_diff`.
pub fn fill_code_holes(grid: &mut Grid, axis: Axis, max_width: usize, max_border_diff: f32) {
    let mut buf = Vec::new();
    for span in grid.lines(axis, 0) {
        grid.read_line(span, &mut buf);
        fill_holes_line(&mut buf, max_width, max_border_diff);
        grid.write_line(span, &buf);
    }
}

/// Standard three-pass hole-filling schedule: tolerant pass along the stripe
/// axis, exact-match pass across it, then a medium pass along it again.
/// Hole width is capped at 5 pixels in all passes.
pub fn fill_code_holes_schedule(grid: &mut Grid, primary: Axis) {
    const MAX_WIDTH: usize = 5;
    fill_code_holes(grid, primary, MAX_WIDTH, 2.0);
    fill_code_holes(grid, primary.orthogonal(), MAX_WIDTH, 0.0);
    fill_code_holes(grid, primary, MAX_WIDTH, 1.0);
}

/// Set band 0 to `UNK` wherever the mask is zero.
pub fn erase_foreground(grid: &mut Grid, mask: &GrayImage) -> Result<()> {
    if mask.width() as usize != grid.width() || mask.height() as usize != grid.height() {
        return Err(Error::ShapeMismatch {
            context: "erase_foreground: mask",
            expected: (grid.width(), grid.height(), 1),
            got: (mask.width() as usize, mask.height() as usize, 1),
        });
    }
    for y in 0..grid.height() {
        for x in 0..grid.width() {
            if mask.get_pixel(x as u32, y as u32).0[0] == 0 {
                grid.set(x, y, 0, UNK);
            }
        }
    }
    Ok(())
}

// Hue ramp Red-Yellow-Green-Cyan-Blue-Magenta for f in 0..1.
fn hue(f: f32) -> [f32; 3] {
    let f = f * 6.0;
    let f0 = f.floor();
    let t = f - f0;
    match f0 as i32 {
        0 => [1.0, t, 0.0],
        1 => [1.0 - t, 1.0, 0.0],
        2 => [0.0, 1.0, t],
        3 => [0.0, 1.0 - t, 1.0],
        4 => [t, 0.0, 1.0],
        _ => [1.0, 0.0, 1.0 - t],
    }
}

// Spiral in hue-brightness space; `rounds` hue cycles across 0..1 with
// brightness ramping from near-black to near-white.
fn hueshade(f: f32, rounds: f32) -> [u8; 3] {
    let f = f.clamp(0.0, 1.0);
    let f1 = (f * rounds).fract();
    let mut rgb = hue(f1);
    let b = 1.6 * f - 0.8;
    for c in &mut rgb {
        if b < 0.0 {
            *c *= b + 1.0;
        } else {
            *c = (1.0 - b) * *c + b;
        }
    }
    [
        (rgb[0] * 255.0) as u8,
        (rgb[1] * 255.0) as u8,
        (rgb[2] * 255.0) as u8,
    ]
}

/// Render a code map to an RGB image for inspection: code values trace a
/// hue-brightness spiral over `0..num_codes`, `UNK` is black.
pub fn code_map_to_rgb(grid: &Grid, num_codes: usize) -> RgbImage {
    let scale = 1.0 / num_codes as f32;
    let mut out = RgbImage::new(grid.width() as u32, grid.height() as u32);
    for y in 0..grid.height() {
        for x in 0..grid.width() {
            let v = grid.get(x, y, 0);
            let rgb = if v == UNK {
                [0, 0, 0]
            } else {
                hueshade(v * scale, 100.0)
            };
            out.put_pixel(x as u32, y as u32, image::Rgb(rgb));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn threshold_image(w: u32, h: u32, f: impl Fn(u32, u32) -> u8) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([f(x, y)]))
    }

    #[test]
    fn decode_recovers_gray_coded_columns() {
        let table = CodeTable::gray(3).unwrap();
        let mut dec = Decoder::new(8, 2);
        for bit in 0..3u32 {
            let img = threshold_image(8, 2, |x, _| {
                let code = table.code_at(x).unwrap();
                if code & (1 << bit) != 0 {
                    LABEL_ON
                } else {
                    0
                }
            });
            dec.accumulate_bit(&img, bit).unwrap();
        }
        let grid = dec.decode(&table);
        for x in 0..8 {
            assert_eq!(grid.get(x, 0, 0), x as f32);
            assert_eq!(grid.get(x, 1, 0), x as f32);
        }
    }

    #[test]
    fn undecided_pixel_decodes_unknown() {
        let table = CodeTable::gray(2).unwrap();
        let mut dec = Decoder::new(2, 1);
        dec.accumulate_bit(&threshold_image(2, 1, |x, _| if x == 0 { LABEL_ON } else { 0 }), 0)
            .unwrap();
        dec.accumulate_bit(&threshold_image(2, 1, |_, _| LABEL_UNDECIDED), 1)
            .unwrap();
        let grid = dec.decode(&table);
        assert_eq!(grid.get(0, 0, 0), UNK);
        assert_eq!(grid.get(1, 0, 0), UNK);
    }

    #[test]
    fn pattern_outside_table_decodes_unknown() {
        // 2-entry table, but accumulate bit 3 so patterns exceed it
        let table = CodeTable::gray(1).unwrap();
        let mut dec = Decoder::new(1, 1);
        dec.accumulate_bit(&threshold_image(1, 1, |_, _| LABEL_ON), 3)
            .unwrap();
        assert_eq!(dec.decode(&table).get(0, 0, 0), UNK);
    }

    #[test]
    fn wrong_sized_image_is_rejected() {
        let mut dec = Decoder::new(4, 4);
        let img = threshold_image(4, 5, |_, _| 0);
        assert!(matches!(
            dec.accumulate_bit(&img, 0),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn short_hole_with_matching_borders_is_filled() {
        let mut buf = [3.0, UNK, UNK, 4.0];
        fill_holes_line(&mut buf, 5, 2.0);
        assert_eq!(buf, [3.0, 3.5, 3.5, 4.0]);
    }

    #[test]
    fn wide_or_mismatched_holes_stay_open() {
        let mut wide = [1.0, UNK, UNK, UNK, 2.0];
        fill_holes_line(&mut wide, 2, 2.0);
        assert_eq!(wide[2], UNK);

        let mut jump = [1.0, UNK, 9.0];
        fill_holes_line(&mut jump, 5, 2.0);
        assert_eq!(jump[1], UNK);
    }

    #[test]
    fn border_holes_stay_open() {
        let mut buf = [UNK, 2.0, UNK];
        fill_holes_line(&mut buf, 5, 2.0);
        assert_eq!(buf, [UNK, 2.0, UNK]);
    }

    #[test]
    fn schedule_fills_across_both_axes() {
        let mut g = Grid::filled(5, 3, 1, 1.0);
        g.set(2, 1, 0, UNK);
        fill_code_holes_schedule(&mut g, Axis::X);
        assert_eq!(g.get(2, 1, 0), 1.0);
    }

    #[test]
    fn foreground_erase_respects_mask() {
        let mut g = Grid::filled(2, 2, 1, 5.0);
        let mask = threshold_image(2, 2, |x, _| if x == 0 { 0 } else { 255 });
        erase_foreground(&mut g, &mask).unwrap();
        assert_eq!(g.get(0, 0, 0), UNK);
        assert_eq!(g.get(1, 0, 0), 5.0);

        let bad = threshold_image(3, 2, |_, _| 255);
        assert!(erase_foreground(&mut g, &bad).is_err());
    }

    #[test]
    fn code_map_rendering_blacks_out_unknowns() {
        let mut g = Grid::filled(2, 1, 1, 100.0);
        g.set(1, 0, 0, UNK);
        let img = code_map_to_rgb(&g, 1024);
        assert_ne!(img.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [0, 0, 0]);
    }
}
