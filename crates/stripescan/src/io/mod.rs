//! Checkpoint file IO.
//!
//! Every pipeline stage reads its inputs from disk and writes its outputs
//! (including intermediates) back to disk under fixed names, so a run can be
//! resumed or partially rerun from any stage boundary. Single-band maps use
//! PFM, two-band maps use FLO, byte masks and visualizations go through the
//! `image` crate.

use std::path::{Path, PathBuf};

use image::GrayImage;

use crate::error::Result;
use crate::grid::{Axis, Grid};

mod flo;
mod pfm;

pub use flo::{read_flo, write_flo};
pub use pfm::{read_pfm, write_pfm};

/// Intermediate results of the decode/refine stage, in pipeline order.
/// The numeric prefix in the file name keeps directory listings ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Initial,
    Filtered,
    HoleFilled,
    Refined1,
    Refined2,
    ForegroundRemoved,
}

impl Checkpoint {
    fn tag(self) -> &'static str {
        match self {
            Checkpoint::Initial => "0initial",
            Checkpoint::Filtered => "1filtered",
            Checkpoint::HoleFilled => "2holefilled",
            Checkpoint::Refined1 => "3refined1",
            Checkpoint::Refined2 => "4refined2",
            Checkpoint::ForegroundRemoved => "5foregroundremoved",
        }
    }
}

/// `{outdir}/result{direction}-{stage}.pfm`
pub fn checkpoint_path(outdir: &Path, direction: usize, stage: Checkpoint) -> PathBuf {
    outdir.join(format!("result{direction}-{}.pfm", stage.tag()))
}

/// `{outdir}/disp{pos0}{pos1}{u|v}.pfm`, the single-axis disparity between
/// two viewpoints.
pub fn disparity_path(outdir: &Path, pos0: usize, pos1: usize, axis: Axis) -> PathBuf {
    let band = match axis {
        Axis::X => 'u',
        Axis::Y => 'v',
    };
    outdir.join(format!("disp{pos0}{pos1}{band}.pfm"))
}

/// Load a byte mask (any format `image` can decode), converted to 8-bit gray.
pub fn read_mask(path: &Path) -> Result<GrayImage> {
    Ok(image::open(path)?.into_luma8())
}

/// Join two single-band PFM files into one two-band FLO file.
pub fn merge_to_flo(u_path: &Path, v_path: &Path, flo_path: &Path) -> Result<()> {
    let u = read_pfm(u_path)?;
    let v = read_pfm(v_path)?;
    write_flo(flo_path, &Grid::merge_bands(&u, &v)?)
}

/// Split a two-band FLO file into two single-band PFM files.
pub fn split_from_flo(flo_path: &Path, u_path: &Path, v_path: &Path) -> Result<()> {
    let flo = read_flo(flo_path)?;
    let (u, v) = flo.split_bands();
    write_pfm(u_path, &u)?;
    write_pfm(v_path, &v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn checkpoint_names_follow_convention() {
        let p = checkpoint_path(Path::new("/out"), 1, Checkpoint::HoleFilled);
        assert_eq!(p, Path::new("/out/result1-2holefilled.pfm"));
        let d = disparity_path(Path::new("/out"), 0, 2, Axis::Y);
        assert_eq!(d, Path::new("/out/disp02v.pfm"));
    }

    #[test]
    fn flo_merge_split_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut u = Grid::new(3, 2, 1);
        let mut v = Grid::new(3, 2, 1);
        u.set(1, 0, 0, 4.0);
        v.set(2, 1, 0, -1.0);
        let (up, vp, fp) = (
            dir.path().join("u.pfm"),
            dir.path().join("v.pfm"),
            dir.path().join("d.flo"),
        );
        write_pfm(&up, &u).unwrap();
        write_pfm(&vp, &v).unwrap();
        merge_to_flo(&up, &vp, &fp).unwrap();
        let (u2p, v2p) = (dir.path().join("u2.pfm"), dir.path().join("v2.pfm"));
        split_from_flo(&fp, &u2p, &v2p).unwrap();
        assert_eq!(read_pfm(&u2p).unwrap(), u);
        assert_eq!(read_pfm(&v2p).unwrap(), v);
    }
}
