//! Middlebury `.flo` codec for two-band (dx, dy) disparity maps.
//!
//! The magic number 202021.25 reads as "PIEH" in ASCII when written little
//! endian, which doubles as a sanity check against byte-order mixups.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::grid::Grid;

const MAGIC: f32 = 202021.25;

fn read_f32(r: &mut impl Read) -> std::io::Result<f32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(f32::from_le_bytes(b))
}

fn read_i32(r: &mut impl Read) -> std::io::Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(i32::from_le_bytes(b))
}

/// Read a two-band flow-format file.
pub fn read_flo(path: &Path) -> Result<Grid> {
    let mut r = BufReader::new(File::open(path)?);
    let magic = read_f32(&mut r)?;
    if magic != MAGIC {
        return Err(Error::codec(path, format!("bad flo magic {magic}")));
    }
    let width = read_i32(&mut r)?;
    let height = read_i32(&mut r)?;
    if width <= 0 || height <= 0 {
        return Err(Error::codec(path, format!("bad size {width}x{height}")));
    }
    let (width, height) = (width as usize, height as usize);
    let mut data = vec![0u8; width * height * 2 * 4];
    r.read_exact(&mut data)
        .map_err(|_| Error::codec(path, "truncated pixel data"))?;
    let floats = data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Grid::from_vec(width, height, 2, floats))
}

/// Write a two-band grid in flow format.
pub fn write_flo(path: &Path, grid: &Grid) -> Result<()> {
    if grid.bands() != 2 {
        return Err(Error::codec(
            path,
            format!("flo stores 2 bands, grid has {}", grid.bands()),
        ));
    }
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(&MAGIC.to_le_bytes())?;
    w.write_all(&(grid.width() as i32).to_le_bytes())?;
    w.write_all(&(grid.height() as i32).to_le_bytes())?;
    for v in grid.data() {
        w.write_all(&v.to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::UNK;

    #[test]
    fn roundtrip_preserves_both_bands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.flo");
        let mut g = Grid::new(4, 3, 2);
        g.set(1, 2, 0, -3.25);
        g.set(1, 2, 1, 0.5);
        g.set(0, 0, 0, UNK);
        write_flo(&path, &g).unwrap();
        assert_eq!(read_flo(&path).unwrap(), g);
    }

    #[test]
    fn single_band_grid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let g = Grid::new(2, 2, 1);
        assert!(write_flo(&dir.path().join("t.flo"), &g).is_err());
    }

    #[test]
    fn magic_is_pieh() {
        assert_eq!(&MAGIC.to_le_bytes(), b"PIEH");
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.flo");
        std::fs::write(&path, [0u8; 12]).unwrap();
        assert!(matches!(read_flo(&path), Err(Error::Codec { .. })));
    }
}
