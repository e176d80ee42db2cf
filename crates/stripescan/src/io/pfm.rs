//! PFM (portable float map) codec, single band.
//!
//! Header is `Pf`, width/height in ASCII, then a scale whose sign encodes
//! byte order (negative = little endian, the only order written here).
//! Rows are stored bottom-up. Values round-trip bit-exactly, including the
//! infinities used as the unknown sentinel.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::grid::Grid;

// Next whitespace-delimited ASCII token.
fn read_token(r: &mut impl Read, path: &Path) -> Result<String> {
    let mut tok = String::new();
    let mut byte = [0u8; 1];
    loop {
        if r.read(&mut byte)? == 0 {
            if tok.is_empty() {
                return Err(Error::codec(path, "unexpected end of header"));
            }
            return Ok(tok);
        }
        if byte[0].is_ascii_whitespace() {
            if !tok.is_empty() {
                return Ok(tok);
            }
        } else {
            tok.push(byte[0] as char);
        }
    }
}

fn parse<T: std::str::FromStr>(tok: &str, path: &Path, what: &str) -> Result<T> {
    tok.parse()
        .map_err(|_| Error::codec(path, format!("bad {what} {tok:?}")))
}

/// Read a single-band PFM file.
pub fn read_pfm(path: &Path) -> Result<Grid> {
    let mut r = BufReader::new(File::open(path)?);
    let magic = read_token(&mut r, path)?;
    if magic != "Pf" {
        return Err(Error::codec(
            path,
            format!("expected single-band PFM magic \"Pf\", got {magic:?}"),
        ));
    }
    let width: usize = parse(&read_token(&mut r, path)?, path, "width")?;
    let height: usize = parse(&read_token(&mut r, path)?, path, "height")?;
    let scale: f32 = parse(&read_token(&mut r, path)?, path, "scale")?;
    let little_endian = scale < 0.0;

    let mut bytes = vec![0u8; width * height * 4];
    r.read_exact(&mut bytes)
        .map_err(|_| Error::codec(path, "truncated pixel data"))?;

    let mut grid = Grid::new(width, height, 1);
    for y in 0..height {
        // rows are stored bottom-up
        let src_row = height - 1 - y;
        for x in 0..width {
            let off = (src_row * width + x) * 4;
            let raw: [u8; 4] = [bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]];
            let v = if little_endian {
                f32::from_le_bytes(raw)
            } else {
                f32::from_be_bytes(raw)
            };
            grid.set(x, y, 0, v);
        }
    }
    Ok(grid)
}

/// Write a single-band grid as little-endian PFM.
pub fn write_pfm(path: &Path, grid: &Grid) -> Result<()> {
    if grid.bands() != 1 {
        return Err(Error::codec(
            path,
            format!("PFM stores 1 band, grid has {}", grid.bands()),
        ));
    }
    let mut w = BufWriter::new(File::create(path)?);
    write!(w, "Pf\n{} {}\n-1.0\n", grid.width(), grid.height())?;
    for y in (0..grid.height()).rev() {
        for x in 0..grid.width() {
            w.write_all(&grid.get(x, y, 0).to_le_bytes())?;
        }
    }
    w.flush()?;
    Ok(())
}
