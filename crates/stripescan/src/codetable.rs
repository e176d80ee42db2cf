//! Bit-pattern ↔ stripe-position lookup tables.
//!
//! A code table maps the integer value accumulated from `N` threshold images
//! to the stripe position it encodes (and back). Tables are immutable and
//! passed to the decoder explicitly; the on-disk format is the `minSW.dat`
//! layout: a u32 LE code count followed by the `pos_to_code` and
//! `code_to_pos` u32 arrays.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};

/// Fixed capacity of a code table (10-bit codes).
pub const MAX_CODES: usize = 1024;

/// Immutable bidirectional lookup table between accumulated bit patterns
/// ("codes") and stripe positions.
#[derive(Debug, Clone)]
pub struct CodeTable {
    pos_to_code: Vec<u32>,
    code_to_pos: Vec<u32>,
}

impl CodeTable {
    /// Build from explicit lookup arrays. Both must have the same length,
    /// at most [`MAX_CODES`].
    pub fn new(pos_to_code: Vec<u32>, code_to_pos: Vec<u32>) -> Result<Self> {
        let n = pos_to_code.len();
        if n > MAX_CODES || code_to_pos.len() > MAX_CODES {
            return Err(Error::TooManyCodes {
                got: n.max(code_to_pos.len()),
                max: MAX_CODES,
            });
        }
        Ok(Self {
            pos_to_code,
            code_to_pos,
        })
    }

    /// Standard reflected Gray code over `num_bits` bits.
    pub fn gray(num_bits: u32) -> Result<Self> {
        let n = 1usize << num_bits;
        if n > MAX_CODES {
            return Err(Error::TooManyCodes {
                got: n,
                max: MAX_CODES,
            });
        }
        let mut pos_to_code = vec![0u32; n];
        let mut code_to_pos = vec![0u32; n];
        for pos in 0..n as u32 {
            let code = pos ^ (pos >> 1);
            pos_to_code[pos as usize] = code;
            code_to_pos[code as usize] = pos;
        }
        Ok(Self {
            pos_to_code,
            code_to_pos,
        })
    }

    /// Load a binary code file: u32 LE count, then the two u32 LE arrays.
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let read_u32 = |off: usize| -> Result<u32> {
            let bytes: [u8; 4] = buf
                .get(off..off + 4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| Error::codec(path, "truncated code table"))?;
            Ok(u32::from_le_bytes(bytes))
        };

        let n = read_u32(0)? as usize;
        if n > MAX_CODES {
            return Err(Error::TooManyCodes {
                got: n,
                max: MAX_CODES,
            });
        }
        let mut pos_to_code = Vec::with_capacity(n);
        let mut code_to_pos = Vec::with_capacity(n);
        for i in 0..n {
            pos_to_code.push(read_u32(4 + 4 * i)?);
        }
        for i in 0..n {
            code_to_pos.push(read_u32(4 + 4 * (n + i))?);
        }
        Ok(Self {
            pos_to_code,
            code_to_pos,
        })
    }

    pub fn num_codes(&self) -> usize {
        self.code_to_pos.len()
    }

    /// Stripe position encoded by an accumulated bit pattern, or `None` for
    /// a pattern outside the table.
    #[inline]
    pub fn position_of(&self, code: u32) -> Option<u32> {
        self.code_to_pos.get(code as usize).copied()
    }

    /// Bit pattern displayed at a stripe position.
    #[inline]
    pub fn code_at(&self, pos: u32) -> Option<u32> {
        self.pos_to_code.get(pos as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_table_is_a_bijection() {
        let t = CodeTable::gray(10).unwrap();
        assert_eq!(t.num_codes(), 1024);
        for pos in 0..1024u32 {
            let code = t.code_at(pos).unwrap();
            assert_eq!(t.position_of(code), Some(pos));
        }
        // adjacent positions differ in exactly one bit
        for pos in 1..1024u32 {
            let a = t.code_at(pos - 1).unwrap();
            let b = t.code_at(pos).unwrap();
            assert_eq!((a ^ b).count_ones(), 1);
        }
    }

    #[test]
    fn oversized_table_is_rejected() {
        assert!(matches!(
            CodeTable::gray(11),
            Err(Error::TooManyCodes { got: 2048, .. })
        ));
        let big = vec![0u32; MAX_CODES + 1];
        assert!(CodeTable::new(big.clone(), big).is_err());
    }

    #[test]
    fn load_parses_minsw_layout() {
        use std::io::Write;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u32.to_le_bytes());
        for v in [0u32, 1, 3, 2] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for v in [0u32, 1, 3, 2] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&bytes).unwrap();
        let t = CodeTable::load(f.path()).unwrap();
        assert_eq!(t.num_codes(), 4);
        assert_eq!(t.position_of(3), Some(2));
        assert_eq!(t.code_at(2), Some(3));
    }
}
