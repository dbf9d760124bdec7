//! Compact-size helpers shared by the disk codecs.
//!
//! The same length-prefix format the consensus serialization uses for
//! collections, exposed directly so hand-written record codecs can
//! frame their own counts.

use bitcoin::consensus::encode;
use bitcoin::io;

/// Writes `size` in compact-size framing, returning the encoded length.
pub fn write_compact_size<W: io::Write + ?Sized>(
    w: &mut W,
    size: u64,
) -> Result<usize, io::Error> {
    if size < 253 {
        w.write_all(&[size as u8])?;
        Ok(1)
    } else if size <= 0xffff {
        w.write_all(&[253])?;
        w.write_all(&(size as u16).to_le_bytes())?;
        Ok(3)
    } else if size <= 0xffff_ffff {
        w.write_all(&[254])?;
        w.write_all(&(size as u32).to_le_bytes())?;
        Ok(5)
    } else {
        w.write_all(&[255])?;
        w.write_all(&size.to_le_bytes())?;
        Ok(9)
    }
}

/// Reads a compact-size framed integer.
pub fn read_compact_size<R: io::BufRead + ?Sized>(r: &mut R) -> Result<u64, encode::Error> {
    let mut first = [0u8; 1];
    r.read_exact(&mut first)?;
    Ok(match first[0] {
        253 => {
            let mut bytes = [0u8; 2];
            r.read_exact(&mut bytes)?;
            u64::from(u16::from_le_bytes(bytes))
        }
        254 => {
            let mut bytes = [0u8; 4];
            r.read_exact(&mut bytes)?;
            u64::from(u32::from_le_bytes(bytes))
        }
        255 => {
            let mut bytes = [0u8; 8];
            r.read_exact(&mut bytes)?;
            u64::from_le_bytes(bytes)
        }
        small => u64::from(small),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_sizes_round_trip_across_the_framing_breaks() {
        for size in [0u64, 1, 252, 253, 0xffff, 0x1_0000, 0xffff_ffff, u64::MAX] {
            let mut buf = Vec::new();
            let written = write_compact_size(&mut buf, size).unwrap();
            assert_eq!(written, buf.len());
            assert_eq!(read_compact_size(&mut buf.as_slice()).unwrap(), size);
        }
    }
}
