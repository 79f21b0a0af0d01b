//! Wire-format primitives: varints and big-endian integers
//!
//! The file format stores multi-byte integers big-endian and lengths /
//! rowids as variable-length integers of at most nine bytes. In the
//! first eight bytes the high bit marks continuation and seven bits
//! carry payload; a ninth byte, when present, contributes all eight
//! bits.

use crate::error::{Error, ErrorCode, Result};

/// Decode a varint starting at `offset`. Returns the value and the
/// number of bytes consumed (1..=9).
pub fn read_varint(data: &[u8], offset: usize) -> Result<(u64, usize)> {
    if offset >= data.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let mut value: u64 = 0;
    for i in 0..9 {
        let Some(&b) = data.get(offset + i) else {
            return Err(Error::new(ErrorCode::Corrupt));
        };
        if i == 8 {
            value = (value << 8) | b as u64;
            return Ok((value, 9));
        }
        value = (value << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    unreachable!()
}

/// Decode a varint that is known to fit in 32 bits (payload lengths,
/// page numbers). Larger stored values are truncated, matching the
/// forgiving treatment in the original format.
pub fn read_varint32(data: &[u8], offset: usize) -> Result<(u32, usize)> {
    let (value, consumed) = read_varint(data, offset)?;
    Ok((value as u32, consumed))
}

/// Number of bytes [`put_varint_at`] will use for `value`.
pub fn varint_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 && len < 9 {
        len += 1;
        v >>= 7;
    }
    if value > 0x00ff_ffff_ffff_ffff {
        9
    } else {
        len
    }
}

/// Encode `value` at the start of `buf`. Returns the bytes written,
/// or 0 if the buffer is too small.
pub fn put_varint_at(buf: &mut [u8], value: u64) -> usize {
    let len = varint_len(value);
    if buf.len() < len {
        return 0;
    }
    if len == 9 {
        buf[8] = (value & 0xff) as u8;
        let mut v = value >> 8;
        for i in (0..8).rev() {
            buf[i] = ((v & 0x7f) | 0x80) as u8;
            v >>= 7;
        }
    } else {
        let mut v = value;
        for i in (0..len).rev() {
            if i == len - 1 {
                buf[i] = (v & 0x7f) as u8;
            } else {
                buf[i] = ((v & 0x7f) | 0x80) as u8;
            }
            v >>= 7;
        }
    }
    len
}

/// Append the varint encoding of `value` to `out`.
pub fn write_varint(value: u64, out: &mut Vec<u8>) {
    let len = varint_len(value);
    let start = out.len();
    out.resize(start + len, 0);
    put_varint_at(&mut out[start..], value);
}

/// Read a big-endian u16 at `offset`, or None past the end.
pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a big-endian u32 at `offset`, or None past the end.
pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Write a big-endian u16 at `offset`.
pub fn write_u16(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    let slot = data
        .get_mut(offset..offset + 2)
        .ok_or(Error::new(ErrorCode::Corrupt))?;
    slot.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Write a big-endian u32 at `offset`.
pub fn write_u32(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let slot = data
        .get_mut(offset..offset + 4)
        .ok_or(Error::new(ErrorCode::Corrupt))?;
    slot.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_single_byte() {
        let mut buf = [0u8; 9];
        assert_eq!(put_varint_at(&mut buf, 0x45), 1);
        assert_eq!(buf[0], 0x45);
        assert_eq!(read_varint(&buf, 0).unwrap(), (0x45, 1));
    }

    #[test]
    fn test_varint_boundaries() {
        // Largest value per encoded length.
        let cases: &[(u64, usize)] = &[
            (0x7f, 1),
            (0x3fff, 2),
            (0x1f_ffff, 3),
            (0x0fff_ffff, 4),
            (0x07_ffff_ffff, 5),
            (0x03ff_ffff_ffff, 6),
            (0x01_ffff_ffff_ffff, 7),
            (0x00ff_ffff_ffff_ffff, 8),
            (u64::MAX, 9),
        ];
        for &(value, expected_len) in cases {
            assert_eq!(varint_len(value), expected_len, "len of {:#x}", value);
            let mut buf = [0u8; 9];
            assert_eq!(put_varint_at(&mut buf, value), expected_len);
            assert_eq!(read_varint(&buf, 0).unwrap(), (value, expected_len));
            // One more must need one more byte (except at the top).
            if value < u64::MAX {
                assert_eq!(varint_len(value + 1), expected_len + 1);
            }
        }
    }

    #[test]
    fn test_varint_nine_byte_uses_all_bits() {
        let mut buf = [0u8; 9];
        let value = u64::MAX;
        put_varint_at(&mut buf, value);
        for b in &buf[..8] {
            assert_ne!(b & 0x80, 0);
        }
        assert_eq!(read_varint(&buf, 0).unwrap(), (value, 9));
    }

    #[test]
    fn test_varint_truncated_input_is_corrupt() {
        // Continuation bit set but the buffer ends.
        let buf = [0x80u8];
        assert!(read_varint(&buf, 0).is_err());
        assert!(read_varint(&buf, 5).is_err());
    }

    #[test]
    fn test_write_varint_appends() {
        let mut out = vec![0xaa];
        write_varint(300, &mut out);
        assert_eq!(out[0], 0xaa);
        assert_eq!(read_varint(&out, 1).unwrap(), (300, 2));
    }

    #[test]
    fn test_big_endian_helpers() {
        let mut buf = vec![0u8; 8];
        write_u16(&mut buf, 1, 0x1234).unwrap();
        write_u32(&mut buf, 3, 0xdead_beef).unwrap();
        assert_eq!(read_u16(&buf, 1), Some(0x1234));
        assert_eq!(read_u32(&buf, 3), Some(0xdead_beef));
        assert_eq!(read_u16(&buf, 7), None);
        assert!(write_u32(&mut buf, 6, 1).is_err());
    }
}
