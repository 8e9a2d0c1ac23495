//! Variable-length integer codec.
//!
//! Integers are stored big-endian in 7-bit groups, the high bit of each byte
//! meaning "more follows". Values needing more than 56 bits use nine bytes,
//! the ninth carrying a full eight bits with no continuation flag.

/// Longest possible encoding.
pub const MAX_VARINT_LEN: usize = 9;

/// Number of bytes `put_varint` writes for `value`.
pub const fn varint_len(value: u64) -> usize {
    if value <= 0x7F {
        1
    } else if value <= 0x3FFF {
        2
    } else if value <= 0x1F_FFFF {
        3
    } else if value <= 0x0FFF_FFFF {
        4
    } else if value <= 0x07_FFFF_FFFF {
        5
    } else if value <= 0x03FF_FFFF_FFFF {
        6
    } else if value <= 0x01_FFFF_FFFF_FFFF {
        7
    } else if value <= 0xFF_FFFF_FFFF_FFFF {
        8
    } else {
        9
    }
}

/// Encode `value` at the start of `buf`, returning the bytes written.
///
/// Panics if `buf` is shorter than the encoding.
pub fn put_varint(buf: &mut [u8], mut value: u64) -> usize {
    if value & (0xFF00_0000u64 << 32) != 0 {
        assert!(buf.len() >= 9, "varint needs 9 bytes, buffer has {}", buf.len());
        buf[8] = value as u8;
        value >>= 8;
        for i in (0..8).rev() {
            buf[i] = (value as u8 & 0x7F) | 0x80;
            value >>= 7;
        }
        return 9;
    }

    let mut scratch = [0u8; 10];
    let mut n = 0;
    loop {
        scratch[n] = (value as u8 & 0x7F) | 0x80;
        n += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    scratch[0] &= 0x7F;
    assert!(buf.len() >= n, "varint needs {n} bytes, buffer has {}", buf.len());
    for (dst, src) in buf.iter_mut().zip(scratch[..n].iter().rev()) {
        *dst = *src;
    }
    n
}

/// Decode a varint from the start of `buf`, returning `(value, consumed)`.
///
/// Panics if `buf` ends in the middle of the encoding; use
/// [`try_get_varint`] for untrusted input.
pub fn get_varint(buf: &[u8]) -> (u64, usize) {
    match try_get_varint(buf) {
        Some(decoded) => decoded,
        None => panic!("truncated varint in {} byte buffer", buf.len()),
    }
}

/// Decode a varint, returning `None` when `buf` ends before the encoding does.
pub fn try_get_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(8) {
        value = (value << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    let ninth = *buf.get(8)?;
    Some(((value << 8) | u64::from(ninth), 9))
}

/// 32-bit encoder; the one and two byte forms skip the general loop.
pub fn put_varint32(buf: &mut [u8], value: u32) -> usize {
    if value < 0x80 {
        buf[0] = value as u8;
        return 1;
    }
    if value < 0x4000 {
        buf[0] = ((value >> 7) as u8) | 0x80;
        buf[1] = (value as u8) & 0x7F;
        return 2;
    }
    put_varint(buf, u64::from(value))
}

/// 32-bit decoder. Values that do not fit are clamped to `u32::MAX`.
pub fn get_varint32(buf: &[u8]) -> (u32, usize) {
    let a = buf[0];
    if a & 0x80 == 0 {
        return (u32::from(a), 1);
    }
    let b = buf[1];
    if b & 0x80 == 0 {
        return ((u32::from(a & 0x7F) << 7) | u32::from(b), 2);
    }
    let (value, n) = get_varint(buf);
    (u32::try_from(value).unwrap_or(u32::MAX), n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: u64) -> usize {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let n = put_varint(&mut buf, value);
        assert_eq!(n, varint_len(value), "length of {value:#x}");
        assert_eq!(get_varint(&buf[..n]), (value, n), "decode of {value:#x}");
        n
    }

    #[test]
    fn test_boundaries() {
        let cases = [
            (0u64, 1usize),
            (0x7F, 1),
            (0x80, 2),
            (0x3FFF, 2),
            (0x4000, 3),
            (0x1F_FFFF, 3),
            (0x20_0000, 4),
            (0x0FFF_FFFF, 4),
            (0x1000_0000, 5),
            (0x07_FFFF_FFFF, 5),
            (0x08_0000_0000, 6),
            (0x03FF_FFFF_FFFF, 6),
            (0x0400_0000_0000, 7),
            (0x01_FFFF_FFFF_FFFF, 7),
            (0x02_0000_0000_0000, 8),
            (0xFF_FFFF_FFFF_FFFF, 8),
            (1 << 56, 9),
            (u64::MAX, 9),
        ];
        for (value, len) in cases {
            assert_eq!(round_trip(value), len, "{value:#x}");
        }
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = [0u8; 9];
        assert_eq!(put_varint(&mut buf, 0x80), 2);
        assert_eq!(&buf[..2], &[0x81, 0x00]);

        assert_eq!(put_varint(&mut buf, 300), 2);
        assert_eq!(&buf[..2], &[0x82, 0x2C]);

        assert_eq!(put_varint(&mut buf, u64::MAX), 9);
        assert_eq!(buf, [0xFF; 9]);
    }

    #[test]
    fn test_every_bit_width() {
        for shift in 0..64 {
            let value = 1u64 << shift;
            round_trip(value);
            round_trip(value - 1);
            round_trip(value | (value >> 1));
        }
    }

    #[test]
    fn test_varint32_matches_64_bit_path() {
        let values = [
            0u32,
            1,
            0x7F,
            0x80,
            0x3FFF,
            0x4000,
            0x1F_FFFF,
            0x20_0000,
            0xFFFF_FFFF,
        ];
        for value in values {
            let mut a = [0u8; 9];
            let mut b = [0u8; 9];
            let na = put_varint32(&mut a, value);
            let nb = put_varint(&mut b, u64::from(value));
            assert_eq!(&a[..na], &b[..nb], "{value:#x}");
            assert_eq!(get_varint32(&a), (value, na));
        }
    }

    #[test]
    fn test_varint32_clamps_wide_values() {
        let mut buf = [0u8; 9];
        let n = put_varint(&mut buf, 1 << 40);
        assert_eq!(get_varint32(&buf), (u32::MAX, n));
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(try_get_varint(&[]), None);
        assert_eq!(try_get_varint(&[0x81]), None);
        assert_eq!(try_get_varint(&[0xFF; 8]), None);
        assert_eq!(try_get_varint(&[0x81, 0x00]), Some((0x80, 2)));
    }

    #[test]
    #[should_panic(expected = "truncated varint")]
    fn test_get_varint_fails_fast() {
        get_varint(&[0x80, 0x80]);
    }
}
