//! Fixed-capacity byte buffers and bounds-checked views over them.
//!
//! All multi-byte accessors are big-endian, matching the on-disk format.
//! Every access is checked against the view's limit and panics when it
//! falls outside: callers validate untrusted offsets before touching bytes.

pub mod varint;

use std::cmp::Ordering;
use std::ops::{Deref, DerefMut};

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::vfs::File;

#[track_caller]
fn check_bounds(limit: usize, at: usize, len: usize) {
    let in_bounds = at.checked_add(len).is_some_and(|end| end <= limit);
    assert!(
        in_bounds,
        "buffer access out of bounds: offset {at} + {len} exceeds limit {limit}"
    );
}

/// A zero-initialized byte region whose size is fixed at construction.
#[derive(Clone, PartialEq, Eq)]
pub struct Buffer {
    bytes: Box<[u8]>,
}

impl Buffer {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            bytes: data.to_vec().into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn pointer(&self, offset: usize) -> Pointer<'_> {
        Pointer::new(&self.bytes).advance(offset)
    }

    pub fn pointer_mut(&mut self, offset: usize) -> PointerMut<'_> {
        PointerMut::new(&mut self.bytes).advance(offset)
    }

    pub fn fill(&mut self, byte: u8) {
        self.bytes.fill(byte);
    }

    /// Overwrite the whole buffer; `src` must be exactly as long.
    #[track_caller]
    pub fn copy_from(&mut self, src: &[u8]) {
        assert_eq!(src.len(), self.bytes.len(), "buffer copy size mismatch");
        self.bytes.copy_from_slice(src);
    }

    /// Fill the buffer from `file` at byte `offset`. Bytes past the end of
    /// the file read as zero; returns how many bytes the file supplied.
    pub fn read_from(&mut self, file: &mut File, offset: u64) -> Result<usize> {
        file.read(&mut self.bytes, offset)
    }

    pub fn write_to(&self, file: &mut File, offset: u64) -> Result<()> {
        file.write(&self.bytes, offset)
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("len", &self.bytes.len()).finish()
    }
}

/// Read-only view starting at some offset of a byte region.
///
/// Accessor offsets are relative to the view's start.
#[derive(Debug, Clone, Copy)]
pub struct Pointer<'a> {
    data: &'a [u8],
}

impl<'a> Pointer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// A view `delta` bytes further along.
    #[track_caller]
    pub fn advance(self, delta: usize) -> Self {
        check_bounds(self.data.len(), delta, 0);
        Self {
            data: &self.data[delta..],
        }
    }

    /// A view of `len` bytes at `at`.
    #[track_caller]
    pub fn limit(self, at: usize, len: usize) -> Self {
        check_bounds(self.data.len(), at, len);
        Self {
            data: &self.data[at..at + len],
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    #[track_caller]
    pub fn bytes(&self, at: usize, len: usize) -> &'a [u8] {
        check_bounds(self.data.len(), at, len);
        &self.data[at..at + len]
    }

    #[track_caller]
    pub fn get_u8(&self, at: usize) -> u8 {
        check_bounds(self.data.len(), at, 1);
        self.data[at]
    }

    #[track_caller]
    pub fn get_u16(&self, at: usize) -> u16 {
        BigEndian::read_u16(self.bytes(at, 2))
    }

    #[track_caller]
    pub fn get_u32(&self, at: usize) -> u32 {
        BigEndian::read_u32(self.bytes(at, 4))
    }

    #[track_caller]
    pub fn get_u64(&self, at: usize) -> u64 {
        BigEndian::read_u64(self.bytes(at, 8))
    }

    #[track_caller]
    pub fn get_i64(&self, at: usize) -> i64 {
        BigEndian::read_i64(self.bytes(at, 8))
    }

    /// Unsigned big-endian integer of `width` bytes (1..=8).
    #[track_caller]
    pub fn get_unsigned(&self, at: usize, width: usize) -> u64 {
        assert!((1..=8).contains(&width), "invalid integer width {width}");
        BigEndian::read_uint(self.bytes(at, width), width)
    }

    /// Signed big-endian integer of `width` bytes (1..=8), sign-extended.
    #[track_caller]
    pub fn get_signed(&self, at: usize, width: usize) -> i64 {
        assert!((1..=8).contains(&width), "invalid integer width {width}");
        BigEndian::read_int(self.bytes(at, width), width)
    }

    #[track_caller]
    pub fn get_varint(&self, at: usize) -> (u64, usize) {
        check_bounds(self.data.len(), at, 1);
        varint::get_varint(&self.data[at..])
    }

    /// Lexicographic comparison of `len` bytes at `at` against `other`.
    #[track_caller]
    pub fn compare(&self, at: usize, len: usize, other: &[u8]) -> Ordering {
        self.bytes(at, len).cmp(other)
    }
}

/// Writable counterpart of [`Pointer`].
#[derive(Debug)]
pub struct PointerMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PointerMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    #[track_caller]
    pub fn advance(self, delta: usize) -> Self {
        check_bounds(self.data.len(), delta, 0);
        Self {
            data: &mut self.data[delta..],
        }
    }

    pub fn as_pointer(&self) -> Pointer<'_> {
        Pointer::new(self.data)
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    #[track_caller]
    pub fn bytes_mut(&mut self, at: usize, len: usize) -> &mut [u8] {
        check_bounds(self.data.len(), at, len);
        &mut self.data[at..at + len]
    }

    #[track_caller]
    pub fn put_u8(&mut self, at: usize, value: u8) {
        check_bounds(self.data.len(), at, 1);
        self.data[at] = value;
    }

    #[track_caller]
    pub fn put_u16(&mut self, at: usize, value: u16) {
        BigEndian::write_u16(self.bytes_mut(at, 2), value);
    }

    #[track_caller]
    pub fn put_u32(&mut self, at: usize, value: u32) {
        BigEndian::write_u32(self.bytes_mut(at, 4), value);
    }

    #[track_caller]
    pub fn put_u64(&mut self, at: usize, value: u64) {
        BigEndian::write_u64(self.bytes_mut(at, 8), value);
    }

    /// Low `width` bytes of `value`, big-endian.
    #[track_caller]
    pub fn put_unsigned(&mut self, at: usize, width: usize, value: u64) {
        assert!((1..=8).contains(&width), "invalid integer width {width}");
        let masked = if width == 8 {
            value
        } else {
            value & ((1u64 << (width * 8)) - 1)
        };
        BigEndian::write_uint(self.bytes_mut(at, width), masked, width);
    }

    #[track_caller]
    pub fn put_varint(&mut self, at: usize, value: u64) -> usize {
        let len = varint::varint_len(value);
        varint::put_varint(self.bytes_mut(at, len), value)
    }

    #[track_caller]
    pub fn copy_from(&mut self, at: usize, src: &[u8]) {
        self.bytes_mut(at, src.len()).copy_from_slice(src);
    }

    /// Copy `len` bytes from `src` to `dst` within this view; ranges may overlap.
    #[track_caller]
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        check_bounds(self.data.len(), src, len);
        check_bounds(self.data.len(), dst, len);
        self.data.copy_within(src..src + len, dst);
    }

    #[track_caller]
    pub fn fill(&mut self, at: usize, len: usize, byte: u8) {
        self.bytes_mut(at, len).fill(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_zeroed() {
        let buf = Buffer::new(64);
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_big_endian_accessors() {
        let mut buf = Buffer::new(32);
        {
            let mut p = buf.pointer_mut(4);
            p.put_u16(0, 0x1234);
            p.put_u32(2, 0xDEAD_BEEF);
            p.put_u64(6, 0x0102_0304_0506_0708);
        }
        assert_eq!(&buf[4..6], &[0x12, 0x34]);
        assert_eq!(&buf[6..10], &[0xDE, 0xAD, 0xBE, 0xEF]);

        let p = buf.pointer(4);
        assert_eq!(p.get_u16(0), 0x1234);
        assert_eq!(p.get_u32(2), 0xDEAD_BEEF);
        assert_eq!(p.get_u64(6), 0x0102_0304_0506_0708);
        assert_eq!(p.remaining(), 28);
    }

    #[test]
    fn test_odd_width_integers() {
        let mut buf = Buffer::new(16);
        {
            let mut p = buf.pointer_mut(0);
            p.put_unsigned(0, 3, 0x00AB_CDEF);
            p.put_unsigned(3, 6, (-2i64) as u64);
        }
        let p = buf.pointer(0);
        assert_eq!(p.get_unsigned(0, 3), 0x00AB_CDEF);
        assert_eq!(p.get_signed(0, 3), 0xFFAB_CDEFu32 as i32 as i64);
        assert_eq!(p.get_signed(3, 6), -2);
        assert_eq!(p.get_unsigned(3, 6), 0xFFFF_FFFF_FFFE);
    }

    #[test]
    fn test_varint_through_pointer() {
        let mut buf = Buffer::new(16);
        let n = buf.pointer_mut(2).put_varint(0, 300);
        assert_eq!(n, 2);
        assert_eq!(buf.pointer(2).get_varint(0), (300, 2));
    }

    #[test]
    fn test_copy_fill_compare() {
        let mut buf = Buffer::new(8);
        {
            let mut p = buf.pointer_mut(0);
            p.copy_from(0, b"abcd");
            p.fill(4, 4, b'z');
            p.copy_within(0, 2, 2);
        }
        assert_eq!(&buf[..], b"ababzzzz");
        let p = buf.pointer(0);
        assert_eq!(p.compare(0, 2, b"ab"), Ordering::Equal);
        assert_eq!(p.compare(0, 2, b"ac"), Ordering::Less);
        assert_eq!(p.compare(4, 1, b"a"), Ordering::Greater);
    }

    #[test]
    fn test_limited_view() {
        let buf = Buffer::from_slice(b"0123456789");
        let p = buf.pointer(2).limit(1, 3);
        assert_eq!(p.as_slice(), b"345");
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_read_fails_fast() {
        let buf = Buffer::new(4);
        buf.pointer(1).get_u32(0);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_write_fails_fast() {
        let mut buf = Buffer::new(4);
        buf.pointer_mut(0).put_u16(3, 1);
    }
}
