//! Rollback journal format.
//!
//! A journal starts with one sector holding the header, followed by one
//! record per journaled page: the page number, the page's original image
//! and a checksum seeded with the header nonce.

use crate::buffer::{Buffer, Pointer};
use crate::vfs::File;
use crate::error::Result;

use super::PageNo;

pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];
pub const SECTOR_SIZE: usize = 512;

/// Record count meaning "every complete record up to the end of the file".
pub const COUNT_TO_EOF: u32 = u32::MAX;

const OFFSET_RECORD_COUNT: usize = 8;
const OFFSET_NONCE: usize = 12;
const OFFSET_ORIGINAL_PAGES: usize = 16;
const OFFSET_SECTOR_SIZE: usize = 20;
const OFFSET_PAGE_SIZE: usize = 24;
const HEADER_FIELDS_END: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub record_count: u32,
    pub nonce: u32,
    pub original_page_count: u32,
    pub sector_size: u32,
    pub page_size: u32,
}

impl JournalHeader {
    pub fn new(nonce: u32, original_page_count: u32, page_size: usize, record_count: u32) -> Self {
        JournalHeader {
            record_count,
            nonce,
            original_page_count,
            sector_size: SECTOR_SIZE as u32,
            page_size: page_size as u32,
        }
    }

    /// The full header sector.
    pub fn encode(&self) -> Buffer {
        let mut buf = Buffer::new(SECTOR_SIZE);
        let mut p = buf.pointer_mut(0);
        p.copy_from(0, &JOURNAL_MAGIC);
        p.put_u32(OFFSET_RECORD_COUNT, self.record_count);
        p.put_u32(OFFSET_NONCE, self.nonce);
        p.put_u32(OFFSET_ORIGINAL_PAGES, self.original_page_count);
        p.put_u32(OFFSET_SECTOR_SIZE, self.sector_size);
        p.put_u32(OFFSET_PAGE_SIZE, self.page_size);
        buf
    }

    /// `None` when the bytes are not a journal header.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_FIELDS_END || data[..8] != JOURNAL_MAGIC {
            return None;
        }
        let p = Pointer::new(data);
        let header = JournalHeader {
            record_count: p.get_u32(OFFSET_RECORD_COUNT),
            nonce: p.get_u32(OFFSET_NONCE),
            original_page_count: p.get_u32(OFFSET_ORIGINAL_PAGES),
            sector_size: p.get_u32(OFFSET_SECTOR_SIZE),
            page_size: p.get_u32(OFFSET_PAGE_SIZE),
        };
        (header.sector_size as usize == SECTOR_SIZE).then_some(header)
    }

    /// Bytes of the record count field, for rewriting it in place.
    pub fn record_count_field(count: u32) -> (u64, [u8; 4]) {
        (OFFSET_RECORD_COUNT as u64, count.to_be_bytes())
    }
}

/// Zeroed header fields, used to invalidate a persisted journal.
pub fn zeroed_header() -> [u8; HEADER_FIELDS_END] {
    [0u8; HEADER_FIELDS_END]
}

pub fn record_size(page_size: usize) -> u64 {
    (4 + page_size + 4) as u64
}

pub fn record_offset(index: u32, page_size: usize) -> u64 {
    SECTOR_SIZE as u64 + index as u64 * record_size(page_size)
}

/// Checksum of a page image: the nonce plus every 200th byte counted down
/// from `page_size - 200`.
pub fn checksum(nonce: u32, data: &[u8]) -> u32 {
    let mut sum = nonce;
    let mut i = data.len() as isize - 200;
    while i > 0 {
        sum = sum.wrapping_add(data[i as usize] as u32);
        i -= 200;
    }
    sum
}

/// Append the pre-image of `pgno` as record number `index`.
pub fn write_record(
    journal: &mut File,
    index: u32,
    nonce: u32,
    pgno: PageNo,
    data: &[u8],
) -> Result<()> {
    let mut record = Buffer::new(record_size(data.len()) as usize);
    {
        let mut p = record.pointer_mut(0);
        p.put_u32(0, pgno);
        p.copy_from(4, data);
        p.put_u32(4 + data.len(), checksum(nonce, data));
    }
    record.write_to(journal, record_offset(index, data.len()))
}

/// A record read back from a journal.
pub struct JournalRecord {
    pub pgno: PageNo,
    pub data: Buffer,
}

/// Read record `index`. `None` when it is incomplete or its checksum does
/// not match, which marks the end of the valid part of the journal.
pub fn read_record(
    journal: &mut File,
    index: u32,
    nonce: u32,
    page_size: usize,
) -> Result<Option<JournalRecord>> {
    let size = record_size(page_size) as usize;
    let mut raw = Buffer::new(size);
    if raw.read_from(journal, record_offset(index, page_size))? < size {
        return Ok(None);
    }
    let p = raw.pointer(0);
    let pgno = p.get_u32(0);
    let image = p.bytes(4, page_size);
    if pgno == 0 || p.get_u32(4 + page_size) != checksum(nonce, image) {
        return Ok(None);
    }
    Ok(Some(JournalRecord {
        pgno,
        data: Buffer::from_slice(image),
    }))
}

/// Number of complete records a journal of `file_size` bytes can hold.
pub fn records_in(file_size: u64, page_size: usize) -> u32 {
    if file_size <= SECTOR_SIZE as u64 {
        return 0;
    }
    ((file_size - SECTOR_SIZE as u64) / record_size(page_size)).min(u32::MAX as u64 - 1) as u32
}
