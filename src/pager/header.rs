//! The 100-byte database header stored at the start of page 1.

use crate::buffer::{Pointer, PointerMut};
use crate::config::is_valid_page_size;
use crate::error::{Error, Result};

pub const MAGIC: &[u8; 16] = b"vibelite format\0";
pub const HEADER_SIZE: usize = 100;

pub const OFFSET_PAGE_SIZE: usize = 16;
pub const OFFSET_WRITE_VERSION: usize = 18;
pub const OFFSET_READ_VERSION: usize = 19;
pub const OFFSET_RESERVED: usize = 20;
pub const OFFSET_MAX_PAYLOAD_FRACTION: usize = 21;
pub const OFFSET_MIN_PAYLOAD_FRACTION: usize = 22;
pub const OFFSET_LEAF_PAYLOAD_FRACTION: usize = 23;
pub const OFFSET_CHANGE_COUNTER: usize = 24;
pub const OFFSET_PAGE_COUNT: usize = 28;
pub const OFFSET_FREELIST_TRUNK: usize = 32;
pub const OFFSET_FREELIST_COUNT: usize = 36;
pub const OFFSET_SCHEMA_COOKIE: usize = 40;
pub const OFFSET_SCHEMA_FORMAT: usize = 44;
pub const OFFSET_DEFAULT_CACHE_SIZE: usize = 48;
pub const OFFSET_LARGEST_ROOT: usize = 52;
pub const OFFSET_TEXT_ENCODING: usize = 56;
pub const OFFSET_USER_VERSION: usize = 60;
pub const OFFSET_INCREMENTAL_VACUUM: usize = 64;
pub const OFFSET_APPLICATION_ID: usize = 68;
pub const OFFSET_VERSION_VALID_FOR: usize = 92;
pub const OFFSET_LIBRARY_VERSION: usize = 96;

/// Rollback-journal file format.
const FORMAT_VERSION: u8 = 1;
const LIBRARY_VERSION: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl TextEncoding {
    pub fn code(self) -> u32 {
        match self {
            TextEncoding::Utf8 => 1,
            TextEncoding::Utf16Le => 2,
            TextEncoding::Utf16Be => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(TextEncoding::Utf8),
            2 => Some(TextEncoding::Utf16Le),
            3 => Some(TextEncoding::Utf16Be),
            _ => None,
        }
    }
}

/// Decoded view of the database header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub page_size: usize,
    pub reserved_bytes: u8,
    pub change_counter: u32,
    pub page_count: u32,
    pub freelist_trunk: u32,
    pub freelist_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: i32,
    pub largest_root: u32,
    pub text_encoding: TextEncoding,
    pub user_version: u32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
}

impl DatabaseHeader {
    /// Header of a freshly created database.
    pub fn new(page_size: usize) -> Self {
        DatabaseHeader {
            page_size,
            reserved_bytes: 0,
            change_counter: 0,
            page_count: 1,
            freelist_trunk: 0,
            freelist_count: 0,
            schema_cookie: 0,
            schema_format: 4,
            default_cache_size: 0,
            largest_root: 0,
            text_encoding: TextEncoding::Utf8,
            user_version: 0,
            incremental_vacuum: 0,
            application_id: 0,
            version_valid_for: 0,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE || &data[..MAGIC.len()] != MAGIC {
            return Err(Error::NotADatabase);
        }
        let p = Pointer::new(data);
        let page_size = decode_page_size(p.get_u16(OFFSET_PAGE_SIZE))?;
        if p.get_u8(OFFSET_READ_VERSION) > FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported read format version {}",
                p.get_u8(OFFSET_READ_VERSION)
            )));
        }
        let encoding_code = p.get_u32(OFFSET_TEXT_ENCODING);
        let text_encoding = match encoding_code {
            0 => TextEncoding::Utf8,
            code => TextEncoding::from_code(code)
                .ok_or_else(|| Error::corrupt(format!("unknown text encoding {code}")))?,
        };
        Ok(DatabaseHeader {
            page_size,
            reserved_bytes: p.get_u8(OFFSET_RESERVED),
            change_counter: p.get_u32(OFFSET_CHANGE_COUNTER),
            page_count: p.get_u32(OFFSET_PAGE_COUNT),
            freelist_trunk: p.get_u32(OFFSET_FREELIST_TRUNK),
            freelist_count: p.get_u32(OFFSET_FREELIST_COUNT),
            schema_cookie: p.get_u32(OFFSET_SCHEMA_COOKIE),
            schema_format: p.get_u32(OFFSET_SCHEMA_FORMAT),
            default_cache_size: p.get_u32(OFFSET_DEFAULT_CACHE_SIZE) as i32,
            largest_root: p.get_u32(OFFSET_LARGEST_ROOT),
            text_encoding,
            user_version: p.get_u32(OFFSET_USER_VERSION),
            incremental_vacuum: p.get_u32(OFFSET_INCREMENTAL_VACUUM),
            application_id: p.get_u32(OFFSET_APPLICATION_ID),
            version_valid_for: p.get_u32(OFFSET_VERSION_VALID_FOR),
        })
    }

    pub fn write(&self, data: &mut [u8]) {
        let mut p = PointerMut::new(data);
        p.copy_from(0, MAGIC);
        // 65536 does not fit in 16 bits and is stored as 1.
        let size_field = if self.page_size == 65536 {
            1
        } else {
            self.page_size as u16
        };
        p.put_u16(OFFSET_PAGE_SIZE, size_field);
        p.put_u8(OFFSET_WRITE_VERSION, FORMAT_VERSION);
        p.put_u8(OFFSET_READ_VERSION, FORMAT_VERSION);
        p.put_u8(OFFSET_RESERVED, self.reserved_bytes);
        p.put_u8(OFFSET_MAX_PAYLOAD_FRACTION, 64);
        p.put_u8(OFFSET_MIN_PAYLOAD_FRACTION, 32);
        p.put_u8(OFFSET_LEAF_PAYLOAD_FRACTION, 32);
        p.put_u32(OFFSET_CHANGE_COUNTER, self.change_counter);
        p.put_u32(OFFSET_PAGE_COUNT, self.page_count);
        p.put_u32(OFFSET_FREELIST_TRUNK, self.freelist_trunk);
        p.put_u32(OFFSET_FREELIST_COUNT, self.freelist_count);
        p.put_u32(OFFSET_SCHEMA_COOKIE, self.schema_cookie);
        p.put_u32(OFFSET_SCHEMA_FORMAT, self.schema_format);
        p.put_u32(OFFSET_DEFAULT_CACHE_SIZE, self.default_cache_size as u32);
        p.put_u32(OFFSET_LARGEST_ROOT, self.largest_root);
        p.put_u32(OFFSET_TEXT_ENCODING, self.text_encoding.code());
        p.put_u32(OFFSET_USER_VERSION, self.user_version);
        p.put_u32(OFFSET_INCREMENTAL_VACUUM, self.incremental_vacuum);
        p.put_u32(OFFSET_APPLICATION_ID, self.application_id);
        p.fill(72, 20, 0);
        p.put_u32(OFFSET_VERSION_VALID_FOR, self.version_valid_for);
        p.put_u32(OFFSET_LIBRARY_VERSION, LIBRARY_VERSION);
    }
}

fn decode_page_size(field: u16) -> Result<usize> {
    let size = if field == 1 { 65536 } else { field as usize };
    if !is_valid_page_size(size) {
        return Err(Error::corrupt(format!("invalid page size {size}")));
    }
    Ok(size)
}

/// Change counter of a raw header, without validating anything else.
pub fn peek_change_counter(data: &[u8]) -> u32 {
    Pointer::new(data).get_u32(OFFSET_CHANGE_COUNTER)
}
