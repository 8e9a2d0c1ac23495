//! How index keys are ordered.

use std::cmp::Ordering;

use bitflags::bitflags;

use crate::error::Result;
use crate::pager::header::TextEncoding;

use super::value::Value;
use super::decode_record_with;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Text comparison rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collation {
    /// Byte-wise.
    #[default]
    Binary,
    /// ASCII letters compare case-insensitively.
    NoCase,
    /// Trailing spaces are ignored.
    RTrim,
}

impl Collation {
    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            Collation::Binary => a.as_bytes().cmp(b.as_bytes()),
            Collation::NoCase => a
                .bytes()
                .map(|c| c.to_ascii_lowercase())
                .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
            Collation::RTrim => a.trim_end_matches(' ').as_bytes().cmp(b.trim_end_matches(' ').as_bytes()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyField {
    pub order: SortOrder,
    pub collation: Collation,
}

impl KeyField {
    pub fn desc() -> Self {
        KeyField {
            order: SortOrder::Desc,
            ..Default::default()
        }
    }

    pub fn collate(collation: Collation) -> Self {
        KeyField {
            collation,
            ..Default::default()
        }
    }
}

/// Per-field ordering for an index. Fields past `fields` use the default
/// (ascending, binary).
#[derive(Debug, Clone, Default)]
pub struct KeyInfo {
    pub fields: Vec<KeyField>,
    pub encoding: TextEncoding,
}

impl KeyInfo {
    /// `n` ascending binary fields.
    pub fn new(n: usize) -> Self {
        KeyInfo {
            fields: vec![KeyField::default(); n],
            encoding: TextEncoding::Utf8,
        }
    }

    pub fn with_fields(fields: Vec<KeyField>) -> Self {
        KeyInfo {
            fields,
            encoding: TextEncoding::Utf8,
        }
    }

    pub fn field(&self, i: usize) -> KeyField {
        self.fields.get(i).copied().unwrap_or_default()
    }

    pub fn decode(&self, record: &[u8]) -> Result<Vec<Value>> {
        decode_record_with(record, self.encoding)
    }

    /// Order of `probe` relative to `stored`.
    pub fn compare(&self, probe: &[Value], stored: &[Value], flags: CompareFlags) -> Ordering {
        let (probe, stored) = if flags.contains(CompareFlags::IGNORE_ROWID) {
            (drop_last(probe), drop_last(stored))
        } else {
            (probe, stored)
        };
        for (i, (a, b)) in probe.iter().zip(stored).enumerate() {
            let field = self.field(i);
            let ord = a.compare(b, field.collation);
            if ord != Ordering::Equal {
                return match field.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                };
            }
        }
        if flags.contains(CompareFlags::PREFIX_MATCH) && probe.len() <= stored.len() {
            return Ordering::Equal;
        }
        probe.len().cmp(&stored.len())
    }

    /// Same as [`KeyInfo::compare`] on two encoded records.
    pub fn compare_encoded(&self, probe: &[u8], stored: &[u8], flags: CompareFlags) -> Result<Ordering> {
        Ok(self.compare(&self.decode(probe)?, &self.decode(stored)?, flags))
    }
}

fn drop_last(values: &[Value]) -> &[Value] {
    &values[..values.len().saturating_sub(1)]
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompareFlags: u8 {
        /// Leave the trailing row-id field of both records out.
        const IGNORE_ROWID = 0x01;
        /// A probe that runs out of fields first equals the stored record.
        const PREFIX_MATCH = 0x02;
    }
}
