//! Cell formats.
//!
//! ```text
//! table leaf      varint payload length, varint rowid, local payload, [overflow page]
//! table interior  u32 left child, varint rowid
//! index leaf      varint payload length, local payload, [overflow page]
//! index interior  u32 left child, varint payload length, local payload, [overflow page]
//! ```

use crate::buffer::varint::{put_varint, try_get_varint, MAX_VARINT_LEN};
use crate::buffer::Pointer;
use crate::error::{Error, Result};
use crate::pager::{PageNo, Pager};

use super::node::NodeKind;
use super::overflow;

/// Largest payload accepted in one cell.
const MAX_PAYLOAD: u64 = 1 << 30;

/// Most payload bytes kept on the node page itself.
pub fn max_local(kind: NodeKind, usable: usize) -> usize {
    if kind == NodeKind::TableLeaf {
        usable - 35
    } else {
        (usable - 12) * 64 / 255 - 23
    }
}

/// Payload bytes kept locally once a payload spills.
pub fn min_local(usable: usize) -> usize {
    (usable - 12) * 32 / 255 - 23
}

/// How much of a `payload_len` byte payload stays on the node page.
pub fn local_size(kind: NodeKind, payload_len: usize, usable: usize) -> usize {
    let max = max_local(kind, usable);
    if payload_len <= max {
        return payload_len;
    }
    let min = min_local(usable);
    let surplus = min + (payload_len - min) % (usable - 4);
    if surplus <= max {
        surplus
    } else {
        min
    }
}

/// Decoded cell header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellInfo {
    /// 0 for leaf cells.
    pub left_child: PageNo,
    /// Table cells only.
    pub rowid: i64,
    pub payload_len: usize,
    pub local_start: usize,
    pub local_len: usize,
    /// First overflow page, 0 when the payload is all local.
    pub overflow: PageNo,
    /// Total bytes of the cell.
    pub size: usize,
}

impl CellInfo {
    pub fn local<'a>(&self, cell: &'a [u8]) -> &'a [u8] {
        &cell[self.local_start..self.local_start + self.local_len]
    }

    /// Payload bytes stored in the overflow chain.
    pub fn overflow_len(&self) -> usize {
        self.payload_len - self.local_len
    }
}

/// Parse the cell at the start of `data`. `data` may run past the cell.
pub fn parse_cell(kind: NodeKind, data: &[u8], usable: usize) -> Result<CellInfo> {
    let truncated = || Error::corrupt("truncated cell");
    let mut info = CellInfo {
        left_child: 0,
        rowid: 0,
        payload_len: 0,
        local_start: 0,
        local_len: 0,
        overflow: 0,
        size: 0,
    };
    let mut pos = 0;
    if !kind.is_leaf() {
        if data.len() < 4 {
            return Err(truncated());
        }
        info.left_child = Pointer::new(data).get_u32(0);
        pos = 4;
    }
    if kind == NodeKind::TableInterior {
        let (rowid, n) = try_get_varint(&data[pos..]).ok_or_else(truncated)?;
        info.rowid = rowid as i64;
        info.size = pos + n;
        return Ok(info);
    }

    let (len, n) = try_get_varint(&data[pos..]).ok_or_else(truncated)?;
    if len > MAX_PAYLOAD {
        return Err(Error::corrupt(format!("cell payload of {len} bytes")));
    }
    pos += n;
    if kind == NodeKind::TableLeaf {
        let (rowid, n) = try_get_varint(&data[pos..]).ok_or_else(truncated)?;
        info.rowid = rowid as i64;
        pos += n;
    }
    info.payload_len = len as usize;
    info.local_len = local_size(kind, info.payload_len, usable);
    info.local_start = pos;
    pos += info.local_len;
    if info.local_len < info.payload_len {
        if data.len() < pos + 4 {
            return Err(truncated());
        }
        info.overflow = Pointer::new(data).get_u32(pos);
        pos += 4;
    }
    if pos > data.len() {
        return Err(truncated());
    }
    info.size = pos;
    Ok(info)
}

fn push_varint(out: &mut Vec<u8>, value: u64) {
    let mut scratch = [0u8; MAX_VARINT_LEN];
    let n = put_varint(&mut scratch, value);
    out.extend_from_slice(&scratch[..n]);
}

/// Build a cell, writing any payload that does not fit locally to a new
/// overflow chain.
pub fn build_cell(
    pager: &mut Pager,
    kind: NodeKind,
    left_child: PageNo,
    rowid: i64,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut cell = Vec::new();
    if !kind.is_leaf() {
        cell.extend_from_slice(&left_child.to_be_bytes());
    }
    if kind == NodeKind::TableInterior {
        push_varint(&mut cell, rowid as u64);
        return Ok(cell);
    }
    push_varint(&mut cell, payload.len() as u64);
    if kind == NodeKind::TableLeaf {
        push_varint(&mut cell, rowid as u64);
    }
    let local = local_size(kind, payload.len(), pager.usable_size());
    cell.extend_from_slice(&payload[..local]);
    if local < payload.len() {
        let first = overflow::write_chain(pager, &payload[local..])?;
        cell.extend_from_slice(&first.to_be_bytes());
    }
    Ok(cell)
}

/// Full payload of a cell, following its overflow chain.
pub fn read_payload(pager: &mut Pager, kind: NodeKind, cell: &[u8]) -> Result<Vec<u8>> {
    let info = parse_cell(kind, cell, pager.usable_size())?;
    let mut payload = Vec::with_capacity(info.payload_len);
    payload.extend_from_slice(info.local(cell));
    if info.overflow != 0 {
        overflow::read_chain(pager, info.overflow, info.overflow_len(), &mut payload)?;
    }
    Ok(payload)
}

/// Release the overflow pages a cell owns.
pub fn free_overflow(pager: &mut Pager, kind: NodeKind, cell: &[u8]) -> Result<()> {
    let info = parse_cell(kind, cell, pager.usable_size())?;
    if info.overflow != 0 {
        overflow::free_chain(pager, info.overflow, info.overflow_len())?;
    }
    Ok(())
}

/// Separator for an interior node built from a leaf cell, pointing left at
/// `left_child`. Index separators get their own copy of the payload.
pub fn separator_from_leaf(
    pager: &mut Pager,
    leaf_kind: NodeKind,
    leaf_cell: &[u8],
    left_child: PageNo,
) -> Result<Vec<u8>> {
    let interior = NodeKind::interior(leaf_kind.tree());
    let info = parse_cell(leaf_kind, leaf_cell, pager.usable_size())?;
    if leaf_kind == NodeKind::TableLeaf {
        return build_cell(pager, interior, left_child, info.rowid, &[]);
    }
    let payload = read_payload(pager, leaf_kind, leaf_cell)?;
    build_cell(pager, interior, left_child, 0, &payload)
}
