//! On-page layout of B-tree nodes.
//!
//! ```text
//! 0      type (0x02 index interior, 0x05 table interior, 0x0A index leaf, 0x0D table leaf)
//! 1..3   fragmented bytes
//! 3..5   cell count
//! 5..7   start of cell content (0 means 65536)
//! 7      reserved
//! 8..12  right-most child (interior nodes only)
//! ...    cell pointer array, two bytes per cell, in key order
//! ```
//!
//! Cell bodies are packed at the end of the page.

use crate::buffer::{Pointer, PointerMut};
use crate::error::{Error, Result};
use crate::pager::PageNo;

use super::cell;

pub const LEAF_HEADER_SIZE: usize = 8;
pub const INTERIOR_HEADER_SIZE: usize = 12;

const OFFSET_TYPE: usize = 0;
const OFFSET_FRAGMENTED: usize = 1;
const OFFSET_CELL_COUNT: usize = 3;
const OFFSET_CONTENT_START: usize = 5;
const OFFSET_RIGHT_CHILD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Integer keys with a data payload.
    Table,
    /// Record keys, no separate data.
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    IndexInterior,
    TableInterior,
    IndexLeaf,
    TableLeaf,
}

impl NodeKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x02 => Some(NodeKind::IndexInterior),
            0x05 => Some(NodeKind::TableInterior),
            0x0A => Some(NodeKind::IndexLeaf),
            0x0D => Some(NodeKind::TableLeaf),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            NodeKind::IndexInterior => 0x02,
            NodeKind::TableInterior => 0x05,
            NodeKind::IndexLeaf => 0x0A,
            NodeKind::TableLeaf => 0x0D,
        }
    }

    pub fn leaf(tree: TreeKind) -> Self {
        match tree {
            TreeKind::Table => NodeKind::TableLeaf,
            TreeKind::Index => NodeKind::IndexLeaf,
        }
    }

    pub fn interior(tree: TreeKind) -> Self {
        match tree {
            TreeKind::Table => NodeKind::TableInterior,
            TreeKind::Index => NodeKind::IndexInterior,
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, NodeKind::TableLeaf | NodeKind::IndexLeaf)
    }

    pub fn tree(self) -> TreeKind {
        match self {
            NodeKind::TableLeaf | NodeKind::TableInterior => TreeKind::Table,
            NodeKind::IndexLeaf | NodeKind::IndexInterior => TreeKind::Index,
        }
    }

    pub fn header_size(self) -> usize {
        if self.is_leaf() {
            LEAF_HEADER_SIZE
        } else {
            INTERIOR_HEADER_SIZE
        }
    }
}

/// Borrowed view of a node page, for reads.
#[derive(Debug, Clone, Copy)]
pub struct NodePage<'a> {
    data: &'a [u8],
    kind: NodeKind,
    count: usize,
    usable: usize,
}

impl<'a> NodePage<'a> {
    pub fn new(data: &'a [u8], pgno: PageNo, usable: usize) -> Result<Self> {
        let p = Pointer::new(data);
        let kind = NodeKind::from_byte(p.get_u8(OFFSET_TYPE)).ok_or_else(|| {
            Error::corrupt(format!(
                "page {pgno} has unknown node type {:#04x}",
                p.get_u8(OFFSET_TYPE)
            ))
        })?;
        let count = p.get_u16(OFFSET_CELL_COUNT) as usize;
        if kind.header_size() + 2 * count > usable {
            return Err(Error::corrupt(format!(
                "page {pgno} claims {count} cells"
            )));
        }
        Ok(NodePage {
            data: &data[..usable],
            kind,
            count,
            usable,
        })
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn cell_count(&self) -> usize {
        self.count
    }

    pub fn right_child(&self) -> PageNo {
        if self.kind.is_leaf() {
            0
        } else {
            Pointer::new(self.data).get_u32(OFFSET_RIGHT_CHILD)
        }
    }

    /// Bytes of cell `i`.
    pub fn cell(&self, i: usize) -> Result<&'a [u8]> {
        debug_assert!(i < self.count);
        let offset = Pointer::new(self.data).get_u16(self.kind.header_size() + 2 * i) as usize;
        let ptr_end = self.kind.header_size() + 2 * self.count;
        if offset < ptr_end || offset >= self.usable {
            return Err(Error::corrupt(format!("cell pointer {offset} out of range")));
        }
        let size = cell::parse_cell(self.kind, &self.data[offset..], self.usable)?.size;
        Ok(&self.data[offset..offset + size])
    }

    /// Child `i`: the left child of cell `i`, or the right-most child when
    /// `i == cell_count()`.
    pub fn child(&self, i: usize) -> Result<PageNo> {
        debug_assert!(!self.kind.is_leaf());
        let pgno = if i == self.count {
            self.right_child()
        } else {
            Pointer::new(self.cell(i)?).get_u32(0)
        };
        if pgno == 0 {
            return Err(Error::corrupt("child pointer is 0"));
        }
        Ok(pgno)
    }
}

/// Owned, editable copy of a node. Edits happen here and the page is
/// rewritten compactly with [`Node::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub cells: Vec<Vec<u8>>,
    /// 0 for leaves.
    pub right_child: PageNo,
}

impl Node {
    pub fn empty(kind: NodeKind) -> Self {
        Node {
            kind,
            cells: Vec::new(),
            right_child: 0,
        }
    }

    pub fn parse(data: &[u8], pgno: PageNo, usable: usize) -> Result<Self> {
        let page = NodePage::new(data, pgno, usable)?;
        let cells = (0..page.cell_count())
            .map(|i| page.cell(i).map(<[u8]>::to_vec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Node {
            kind: page.kind(),
            cells,
            right_child: page.right_child(),
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.kind.is_leaf()
    }

    /// Bytes the node needs on a page.
    pub fn used_bytes(&self) -> usize {
        self.kind.header_size() + self.cells.iter().map(|c| c.len() + 2).sum::<usize>()
    }

    pub fn fits(&self, usable: usize) -> bool {
        self.used_bytes() <= usable
    }

    /// Less than a third full, or empty.
    pub fn is_underfull(&self, usable: usize) -> bool {
        self.cells.is_empty() || self.used_bytes() < usable / 3
    }

    pub fn child(&self, i: usize) -> PageNo {
        if i == self.cells.len() {
            self.right_child
        } else {
            Pointer::new(&self.cells[i]).get_u32(0)
        }
    }

    pub fn set_child(&mut self, i: usize, pgno: PageNo) {
        if i == self.cells.len() {
            self.right_child = pgno;
        } else {
            PointerMut::new(&mut self.cells[i]).put_u32(0, pgno);
        }
    }

    /// Which child points at `pgno`.
    pub fn child_index(&self, pgno: PageNo) -> Option<usize> {
        (0..=self.cells.len()).find(|&i| self.child(i) == pgno)
    }

    /// Serialize into `data`. The node must fit.
    pub fn write(&self, data: &mut [u8], usable: usize) {
        assert!(self.fits(usable), "node of {} bytes written to a {usable} byte page", self.used_bytes());
        data[..usable].fill(0);
        let header = self.kind.header_size();
        let mut content = usable;
        for (i, cell) in self.cells.iter().enumerate() {
            content -= cell.len();
            data[content..content + cell.len()].copy_from_slice(cell);
            PointerMut::new(data).put_u16(header + 2 * i, content as u16);
        }
        let mut p = PointerMut::new(data);
        p.put_u8(OFFSET_TYPE, self.kind.to_byte());
        p.put_u16(OFFSET_FRAGMENTED, 0);
        p.put_u16(OFFSET_CELL_COUNT, self.cells.len() as u16);
        // 65536 wraps to 0.
        p.put_u16(OFFSET_CONTENT_START, content as u16);
        if !self.is_leaf() {
            p.put_u32(OFFSET_RIGHT_CHILD, self.right_child);
        }
    }
}

/// Node type of a page without parsing the rest.
pub fn peek_kind(data: &[u8]) -> Option<NodeKind> {
    data.first().and_then(|b| NodeKind::from_byte(*b))
}
