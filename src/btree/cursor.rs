use std::cmp::Ordering;

use log::warn;

use crate::error::{Error, Result};
use crate::pager::{PageNo, PageRef, Pager};
use crate::record::{field_count, CompareFlags, KeyInfo, Value};

use super::balance;
use super::cell;
use super::node::{NodeKind, NodePage, TreeKind};

/// Deeper than any tree a 4 GiB page space can hold; stops descent on
/// cyclic child pointers.
const MAX_DEPTH: usize = 40;

/// Key passed to [`BTreeCursor::move_to`] and [`BTreeCursor::insert`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BTreeKey<'a> {
    /// Row id of a table tree.
    Int(i64),
    /// Encoded record of an index tree.
    Record(&'a [u8]),
}

#[derive(Debug, Clone)]
enum Probe {
    Int(i64),
    Record(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq)]
enum SavedKey {
    Int(i64),
    Record(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Unpositioned,
    Valid,
    Eof,
}

/// A position in one tree.
///
/// Every method takes the pager the tree lives in. The cursor pins the
/// pages on its path between calls; [`BTreeCursor::close`] releases them.
/// When anything changes the database after the cursor was positioned,
/// the cursor finds its entry again by key before it moves or reads. If
/// the entry is gone it lands on the next larger one.
#[derive(Debug)]
pub struct BTreeCursor {
    root: PageNo,
    tree: TreeKind,
    key_info: KeyInfo,
    path: Vec<(PageRef, usize)>,
    state: CursorState,
    saved: Option<SavedKey>,
    seq: u64,
    /// The entry the cursor was on went away and it now sits on the next
    /// one; the following `next` does not move.
    at_successor: bool,
}

impl BTreeCursor {
    pub(crate) fn new(root: PageNo, tree: TreeKind, key_info: KeyInfo) -> Self {
        BTreeCursor {
            root,
            tree,
            key_info,
            path: Vec::new(),
            state: CursorState::Unpositioned,
            saved: None,
            seq: 0,
            at_successor: false,
        }
    }

    pub fn root(&self) -> PageNo {
        self.root
    }

    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    pub fn is_eof(&self) -> bool {
        self.state == CursorState::Eof
    }

    /// Position on the smallest entry. Returns false for an empty tree.
    pub fn first(&mut self, pager: &mut Pager) -> Result<bool> {
        self.reset(pager);
        let result = self.descend(pager, self.root, false).and_then(|_| self.settle_forward(pager));
        self.finish(pager, result)
    }

    /// Position on the largest entry. Returns false for an empty tree.
    pub fn last(&mut self, pager: &mut Pager) -> Result<bool> {
        self.reset(pager);
        let result = self.descend(pager, self.root, true).and_then(|_| {
            if self.leaf_has_entry(pager)? {
                Ok(true)
            } else {
                self.step_backward(pager)
            }
        });
        self.finish(pager, result)
    }

    /// Advance to the next entry; false once past the last one.
    pub fn next(&mut self, pager: &mut Pager) -> Result<bool> {
        self.restore(pager)?;
        match self.state {
            CursorState::Unpositioned => return Err(Error::misuse("cursor is not positioned")),
            CursorState::Eof => return Ok(false),
            CursorState::Valid => {}
        }
        if std::mem::take(&mut self.at_successor) {
            return Ok(true);
        }
        if let Some((_, idx)) = self.path.last_mut() {
            *idx += 1;
        }
        let result = self.settle_forward(pager);
        self.finish(pager, result)
    }

    /// Step back to the previous entry; false once before the first one.
    pub fn previous(&mut self, pager: &mut Pager) -> Result<bool> {
        self.restore(pager)?;
        let at_successor = std::mem::take(&mut self.at_successor);
        match self.state {
            CursorState::Unpositioned => return Err(Error::misuse("cursor is not positioned")),
            // The entry was the largest one and is gone.
            CursorState::Eof if at_successor => return self.last(pager),
            CursorState::Eof => return Ok(false),
            CursorState::Valid => {}
        }
        let result = self.step_backward(pager);
        self.finish(pager, result)
    }

    /// Seek `key`. The cursor ends on the smallest entry not less than
    /// `key`, or past the end. Returns whether that entry equals `key`.
    ///
    /// For index trees with `exact` false, a stored record whose leading
    /// fields equal all fields of `key` counts as equal, so a short key
    /// finds the first entry it is a prefix of.
    pub fn move_to(&mut self, pager: &mut Pager, key: BTreeKey<'_>, exact: bool) -> Result<bool> {
        let flags = if exact {
            CompareFlags::empty()
        } else {
            CompareFlags::PREFIX_MATCH
        };
        self.move_to_with(pager, key, flags)
    }

    /// [`BTreeCursor::move_to`] with explicit comparison flags. With
    /// `IGNORE_ROWID` an index record matches any entry that differs only
    /// in its trailing row id.
    pub fn move_to_with(&mut self, pager: &mut Pager, key: BTreeKey<'_>, flags: CompareFlags) -> Result<bool> {
        let probe = self.probe(key)?;
        self.reset(pager);
        let result = self.seek(pager, &probe, flags).and_then(|_| {
            if self.settle_forward(pager)? {
                self.matches_here(pager, &probe, flags)
            } else {
                Ok(false)
            }
        });
        let found = match result {
            Ok(found) => found,
            Err(e) => {
                self.reset(pager);
                return Err(e);
            }
        };
        self.finish(pager, Ok(true))?;
        Ok(found && self.is_valid())
    }

    /// Insert an index record unless an entry equal to it in every field
    /// but the trailing row id is already there. Returns false, with the
    /// cursor on that entry, when one is.
    pub fn insert_unique(&mut self, pager: &mut Pager, record: &[u8]) -> Result<bool> {
        if self.tree != TreeKind::Index {
            return Err(Error::misuse("unique inserts go to index trees"));
        }
        if field_count(record)? < 2 {
            return Err(Error::misuse("unique index records end with a row id"));
        }
        if self.move_to_with(pager, BTreeKey::Record(record), CompareFlags::IGNORE_ROWID)? {
            return Ok(false);
        }
        self.insert(pager, BTreeKey::Record(record), &[])?;
        Ok(true)
    }

    /// Insert an entry, replacing one with an equal key. Index entries
    /// carry everything in the key and take empty `data`. Afterwards the
    /// cursor is on the new entry.
    pub fn insert(&mut self, pager: &mut Pager, key: BTreeKey<'_>, data: &[u8]) -> Result<()> {
        if !pager.state().is_writing() {
            return Err(Error::misuse("insert outside a write transaction"));
        }
        let probe = self.probe(key)?;
        let (rowid, payload) = match key {
            BTreeKey::Int(rowid) => (rowid, data),
            BTreeKey::Record(record) => {
                if !data.is_empty() {
                    return Err(Error::misuse("index entries take no data"));
                }
                (0, record)
            }
        };
        self.reset(pager);
        let found = match self.seek(pager, &probe, CompareFlags::empty()) {
            Ok(found) => found,
            Err(e) => {
                self.reset(pager);
                return Err(e);
            }
        };
        let (path, leaf_pgno, idx) = self.take_path(pager)?;
        let mut leaf = balance::read_node(pager, leaf_pgno)?;
        let new_cell = cell::build_cell(pager, leaf.kind, 0, rowid, payload)?;
        if found {
            let old = std::mem::replace(&mut leaf.cells[idx], new_cell);
            cell::free_overflow(pager, leaf.kind, &old)?;
        } else {
            leaf.cells.insert(idx, new_cell);
        }
        balance::rebalance(pager, self.root, path, leaf_pgno, leaf)?;

        let result = self.seek(pager, &probe, CompareFlags::empty()).map(|_| true);
        self.finish(pager, result)?;
        Ok(())
    }

    /// Remove the entry under the cursor. The cursor then rests on the
    /// following entry, which the next call to `next` returns.
    pub fn delete(&mut self, pager: &mut Pager) -> Result<()> {
        if !pager.state().is_writing() {
            return Err(Error::misuse("delete outside a write transaction"));
        }
        self.restore(pager)?;
        if self.state != CursorState::Valid || self.at_successor {
            return Err(Error::misuse("cursor has no current entry"));
        }
        let probe = match self.saved.clone() {
            Some(SavedKey::Int(rowid)) => Probe::Int(rowid),
            Some(SavedKey::Record(record)) => Probe::Record(self.key_info.decode(&record)?),
            None => return Err(Error::misuse("cursor has no current entry")),
        };
        let (path, leaf_pgno, idx) = self.take_path(pager)?;
        let mut leaf = balance::read_node(pager, leaf_pgno)?;
        if idx >= leaf.cells.len() {
            return Err(Error::corrupt(format!("cursor index {idx} past page {leaf_pgno}")));
        }
        let removed = leaf.cells.remove(idx);
        cell::free_overflow(pager, leaf.kind, &removed)?;
        balance::rebalance(pager, self.root, path, leaf_pgno, leaf)?;

        let result = self
            .seek(pager, &probe, CompareFlags::empty())
            .and_then(|_| self.settle_forward(pager));
        self.finish(pager, result)?;
        self.at_successor = true;
        Ok(())
    }

    /// Row id of the current table entry.
    pub fn rowid(&mut self, pager: &mut Pager) -> Result<i64> {
        if self.tree != TreeKind::Table {
            return Err(Error::misuse("row ids belong to table trees"));
        }
        self.current(pager)?;
        let (kind, cell) = self.leaf_cell(pager)?;
        Ok(cell::parse_cell(kind, &cell, pager.usable_size())?.rowid)
    }

    /// Encoded record of the current index entry.
    pub fn key(&mut self, pager: &mut Pager) -> Result<Vec<u8>> {
        if self.tree != TreeKind::Index {
            return Err(Error::misuse("table entries are keyed by row id"));
        }
        self.current(pager)?;
        let (kind, cell) = self.leaf_cell(pager)?;
        cell::read_payload(pager, kind, &cell)
    }

    /// Data of the current table entry.
    pub fn data(&mut self, pager: &mut Pager) -> Result<Vec<u8>> {
        if self.tree != TreeKind::Table {
            return Err(Error::misuse("index entries carry no data"));
        }
        self.current(pager)?;
        let (kind, cell) = self.leaf_cell(pager)?;
        cell::read_payload(pager, kind, &cell)
    }

    /// The current entry's record, decoded: the key of an index entry or
    /// the data of a table entry.
    pub fn record(&mut self, pager: &mut Pager) -> Result<Vec<Value>> {
        let bytes = match self.tree {
            TreeKind::Table => self.data(pager)?,
            TreeKind::Index => self.key(pager)?,
        };
        self.key_info.decode(&bytes)
    }

    /// Number of entries in the tree. Leaves the position alone.
    pub fn count(&mut self, pager: &mut Pager) -> Result<u64> {
        let usable = pager.usable_size();
        let mut total = 0u64;
        let mut visited = 0u32;
        let mut stack = vec![self.root];
        while let Some(pgno) = stack.pop() {
            visited += 1;
            if visited > pager.page_count() {
                return Err(Error::corrupt(format!("tree at page {} has a cycle", self.root)));
            }
            pager.with_page(pgno, false, |pager, page| {
                let view = NodePage::new(pager.page_data(page), pgno, usable)?;
                if view.kind().is_leaf() {
                    total += view.cell_count() as u64;
                } else {
                    for i in 0..=view.cell_count() {
                        stack.push(view.child(i)?);
                    }
                }
                Ok(())
            })?;
        }
        Ok(total)
    }

    /// Release the cursor's pages.
    pub fn close(mut self, pager: &mut Pager) {
        self.reset(pager);
    }

    // ---- positioning ----

    fn probe(&self, key: BTreeKey<'_>) -> Result<Probe> {
        match (self.tree, key) {
            (TreeKind::Table, BTreeKey::Int(rowid)) => Ok(Probe::Int(rowid)),
            (TreeKind::Index, BTreeKey::Record(record)) => Ok(Probe::Record(self.key_info.decode(record)?)),
            (TreeKind::Table, BTreeKey::Record(_)) => Err(Error::misuse("table trees are keyed by row id")),
            (TreeKind::Index, BTreeKey::Int(_)) => Err(Error::misuse("index trees are keyed by record")),
        }
    }

    fn reset(&mut self, pager: &mut Pager) {
        for (page, _) in self.path.drain(..) {
            pager.release_page(page);
        }
        self.state = CursorState::Unpositioned;
        self.saved = None;
        self.at_successor = false;
    }

    /// Record the outcome of a move: either the cursor is on an entry, whose
    /// key is remembered, or it is past the end.
    fn finish(&mut self, pager: &mut Pager, moved: Result<bool>) -> Result<bool> {
        let on_entry = match moved {
            Ok(on_entry) => on_entry,
            Err(e) => {
                self.reset(pager);
                return Err(e);
            }
        };
        self.seq = pager.change_seq();
        let leaf_ok = on_entry && self.leaf_has_entry(pager).unwrap_or(false);
        if !leaf_ok {
            self.reset(pager);
            self.state = CursorState::Eof;
            return Ok(false);
        }
        match self.key_here(pager) {
            Ok(key) => {
                self.saved = Some(key);
                self.state = CursorState::Valid;
                Ok(true)
            }
            Err(e) => {
                self.reset(pager);
                Err(e)
            }
        }
    }

    /// Find the entry again if the database changed since the cursor was
    /// positioned.
    fn restore(&mut self, pager: &mut Pager) -> Result<()> {
        if self.state != CursorState::Valid || self.seq == pager.change_seq() {
            return Ok(());
        }
        let probe = match self.saved.take() {
            Some(SavedKey::Int(rowid)) => Probe::Int(rowid),
            Some(SavedKey::Record(record)) => Probe::Record(self.key_info.decode(&record)?),
            None => return Err(Error::misuse("cursor lost its position")),
        };
        let was_at_successor = self.at_successor;
        for (page, _) in self.path.drain(..) {
            pager.release_page(page);
        }
        let result = self.seek(pager, &probe, CompareFlags::empty()).and_then(|_| {
            if self.settle_forward(pager)? {
                self.matches_here(pager, &probe, CompareFlags::empty())
            } else {
                Ok(false)
            }
        });
        let found = match result {
            Ok(found) => found,
            Err(e) => {
                self.reset(pager);
                return Err(e);
            }
        };
        self.finish(pager, Ok(true))?;
        self.at_successor = was_at_successor || !found;
        Ok(())
    }

    fn current(&mut self, pager: &mut Pager) -> Result<()> {
        self.restore(pager)?;
        if self.state != CursorState::Valid {
            return Err(Error::misuse("cursor is not on an entry"));
        }
        Ok(())
    }

    /// Descend from the root towards `probe`, leaving the cursor at the
    /// first leaf slot whose key is not less than it.
    fn seek(&mut self, pager: &mut Pager, probe: &Probe, flags: CompareFlags) -> Result<bool> {
        let usable = pager.usable_size();
        let mut pgno = self.root;
        loop {
            if self.path.len() >= MAX_DEPTH {
                return Err(Error::corrupt(format!("tree at page {} is too deep", self.root)));
            }
            let page = pager.acquire_page(pgno, false)?;
            self.path.push((page, 0));
            let (kind, count) = self.node_info(pager, usable)?;

            let (mut lo, mut hi) = (0, count);
            let mut found = false;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let cell = self.path_cell(pager, usable, mid)?;
                match self.compare_cell(pager, kind, &cell, probe, flags)? {
                    Ordering::Greater => lo = mid + 1,
                    Ordering::Equal => {
                        found = true;
                        hi = mid;
                    }
                    Ordering::Less => hi = mid,
                }
            }
            if let Some((_, idx)) = self.path.last_mut() {
                *idx = lo;
            }
            if kind.is_leaf() {
                return Ok(found);
            }
            pgno = self.child_of_last(pager, usable, lo)?;
        }
    }

    /// Follow first or last children from `pgno` down to a leaf.
    fn descend(&mut self, pager: &mut Pager, mut pgno: PageNo, rightmost: bool) -> Result<()> {
        let usable = pager.usable_size();
        loop {
            if self.path.len() >= MAX_DEPTH {
                return Err(Error::corrupt(format!("tree at page {} is too deep", self.root)));
            }
            let page = pager.acquire_page(pgno, false)?;
            self.path.push((page, 0));
            let (kind, count) = self.node_info(pager, usable)?;
            let idx = match (rightmost, kind.is_leaf()) {
                (false, _) => 0,
                (true, true) => count.saturating_sub(1),
                (true, false) => count,
            };
            if let Some((_, i)) = self.path.last_mut() {
                *i = idx;
            }
            if kind.is_leaf() {
                return Ok(());
            }
            pgno = self.child_of_last(pager, usable, idx)?;
        }
    }

    /// The leaf slot may be one past its last entry; climb until an entry
    /// is under the cursor. False at the end of the tree.
    fn settle_forward(&mut self, pager: &mut Pager) -> Result<bool> {
        let usable = pager.usable_size();
        loop {
            if self.leaf_has_entry(pager)? {
                return Ok(true);
            }
            if let Some((page, _)) = self.path.pop() {
                pager.release_page(page);
            }
            loop {
                if self.path.is_empty() {
                    return Ok(false);
                }
                let (_, count) = self.node_info(pager, usable)?;
                let idx = self.path.last().map_or(0, |(_, idx)| *idx);
                if idx < count {
                    let child = self.child_of_last(pager, usable, idx + 1)?;
                    if let Some((_, i)) = self.path.last_mut() {
                        *i = idx + 1;
                    }
                    self.descend(pager, child, false)?;
                    break;
                }
                if let Some((page, _)) = self.path.pop() {
                    pager.release_page(page);
                }
            }
        }
    }

    /// Move to the entry before the current leaf slot. False at the start.
    fn step_backward(&mut self, pager: &mut Pager) -> Result<bool> {
        let usable = pager.usable_size();
        loop {
            let idx = self.path.last().map_or(0, |(_, idx)| *idx);
            if idx > 0 {
                if let Some((_, i)) = self.path.last_mut() {
                    *i = idx - 1;
                }
                return Ok(true);
            }
            if let Some((page, _)) = self.path.pop() {
                pager.release_page(page);
            }
            loop {
                let Some(&(_, idx)) = self.path.last() else {
                    return Ok(false);
                };
                if idx > 0 {
                    let child = self.child_of_last(pager, usable, idx - 1)?;
                    if let Some((_, i)) = self.path.last_mut() {
                        *i = idx - 1;
                    }
                    self.descend(pager, child, true)?;
                    break;
                }
                if let Some((page, _)) = self.path.pop() {
                    pager.release_page(page);
                }
            }
            if self.leaf_has_entry(pager)? {
                return Ok(true);
            }
            // An empty leaf: the slot is 0, so the next round climbs again.
        }
    }

    /// Drop the pins and hand back the path as page numbers, split into the
    /// ancestors and the leaf slot.
    fn take_path(&mut self, pager: &mut Pager) -> Result<(Vec<(PageNo, usize)>, PageNo, usize)> {
        let mut levels: Vec<(PageNo, usize)> = self.path.iter().map(|(page, idx)| (page.pgno(), *idx)).collect();
        self.reset(pager);
        let (leaf, idx) = levels
            .pop()
            .ok_or_else(|| Error::corrupt("seek left an empty path"))?;
        Ok((levels, leaf, idx))
    }

    // ---- page access along the path ----

    fn node_info(&self, pager: &Pager, usable: usize) -> Result<(NodeKind, usize)> {
        let (page, _) = self
            .path
            .last()
            .ok_or_else(|| Error::misuse("cursor is not positioned"))?;
        let view = NodePage::new(pager.page_data(page), page.pgno(), usable)?;
        if view.kind().tree() != self.tree {
            return Err(Error::corrupt(format!(
                "page {} does not belong to a {:?} tree",
                page.pgno(),
                self.tree
            )));
        }
        Ok((view.kind(), view.cell_count()))
    }

    fn path_cell(&self, pager: &Pager, usable: usize, i: usize) -> Result<Vec<u8>> {
        let (page, _) = self
            .path
            .last()
            .ok_or_else(|| Error::misuse("cursor is not positioned"))?;
        let view = NodePage::new(pager.page_data(page), page.pgno(), usable)?;
        Ok(view.cell(i)?.to_vec())
    }

    fn child_of_last(&self, pager: &Pager, usable: usize, i: usize) -> Result<PageNo> {
        let (page, _) = self
            .path
            .last()
            .ok_or_else(|| Error::misuse("cursor is not positioned"))?;
        NodePage::new(pager.page_data(page), page.pgno(), usable)?.child(i)
    }

    fn leaf_has_entry(&self, pager: &Pager) -> Result<bool> {
        match self.path.last() {
            None => Ok(false),
            Some((_, idx)) => {
                let (kind, count) = self.node_info(pager, pager.usable_size())?;
                Ok(kind.is_leaf() && *idx < count)
            }
        }
    }

    fn leaf_cell(&self, pager: &Pager) -> Result<(NodeKind, Vec<u8>)> {
        let usable = pager.usable_size();
        let (kind, _) = self.node_info(pager, usable)?;
        let idx = self.path.last().map_or(0, |(_, idx)| *idx);
        Ok((kind, self.path_cell(pager, usable, idx)?))
    }

    fn key_here(&self, pager: &mut Pager) -> Result<SavedKey> {
        let (kind, cell) = self.leaf_cell(pager)?;
        match self.tree {
            TreeKind::Table => Ok(SavedKey::Int(cell::parse_cell(kind, &cell, pager.usable_size())?.rowid)),
            TreeKind::Index => Ok(SavedKey::Record(cell::read_payload(pager, kind, &cell)?)),
        }
    }

    /// Whether the entry under the cursor equals `probe`.
    fn matches_here(&self, pager: &mut Pager, probe: &Probe, flags: CompareFlags) -> Result<bool> {
        let (kind, cell) = self.leaf_cell(pager)?;
        Ok(self.compare_cell(pager, kind, &cell, probe, flags)? == Ordering::Equal)
    }

    /// Order of `probe` relative to the key in `cell`.
    fn compare_cell(
        &self,
        pager: &mut Pager,
        kind: NodeKind,
        cell: &[u8],
        probe: &Probe,
        flags: CompareFlags,
    ) -> Result<Ordering> {
        match probe {
            Probe::Int(rowid) => Ok(rowid.cmp(&cell::parse_cell(kind, cell, pager.usable_size())?.rowid)),
            Probe::Record(values) => {
                let payload = cell::read_payload(pager, kind, cell)?;
                let stored = self.key_info.decode(&payload)?;
                Ok(self.key_info.compare(values, &stored, flags))
            }
        }
    }
}

impl Drop for BTreeCursor {
    fn drop(&mut self) {
        if !self.path.is_empty() {
            warn!(
                "cursor on tree {} dropped without close, {} pages stay pinned",
                self.root,
                self.path.len()
            );
        }
    }
}
