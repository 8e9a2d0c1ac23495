//! Keeping nodes within their page after an insert or delete.
//!
//! Work moves bottom-up over the `(page, child index)` path recorded while
//! descending: a node that overflows is split into its parent, an underfull
//! node is merged with or borrows from a sibling, and the parent is then
//! looked at in turn. The root keeps its page number: it grows a level by
//! moving its content into a new child and shrinks one by absorbing its
//! only child.

use std::ops::Range;

use log::debug;

use crate::buffer::{Pointer, PointerMut};
use crate::error::{Error, Result};
use crate::pager::{PageNo, Pager};

use super::cell;
use super::node::{Node, NodeKind, TreeKind};

pub(crate) fn read_node(pager: &mut Pager, pgno: PageNo) -> Result<Node> {
    let usable = pager.usable_size();
    pager.with_page(pgno, false, |pager, page| Node::parse(pager.page_data(page), pgno, usable))
}

pub(crate) fn write_node(pager: &mut Pager, pgno: PageNo, node: &Node) -> Result<()> {
    let usable = pager.usable_size();
    pager.with_page(pgno, false, |pager, page| {
        node.write(pager.write_page(page)?, usable);
        Ok(())
    })
}

fn allocate_node_page(pager: &mut Pager) -> Result<PageNo> {
    let page = pager.allocate_page()?;
    let pgno = page.pgno();
    pager.release_page(page);
    Ok(pgno)
}

pub(crate) fn free_page_no(pager: &mut Pager, pgno: PageNo) -> Result<()> {
    let page = pager.acquire_page(pgno, false)?;
    pager.free_page(page)
}

/// Store `node` at `pgno` and restore the size invariants from there up to
/// the root. `path` holds the ancestors of `pgno`, root first, each with
/// the index of the child that was followed.
pub(crate) fn rebalance(
    pager: &mut Pager,
    root: PageNo,
    mut path: Vec<(PageNo, usize)>,
    mut pgno: PageNo,
    mut node: Node,
) -> Result<()> {
    let usable = pager.usable_size();
    let mut modified = true;
    loop {
        if pgno == root {
            if !node.fits(usable) {
                let child = allocate_node_page(pager)?;
                let mut new_root = Node::empty(NodeKind::interior(node.kind.tree()));
                new_root.right_child = child;
                write_node(pager, root, &new_root)?;
                debug!("root {} grew a level, content moved to page {}", root, child);
                path = vec![(root, 0)];
                pgno = child;
                continue;
            }
            if !node.is_leaf() && node.cells.is_empty() {
                let child = node.right_child;
                node = read_node(pager, child)?;
                free_page_no(pager, child)?;
                debug!("root {} absorbed its only child {}", root, child);
                modified = true;
                continue;
            }
            if modified {
                write_node(pager, root, &node)?;
            }
            return Ok(());
        }

        let (parent_pgno, child_idx) = *path
            .last()
            .ok_or_else(|| Error::corrupt(format!("page {pgno} has no parent on the path")))?;

        if !node.fits(usable) {
            node = split(pager, pgno, node, parent_pgno, child_idx)?;
        } else if node.is_underfull(usable) {
            match fix_underfull(pager, pgno, node, parent_pgno, child_idx)? {
                Fixed::Parent(parent) => node = parent,
                Fixed::Alone(alone) => {
                    if modified {
                        write_node(pager, pgno, &alone)?;
                    }
                    node = read_node(pager, parent_pgno)?;
                    modified = false;
                    path.pop();
                    pgno = parent_pgno;
                    continue;
                }
            }
        } else {
            if modified {
                write_node(pager, pgno, &node)?;
            }
            return Ok(());
        }
        modified = true;
        path.pop();
        pgno = parent_pgno;
    }
}

/// Split an overflowing node into as many pages as it needs and return
/// the parent with the new separators in place (not yet written).
fn split(pager: &mut Pager, pgno: PageNo, node: Node, parent_pgno: PageNo, child_idx: usize) -> Result<Node> {
    let usable = pager.usable_size();
    let mut parent = read_node(pager, parent_pgno)?;
    let Node {
        kind,
        mut cells,
        right_child,
    } = node;
    let leaf = kind.is_leaf();
    let sizes: Vec<usize> = cells.iter().map(|c| c.len() + 2).collect();
    let groups = partition(&sizes, usable - kind.header_size(), !leaf);

    let mut pages = vec![pgno];
    for _ in 1..groups.len() {
        pages.push(allocate_node_page(pager)?);
    }

    let mut separators = Vec::with_capacity(groups.len() - 1);
    for (g, range) in groups.iter().enumerate() {
        let last = g + 1 == groups.len();
        let mut part = Node::empty(kind);
        part.cells = cells[range.clone()].iter_mut().map(std::mem::take).collect();
        if leaf {
            if !last {
                let key_cell = part
                    .cells
                    .last()
                    .ok_or_else(|| Error::corrupt("split produced an empty leaf"))?;
                separators.push(cell::separator_from_leaf(pager, kind, key_cell, pages[g])?);
            }
        } else if last {
            part.right_child = right_child;
        } else {
            let mut promoted = std::mem::take(&mut cells[range.end]);
            part.right_child = Pointer::new(&promoted).get_u32(0);
            PointerMut::new(&mut promoted).put_u32(0, pages[g]);
            separators.push(promoted);
        }
        write_node(pager, pages[g], &part)?;
    }

    let k = pages.len();
    parent.cells.splice(child_idx..child_idx, separators);
    parent.set_child(child_idx + k - 1, pages[k - 1]);
    debug!("split page {} into {:?}", pgno, pages);
    Ok(parent)
}

/// Cut `sizes` into consecutive groups that each fit `capacity`. With
/// `promote`, the entry after every group but the last is left out; it
/// becomes the separator above the group.
fn partition(sizes: &[usize], capacity: usize, promote: bool) -> Vec<Range<usize>> {
    let greedy = pack(sizes, capacity, promote, None).unwrap_or_else(|| vec![0..sizes.len()]);
    match pack(sizes, capacity, promote, Some(greedy.len())) {
        Some(balanced) if balanced.len() == greedy.len() => balanced,
        _ => greedy,
    }
}

/// Greedy packing. With `groups`, each group stops once it holds its share
/// of what is left.
fn pack(sizes: &[usize], capacity: usize, promote: bool, groups: Option<usize>) -> Option<Vec<Range<usize>>> {
    let n = sizes.len();
    let mut out = Vec::new();
    let mut i = 0;
    while i < n {
        let target = match groups {
            Some(k) if k > out.len() + 1 => sizes[i..].iter().sum::<usize>() / (k - out.len()),
            _ => usize::MAX,
        };
        let start = i;
        let mut used = 0;
        while i < n && used + sizes[i] <= capacity && (used < target || i == start) {
            used += sizes[i];
            i += 1;
        }
        if i == start {
            return None;
        }
        // Promoting the only entry left would leave the last group empty.
        if promote && i + 1 == n && i - start >= 2 {
            i -= 1;
        }
        out.push(start..i);
        if promote && i < n {
            i += 1;
            if i == n {
                out.push(n..n);
            }
        }
    }
    Some(out)
}

enum Fixed {
    /// Sibling pages were rewritten; this is the updated parent.
    Parent(Node),
    /// Nothing to pair with; the node comes back unchanged.
    Alone(Node),
}

/// Merge an underfull node with a sibling, or even out the two when the
/// merge would not fit.
fn fix_underfull(pager: &mut Pager, pgno: PageNo, node: Node, parent_pgno: PageNo, child_idx: usize) -> Result<Fixed> {
    let usable = pager.usable_size();
    let mut parent = read_node(pager, parent_pgno)?;
    if parent.cells.is_empty() {
        return Ok(Fixed::Alone(node));
    }
    let node_is_left = child_idx == 0;
    let (s, left_pgno, right_pgno) = if node_is_left {
        (0, pgno, parent.child(1))
    } else {
        (child_idx - 1, parent.child(child_idx - 1), pgno)
    };
    let (left, right) = if node_is_left {
        (node, read_node(pager, right_pgno)?)
    } else {
        (read_node(pager, left_pgno)?, node)
    };
    if left.kind != right.kind {
        return Err(Error::corrupt(format!(
            "sibling pages {left_pgno} and {right_pgno} differ in type"
        )));
    }
    let kind = left.kind;

    let mut merged = Node::empty(kind);
    merged.cells.extend(left.cells.iter().cloned());
    if !kind.is_leaf() {
        let mut pulled = parent.cells[s].clone();
        PointerMut::new(&mut pulled).put_u32(0, left.right_child);
        merged.cells.push(pulled);
    }
    merged.cells.extend(right.cells.iter().cloned());
    merged.right_child = right.right_child;

    if merged.fits(usable) {
        write_node(pager, left_pgno, &merged)?;
        free_page_no(pager, right_pgno)?;
        let separator = parent.cells.remove(s);
        if kind.is_leaf() {
            cell::free_overflow(pager, parent.kind, &separator)?;
        }
        parent.set_child(s, left_pgno);
        debug!("merged page {} into {}", right_pgno, left_pgno);
        return Ok(Fixed::Parent(parent));
    }

    // Spread the combined entries over both pages.
    let sizes: Vec<usize> = merged.cells.iter().map(|c| c.len() + 2).collect();
    let groups = match pack(&sizes, usable - kind.header_size(), !kind.is_leaf(), Some(2)) {
        Some(groups) if groups.len() == 2 => groups,
        _ => {
            let node = if node_is_left { left } else { right };
            return Ok(Fixed::Alone(node));
        }
    };
    let mut all = merged.cells;
    let mut new_left = Node::empty(kind);
    let mut new_right = Node::empty(kind);
    new_left.cells = all[groups[0].clone()].iter_mut().map(std::mem::take).collect();
    new_right.cells = all[groups[1].clone()].iter_mut().map(std::mem::take).collect();
    new_right.right_child = right.right_child;

    let separator = if kind.is_leaf() {
        let key_cell = new_left
            .cells
            .last()
            .ok_or_else(|| Error::corrupt("redistribution left a page empty"))?;
        let separator = cell::separator_from_leaf(pager, kind, key_cell, left_pgno)?;
        cell::free_overflow(pager, parent.kind, &parent.cells[s])?;
        separator
    } else {
        let mut promoted = std::mem::take(&mut all[groups[0].end]);
        new_left.right_child = Pointer::new(&promoted).get_u32(0);
        PointerMut::new(&mut promoted).put_u32(0, left_pgno);
        promoted
    };
    write_node(pager, left_pgno, &new_left)?;
    write_node(pager, right_pgno, &new_right)?;
    parent.cells[s] = separator;
    debug!("redistributed pages {} and {}", left_pgno, right_pgno);
    Ok(Fixed::Parent(parent))
}

/// Tree kind stored at `root`.
pub(crate) fn tree_kind(pager: &mut Pager, root: PageNo) -> Result<TreeKind> {
    Ok(read_node(pager, root)?.kind.tree())
}
