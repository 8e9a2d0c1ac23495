use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::Result;
use crate::pager::{PageNo, Pager};
use crate::record::{CompareFlags, KeyInfo, Value};

use super::balance::read_node;
use super::cell;
use super::node::{Node, NodeKind, TreeKind};
use super::overflow;
use super::BTree;

#[derive(Debug, Clone)]
enum Key {
    Int(i64),
    Record(Vec<Value>),
}

fn compare(key_info: &KeyInfo, a: &Key, b: &Key) -> Ordering {
    match (a, b) {
        (Key::Int(a), Key::Int(b)) => a.cmp(b),
        (Key::Record(a), Key::Record(b)) => key_info.compare(a, b, CompareFlags::empty()),
        (Key::Int(_), Key::Record(_)) => Ordering::Less,
        (Key::Record(_), Key::Int(_)) => Ordering::Greater,
    }
}

fn cell_key(pager: &mut Pager, kind: NodeKind, cell: &[u8], key_info: &KeyInfo) -> Result<Key> {
    if kind.tree() == TreeKind::Table {
        return Ok(Key::Int(cell::parse_cell(kind, cell, pager.usable_size())?.rowid));
    }
    let payload = cell::read_payload(pager, kind, cell)?;
    Ok(Key::Record(key_info.decode(&payload)?))
}

struct Visit {
    pgno: PageNo,
    depth: usize,
    lower: Option<Key>,
    upper: Option<Key>,
}

/// Walk the whole tree and describe every inconsistency found.
pub(crate) fn check(tree: &BTree, pager: &mut Pager) -> Result<Vec<String>> {
    let usable = pager.usable_size();
    let page_count = pager.page_count();
    let mut problems = Vec::new();
    let mut seen: HashSet<PageNo> = HashSet::new();
    let mut leaf_depth = None;
    let mut stack = vec![Visit {
        pgno: tree.root,
        depth: 0,
        lower: None,
        upper: None,
    }];

    while let Some(visit) = stack.pop() {
        let pgno = visit.pgno;
        if pgno < 2 || pgno > page_count {
            problems.push(format!("page {pgno}: out of range"));
            continue;
        }
        if !seen.insert(pgno) {
            problems.push(format!("page {pgno}: referenced more than once"));
            continue;
        }
        let node: Node = match read_node(pager, pgno) {
            Ok(node) => node,
            Err(e) => {
                problems.push(format!("page {pgno}: {e}"));
                continue;
            }
        };
        if node.kind.tree() != tree.kind {
            problems.push(format!("page {pgno}: {:?} node in a {:?} tree", node.kind, tree.kind));
            continue;
        }
        if pgno != tree.root && node.cells.is_empty() && !node.is_leaf() {
            problems.push(format!("page {pgno}: interior node without cells"));
        }

        let mut keys = Vec::with_capacity(node.cells.len());
        for (i, cell_bytes) in node.cells.iter().enumerate() {
            match cell_key(pager, node.kind, cell_bytes, &tree.key_info) {
                Ok(key) => keys.push(key),
                Err(e) => problems.push(format!("page {pgno} cell {i}: {e}")),
            }
            let info = match cell::parse_cell(node.kind, cell_bytes, usable) {
                Ok(info) => info,
                Err(_) => continue,
            };
            if info.overflow != 0 {
                match overflow::chain_pages(pager, info.overflow, info.overflow_len()) {
                    Ok(chain) => {
                        for page in chain {
                            if !seen.insert(page) {
                                problems.push(format!("page {page}: overflow page referenced more than once"));
                            }
                        }
                    }
                    Err(e) => problems.push(format!("page {pgno} cell {i}: {e}")),
                }
            }
        }
        if keys.len() != node.cells.len() {
            continue;
        }

        for (i, pair) in keys.windows(2).enumerate() {
            if compare(&tree.key_info, &pair[0], &pair[1]) != Ordering::Less {
                problems.push(format!("page {pgno}: keys {i} and {} out of order", i + 1));
            }
        }
        for (i, key) in keys.iter().enumerate() {
            if let Some(lower) = &visit.lower {
                if compare(&tree.key_info, key, lower) != Ordering::Greater {
                    problems.push(format!("page {pgno} cell {i}: key not above its parent separator"));
                }
            }
            if let Some(upper) = &visit.upper {
                if compare(&tree.key_info, key, upper) == Ordering::Greater {
                    problems.push(format!("page {pgno} cell {i}: key above its parent separator"));
                }
            }
        }

        if node.is_leaf() {
            match leaf_depth {
                None => leaf_depth = Some(visit.depth),
                Some(depth) if depth != visit.depth => {
                    problems.push(format!("page {pgno}: leaf at depth {} instead of {depth}", visit.depth));
                }
                Some(_) => {}
            }
            continue;
        }
        for i in 0..=node.cells.len() {
            let lower = if i == 0 {
                visit.lower.clone()
            } else {
                Some(keys[i - 1].clone())
            };
            let upper = if i < keys.len() {
                Some(keys[i].clone())
            } else {
                visit.upper.clone()
            };
            stack.push(Visit {
                pgno: node.child(i),
                depth: visit.depth + 1,
                lower,
                upper,
            });
        }
    }

    match pager.freelist_pages() {
        Ok(free) => {
            for pgno in free {
                if seen.contains(&pgno) {
                    problems.push(format!("page {pgno}: in use and on the freelist"));
                }
            }
        }
        Err(e) => problems.push(format!("freelist: {e}")),
    }
    Ok(problems)
}
