//! B-trees stored in pager pages.
//!
//! Table trees map 64-bit row ids to data; index trees hold encoded
//! records ordered by a [`KeyInfo`]. Entries live in leaves only, interior
//! nodes carry separators. Every tree is named by its root page, which
//! never moves for the life of the tree.

pub mod balance;
pub mod cell;
pub mod cursor;
mod integrity;
pub mod node;
pub mod overflow;

pub use self::cursor::{BTreeCursor, BTreeKey};
pub use self::node::TreeKind;

use log::debug;

use crate::error::{Error, Result};
use crate::pager::{PageNo, Pager};
use crate::record::KeyInfo;

use self::balance::{free_page_no, read_node, write_node};
use self::node::{Node, NodeKind};

#[derive(Debug, Clone)]
pub struct BTree {
    root: PageNo,
    kind: TreeKind,
    key_info: KeyInfo,
}

impl BTree {
    /// Allocate an empty tree and return its root page. Needs a write
    /// transaction.
    pub fn create(pager: &mut Pager, kind: TreeKind) -> Result<PageNo> {
        let page = pager.allocate_page()?;
        let pgno = page.pgno();
        let usable = pager.usable_size();
        let written = pager
            .write_page(&page)
            .map(|data| Node::empty(NodeKind::leaf(kind)).write(data, usable));
        pager.release_page(page);
        written?;
        pager.update_header(|header| header.largest_root = header.largest_root.max(pgno))?;
        debug!("created {:?} tree at page {}", kind, pgno);
        Ok(pgno)
    }

    pub fn table(root: PageNo) -> Self {
        BTree {
            root,
            kind: TreeKind::Table,
            key_info: KeyInfo::default(),
        }
    }

    pub fn index(root: PageNo, key_info: KeyInfo) -> Self {
        BTree {
            root,
            kind: TreeKind::Index,
            key_info,
        }
    }

    /// Open the tree at `root`, taking its kind from the root page. Index
    /// trees get the default key order.
    pub fn open(pager: &mut Pager, root: PageNo) -> Result<Self> {
        if root < 2 {
            return Err(Error::misuse(format!("page {root} cannot be a tree root")));
        }
        Ok(match balance::tree_kind(pager, root)? {
            TreeKind::Table => BTree::table(root),
            TreeKind::Index => BTree::index(root, KeyInfo::default()),
        })
    }

    pub fn root(&self) -> PageNo {
        self.root
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    pub fn key_info(&self) -> &KeyInfo {
        &self.key_info
    }

    pub fn cursor(&self) -> BTreeCursor {
        BTreeCursor::new(self.root, self.kind, self.key_info.clone())
    }

    /// Levels from the root to the leaves; 1 for a lone leaf.
    pub fn depth(&self, pager: &mut Pager) -> Result<usize> {
        let mut depth = 1;
        let mut node = read_node(pager, self.root)?;
        while !node.is_leaf() {
            depth += 1;
            if depth > pager.page_count() as usize {
                return Err(Error::corrupt(format!("tree at page {} has a cycle", self.root)));
            }
            node = read_node(pager, node.child(0))?;
        }
        Ok(depth)
    }

    /// Remove every entry. The root stays, as an empty leaf.
    pub fn clear(&self, pager: &mut Pager) -> Result<()> {
        let freed = self.free_below_root(pager)?;
        write_node(pager, self.root, &Node::empty(NodeKind::leaf(self.kind)))?;
        debug!("cleared tree {} ({} pages freed)", self.root, freed);
        Ok(())
    }

    /// Free the tree's pages, root included.
    pub fn drop_tree(self, pager: &mut Pager) -> Result<()> {
        self.free_below_root(pager)?;
        free_page_no(pager, self.root)?;
        debug!("dropped tree {}", self.root);
        Ok(())
    }

    fn free_below_root(&self, pager: &mut Pager) -> Result<usize> {
        if !pager.state().is_writing() {
            return Err(Error::misuse("tree changed outside a write transaction"));
        }
        let mut freed = 0;
        let mut stack = vec![self.root];
        while let Some(pgno) = stack.pop() {
            let node = read_node(pager, pgno)?;
            for cell_bytes in &node.cells {
                cell::free_overflow(pager, node.kind, cell_bytes)?;
            }
            if !node.is_leaf() {
                stack.extend((0..=node.cells.len()).map(|i| node.child(i)));
            }
            if pgno != self.root {
                free_page_no(pager, pgno)?;
                freed += 1;
            }
        }
        Ok(freed)
    }

    /// Verify ordering, balance, page ownership and overflow chains.
    /// Returns one line per problem; an empty list means the tree is sound.
    pub fn check_integrity(&self, pager: &mut Pager) -> Result<Vec<String>> {
        integrity::check(self, pager)
    }
}
