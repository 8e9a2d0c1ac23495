//! vibelite: an embedded single-file database storage engine.
//!
//! A [`Pager`] caches the pages of one file and makes changes atomic with
//! a rollback journal. [`BTree`]s store table rows and index records in
//! those pages. A [`Database`] puts one pager behind a per-handle mutex.

pub mod btree;
pub mod buffer;
pub mod config;
pub mod database;
pub mod error;
pub mod mutex;
pub mod pager;
pub mod record;
pub mod vfs;

pub use btree::{BTree, BTreeCursor, BTreeKey, TreeKind};
pub use config::{DatabaseConfig, JournalMode, SyncMode};
pub use database::Database;
pub use error::{Error, ErrorCode, IoErrorKind, Result};
pub use pager::{PageNo, PageRef, Pager, PagerState};
pub use record::{decode_record, encode_record, CompareFlags, KeyInfo, Value};
pub use vfs::{Vfs, VfsRegistry};
