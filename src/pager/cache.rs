//! Page cache: at most one in-memory copy per page number, with reference
//! counts and an LRU order over unreferenced pages.

use std::collections::HashMap;

use crate::buffer::Buffer;

use super::lru::{LruReplacer, Replacer};
use super::PageNo;

#[derive(Debug)]
pub struct CachedPage {
    pub data: Buffer,
    pub dirty: bool,
    pub ref_count: u32,
    /// The pre-image is in the journal for the current transaction.
    pub in_journal: bool,
}

impl CachedPage {
    pub fn new(data: Buffer) -> Self {
        Self {
            data,
            dirty: false,
            ref_count: 0,
            in_journal: false,
        }
    }
}

#[derive(Debug)]
pub struct PageCache {
    pages: HashMap<PageNo, CachedPage>,
    replacer: Box<dyn Replacer>,
    capacity: usize,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            pages: HashMap::new(),
            replacer: Box::new(LruReplacer::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_full(&self) -> bool {
        self.pages.len() >= self.capacity
    }

    pub fn get(&self, pgno: PageNo) -> Option<&CachedPage> {
        self.pages.get(&pgno)
    }

    pub fn get_mut(&mut self, pgno: PageNo) -> Option<&mut CachedPage> {
        self.pages.get_mut(&pgno)
    }

    /// Add an unreferenced page.
    pub fn insert(&mut self, pgno: PageNo, page: CachedPage) {
        debug_assert!(!self.pages.contains_key(&pgno), "page {pgno} cached twice");
        debug_assert_eq!(page.ref_count, 0);
        self.pages.insert(pgno, page);
        self.replacer.unpin(pgno);
    }

    /// Take a reference to a cached page.
    pub fn pin(&mut self, pgno: PageNo) {
        if let Some(page) = self.pages.get_mut(&pgno) {
            page.ref_count += 1;
            if page.ref_count == 1 {
                self.replacer.pin(pgno);
            }
        }
    }

    /// Drop a reference; returns the remaining count.
    pub fn unpin(&mut self, pgno: PageNo) -> u32 {
        let Some(page) = self.pages.get_mut(&pgno) else {
            return 0;
        };
        assert!(page.ref_count > 0, "page {pgno} released more often than acquired");
        page.ref_count -= 1;
        if page.ref_count == 0 {
            self.replacer.unpin(pgno);
        }
        page.ref_count
    }

    pub fn remove(&mut self, pgno: PageNo) -> Option<CachedPage> {
        self.replacer.pin(pgno);
        self.pages.remove(&pgno)
    }

    /// Unreferenced pages, least recently used first.
    pub fn eviction_candidates(&self) -> Vec<PageNo> {
        self.replacer.candidates()
    }

    /// Dirty pages in ascending page order.
    pub fn dirty_pages(&self) -> Vec<PageNo> {
        let mut dirty: Vec<PageNo> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(pgno, _)| *pgno)
            .collect();
        dirty.sort_unstable();
        dirty
    }

    pub fn has_dirty(&self) -> bool {
        self.pages.values().any(|p| p.dirty)
    }

    /// Sum of all reference counts.
    pub fn total_refs(&self) -> usize {
        self.pages.values().map(|p| p.ref_count as usize).sum()
    }

    pub fn page_numbers(&self) -> Vec<PageNo> {
        self.pages.keys().copied().collect()
    }

    /// Drop every unreferenced page; returns the referenced ones that stay.
    pub fn discard_unpinned(&mut self) -> Vec<PageNo> {
        for pgno in self.replacer.candidates() {
            self.remove(pgno);
        }
        self.page_numbers()
    }
}
