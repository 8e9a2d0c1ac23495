use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use super::PageNo;

pub trait Replacer: Send + Debug {
    /// Mark a page as pinned (not evictable).
    fn pin(&mut self, pgno: PageNo);

    /// Mark a page as unpinned (evictable).
    fn unpin(&mut self, pgno: PageNo);

    /// Evictable pages, least recently unpinned first.
    fn candidates(&self) -> Vec<PageNo>;

    /// Get the number of evictable pages.
    fn size(&self) -> usize;
}

/// Orders unpinned pages by the time they were last unpinned.
#[derive(Debug, Default)]
pub struct LruReplacer {
    /// Unpin tick -> page
    order: BTreeMap<u64, PageNo>,
    /// Page -> its tick in `order`
    ticks: HashMap<PageNo, u64>,
    clock: u64,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Replacer for LruReplacer {
    fn pin(&mut self, pgno: PageNo) {
        if let Some(tick) = self.ticks.remove(&pgno) {
            self.order.remove(&tick);
        }
    }

    fn unpin(&mut self, pgno: PageNo) {
        if self.ticks.contains_key(&pgno) {
            return;
        }
        self.clock += 1;
        self.order.insert(self.clock, pgno);
        self.ticks.insert(pgno, self.clock);
    }

    fn candidates(&self) -> Vec<PageNo> {
        self.order.values().copied().collect()
    }

    fn size(&self) -> usize {
        self.order.len()
    }
}
