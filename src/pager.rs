//! Page cache and rollback-journal transactions over one database file.
//!
//! The pager hands out reference-counted pages, tracks the lock held on
//! the database file and guarantees that a crash at any point leaves the
//! file recoverable: no page is written to the database before its
//! original image is in the journal and the journal has been synced.
//!
//! Lock states move `Unlocked -> SharedRead -> ReservedWrite ->
//! ExclusiveWrite` and back down when a transaction ends.

pub mod busy;
pub mod cache;
pub mod freelist;
pub mod header;
pub mod journal;
pub mod lru;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::buffer::Buffer;
use crate::config::{is_valid_page_size, DatabaseConfig, JournalMode, SyncMode, DEFAULT_CACHE_SIZE};
use crate::error::{Error, Result};
use crate::vfs::{File, FileType, LockLevel, OpenFlags, Vfs, VfsRegistry};
use busy::BusyHandler;
use cache::{CachedPage, PageCache};
use header::{DatabaseHeader, HEADER_SIZE};
use journal::{JournalHeader, COUNT_TO_EOF, SECTOR_SIZE};

/// 1-based page number.
pub type PageNo = u32;

const MIN_CACHE_SIZE: usize = 10;

static NEXT_PAGER_ID: AtomicU64 = AtomicU64::new(1);

/// A pinned page. Every reference must be handed back exactly once with
/// [`Pager::release_page`].
#[must_use = "acquired pages must be released with Pager::release_page"]
#[derive(Debug)]
pub struct PageRef {
    pgno: PageNo,
    owner: u64,
}

impl PageRef {
    pub fn pgno(&self) -> PageNo {
        self.pgno
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerState {
    Unlocked,
    SharedRead,
    ReservedWrite,
    ExclusiveWrite,
}

impl PagerState {
    pub fn is_writing(self) -> bool {
        matches!(self, PagerState::ReservedWrite | PagerState::ExclusiveWrite)
    }
}

enum Replay {
    Applied { original_pages: u32, records: u32 },
    Invalid(&'static str),
}

pub struct Pager {
    id: u64,
    vfs: Arc<Vfs>,
    db_file: File,
    journal_path: Option<PathBuf>,
    journal: Option<File>,
    journal_mode: JournalMode,
    sync_mode: SyncMode,
    max_page_count: u32,
    fixed_cache_size: bool,
    read_only: bool,
    page_size: usize,
    state: PagerState,
    cache: PageCache,
    /// Outstanding page references.
    outstanding: usize,
    /// Pages in the database, including ones added by the open transaction.
    db_size: u32,
    /// Page count when the write transaction began.
    original_size: u32,
    nonce: u32,
    journal_records: u32,
    synced_records: u32,
    journaled: HashSet<PageNo>,
    /// Something was written to the database file in this transaction.
    db_modified: bool,
    counter_bumped: bool,
    explicit_read: bool,
    cached_change_counter: Option<u32>,
    busy: Box<dyn BusyHandler>,
    change_seq: u64,
    #[cfg(test)]
    abandoned: bool,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("file", &self.db_file.path())
            .field("state", &self.state)
            .field("page_size", &self.page_size)
            .field("db_size", &self.db_size)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl Pager {
    /// Open the database at `path`, or a private temporary database when
    /// `path` is `None`.
    ///
    /// The header is validated (and a hot journal rolled back) before this
    /// returns.
    pub fn open(registry: &VfsRegistry, path: Option<&Path>, config: &DatabaseConfig) -> Result<Pager> {
        config.validate()?;
        let vfs = registry.find(config.vfs.as_deref())?;

        let (db_file, journal_path, read_only) = match path {
            Some(path) => {
                let mut flags = if config.read_only {
                    OpenFlags::READONLY
                } else {
                    OpenFlags::READWRITE
                };
                if config.create {
                    flags |= OpenFlags::CREATE;
                }
                let (file, used) = vfs.open(Some(path), FileType::MainDb, flags)?;
                let read_only = used.contains(OpenFlags::READONLY);
                if read_only && !config.read_only {
                    warn!("{} opened read-only", path.display());
                }
                let db_path = file.path().unwrap_or(path).to_path_buf();
                (file, Some(journal_path_for(&db_path)), read_only)
            }
            None => {
                let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETE_ON_CLOSE;
                let (file, _) = vfs.open(None, FileType::TempDb, flags)?;
                (file, None, false)
            }
        };

        let capacity = config.cache_size.unwrap_or(DEFAULT_CACHE_SIZE).max(MIN_CACHE_SIZE);
        let mut pager = Pager {
            id: NEXT_PAGER_ID.fetch_add(1, Ordering::Relaxed),
            vfs,
            db_file,
            journal_path,
            journal: None,
            journal_mode: config.journal_mode,
            sync_mode: config.sync_mode,
            max_page_count: config.max_page_count,
            fixed_cache_size: config.cache_size.is_some(),
            read_only,
            page_size: config.page_size,
            state: PagerState::Unlocked,
            cache: PageCache::new(capacity),
            outstanding: 0,
            db_size: 0,
            original_size: 0,
            nonce: 0,
            journal_records: 0,
            synced_records: 0,
            journaled: HashSet::new(),
            db_modified: false,
            counter_bumped: false,
            explicit_read: false,
            cached_change_counter: None,
            busy: busy::for_timeout(config.busy_timeout),
            change_seq: 0,
            #[cfg(test)]
            abandoned: false,
        };

        pager.begin_read()?;
        pager.end_read()?;
        debug!("opened {:?}", pager);
        Ok(pager)
    }

    pub fn set_busy_handler(&mut self, handler: Box<dyn BusyHandler>) {
        self.busy = handler;
    }

    pub fn state(&self) -> PagerState {
        self.state
    }

    pub fn lock_level(&self) -> LockLevel {
        self.db_file.lock_level()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes per page available to the B-tree layer.
    pub fn usable_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages, as of the current lock.
    pub fn page_count(&self) -> u32 {
        self.db_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_file.path()
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    pub fn journal_mode(&self) -> JournalMode {
        self.journal_mode
    }

    /// Increases whenever page content may have changed. Cursors compare it
    /// to decide whether their position is still trustworthy.
    pub fn change_seq(&self) -> u64 {
        self.change_seq
    }

    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    pub fn ref_count(&self, pgno: PageNo) -> u32 {
        self.cache.get(pgno).map_or(0, |p| p.ref_count)
    }

    // ---- page access ----

    /// Pin page `pgno`, reading it if needed. Pages past the end of the
    /// database are `Corrupt` unless `allow_create`, in which case a zeroed
    /// page is returned.
    pub fn acquire_page(&mut self, pgno: PageNo, allow_create: bool) -> Result<PageRef> {
        if pgno == 0 {
            return Err(Error::corrupt("reference to page 0"));
        }
        if self.state == PagerState::Unlocked {
            self.lock_shared()?;
        }
        let result = self.load_page(pgno, allow_create);
        if result.is_err() {
            self.release_if_idle();
        }
        result
    }

    fn load_page(&mut self, pgno: PageNo, allow_create: bool) -> Result<PageRef> {
        if self.cache.get(pgno).is_none() {
            if pgno > self.db_size && !allow_create {
                return Err(Error::corrupt(format!(
                    "page {pgno} is past the end of the database ({} pages)",
                    self.db_size
                )));
            }
            if pgno > self.max_page_count {
                return Err(Error::Full);
            }
            self.make_room()?;
            let mut data = Buffer::new(self.page_size);
            if pgno <= self.db_size {
                let offset = self.page_offset(pgno);
                data.read_from(&mut self.db_file, offset)?;
            }
            let mut page = CachedPage::new(data);
            page.in_journal = self.journaled.contains(&pgno);
            self.cache.insert(pgno, page);
        }
        self.cache.pin(pgno);
        self.outstanding += 1;
        Ok(PageRef {
            pgno,
            owner: self.id,
        })
    }

    /// Hand a page back. The last release outside an explicit transaction
    /// drops the file lock.
    pub fn release_page(&mut self, page: PageRef) {
        self.check_owner(&page);
        let remaining = self.cache.unpin(page.pgno);
        self.outstanding -= 1;
        if remaining == 0 && page.pgno > self.db_size {
            // Created but never written.
            if self.cache.get(page.pgno).is_some_and(|p| !p.dirty) {
                self.cache.remove(page.pgno);
            }
        }
        self.release_if_idle();
    }

    pub fn page_data(&self, page: &PageRef) -> &[u8] {
        self.check_owner(page);
        &self.pinned(page.pgno).data
    }

    pub fn is_dirty(&self, page: &PageRef) -> bool {
        self.pinned(page.pgno).dirty
    }

    /// Make a page writable in the open write transaction, journaling its
    /// original content first.
    pub fn write_page(&mut self, page: &PageRef) -> Result<&mut [u8]> {
        self.check_owner(page);
        if !self.state.is_writing() {
            return Err(Error::misuse("page written outside a write transaction"));
        }
        let pgno = page.pgno;
        let needs_journal = pgno <= self.original_size && !self.journaled.contains(&pgno);
        if needs_journal {
            let journal = self
                .journal
                .as_mut()
                .ok_or_else(|| Error::misuse("write transaction has no journal"))?;
            let cached = self
                .cache
                .get(pgno)
                .unwrap_or_else(|| panic!("page {pgno} is pinned but not cached"));
            journal::write_record(journal, self.journal_records, self.nonce, pgno, &cached.data)?;
            self.journal_records += 1;
            self.journaled.insert(pgno);
        }
        if pgno > self.db_size {
            self.db_size = pgno;
        }
        self.change_seq += 1;
        let cached = self.pinned_mut(pgno);
        cached.in_journal = needs_journal || cached.in_journal;
        cached.dirty = true;
        Ok(&mut cached.data[..])
    }

    /// Run `f` with page `pgno` pinned, releasing it afterwards whatever
    /// the outcome.
    pub fn with_page<T>(
        &mut self,
        pgno: PageNo,
        allow_create: bool,
        f: impl FnOnce(&mut Pager, &PageRef) -> Result<T>,
    ) -> Result<T> {
        let page = self.acquire_page(pgno, allow_create)?;
        let result = f(self, &page);
        self.release_page(page);
        result
    }

    // ---- transactions ----

    /// Hold SHARED until [`Pager::end_read`], so that every page read in
    /// between sees one snapshot.
    pub fn begin_read(&mut self) -> Result<()> {
        if self.explicit_read {
            return Err(Error::misuse("read transaction already open"));
        }
        if self.state == PagerState::Unlocked {
            self.lock_shared()?;
        }
        self.explicit_read = true;
        Ok(())
    }

    pub fn end_read(&mut self) -> Result<()> {
        self.explicit_read = false;
        self.release_if_idle();
        Ok(())
    }

    pub fn in_read_transaction(&self) -> bool {
        self.explicit_read
    }

    pub fn begin_write(&mut self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if self.state.is_writing() {
            return Err(Error::misuse("write transaction already open"));
        }
        if self.state == PagerState::Unlocked {
            self.lock_shared()?;
        }
        if let Err(e) = self.wait_for_lock(LockLevel::Reserved) {
            self.release_if_idle();
            return Err(e);
        }
        self.state = PagerState::ReservedWrite;
        self.original_size = self.db_size;
        self.db_modified = false;

        if let Err(e) = self.open_journal() {
            self.journal = None;
            self.step_down();
            return Err(e);
        }
        debug!("write transaction started ({} pages)", self.original_size);

        if self.db_size == 0 {
            let page_size = self.page_size;
            let init = self.with_page(1, true, |pager, page| {
                DatabaseHeader::new(page_size).write(pager.write_page(page)?);
                Ok(())
            });
            if let Err(e) = init {
                if let Err(rollback_err) = self.rollback() {
                    warn!("rollback after failed header write also failed: {}", rollback_err);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn open_journal(&mut self) -> Result<()> {
        let mut journal = match &self.journal_path {
            Some(path) if self.journal_mode != JournalMode::Memory => {
                let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
                let (mut file, _) = self.vfs.open(Some(path), FileType::MainJournal, flags)?;
                file.truncate(0)?;
                file
            }
            _ => File::memory(),
        };
        self.nonce = rand::random();
        let count = if journal.is_memory() || self.sync_mode == SyncMode::Off {
            COUNT_TO_EOF
        } else {
            0
        };
        let header = JournalHeader::new(self.nonce, self.original_size, self.page_size, count);
        header.encode().write_to(&mut journal, 0)?;
        self.journal_records = 0;
        self.synced_records = 0;
        self.journaled.clear();
        self.journal = Some(journal);
        Ok(())
    }

    /// Both commit phases.
    pub fn commit(&mut self) -> Result<()> {
        self.commit_phase_one()?;
        self.commit_phase_two()
    }

    /// Update the header, make the journal durable and take EXCLUSIVE.
    /// On `Busy` the transaction stays open and the commit may be retried.
    pub fn commit_phase_one(&mut self) -> Result<()> {
        if !self.state.is_writing() {
            return Err(Error::misuse("commit without a write transaction"));
        }
        if !self.cache.has_dirty() && !self.db_modified {
            return Ok(());
        }
        if !self.counter_bumped {
            self.bump_change_counter()?;
            self.counter_bumped = true;
        }
        self.sync_journal()?;
        if self.state != PagerState::ExclusiveWrite {
            self.wait_for_lock(LockLevel::Exclusive)?;
            self.state = PagerState::ExclusiveWrite;
        }
        Ok(())
    }

    /// Write dirty pages, sync the database and retire the journal. Any
    /// failure rolls the transaction back before the error is returned.
    pub fn commit_phase_two(&mut self) -> Result<()> {
        if !self.state.is_writing() {
            return Err(Error::misuse("commit without a write transaction"));
        }
        let has_changes = self.cache.has_dirty() || self.db_modified;
        if has_changes && self.state != PagerState::ExclusiveWrite {
            return Err(Error::misuse("commit phase two before phase one"));
        }
        if has_changes {
            if let Err(e) = self.write_back() {
                warn!("commit failed, rolling back: {}", e);
                if let Err(rollback_err) = self.rollback() {
                    warn!("rollback after failed commit also failed: {}", rollback_err);
                }
                return Err(e);
            }
        }
        if let Err(e) = self.finalize_journal() {
            // The journal is still on disk and will be treated as hot.
            warn!("could not finalize journal: {}", e);
            self.invalidate_cache();
            self.end_write_transaction();
            return Err(e);
        }
        self.end_write_transaction();
        debug!("committed ({} pages)", self.db_size);
        Ok(())
    }

    fn write_back(&mut self) -> Result<()> {
        self.db_modified = true;
        for pgno in self.cache.dirty_pages() {
            self.write_to_file(pgno)?;
        }
        let size = self.db_size as u64 * self.page_size as u64;
        if self.db_file.file_size()? != size {
            self.db_file.truncate(size)?;
        }
        if self.sync_mode != SyncMode::Off {
            self.db_file.sync(true)?;
        }
        self.cached_change_counter = self
            .cache
            .get(1)
            .map(|page| header::peek_change_counter(&page.data));
        Ok(())
    }

    fn write_to_file(&mut self, pgno: PageNo) -> Result<()> {
        let offset = self.page_offset(pgno);
        let page = self
            .cache
            .get_mut(pgno)
            .unwrap_or_else(|| panic!("dirty page {pgno} is not cached"));
        page.data.write_to(&mut self.db_file, offset)?;
        page.dirty = false;
        Ok(())
    }

    /// Undo the open write transaction. Pinned pages keep their identity
    /// and show their pre-transaction content afterwards.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.state.is_writing() {
            return Ok(());
        }
        let result = self.restore_original();
        if let Err(e) = self.finalize_journal() {
            warn!("could not finalize journal after rollback: {}", e);
        }
        if result.is_err() {
            self.invalidate_cache();
        }
        self.end_write_transaction();
        debug!("rolled back to {} pages", self.db_size);
        result
    }

    fn restore_original(&mut self) -> Result<()> {
        self.change_seq += 1;
        if let Some(mut journal) = self.journal.take() {
            let count = self.journal_records;
            let replayed = self.apply_journal(&mut journal, self.nonce, count, self.original_size, self.db_modified);
            self.journal = Some(journal);
            let applied = replayed?;
            if applied != count {
                return Err(Error::corrupt(format!(
                    "journal holds {applied} of {count} records"
                )));
            }
        }

        for pgno in self.cache.page_numbers() {
            if pgno > self.original_size {
                let pinned = self.cache.get(pgno).is_some_and(|p| p.ref_count > 0);
                if pinned {
                    let page = self.pinned_mut(pgno);
                    page.data.fill(0);
                    page.dirty = false;
                } else {
                    self.cache.remove(pgno);
                }
            } else if let Some(page) = self.cache.get_mut(pgno) {
                page.dirty = false;
            }
        }

        self.db_size = self.original_size;
        if self.db_modified {
            self.db_file
                .truncate(self.original_size as u64 * self.page_size as u64)?;
            if self.sync_mode != SyncMode::Off {
                self.db_file.sync(true)?;
            }
        }
        Ok(())
    }

    /// Copy `count` journal records back into cached pages, and into the
    /// database file when `to_file`. Returns how many records were intact.
    fn apply_journal(
        &mut self,
        journal: &mut File,
        nonce: u32,
        count: u32,
        original_pages: u32,
        to_file: bool,
    ) -> Result<u32> {
        let mut applied = 0;
        for index in 0..count {
            let Some(record) = journal::read_record(journal, index, nonce, self.page_size)? else {
                break;
            };
            applied += 1;
            if record.pgno > original_pages {
                continue;
            }
            if to_file {
                let offset = self.page_offset(record.pgno);
                record.data.write_to(&mut self.db_file, offset)?;
            }
            if let Some(page) = self.cache.get_mut(record.pgno) {
                page.data.copy_from(&record.data);
                page.dirty = false;
                page.in_journal = false;
            }
        }
        Ok(applied)
    }

    fn finalize_journal(&mut self) -> Result<()> {
        let Some(mut journal) = self.journal.take() else {
            return Ok(());
        };
        if journal.is_memory() {
            return Ok(());
        }
        match self.journal_mode {
            JournalMode::Delete | JournalMode::Memory => {
                journal.close()?;
                if let Some(path) = &self.journal_path {
                    self.vfs.delete(path)?;
                }
            }
            JournalMode::Truncate => {
                journal.truncate(0)?;
                if self.sync_mode == SyncMode::Full {
                    journal.sync(true)?;
                }
                journal.close()?;
            }
            JournalMode::Persist => {
                journal.write(&journal::zeroed_header(), 0)?;
                if self.sync_mode != SyncMode::Off {
                    journal.sync(false)?;
                }
                journal.close()?;
            }
        }
        debug!("journal finalized ({:?})", self.journal_mode);
        Ok(())
    }

    fn end_write_transaction(&mut self) {
        self.journal = None;
        self.journaled.clear();
        self.journal_records = 0;
        self.synced_records = 0;
        self.db_modified = false;
        self.counter_bumped = false;
        for pgno in self.cache.page_numbers() {
            if let Some(page) = self.cache.get_mut(pgno) {
                page.in_journal = false;
            }
        }
        self.step_down();
    }

    /// Leave the write lock, keeping SHARED only while still needed.
    fn step_down(&mut self) {
        let keep_shared = self.explicit_read || self.outstanding > 0;
        let target = if keep_shared {
            LockLevel::Shared
        } else {
            LockLevel::None
        };
        if let Err(e) = self.db_file.unlock(target) {
            warn!("unlock failed: {}", e);
        }
        self.state = if keep_shared {
            PagerState::SharedRead
        } else {
            PagerState::Unlocked
        };
    }

    fn bump_change_counter(&mut self) -> Result<()> {
        let page_count = self.db_size;
        self.with_page(1, false, |pager, page| {
            let data = pager.write_page(page)?;
            let mut header = DatabaseHeader::parse(data)?;
            header.change_counter = header.change_counter.wrapping_add(1);
            header.page_count = page_count;
            header.version_valid_for = header.change_counter;
            header.write(data);
            Ok(())
        })
    }

    /// Make every journal record written so far durable.
    fn sync_journal(&mut self) -> Result<()> {
        if self.synced_records == self.journal_records {
            return Ok(());
        }
        let Some(journal) = self.journal.as_mut() else {
            return Ok(());
        };
        if !journal.is_memory() && self.sync_mode != SyncMode::Off {
            if self.sync_mode == SyncMode::Full {
                journal.sync(false)?;
            }
            let (offset, bytes) = JournalHeader::record_count_field(self.journal_records);
            journal.write(&bytes, offset)?;
            journal.sync(self.sync_mode == SyncMode::Full)?;
        }
        self.synced_records = self.journal_records;
        Ok(())
    }

    // ---- header ----

    pub fn header(&mut self) -> Result<DatabaseHeader> {
        if self.state == PagerState::Unlocked {
            self.lock_shared()?;
        }
        let result = if self.db_size == 0 {
            Ok(DatabaseHeader::new(self.page_size))
        } else {
            self.with_page(1, false, |pager, page| DatabaseHeader::parse(pager.page_data(page)))
        };
        self.release_if_idle();
        result
    }

    /// Change the user-settable header fields inside a write transaction.
    /// Fields the pager maintains itself are left untouched.
    pub fn update_header(&mut self, f: impl FnOnce(&mut DatabaseHeader)) -> Result<()> {
        if !self.state.is_writing() {
            return Err(Error::misuse("header updated outside a write transaction"));
        }
        self.with_page(1, false, |pager, page| {
            let current = DatabaseHeader::parse(pager.page_data(page))?;
            let mut updated = current.clone();
            f(&mut updated);
            updated.page_size = current.page_size;
            updated.change_counter = current.change_counter;
            updated.page_count = current.page_count;
            updated.freelist_trunk = current.freelist_trunk;
            updated.freelist_count = current.freelist_count;
            updated.version_valid_for = current.version_valid_for;
            updated.write(pager.write_page(page)?);
            Ok(())
        })
    }

    // ---- locking and recovery ----

    fn wait_for_lock(&mut self, level: LockLevel) -> Result<()> {
        let mut attempts = 0;
        loop {
            if self.db_file.lock(level)? {
                return Ok(());
            }
            if !self.busy.on_busy(attempts) {
                debug!("giving up on {:?} lock after {} retries", level, attempts);
                return Err(Error::Busy);
            }
            attempts += 1;
        }
    }

    fn lock_shared(&mut self) -> Result<()> {
        self.wait_for_lock(LockLevel::Shared)?;
        match self.after_shared_lock() {
            Ok(()) => {
                self.state = PagerState::SharedRead;
                Ok(())
            }
            Err(e) => {
                if let Err(unlock_err) = self.db_file.unlock(LockLevel::None) {
                    warn!("unlock failed: {}", unlock_err);
                }
                Err(e)
            }
        }
    }

    fn after_shared_lock(&mut self) -> Result<()> {
        self.adopt_file_page_size()?;
        if self.has_hot_journal()? {
            self.recover_hot_journal()?;
        }
        self.refresh_from_file()
    }

    /// Existing files dictate the page size.
    fn adopt_file_page_size(&mut self) -> Result<()> {
        let mut head = [0u8; HEADER_SIZE];
        if self.db_file.read(&mut head, 0)? < HEADER_SIZE {
            return Ok(());
        }
        let Ok(header) = DatabaseHeader::parse(&head) else {
            return Ok(());
        };
        self.set_page_size(header.page_size)
    }

    fn set_page_size(&mut self, page_size: usize) -> Result<()> {
        if page_size == self.page_size {
            return Ok(());
        }
        if self.outstanding > 0 {
            return Err(Error::corrupt(format!(
                "page size changed from {} to {page_size} while pages are in use",
                self.page_size
            )));
        }
        self.cache.discard_unpinned();
        self.cached_change_counter = None;
        self.page_size = page_size;
        Ok(())
    }

    fn has_hot_journal(&mut self) -> Result<bool> {
        let Some(path) = &self.journal_path else {
            return Ok(false);
        };
        if !self.vfs.exists(path)? || self.db_file.check_reserved_lock()? {
            return Ok(false);
        }
        let (mut journal, _) = match self.vfs.open(Some(path), FileType::MainJournal, OpenFlags::READONLY) {
            Ok(opened) => opened,
            // Deleted in the meantime.
            Err(Error::CantOpen { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let mut first = [0u8; 1];
        let n = journal.read(&mut first, 0)?;
        journal.close()?;
        // Truncated and persisted journals start empty or zeroed.
        Ok(n == 1 && first[0] != 0)
    }

    fn recover_hot_journal(&mut self) -> Result<()> {
        let Some(path) = self.journal_path.clone() else {
            return Ok(());
        };
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if let Err(e) = self.wait_for_lock(LockLevel::Exclusive) {
            self.db_file.unlock(LockLevel::Shared)?;
            return Err(e);
        }
        let result = self.replay_hot_journal(&path);
        self.db_file.unlock(LockLevel::Shared)?;
        result
    }

    fn replay_hot_journal(&mut self, path: &Path) -> Result<()> {
        // Another handle may have finished recovery while we waited.
        if !self.vfs.exists(path)? {
            return Ok(());
        }
        let (mut journal, _) = self
            .vfs
            .open(Some(path), FileType::MainJournal, OpenFlags::READWRITE)?;
        let outcome = self.replay(&mut journal);
        journal.close()?;
        match outcome? {
            Replay::Applied {
                original_pages,
                records,
            } => {
                info!(
                    "rolled back hot journal {}: {} pages restored, {} pages kept",
                    path.display(),
                    records,
                    original_pages
                );
            }
            Replay::Invalid(reason) => {
                info!("ignoring invalid journal {}: {}", path.display(), reason);
            }
        }
        self.vfs.delete(path)?;
        self.invalidate_cache();
        Ok(())
    }

    fn replay(&mut self, journal: &mut File) -> Result<Replay> {
        let journal_size = journal.file_size()?;
        let mut head = Buffer::new(SECTOR_SIZE);
        if head.read_from(journal, 0)? < SECTOR_SIZE {
            return Ok(Replay::Invalid("truncated header"));
        }
        let Some(header) = JournalHeader::decode(&head) else {
            return Ok(Replay::Invalid("bad magic"));
        };
        let journal_page_size = header.page_size as usize;
        if !is_valid_page_size(journal_page_size) {
            return Ok(Replay::Invalid("bad page size"));
        }
        let file_size = self.db_file.file_size()?;
        if journal_page_size != self.page_size {
            // Only a database that never got a header can take the
            // journal's page size.
            if file_size >= HEADER_SIZE as u64 && self.has_valid_header()? {
                return Ok(Replay::Invalid("page size mismatch"));
            }
            self.set_page_size(journal_page_size)?;
        }
        let file_pages = file_size.div_ceil(self.page_size as u64);
        if header.original_page_count as u64 > file_pages {
            return Ok(Replay::Invalid("original size exceeds database size"));
        }

        let available = journal::records_in(journal_size, self.page_size);
        let count = if header.record_count == COUNT_TO_EOF {
            available
        } else {
            header.record_count.min(available)
        };
        let records = self.apply_journal(journal, header.nonce, count, header.original_page_count, true)?;
        self.db_file
            .truncate(header.original_page_count as u64 * self.page_size as u64)?;
        self.db_file.sync(true)?;
        Ok(Replay::Applied {
            original_pages: header.original_page_count,
            records,
        })
    }

    fn has_valid_header(&mut self) -> Result<bool> {
        let mut head = [0u8; HEADER_SIZE];
        self.db_file.read(&mut head, 0)?;
        Ok(DatabaseHeader::parse(&head).is_ok())
    }

    /// Validate the header and drop cached pages if another handle changed
    /// the file since we last looked.
    fn refresh_from_file(&mut self) -> Result<()> {
        let file_size = self.db_file.file_size()?;
        if file_size == 0 {
            if self.cached_change_counter.is_some() || self.cache.len() > 0 {
                self.invalidate_cache();
                self.cached_change_counter = None;
            }
            self.db_size = 0;
            return Ok(());
        }

        let mut head = [0u8; HEADER_SIZE];
        if self.db_file.read(&mut head, 0)? < HEADER_SIZE {
            return Err(Error::NotADatabase);
        }
        let header = DatabaseHeader::parse(&head)?;
        self.set_page_size(header.page_size)?;
        if file_size % self.page_size as u64 != 0 {
            return Err(Error::corrupt(format!(
                "file size {file_size} is not a multiple of the page size {}",
                self.page_size
            )));
        }
        self.db_size = (file_size / self.page_size as u64) as u32;

        if self.cached_change_counter != Some(header.change_counter) {
            if self.cached_change_counter.is_some() {
                debug!("database changed on disk, dropping cached pages");
            }
            self.invalidate_cache();
            self.reload_pinned()?;
            self.cached_change_counter = Some(header.change_counter);
        }
        if !self.fixed_cache_size && header.default_cache_size != 0 {
            let size = (header.default_cache_size.unsigned_abs() as usize).max(MIN_CACHE_SIZE);
            self.cache.set_capacity(size);
        }
        Ok(())
    }

    fn invalidate_cache(&mut self) {
        self.cache.discard_unpinned();
        self.cached_change_counter = None;
        self.change_seq += 1;
    }

    /// Re-read pinned clean pages after the file changed underneath them.
    fn reload_pinned(&mut self) -> Result<()> {
        for pgno in self.cache.page_numbers() {
            let offset = self.page_offset(pgno);
            let in_file = pgno <= self.db_size;
            let Some(page) = self.cache.get_mut(pgno) else {
                continue;
            };
            if page.dirty {
                continue;
            }
            if in_file {
                page.data.read_from(&mut self.db_file, offset)?;
            } else {
                page.data.fill(0);
            }
        }
        Ok(())
    }

    fn release_if_idle(&mut self) {
        if self.state == PagerState::SharedRead && !self.explicit_read && self.outstanding == 0 {
            if let Err(e) = self.db_file.unlock(LockLevel::None) {
                warn!("unlock failed: {}", e);
            }
            self.state = PagerState::Unlocked;
        }
    }

    // ---- cache management ----

    /// Evict one page if the cache is full. Clean pages go first; a dirty
    /// page is spilled to the database file, which needs EXCLUSIVE. When
    /// nothing can be evicted the cache grows past its bound.
    fn make_room(&mut self) -> Result<()> {
        if !self.cache.is_full() {
            return Ok(());
        }
        let candidates = self.cache.eviction_candidates();
        let clean = candidates
            .iter()
            .copied()
            .find(|pgno| self.cache.get(*pgno).is_some_and(|p| !p.dirty));
        if let Some(pgno) = clean {
            self.cache.remove(pgno);
            return Ok(());
        }
        if let Some(&pgno) = candidates.first() {
            if self.spill(pgno)? {
                self.cache.remove(pgno);
                return Ok(());
            }
        }
        debug!(
            "page cache over capacity: {} pages cached, bound {}",
            self.cache.len(),
            self.cache.capacity()
        );
        Ok(())
    }

    fn spill(&mut self, pgno: PageNo) -> Result<bool> {
        self.sync_journal()?;
        if self.state != PagerState::ExclusiveWrite {
            if !self.db_file.lock(LockLevel::Exclusive)? {
                return Ok(false);
            }
            self.state = PagerState::ExclusiveWrite;
        }
        debug!("spilling page {}", pgno);
        self.db_modified = true;
        self.write_to_file(pgno)?;
        Ok(true)
    }

    // ---- misc ----

    fn page_offset(&self, pgno: PageNo) -> u64 {
        (pgno as u64 - 1) * self.page_size as u64
    }

    fn check_owner(&self, page: &PageRef) {
        assert_eq!(page.owner, self.id, "page {} belongs to another pager", page.pgno);
    }

    fn pinned(&self, pgno: PageNo) -> &CachedPage {
        self.cache
            .get(pgno)
            .unwrap_or_else(|| panic!("page {pgno} is pinned but not cached"))
    }

    fn pinned_mut(&mut self, pgno: PageNo) -> &mut CachedPage {
        self.cache
            .get_mut(pgno)
            .unwrap_or_else(|| panic!("page {pgno} is pinned but not cached"))
    }

    /// Roll back any open write transaction and drop the file lock.
    pub fn close(mut self) -> Result<()> {
        let result = self.rollback();
        if self.outstanding > 0 {
            warn!("closing pager with {} page references held", self.outstanding);
        }
        self.explicit_read = false;
        self.db_file.unlock(LockLevel::None)?;
        self.state = PagerState::Unlocked;
        result
    }

    /// Drop the pager as a crashed process would: no rollback, no journal
    /// cleanup.
    #[cfg(test)]
    pub(crate) fn abandon(mut self) {
        self.abandoned = true;
    }

    /// Write the first `n` dirty pages without finishing the commit.
    #[cfg(test)]
    pub(crate) fn write_some_dirty_pages(&mut self, n: usize) -> Result<()> {
        assert_eq!(self.state, PagerState::ExclusiveWrite);
        self.db_modified = true;
        for pgno in self.cache.dirty_pages().into_iter().take(n) {
            self.write_to_file(pgno)?;
        }
        Ok(())
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        #[cfg(test)]
        if self.abandoned {
            return;
        }
        if self.state.is_writing() {
            warn!("pager dropped inside a write transaction, rolling back");
            if let Err(e) = self.rollback() {
                warn!("rollback on drop failed: {}", e);
            }
        }
    }
}

fn journal_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push("-journal");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            page_size: 1024,
            ..Default::default()
        }
    }

    fn open(registry: &VfsRegistry, path: &Path) -> Result<Pager> {
        Pager::open(registry, Some(path), &config())
    }

    /// Append a page filled with `byte` and commit.
    fn commit_page(pager: &mut Pager, pgno: PageNo, byte: u8) -> anyhow::Result<()> {
        pager.begin_write()?;
        pager.with_page(pgno, true, |pager, page| {
            pager.write_page(page)?.fill(byte);
            Ok(())
        })?;
        pager.commit()?;
        Ok(())
    }

    fn read_byte(pager: &mut Pager, pgno: PageNo) -> Result<u8> {
        pager.with_page(pgno, false, |pager, page| Ok(pager.page_data(page)[10]))
    }

    #[test]
    fn test_new_database_gets_header_on_first_write() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("new.db");
        let registry = VfsRegistry::default();
        let mut pager = open(&registry, &path)?;
        assert_eq!(pager.page_count(), 0);
        assert_eq!(pager.state(), PagerState::Unlocked);

        commit_page(&mut pager, 2, 0xAB)?;
        assert_eq!(pager.page_count(), 2);
        assert_eq!(std::fs::metadata(&path)?.len(), 2048);

        let header = pager.header()?;
        assert_eq!(header.page_size, 1024);
        assert_eq!(header.page_count, 2);
        assert_eq!(header.change_counter, 1);
        Ok(())
    }

    #[test]
    fn test_reopen_sees_committed_data() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("persist.db");
        {
            let mut pager = open(&VfsRegistry::default(), &path)?;
            commit_page(&mut pager, 2, 7)?;
            commit_page(&mut pager, 3, 9)?;
            pager.close()?;
        }
        // A different page size in the config does not matter for an
        // existing file.
        let cfg = DatabaseConfig {
            page_size: 4096,
            ..Default::default()
        };
        let mut pager = Pager::open(&VfsRegistry::default(), Some(&path), &cfg)?;
        assert_eq!(pager.page_size(), 1024);
        assert_eq!(read_byte(&mut pager, 2)?, 7);
        assert_eq!(read_byte(&mut pager, 3)?, 9);
        assert!(!dir.path().join("persist.db-journal").exists());
        Ok(())
    }

    #[test]
    fn test_implicit_shared_lock_follows_references() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut pager = open(&VfsRegistry::default(), &dir.path().join("refs.db"))?;
        commit_page(&mut pager, 2, 1)?;
        assert_eq!(pager.lock_level(), LockLevel::None);

        let a = pager.acquire_page(2, false)?;
        let b = pager.acquire_page(2, false)?;
        assert_eq!(pager.lock_level(), LockLevel::Shared);
        assert_eq!(pager.ref_count(2), 2);
        pager.release_page(a);
        assert_eq!(pager.lock_level(), LockLevel::Shared);
        pager.release_page(b);
        assert_eq!(pager.lock_level(), LockLevel::None);
        assert_eq!(pager.state(), PagerState::Unlocked);
        Ok(())
    }

    #[test]
    fn test_page_past_end_is_corrupt_unless_created() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut pager = open(&VfsRegistry::default(), &dir.path().join("eof.db"))?;
        commit_page(&mut pager, 2, 1)?;
        assert!(matches!(pager.acquire_page(5, false), Err(Error::Corrupt(_))));
        assert!(matches!(pager.acquire_page(0, true), Err(Error::Corrupt(_))));

        let page = pager.acquire_page(5, true)?;
        assert!(pager.page_data(&page).iter().all(|&b| b == 0));
        pager.release_page(page);
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.lock_level(), LockLevel::None);
        Ok(())
    }

    #[test]
    fn test_write_outside_transaction_is_misuse() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut pager = open(&VfsRegistry::default(), &dir.path().join("misuse.db"))?;
        commit_page(&mut pager, 2, 1)?;
        let page = pager.acquire_page(2, false)?;
        let result = pager.write_page(&page).map(|_| ());
        pager.release_page(page);
        assert!(matches!(result, Err(Error::Misuse(_))));
        assert!(matches!(pager.commit(), Err(Error::Misuse(_))));
        Ok(())
    }

    #[test]
    fn test_rollback_restores_content_and_dirty_flag() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut pager = open(&VfsRegistry::default(), &dir.path().join("rb.db"))?;
        commit_page(&mut pager, 2, 0x11)?;

        let page = pager.acquire_page(2, false)?;
        pager.begin_write()?;
        pager.write_page(&page)?.fill(0x22);
        let created = pager.acquire_page(3, true)?;
        pager.write_page(&created)?.fill(0x33);
        assert!(pager.is_dirty(&page));
        assert_eq!(pager.page_count(), 3);

        pager.rollback()?;
        // Same page object, original bytes, clean.
        assert!(!pager.is_dirty(&page));
        assert!(pager.page_data(&page).iter().all(|&b| b == 0x11));
        assert!(pager.page_data(&created).iter().all(|&b| b == 0));
        assert_eq!(pager.page_count(), 2);
        pager.release_page(page);
        pager.release_page(created);

        assert_eq!(read_byte(&mut pager, 2)?, 0x11);
        assert!(matches!(pager.acquire_page(3, false), Err(Error::Corrupt(_))));
        Ok(())
    }

    #[test]
    fn test_each_page_journaled_once() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut pager = open(&VfsRegistry::default(), &dir.path().join("once.db"))?;
        commit_page(&mut pager, 2, 1)?;
        commit_page(&mut pager, 3, 1)?;

        pager.begin_write()?;
        for _ in 0..3 {
            pager.with_page(2, false, |pager, page| {
                pager.write_page(page)?[0] += 1;
                Ok(())
            })?;
        }
        // New pages have no pre-image.
        pager.with_page(4, true, |pager, page| {
            pager.write_page(page)?.fill(4);
            Ok(())
        })?;
        assert_eq!(pager.journal_records, 1);
        pager.commit()?;
        Ok(())
    }

    #[test]
    fn test_journal_modes_finalize() -> anyhow::Result<()> {
        for mode in [
            JournalMode::Delete,
            JournalMode::Truncate,
            JournalMode::Persist,
            JournalMode::Memory,
        ] {
            let dir = tempdir()?;
            let path = dir.path().join("modes.db");
            let cfg = DatabaseConfig {
                page_size: 1024,
                journal_mode: mode,
                ..Default::default()
            };
            let mut pager = Pager::open(&VfsRegistry::default(), Some(&path), &cfg)?;
            commit_page(&mut pager, 2, 5)?;
            commit_page(&mut pager, 2, 6)?;

            let journal = dir.path().join("modes.db-journal");
            match mode {
                JournalMode::Delete | JournalMode::Memory => assert!(!journal.exists(), "{mode:?}"),
                JournalMode::Truncate => assert_eq!(std::fs::metadata(&journal)?.len(), 0),
                JournalMode::Persist => {
                    let bytes = std::fs::read(&journal)?;
                    assert!(bytes[..28].iter().all(|&b| b == 0));
                }
            }

            // Neither leftover counts as a hot journal.
            drop(pager);
            let mut pager = Pager::open(&VfsRegistry::default(), Some(&path), &cfg)?;
            assert_eq!(read_byte(&mut pager, 2)?, 6, "{mode:?}");
        }
        Ok(())
    }

    #[test]
    fn test_crash_before_database_write_recovers() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("crash1.db");
        let mut pager = open(&VfsRegistry::default(), &path)?;
        commit_page(&mut pager, 2, 0x10)?;
        commit_page(&mut pager, 3, 0x20)?;
        let before = std::fs::read(&path)?;

        pager.begin_write()?;
        for pgno in [2, 3] {
            pager.with_page(pgno, false, |pager, page| {
                pager.write_page(page)?.fill(0xEE);
                Ok(())
            })?;
        }
        pager.commit_phase_one()?;
        pager.abandon();
        assert!(dir.path().join("crash1.db-journal").exists());

        let mut pager = open(&VfsRegistry::default(), &path)?;
        assert_eq!(read_byte(&mut pager, 2)?, 0x10);
        pager.close()?;
        assert_eq!(std::fs::read(&path)?, before);
        assert!(!dir.path().join("crash1.db-journal").exists());
        Ok(())
    }

    #[test]
    fn test_crash_inside_phase_two_recovers() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("crash2.db");
        let mut pager = open(&VfsRegistry::default(), &path)?;
        for pgno in 2..=5 {
            commit_page(&mut pager, pgno, pgno as u8)?;
        }
        let before = std::fs::read(&path)?;

        pager.begin_write()?;
        for pgno in 2..=7 {
            pager.with_page(pgno, true, |pager, page| {
                pager.write_page(page)?.fill(0xEE);
                Ok(())
            })?;
        }
        pager.commit_phase_one()?;
        pager.write_some_dirty_pages(4)?;
        pager.abandon();
        assert_ne!(std::fs::read(&path)?, before);

        let pager = open(&VfsRegistry::default(), &path)?;
        pager.close()?;
        assert_eq!(std::fs::read(&path)?, before);
        Ok(())
    }

    #[test]
    fn test_invalid_journal_is_ignored_and_removed() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("junk.db");
        {
            let mut pager = open(&VfsRegistry::default(), &path)?;
            commit_page(&mut pager, 2, 3)?;
        }
        let journal = dir.path().join("junk.db-journal");
        std::fs::write(&journal, vec![0x5Au8; 700])?;

        let mut pager = open(&VfsRegistry::default(), &path)?;
        assert_eq!(read_byte(&mut pager, 2)?, 3);
        assert!(!journal.exists());
        Ok(())
    }

    #[test]
    fn test_spill_keeps_atomicity() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("spill.db");
        let cfg = DatabaseConfig {
            page_size: 1024,
            cache_size: Some(10),
            ..Default::default()
        };
        let registry = VfsRegistry::default();
        let mut pager = Pager::open(&registry, Some(&path), &cfg)?;
        pager.begin_write()?;
        for pgno in 2..=30 {
            pager.with_page(pgno, true, |pager, page| {
                pager.write_page(page)?.fill(1);
                Ok(())
            })?;
        }
        pager.commit()?;
        let before = std::fs::read(&path)?;

        pager.begin_write()?;
        for pgno in 2..=30 {
            pager.with_page(pgno, false, |pager, page| {
                pager.write_page(page)?.fill(2);
                Ok(())
            })?;
        }
        assert!(pager.cached_pages() <= 12);
        assert_eq!(pager.state(), PagerState::ExclusiveWrite);
        pager.rollback()?;
        assert_eq!(std::fs::read(&path)?, before);
        for pgno in [2, 15, 30] {
            assert_eq!(read_byte(&mut pager, pgno)?, 1);
        }
        Ok(())
    }

    #[test]
    fn test_other_handle_commit_invalidates_cache() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("shared.db");
        let registry = VfsRegistry::default();
        let mut a = open(&registry, &path)?;
        let mut b = open(&registry, &path)?;
        commit_page(&mut a, 2, 1)?;
        assert_eq!(read_byte(&mut b, 2)?, 1);

        commit_page(&mut a, 2, 2)?;
        assert_eq!(read_byte(&mut b, 2)?, 2);
        Ok(())
    }

    #[test]
    fn test_writer_blocked_by_reader() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("busy.db");
        let registry = VfsRegistry::default();
        let mut writer = open(&registry, &path)?;
        let mut reader = open(&registry, &path)?;
        commit_page(&mut writer, 2, 1)?;

        reader.begin_read()?;
        writer.begin_write()?;
        assert!(matches!(reader.begin_write(), Err(Error::Busy)));
        writer.with_page(2, false, |pager, page| {
            pager.write_page(page)?.fill(9);
            Ok(())
        })?;
        assert!(matches!(writer.commit(), Err(Error::Busy)));
        // The reader still sees its snapshot.
        assert_eq!(read_byte(&mut reader, 2)?, 1);
        reader.end_read()?;

        writer.commit()?;
        assert_eq!(read_byte(&mut reader, 2)?, 9);
        Ok(())
    }

    #[test]
    fn test_busy_handler_is_consulted() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("handler.db");
        let registry = VfsRegistry::default();
        let mut a = open(&registry, &path)?;
        let mut b = open(&registry, &path)?;
        commit_page(&mut a, 2, 1)?;
        a.begin_write()?;

        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = calls.clone();
        b.set_busy_handler(Box::new(move |attempts: u32| {
            seen.fetch_add(1, Ordering::SeqCst);
            attempts < 3
        }));
        assert!(matches!(b.begin_write(), Err(Error::Busy)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(b.lock_level(), LockLevel::None);
        a.rollback()?;
        Ok(())
    }

    #[test]
    fn test_foreign_file_is_not_a_database() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("foreign.db");
        std::fs::write(&path, vec![0x42u8; 4096])?;
        let err = open(&VfsRegistry::default(), &path).unwrap_err();
        assert!(matches!(err, Error::NotADatabase));
        Ok(())
    }

    #[test]
    fn test_misaligned_file_is_corrupt() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ragged.db");
        {
            let mut pager = open(&VfsRegistry::default(), &path)?;
            commit_page(&mut pager, 2, 1)?;
        }
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_len(2048 + 100)?;
        let err = open(&VfsRegistry::default(), &path).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
        Ok(())
    }

    #[test]
    fn test_read_only_handle_rejects_writes() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ro.db");
        {
            let mut pager = open(&VfsRegistry::default(), &path)?;
            commit_page(&mut pager, 2, 1)?;
        }
        let cfg = DatabaseConfig {
            read_only: true,
            create: false,
            ..config()
        };
        let mut pager = Pager::open(&VfsRegistry::default(), Some(&path), &cfg)?;
        assert!(pager.is_read_only());
        assert!(matches!(pager.begin_write(), Err(Error::ReadOnly)));
        assert_eq!(read_byte(&mut pager, 2)?, 1);
        Ok(())
    }

    #[test]
    fn test_temporary_database_uses_memory_journal() -> anyhow::Result<()> {
        let mut pager = Pager::open(&VfsRegistry::default(), None, &config())?;
        assert!(pager.journal_path().is_none());
        commit_page(&mut pager, 2, 4)?;

        pager.begin_write()?;
        pager.with_page(2, false, |pager, page| {
            pager.write_page(page)?.fill(8);
            Ok(())
        })?;
        pager.rollback()?;
        assert_eq!(read_byte(&mut pager, 2)?, 4);
        Ok(())
    }

    #[test]
    fn test_update_header_keeps_engine_fields() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut pager = open(&VfsRegistry::default(), &dir.path().join("hdr.db"))?;
        commit_page(&mut pager, 2, 1)?;

        pager.begin_write()?;
        pager.update_header(|h| {
            h.user_version = 77;
            h.schema_cookie = 3;
            h.page_count = 999;
        })?;
        pager.commit()?;

        let header = pager.header()?;
        assert_eq!(header.user_version, 77);
        assert_eq!(header.schema_cookie, 3);
        assert_eq!(header.page_count, 2);
        assert!(matches!(pager.update_header(|_| {}), Err(Error::Misuse(_))));
        Ok(())
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("drop.db");
        {
            let mut pager = open(&VfsRegistry::default(), &path)?;
            commit_page(&mut pager, 2, 1)?;
            pager.begin_write()?;
            pager.with_page(2, false, |pager, page| {
                pager.write_page(page)?.fill(5);
                Ok(())
            })?;
        }
        let mut pager = open(&VfsRegistry::default(), &path)?;
        assert_eq!(read_byte(&mut pager, 2)?, 1);
        assert!(!dir.path().join("drop.db-journal").exists());
        Ok(())
    }
}
