use std::path::Path;

use log::{debug, warn};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::mutex::{self, DbMutex};
use crate::pager::busy::BusyHandler;
use crate::pager::Pager;
use crate::vfs::VfsRegistry;

/// A database handle: one pager behind one mutex.
///
/// Every pager and B-tree call made through the handle runs while the
/// handle's mutex is held. Separate handles on the same file coordinate
/// only through file locks.
pub struct Database {
    mutex: Box<dyn DbMutex>,
    pager: parking_lot::Mutex<Pager>,
}

impl Database {
    /// Open `path` with the default configuration and file system.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(&VfsRegistry::default(), Some(path.as_ref()), &DatabaseConfig::default())
    }

    /// Open `path`, or a private temporary database when `path` is `None`.
    pub fn open_with(registry: &VfsRegistry, path: Option<&Path>, config: &DatabaseConfig) -> Result<Self> {
        let pager = Pager::open(registry, path, config)?;
        debug!(
            "opened database {} (threadsafe: {})",
            path.map_or_else(|| "<temp>".to_string(), |p| p.display().to_string()),
            config.threadsafe
        );
        Ok(Database {
            mutex: mutex::for_handle(config.threadsafe),
            pager: parking_lot::Mutex::new(pager),
        })
    }

    /// Temporary database deleted on close, with an in-memory journal.
    pub fn open_temp(config: &DatabaseConfig) -> Result<Self> {
        Self::open_with(&VfsRegistry::default(), None, config)
    }

    /// Run `f` with the pager while holding the handle's mutex.
    ///
    /// Calling back into the same handle from inside `f` is a misuse.
    pub fn run<T>(&self, f: impl FnOnce(&mut Pager) -> Result<T>) -> Result<T> {
        mutex::run(self.mutex.as_ref(), || {
            let mut pager = self
                .pager
                .try_lock()
                .ok_or_else(|| Error::misuse("database handle re-entered"))?;
            f(&mut *pager)
        })
    }

    /// Like [`Database::run`], but fails with [`Error::Locked`] when another
    /// thread holds the handle.
    pub fn try_run<T>(&self, f: impl FnOnce(&mut Pager) -> Result<T>) -> Result<T> {
        mutex::try_run(self.mutex.as_ref(), || {
            let mut pager = self
                .pager
                .try_lock()
                .ok_or_else(|| Error::misuse("database handle re-entered"))?;
            f(&mut *pager)
        })
    }

    /// Run `f` inside a write transaction. It commits when `f` succeeds and
    /// rolls back when `f` or the commit fails.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Pager) -> Result<T>) -> Result<T> {
        self.run(|pager| {
            pager.begin_write()?;
            let outcome = f(pager).and_then(|value| {
                pager.commit()?;
                Ok(value)
            });
            if let Err(e) = &outcome {
                if pager.state().is_writing() {
                    debug!("rolling back after error: {}", e);
                    if let Err(rollback) = pager.rollback() {
                        warn!("rollback failed: {}", rollback);
                    }
                }
            }
            outcome
        })
    }

    /// Run `f` inside a read transaction, so that it sees one snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&mut Pager) -> Result<T>) -> Result<T> {
        self.run(|pager| {
            pager.begin_read()?;
            let outcome = f(pager);
            pager.end_read()?;
            outcome
        })
    }

    pub fn set_busy_handler(&self, handler: Box<dyn BusyHandler>) -> Result<()> {
        self.run(|pager| {
            pager.set_busy_handler(handler);
            Ok(())
        })
    }

    /// Close the handle. An open write transaction is rolled back.
    pub fn close(self) -> Result<()> {
        let Database { mutex, pager } = self;
        mutex::run(mutex.as_ref(), || pager.into_inner().close())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
