//! Files backed by the operating system.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use super::lock::{HandleId, LockTable};
use super::LockLevel;
use crate::error::{Error, IoErrorKind, Result};

const DELETE_ATTEMPTS: u32 = 6;
const DELETE_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct LockSlot {
    table: Arc<LockTable>,
    handle: HandleId,
}

/// An open OS file with positional I/O and (optionally) lock-table
/// participation.
#[derive(Debug)]
pub struct OsFile {
    file: fs::File,
    path: PathBuf,
    delete_on_close: bool,
    slot: Option<LockSlot>,
    level: LockLevel,
}

impl OsFile {
    pub(crate) fn open(
        path: &Path,
        writable: bool,
        create: bool,
        create_new: bool,
        delete_on_close: bool,
        table: Option<Arc<LockTable>>,
    ) -> io::Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .create(create && !create_new)
            .create_new(create_new)
            .open(path)?;
        // Handles on the same file must agree on the lock table key.
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let slot = table.map(|table| {
            let handle = table.register();
            LockSlot { table, handle }
        });
        Ok(Self {
            file,
            path,
            delete_on_close,
            slot,
            level: LockLevel::None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_level(&self) -> LockLevel {
        self.level
    }

    /// Reads as much of `buf` as the file holds at `offset`; the remainder
    /// is zero-filled.
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match read_at(&self.file, &mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(IoErrorKind::Read, e)),
            }
        }
        buf[total..].fill(0);
        Ok(total)
    }

    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let mut total = 0;
        while total < data.len() {
            match write_at(&self.file, &data[total..], offset + total as u64) {
                Ok(0) => {
                    return Err(Error::io(
                        IoErrorKind::Write,
                        io::Error::new(io::ErrorKind::WriteZero, "write returned zero bytes"),
                    ));
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io(IoErrorKind::Write, e)),
            }
        }
        Ok(())
    }

    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .map_err(|e| Error::io(IoErrorKind::Truncate, e))
    }

    /// `full` also flushes metadata.
    pub fn sync(&mut self, full: bool) -> Result<()> {
        let result = if full {
            self.file.sync_all()
        } else {
            self.file.sync_data()
        };
        result.map_err(|e| Error::io(IoErrorKind::Fsync, e))
    }

    pub fn file_size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Error::io(IoErrorKind::Read, e))
    }

    /// Raise the lock to `level`. Returns false when another handle blocks
    /// the transition; a blocked EXCLUSIVE request leaves the handle at
    /// PENDING.
    pub fn lock(&mut self, level: LockLevel) -> Result<bool> {
        if self.level >= level {
            return Ok(true);
        }
        let Some(slot) = &self.slot else {
            self.level = level;
            return Ok(true);
        };

        let before = self.level;
        let granted = slot.table.lock(&self.path, slot.handle, level);

        if before == LockLevel::None && granted >= LockLevel::Shared {
            if !os_lock(&self.file, OsLock::Shared)? {
                slot.table.unlock(&self.path, slot.handle, LockLevel::None);
                self.level = LockLevel::None;
                return Ok(false);
            }
        }

        if granted == LockLevel::Exclusive && !os_lock(&self.file, OsLock::Exclusive)? {
            // Another process still reads the file.
            slot.table.unlock(&self.path, slot.handle, LockLevel::Pending);
            if !os_lock(&self.file, OsLock::Shared)? {
                warn!("lost shared lock on {} while upgrading", self.path.display());
            }
            self.level = LockLevel::Pending;
            return Ok(false);
        }

        if granted != before {
            debug!("lock {}: {:?} -> {:?}", self.path.display(), before, granted);
        }
        self.level = granted;
        Ok(granted >= level)
    }

    /// Lower the lock to at most `level`.
    pub fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if self.level <= level {
            return Ok(());
        }
        let before = self.level;
        self.level = level;
        let Some(slot) = &self.slot else {
            return Ok(());
        };
        slot.table.unlock(&self.path, slot.handle, level);
        if level == LockLevel::None {
            os_lock(&self.file, OsLock::Unlock)?;
        } else if before == LockLevel::Exclusive {
            os_lock(&self.file, OsLock::Shared)?;
        }
        debug!("unlock {}: {:?} -> {:?}", self.path.display(), before, level);
        Ok(())
    }

    pub fn check_reserved_lock(&self) -> Result<bool> {
        Ok(self
            .slot
            .as_ref()
            .is_some_and(|slot| slot.table.reserved(&self.path)))
    }

    pub fn close(mut self) -> Result<()> {
        self.release();
        let delete = std::mem::take(&mut self.delete_on_close);
        let path = std::mem::take(&mut self.path);
        drop(self);
        if delete {
            delete_with_retry(&path)?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(slot) = &self.slot {
            slot.table.unlock(&self.path, slot.handle, LockLevel::None);
        }
        self.level = LockLevel::None;
    }
}

impl Drop for OsFile {
    fn drop(&mut self) {
        self.release();
        if self.delete_on_close {
            if let Err(e) = delete_with_retry(&self.path) {
                warn!("failed to delete {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Remove `path`, retrying with exponential backoff. A missing file is
/// not an error.
pub(crate) fn delete_with_retry(path: &Path) -> Result<()> {
    let mut delay = DELETE_BACKOFF;
    let mut attempt = 0;
    loop {
        match fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt + 1 >= DELETE_ATTEMPTS => {
                return Err(Error::io(IoErrorKind::Delete, e));
            }
            Err(e) => {
                debug!("delete of {} failed ({}), retrying", path.display(), e);
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OsLock {
    Shared,
    Exclusive,
    Unlock,
}

/// Advisory whole-file lock so that other processes respect SHARED and
/// EXCLUSIVE. Returns false when the lock is held elsewhere.
#[cfg(unix)]
fn os_lock(file: &fs::File, kind: OsLock) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let op = match kind {
        OsLock::Shared => libc::LOCK_SH | libc::LOCK_NB,
        OsLock::Exclusive => libc::LOCK_EX | libc::LOCK_NB,
        OsLock::Unlock => libc::LOCK_UN,
    };
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(Error::io(IoErrorKind::Lock, err))
    }
}

#[cfg(not(unix))]
fn os_lock(_file: &fs::File, _kind: OsLock) -> Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn read_at(file: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &fs::File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &fs::File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_rw(path: &Path, table: &Arc<LockTable>) -> io::Result<OsFile> {
        OsFile::open(path, true, true, false, false, Some(table.clone()))
    }

    #[test]
    fn test_positional_io() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let table = Arc::new(LockTable::new());
        let mut file = open_rw(&dir.path().join("a.db"), &table)?;

        file.write(b"hello", 10)?;
        assert_eq!(file.file_size()?, 15);

        let mut buf = [0xAAu8; 8];
        assert_eq!(file.read(&mut buf, 12)?, 3);
        assert_eq!(&buf, b"llo\0\0\0\0\0");

        file.truncate(4)?;
        assert_eq!(file.file_size()?, 4);
        file.sync(true)?;
        Ok(())
    }

    #[test]
    fn test_lock_ladder_between_handles() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("b.db");
        let table = Arc::new(LockTable::new());
        let mut writer = open_rw(&path, &table)?;
        let mut reader = open_rw(&path, &table)?;

        assert!(reader.lock(LockLevel::Shared)?);
        assert!(writer.lock(LockLevel::Reserved)?);
        assert!(writer.check_reserved_lock()?);
        assert!(!writer.lock(LockLevel::Exclusive)?);
        assert_eq!(writer.lock_level(), LockLevel::Pending);

        reader.unlock(LockLevel::None)?;
        assert!(writer.lock(LockLevel::Exclusive)?);

        // Readers are shut out until the writer steps down.
        assert!(!reader.lock(LockLevel::Shared)?);
        writer.unlock(LockLevel::Shared)?;
        assert!(reader.lock(LockLevel::Shared)?);
        Ok(())
    }

    #[test]
    fn test_drop_releases_locks() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("c.db");
        let table = Arc::new(LockTable::new());
        {
            let mut a = open_rw(&path, &table)?;
            assert!(a.lock(LockLevel::Exclusive)?);
        }
        let mut b = open_rw(&path, &table)?;
        assert!(b.lock(LockLevel::Exclusive)?);
        Ok(())
    }

    #[test]
    fn test_delete_on_close() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("tmp");
        let file = OsFile::open(&path, true, true, true, true, None)?;
        assert!(path.exists());
        file.close()?;
        assert!(!path.exists());

        // Deleting something already gone succeeds.
        delete_with_retry(&path)?;
        Ok(())
    }
}
