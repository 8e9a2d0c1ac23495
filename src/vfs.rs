//! File abstraction: opening, locking and I/O over OS files and in-memory
//! journals.

pub mod lock;
pub mod memory;
pub mod os;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;
use rand::Rng;

use crate::error::{Error, IoErrorKind, Result};
use lock::LockTable;
use memory::MemoryJournal;
use os::OsFile;

/// Prefix of every temporary file name.
pub const TEMP_FILE_PREFIX: &str = "vibelite_";

/// Name under which the default OS provider is registered.
pub const DEFAULT_VFS: &str = "os";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READONLY = 1 << 0;
        const READWRITE = 1 << 1;
        const CREATE = 1 << 2;
        const EXCLUSIVE = 1 << 3;
        const DELETE_ON_CLOSE = 1 << 4;
    }
}

impl OpenFlags {
    /// Check the combination rules: exactly one access mode, CREATE only
    /// when writable, EXCLUSIVE and DELETE_ON_CLOSE only with CREATE.
    pub fn validate(self) -> Result<()> {
        let ro = self.contains(OpenFlags::READONLY);
        let rw = self.contains(OpenFlags::READWRITE);
        if ro == rw {
            return Err(Error::misuse(
                "exactly one of READONLY and READWRITE must be given",
            ));
        }
        if self.contains(OpenFlags::CREATE) && !rw {
            return Err(Error::misuse("CREATE requires READWRITE"));
        }
        if self.contains(OpenFlags::EXCLUSIVE) && !self.contains(OpenFlags::CREATE) {
            return Err(Error::misuse("EXCLUSIVE requires CREATE"));
        }
        if self.contains(OpenFlags::DELETE_ON_CLOSE) && !self.contains(OpenFlags::CREATE) {
            return Err(Error::misuse("DELETE_ON_CLOSE requires CREATE"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    MainDb,
    MainJournal,
    TempDb,
    TempJournal,
    Transient,
}

impl FileType {
    pub fn is_temporary(self) -> bool {
        matches!(
            self,
            FileType::TempDb | FileType::TempJournal | FileType::Transient
        )
    }
}

/// File lock levels, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

/// An open file.
///
/// Only main database files take part in locking; journals and temporary
/// files are private to their owner and use the no-lock variant.
#[derive(Debug)]
pub enum File {
    Locking(OsFile),
    NoLock(OsFile),
    Memory(MemoryJournal),
}

impl File {
    pub fn memory() -> Self {
        File::Memory(MemoryJournal::new())
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            File::Locking(f) | File::NoLock(f) => Some(f.path()),
            File::Memory(_) => None,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, File::Memory(_))
    }

    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            File::Locking(f) | File::NoLock(f) => f.read(buf, offset),
            File::Memory(m) => m.read(buf, offset),
        }
    }

    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        match self {
            File::Locking(f) | File::NoLock(f) => f.write(data, offset),
            File::Memory(m) => m.write(data, offset),
        }
    }

    pub fn truncate(&mut self, size: u64) -> Result<()> {
        match self {
            File::Locking(f) | File::NoLock(f) => f.truncate(size),
            File::Memory(m) => m.truncate(size),
        }
    }

    pub fn sync(&mut self, full: bool) -> Result<()> {
        match self {
            File::Locking(f) | File::NoLock(f) => f.sync(full),
            File::Memory(_) => Ok(()),
        }
    }

    pub fn file_size(&self) -> Result<u64> {
        match self {
            File::Locking(f) | File::NoLock(f) => f.file_size(),
            File::Memory(m) => Ok(m.size()),
        }
    }

    /// See [`OsFile::lock`]. Unshared files always succeed.
    pub fn lock(&mut self, level: LockLevel) -> Result<bool> {
        match self {
            File::Locking(f) | File::NoLock(f) => f.lock(level),
            File::Memory(_) => Ok(true),
        }
    }

    pub fn unlock(&mut self, level: LockLevel) -> Result<()> {
        match self {
            File::Locking(f) | File::NoLock(f) => f.unlock(level),
            File::Memory(_) => Ok(()),
        }
    }

    pub fn lock_level(&self) -> LockLevel {
        match self {
            File::Locking(f) | File::NoLock(f) => f.lock_level(),
            File::Memory(_) => LockLevel::None,
        }
    }

    pub fn check_reserved_lock(&self) -> Result<bool> {
        match self {
            File::Locking(f) => f.check_reserved_lock(),
            File::NoLock(_) | File::Memory(_) => Ok(false),
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            File::Locking(f) | File::NoLock(f) => f.close(),
            File::Memory(_) => Ok(()),
        }
    }
}

/// A file-system provider. Handles opened through the same `Vfs` share
/// one lock table.
#[derive(Debug)]
pub struct Vfs {
    name: String,
    temp_dir: PathBuf,
    locks: Arc<LockTable>,
}

impl Vfs {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_temp_dir(name, std::env::temp_dir())
    }

    pub fn with_temp_dir(name: impl Into<String>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            temp_dir: temp_dir.into(),
            locks: Arc::new(LockTable::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open `path` as `file_type`, returning the file and the flags that
    /// were actually used.
    ///
    /// **Read-only fallback:** when a READWRITE open fails and the request
    /// is not EXCLUSIVE, the open is retried READONLY and, if that works,
    /// the returned flags carry READONLY instead of READWRITE and no CREATE.
    /// Callers that need to write must check the returned flags.
    ///
    /// A `None` path allocates a fresh temporary file under the provider's
    /// temp directory; this requires DELETE_ON_CLOSE and a temporary
    /// `file_type`.
    pub fn open(
        &self,
        path: Option<&Path>,
        file_type: FileType,
        flags: OpenFlags,
    ) -> Result<(File, OpenFlags)> {
        flags.validate()?;
        let resolved = match path {
            Some(p) => p.to_path_buf(),
            None => {
                if !flags.contains(OpenFlags::DELETE_ON_CLOSE) || !file_type.is_temporary() {
                    return Err(Error::misuse(
                        "anonymous files must be temporary and DELETE_ON_CLOSE",
                    ));
                }
                self.temp_path()
            }
        };

        let table = (file_type == FileType::MainDb).then(|| self.locks.clone());
        let create = flags.contains(OpenFlags::CREATE);
        let create_new = path.is_none() || flags.contains(OpenFlags::EXCLUSIVE);
        let delete_on_close = flags.contains(OpenFlags::DELETE_ON_CLOSE);

        let (file, used) = open_or_fall_back(&resolved, flags, |writable| {
            if writable {
                OsFile::open(&resolved, true, create, create_new, delete_on_close, table.clone())
            } else {
                OsFile::open(&resolved, false, false, false, delete_on_close, table.clone())
            }
        })?;

        let file = if file_type == FileType::MainDb {
            File::Locking(file)
        } else {
            File::NoLock(file)
        };
        Ok((file, used))
    }

    pub fn delete(&self, path: &Path) -> Result<()> {
        os::delete_with_retry(path)
    }

    pub fn exists(&self, path: &Path) -> Result<bool> {
        path.try_exists()
            .map_err(|e| Error::io(IoErrorKind::Access, e))
    }

    /// A fresh path for a temporary file.
    pub fn temp_path(&self) -> PathBuf {
        let suffix: u64 = rand::thread_rng().gen();
        self.temp_dir
            .join(format!("{TEMP_FILE_PREFIX}{suffix:016x}"))
    }
}

/// Open with `open_os(writable)`. A read-write open that fails and is not
/// exclusive is retried read-only; the flags that actually applied are
/// returned with the file.
fn open_or_fall_back<T>(
    path: &Path,
    flags: OpenFlags,
    mut open_os: impl FnMut(bool) -> std::io::Result<T>,
) -> Result<(T, OpenFlags)> {
    let writable = flags.contains(OpenFlags::READWRITE);
    match open_os(writable) {
        Ok(file) => Ok((file, flags)),
        Err(e) if writable && !flags.contains(OpenFlags::EXCLUSIVE) && !path.is_dir() => {
            debug!("read-write open of {} failed ({}), retrying read-only", path.display(), e);
            let file = open_os(false).map_err(|_| Error::cant_open(path, Some(e)))?;
            let used = (flags - OpenFlags::READWRITE - OpenFlags::CREATE) | OpenFlags::READONLY;
            Ok((file, used))
        }
        Err(e) => Err(Error::cant_open(path, Some(e))),
    }
}

/// Named file-system providers. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct VfsRegistry {
    providers: HashMap<String, Arc<Vfs>>,
    default: String,
}

impl VfsRegistry {
    pub fn builder() -> VfsRegistryBuilder {
        VfsRegistryBuilder::default()
    }

    /// Look up a provider; `None` selects the default one.
    pub fn find(&self, name: Option<&str>) -> Result<Arc<Vfs>> {
        let name = name.unwrap_or(&self.default);
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::misuse(format!("no such vfs: {name}")))
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }
}

impl Default for VfsRegistry {
    fn default() -> Self {
        VfsRegistry::builder().register(Vfs::new(DEFAULT_VFS)).build()
    }
}

#[derive(Debug, Default)]
pub struct VfsRegistryBuilder {
    providers: HashMap<String, Arc<Vfs>>,
    default: Option<String>,
}

impl VfsRegistryBuilder {
    /// Add a provider. The first one registered becomes the default unless
    /// [`VfsRegistryBuilder::default_vfs`] says otherwise.
    pub fn register(mut self, vfs: Vfs) -> Self {
        let name = vfs.name().to_string();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.providers.insert(name, Arc::new(vfs));
        self
    }

    pub fn default_vfs(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    pub fn build(self) -> VfsRegistry {
        VfsRegistry {
            providers: self.providers,
            default: self.default.unwrap_or_else(|| DEFAULT_VFS.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rw_create() -> OpenFlags {
        OpenFlags::READWRITE | OpenFlags::CREATE
    }

    #[test]
    fn test_flag_validation() {
        assert!(OpenFlags::READONLY.validate().is_ok());
        assert!(rw_create().validate().is_ok());
        assert!(OpenFlags::empty().validate().is_err());
        assert!((OpenFlags::READONLY | OpenFlags::READWRITE).validate().is_err());
        assert!((OpenFlags::READONLY | OpenFlags::CREATE).validate().is_err());
        assert!((OpenFlags::READWRITE | OpenFlags::EXCLUSIVE).validate().is_err());
        assert!((OpenFlags::READWRITE | OpenFlags::DELETE_ON_CLOSE).validate().is_err());
    }

    #[test]
    fn test_open_create_and_reopen() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("main.db");
        let vfs = Vfs::new("os");

        let (mut file, used) = vfs.open(Some(&path), FileType::MainDb, rw_create())?;
        assert_eq!(used, rw_create());
        file.write(b"data", 0)?;
        file.close()?;

        let (mut file, _) = vfs.open(Some(&path), FileType::MainDb, OpenFlags::READONLY)?;
        let mut buf = [0u8; 4];
        file.read(&mut buf, 0)?;
        assert_eq!(&buf, b"data");
        Ok(())
    }

    #[test]
    fn test_missing_file_cant_open() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let vfs = Vfs::new("os");
        let err = vfs
            .open(Some(&dir.path().join("nope.db")), FileType::MainDb, OpenFlags::READONLY)
            .unwrap_err();
        assert!(matches!(err, Error::CantOpen { .. }));
        Ok(())
    }

    #[test]
    fn test_exclusive_create_fails_on_existing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("x.db");
        std::fs::write(&path, b"")?;
        let vfs = Vfs::new("os");
        let flags = rw_create() | OpenFlags::EXCLUSIVE;
        assert!(vfs.open(Some(&path), FileType::MainDb, flags).is_err());
        Ok(())
    }

    #[test]
    fn test_readonly_fallback() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ro.db");
        let denied = || std::io::Error::from(std::io::ErrorKind::PermissionDenied);

        let mut attempts = Vec::new();
        let (_, used) = open_or_fall_back(&path, rw_create(), |writable| {
            attempts.push(writable);
            if writable {
                Err(denied())
            } else {
                Ok(())
            }
        })?;
        assert_eq!(attempts, [true, false]);
        assert_eq!(used, OpenFlags::READONLY);

        // Exclusive opens and read-only opens are not retried.
        let mut calls = 0;
        let exclusive = open_or_fall_back(&path, rw_create() | OpenFlags::EXCLUSIVE, |_| -> std::io::Result<()> {
            calls += 1;
            Err(denied())
        });
        assert!(matches!(exclusive, Err(Error::CantOpen { .. })));
        assert_eq!(calls, 1);
        let read_only = open_or_fall_back(&path, OpenFlags::READONLY, |_| -> std::io::Result<()> { Err(denied()) });
        assert!(matches!(read_only, Err(Error::CantOpen { .. })));

        // Both attempts failing reports the read-write error.
        let both = open_or_fall_back(&path, rw_create(), |_| -> std::io::Result<()> { Err(denied()) });
        assert!(matches!(both, Err(Error::CantOpen { source: Some(_), .. })));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_readonly_file_opens() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir()?;
        let path = dir.path().join("ro.db");
        std::fs::write(&path, b"abc")?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o444))?;

        let vfs = Vfs::new("os");
        let (file, used) = vfs.open(Some(&path), FileType::MainDb, rw_create())?;
        assert_eq!(file.file_size()?, 3);
        // Root may still get write access; anyone else falls back.
        assert!(used.contains(OpenFlags::READONLY) != used.contains(OpenFlags::READWRITE));
        Ok(())
    }

    #[test]
    fn test_anonymous_temp_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let vfs = Vfs::with_temp_dir("os", dir.path());
        let flags = rw_create() | OpenFlags::DELETE_ON_CLOSE;

        let (file, _) = vfs.open(None, FileType::TempDb, flags)?;
        let path = file.path().map(Path::to_path_buf).expect("temp files have a path");
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with(TEMP_FILE_PREFIX));
        assert!(path.exists());
        assert!(matches!(file, File::NoLock(_)));
        file.close()?;
        assert!(!path.exists());

        // Anonymous files must be temporary.
        assert!(vfs.open(None, FileType::MainDb, flags).is_err());
        assert!(vfs.open(None, FileType::TempDb, rw_create()).is_err());
        Ok(())
    }

    #[test]
    fn test_handles_share_lock_table() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("shared.db");
        let vfs = Vfs::new("os");
        let (mut a, _) = vfs.open(Some(&path), FileType::MainDb, rw_create())?;
        let (mut b, _) = vfs.open(Some(&path), FileType::MainDb, rw_create())?;

        assert!(a.lock(LockLevel::Reserved)?);
        assert!(b.check_reserved_lock()?);
        assert!(b.lock(LockLevel::Shared)?);
        assert!(!b.lock(LockLevel::Reserved)?);
        assert!(!a.lock(LockLevel::Exclusive)?);

        b.unlock(LockLevel::None)?;
        assert!(a.lock(LockLevel::Exclusive)?);
        Ok(())
    }

    #[test]
    fn test_registry_lookup() {
        let registry = VfsRegistry::builder()
            .register(Vfs::new("os"))
            .register(Vfs::new("scratch"))
            .default_vfs("scratch")
            .build();
        assert_eq!(registry.default_name(), "scratch");
        assert_eq!(registry.find(None).map(|v| v.name().to_string()).ok(), Some("scratch".into()));
        assert!(registry.find(Some("os")).is_ok());
        assert!(matches!(registry.find(Some("nope")), Err(Error::Misuse(_))));
        assert!(VfsRegistry::default().find(None).is_ok());
    }

    #[test]
    fn test_memory_file_never_locks() -> anyhow::Result<()> {
        let mut file = File::memory();
        assert!(file.lock(LockLevel::Exclusive)?);
        assert!(!file.check_reserved_lock()?);
        file.write(b"journal", 0)?;
        assert_eq!(file.file_size()?, 7);
        assert!(file.path().is_none());
        Ok(())
    }
}
