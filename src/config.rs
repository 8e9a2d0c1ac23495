//! Open-time configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Smallest and largest legal page sizes.
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;

/// Cache size used when neither the configuration nor the file asks for one.
pub const DEFAULT_CACHE_SIZE: usize = 2000;

/// What happens to the rollback journal when a transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    /// Delete the journal file.
    #[default]
    Delete,
    /// Truncate it to zero length.
    Truncate,
    /// Keep the file and zero its header.
    Persist,
    /// Keep the journal in memory. A crash mid-commit can corrupt the file.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Never sync; durability is left to the OS.
    Off,
    /// Sync the journal once before the database is written.
    Normal,
    /// Also sync the journal header separately from its records.
    #[default]
    Full,
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Page size for new databases. Existing files keep their own.
    pub page_size: usize,
    /// Number of cached pages. `None` uses the size stored in the file.
    pub cache_size: Option<usize>,
    pub journal_mode: JournalMode,
    pub sync_mode: SyncMode,
    /// Whether the handle may be used from several threads.
    pub threadsafe: bool,
    /// Name of the file-system provider; `None` is the registry default.
    pub vfs: Option<String>,
    /// How long to retry a busy lock. `None` fails immediately.
    pub busy_timeout: Option<Duration>,
    pub read_only: bool,
    /// Create the file if it does not exist.
    pub create: bool,
    /// Upper bound on the number of pages in the file.
    pub max_page_count: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            page_size: 4096,
            cache_size: None,
            journal_mode: JournalMode::Delete,
            sync_mode: SyncMode::Full,
            threadsafe: true,
            vfs: None,
            busy_timeout: None,
            read_only: false,
            create: true,
            max_page_count: 1_073_741_823,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        if !is_valid_page_size(self.page_size) {
            return Err(Error::misuse(format!(
                "page size {} is not a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.read_only && self.create {
            return Err(Error::misuse("a read-only database cannot be created"));
        }
        if self.max_page_count == 0 {
            return Err(Error::misuse("max_page_count must be positive"));
        }
        Ok(())
    }
}

pub fn is_valid_page_size(size: usize) -> bool {
    size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DatabaseConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.journal_mode, JournalMode::Delete);
    }

    #[test]
    fn test_page_size_bounds() {
        for size in [512, 1024, 4096, 65536] {
            assert!(is_valid_page_size(size), "{size}");
        }
        for size in [0, 256, 1000, 131072] {
            assert!(!is_valid_page_size(size), "{size}");
        }
    }

    #[test]
    fn test_read_only_create_conflict() {
        let config = DatabaseConfig {
            read_only: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = DatabaseConfig {
            read_only: true,
            create: false,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
