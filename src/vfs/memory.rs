//! Rollback journal kept entirely in memory.
//!
//! Used for temporary databases and `JournalMode::Memory`: the journal
//! must support rollback but never has to survive a crash.

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 8192;

/// Append-only byte store made of fixed-size chunks.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    chunks: Vec<Box<[u8]>>,
    size: u64,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read into `buf` from `offset`. Bytes past the written end read as
    /// zero; returns how many bytes were actually available.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        buf.fill(0);
        if offset >= self.size {
            return Ok(0);
        }
        let available = ((self.size - offset) as usize).min(buf.len());
        let mut done = 0;
        while done < available {
            let pos = offset as usize + done;
            let chunk = &self.chunks[pos / CHUNK_SIZE];
            let within = pos % CHUNK_SIZE;
            let n = (CHUNK_SIZE - within).min(available - done);
            buf[done..done + n].copy_from_slice(&chunk[within..within + n]);
            done += n;
        }
        Ok(available)
    }

    /// Append `data`; `offset` must equal the current size, except that
    /// bytes already written may be rewritten in place.
    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        if offset > self.size {
            return Err(Error::misuse(format!(
                "memory journal write at {offset} leaves a gap after {}",
                self.size
            )));
        }
        let end = offset as usize + data.len();
        while self.chunks.len() * CHUNK_SIZE < end {
            self.chunks.push(vec![0u8; CHUNK_SIZE].into_boxed_slice());
        }
        let mut done = 0;
        while done < data.len() {
            let pos = offset as usize + done;
            let chunk = &mut self.chunks[pos / CHUNK_SIZE];
            let within = pos % CHUNK_SIZE;
            let n = (CHUNK_SIZE - within).min(data.len() - done);
            chunk[within..within + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        self.size = self.size.max(end as u64);
        Ok(())
    }

    /// Only shrinking is supported.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        if size > self.size {
            return Err(Error::misuse("memory journal cannot grow by truncation"));
        }
        self.size = size;
        let keep = (size as usize).div_ceil(CHUNK_SIZE);
        self.chunks.truncate(keep);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_across_chunks() -> anyhow::Result<()> {
        let mut journal = MemoryJournal::new();
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 100).map(|i| (i % 251) as u8).collect();
        journal.write(&data[..500], 0)?;
        journal.write(&data[500..], 500)?;
        assert_eq!(journal.size(), data.len() as u64);

        let mut out = vec![0u8; 300];
        let n = journal.read(&mut out, CHUNK_SIZE as u64 - 150)?;
        assert_eq!(n, 300);
        assert_eq!(&out[..], &data[CHUNK_SIZE - 150..CHUNK_SIZE + 150]);
        Ok(())
    }

    #[test]
    fn test_short_read_zero_fills() -> anyhow::Result<()> {
        let mut journal = MemoryJournal::new();
        journal.write(b"abc", 0)?;
        let mut out = [0xFFu8; 8];
        assert_eq!(journal.read(&mut out, 1)?, 2);
        assert_eq!(&out, b"bc\0\0\0\0\0\0");
        assert_eq!(journal.read(&mut out, 10)?, 0);
        Ok(())
    }

    #[test]
    fn test_gap_write_is_misuse() {
        let mut journal = MemoryJournal::new();
        let err = journal.write(b"x", 4).unwrap_err();
        assert!(matches!(err, Error::Misuse(_)));
    }

    #[test]
    fn test_rewrite_header_in_place() -> anyhow::Result<()> {
        let mut journal = MemoryJournal::new();
        journal.write(&[0u8; 16], 0)?;
        journal.write(&[7u8; 4], 8)?;
        let mut out = [0u8; 16];
        journal.read(&mut out, 0)?;
        assert_eq!(&out[8..12], &[7; 4]);
        assert_eq!(journal.size(), 16);
        Ok(())
    }

    #[test]
    fn test_truncate() -> anyhow::Result<()> {
        let mut journal = MemoryJournal::new();
        journal.write(&[1u8; CHUNK_SIZE + 10], 0)?;
        journal.truncate(0)?;
        assert_eq!(journal.size(), 0);
        journal.write(b"again", 0)?;
        assert_eq!(journal.size(), 5);
        assert!(journal.truncate(100).is_err());
        Ok(())
    }
}
