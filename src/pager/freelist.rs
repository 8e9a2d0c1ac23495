//! Free-page list kept in trunk pages.
//!
//! The header points at the first trunk. Each trunk holds the next trunk's
//! page number, a leaf count and that many leaf page numbers.

use log::trace;

use crate::buffer::{Pointer, PointerMut};
use crate::error::{Error, Result};

use super::header::{OFFSET_FREELIST_COUNT, OFFSET_FREELIST_TRUNK};
use super::{PageNo, PageRef, Pager};

const TRUNK_NEXT: usize = 0;
const TRUNK_LEAF_COUNT: usize = 4;
const TRUNK_LEAVES: usize = 8;

/// Leaf slots in one trunk page.
pub fn trunk_capacity(usable_size: usize) -> usize {
    usable_size / 4 - 2
}

impl Pager {
    /// A zeroed, writable page: reused from the freelist when possible,
    /// otherwise appended to the file.
    pub fn allocate_page(&mut self) -> Result<PageRef> {
        if !self.state().is_writing() {
            return Err(Error::misuse("page allocated outside a write transaction"));
        }
        let reused = self.with_page(1, false, |pager, header_page| {
            let head = Pointer::new(pager.page_data(header_page));
            let trunk = head.get_u32(OFFSET_FREELIST_TRUNK);
            let count = head.get_u32(OFFSET_FREELIST_COUNT);
            if trunk == 0 || count == 0 {
                return Ok(None);
            }
            let pgno = pager.take_free_page(trunk)?;
            let data = pager.write_page(header_page)?;
            let mut head = PointerMut::new(data);
            head.put_u32(OFFSET_FREELIST_COUNT, count - 1);
            if pgno == trunk {
                let next = pager.with_page(trunk, false, |pager, page| {
                    Ok(Pointer::new(pager.page_data(page)).get_u32(TRUNK_NEXT))
                })?;
                let data = pager.write_page(header_page)?;
                PointerMut::new(data).put_u32(OFFSET_FREELIST_TRUNK, next);
            }
            Ok(Some(pgno))
        })?;

        let pgno = match reused {
            Some(pgno) => {
                trace!("reusing free page {}", pgno);
                pgno
            }
            None => {
                let next = self.page_count() + 1;
                if next > self.max_page_count {
                    return Err(Error::Full);
                }
                next
            }
        };
        let page = self.acquire_page(pgno, true)?;
        match self.write_page(&page) {
            Ok(data) => {
                data.fill(0);
                Ok(page)
            }
            Err(e) => {
                self.release_page(page);
                Err(e)
            }
        }
    }

    /// Pop a leaf off `trunk`, or hand back the trunk itself when it has
    /// no leaves left.
    fn take_free_page(&mut self, trunk: PageNo) -> Result<PageNo> {
        let db_size = self.page_count();
        self.with_page(trunk, false, |pager, page| {
            let p = Pointer::new(pager.page_data(page));
            let leaves = p.get_u32(TRUNK_LEAF_COUNT) as usize;
            if leaves > trunk_capacity(pager.usable_size()) {
                return Err(Error::corrupt(format!(
                    "freelist trunk {trunk} claims {leaves} leaves"
                )));
            }
            if leaves == 0 {
                return Ok(trunk);
            }
            let leaf = p.get_u32(TRUNK_LEAVES + 4 * (leaves - 1));
            if leaf < 2 || leaf > db_size {
                return Err(Error::corrupt(format!(
                    "freelist leaf {leaf} out of range"
                )));
            }
            let data = pager.write_page(page)?;
            PointerMut::new(data).put_u32(TRUNK_LEAF_COUNT, leaves as u32 - 1);
            Ok(leaf)
        })
    }

    /// Put a page on the freelist. The reference is consumed.
    pub fn free_page(&mut self, page: PageRef) -> Result<()> {
        let pgno = page.pgno();
        self.release_page(page);
        if !self.state().is_writing() {
            return Err(Error::misuse("page freed outside a write transaction"));
        }
        if pgno < 2 || pgno > self.page_count() {
            return Err(Error::corrupt(format!("cannot free page {pgno}")));
        }
        trace!("freeing page {}", pgno);

        self.with_page(1, false, |pager, header_page| {
            let head = Pointer::new(pager.page_data(header_page));
            let trunk = head.get_u32(OFFSET_FREELIST_TRUNK);
            let count = head.get_u32(OFFSET_FREELIST_COUNT);

            let appended = trunk != 0
                && pager.with_page(trunk, false, |pager, trunk_page| {
                    let leaves = Pointer::new(pager.page_data(trunk_page)).get_u32(TRUNK_LEAF_COUNT);
                    if leaves as usize >= trunk_capacity(pager.usable_size()) {
                        return Ok(false);
                    }
                    let data = pager.write_page(trunk_page)?;
                    let mut p = PointerMut::new(data);
                    p.put_u32(TRUNK_LEAVES + 4 * leaves as usize, pgno);
                    p.put_u32(TRUNK_LEAF_COUNT, leaves + 1);
                    Ok(true)
                })?;

            if !appended {
                // The freed page becomes the new first trunk.
                pager.with_page(pgno, false, |pager, new_trunk| {
                    let data = pager.write_page(new_trunk)?;
                    data.fill(0);
                    PointerMut::new(data).put_u32(TRUNK_NEXT, trunk);
                    Ok(())
                })?;
            }

            let data = pager.write_page(header_page)?;
            let mut head = PointerMut::new(data);
            head.put_u32(OFFSET_FREELIST_COUNT, count + 1);
            if !appended {
                head.put_u32(OFFSET_FREELIST_TRUNK, pgno);
            }
            Ok(())
        })
    }

    /// Every page on the freelist, trunks included.
    pub fn freelist_pages(&mut self) -> Result<Vec<PageNo>> {
        let db_size = self.page_count();
        if db_size == 0 {
            return Ok(Vec::new());
        }
        let (mut trunk, count) = self.with_page(1, false, |pager, page| {
            let head = Pointer::new(pager.page_data(page));
            Ok((head.get_u32(OFFSET_FREELIST_TRUNK), head.get_u32(OFFSET_FREELIST_COUNT)))
        })?;

        let mut pages = Vec::new();
        while trunk != 0 {
            if trunk > db_size || pages.len() > count as usize {
                return Err(Error::corrupt(format!("freelist trunk {trunk} is invalid")));
            }
            pages.push(trunk);
            trunk = self.with_page(trunk, false, |pager, page| {
                let p = Pointer::new(pager.page_data(page));
                let leaves = p.get_u32(TRUNK_LEAF_COUNT) as usize;
                if leaves > trunk_capacity(pager.usable_size()) {
                    return Err(Error::corrupt(format!("freelist trunk claims {leaves} leaves")));
                }
                for i in 0..leaves {
                    pages.push(p.get_u32(TRUNK_LEAVES + 4 * i));
                }
                Ok(p.get_u32(TRUNK_NEXT))
            })?;
        }
        if pages.len() != count as usize {
            return Err(Error::corrupt(format!(
                "freelist holds {} pages, header says {count}",
                pages.len()
            )));
        }
        Ok(pages)
    }
}
