//! Overflow chains: each page holds the next page number followed by
//! `usable - 4` payload bytes.

use log::trace;

use crate::buffer::{Pointer, PointerMut};
use crate::error::{Error, Result};
use crate::pager::{PageNo, Pager};

const OFFSET_NEXT: usize = 0;
const OFFSET_DATA: usize = 4;

fn per_page(pager: &Pager) -> usize {
    pager.usable_size() - OFFSET_DATA
}

/// Store `data` in a new chain and return its first page.
pub fn write_chain(pager: &mut Pager, data: &[u8]) -> Result<PageNo> {
    let chunks: Vec<&[u8]> = data.chunks(per_page(pager)).collect();
    let mut pages = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        let page = pager.allocate_page()?;
        pages.push(page.pgno());
        pager.release_page(page);
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let next = pages.get(i + 1).copied().unwrap_or(0);
        pager.with_page(pages[i], false, |pager, page| {
            let data = pager.write_page(page)?;
            let mut p = PointerMut::new(data);
            p.put_u32(OFFSET_NEXT, next);
            p.copy_from(OFFSET_DATA, chunk);
            Ok(())
        })?;
    }
    trace!("wrote {} byte overflow chain over {} pages", data.len(), pages.len());
    pages.first().copied().ok_or_else(|| Error::misuse("empty overflow chain"))
}

/// Pages of a chain holding `len` bytes.
pub fn chain_pages(pager: &mut Pager, first: PageNo, len: usize) -> Result<Vec<PageNo>> {
    let expected = len.div_ceil(per_page(pager));
    let mut pages = Vec::with_capacity(expected);
    let mut next = first;
    while pages.len() < expected {
        check_link(pager, next)?;
        pages.push(next);
        next = pager.with_page(next, false, |pager, page| {
            Ok(Pointer::new(pager.page_data(page)).get_u32(OFFSET_NEXT))
        })?;
    }
    if next != 0 {
        return Err(Error::corrupt(format!(
            "overflow chain at page {first} is longer than its payload"
        )));
    }
    Ok(pages)
}

/// Append `len` bytes from the chain starting at `first` to `out`.
pub fn read_chain(pager: &mut Pager, first: PageNo, len: usize, out: &mut Vec<u8>) -> Result<()> {
    let per_page = per_page(pager);
    let mut remaining = len;
    let mut next = first;
    while remaining > 0 {
        check_link(pager, next)?;
        let take = remaining.min(per_page);
        next = pager.with_page(next, false, |pager, page| {
            let p = Pointer::new(pager.page_data(page));
            out.extend_from_slice(p.bytes(OFFSET_DATA, take));
            Ok(p.get_u32(OFFSET_NEXT))
        })?;
        remaining -= take;
    }
    Ok(())
}

/// Move every page of a chain to the freelist.
pub fn free_chain(pager: &mut Pager, first: PageNo, len: usize) -> Result<()> {
    for pgno in chain_pages(pager, first, len)? {
        let page = pager.acquire_page(pgno, false)?;
        pager.free_page(page)?;
    }
    Ok(())
}

fn check_link(pager: &Pager, pgno: PageNo) -> Result<()> {
    if pgno < 2 || pgno > pager.page_count() {
        return Err(Error::corrupt(format!("overflow chain links to page {pgno}")));
    }
    Ok(())
}
