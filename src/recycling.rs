//! # Page Recycling
//!
//! Pages released by truncation and defragmentation are not returned to the
//! OS; they are parked in the recycling page, a tiered page whose anchor
//! lives at file offset 0, and handed back out by the allocator before the
//! file is ever grown.
//!
//! ## Free Pages Are "Full"
//!
//! Every page in the recycling tree has its watermark forced to `PAGE_SIZE`
//! on entry. The tiered-page arithmetic (used size, leaf counts, anchor
//! records) then stays regular: the free list's used size is always an exact
//! page multiple and recovery needs no special casing.
//!
//! ## Re-entrancy
//!
//! Mutating the recycling tree can itself allocate (a new page-table node
//! needs a backing page) and can itself free (an emptied node's backing
//! page). Allocating *from* the free list mid-mutation would re-enter the
//! tree being modified, so the manager clears its recycling flag around
//! every call in here and those allocations fall through to the file tail.
//! Backing pages freed by [`RecyclingPage::pop_page`] are not re-inserted
//! either; they sit in an in-memory `pending` buffer that the allocator
//! drains first. Pending pages are lost on crash; the engine only promises
//! durability after `sync`.

use std::sync::Arc;

use eyre::Result;

use crate::config::PAGE_SIZE;
use crate::physical::PhysicalPage;
use crate::tiered::{AllocatePage, TieredPage};

#[derive(Debug)]
pub struct RecyclingPage {
    tiered: TieredPage,
    pending: Vec<Arc<PhysicalPage>>,
}

impl RecyclingPage {
    pub fn new(tiered: TieredPage) -> Self {
        Self {
            tiered,
            pending: Vec::new(),
        }
    }

    /// Number of pages parked in the tree (the pending buffer not included).
    pub fn len(&self) -> usize {
        self.tiered.leaf_count()
    }

    /// Parks a batch of released pages. The only mutating add: each page
    /// contributes exactly `PAGE_SIZE` to the free list's used size.
    pub fn add_pages(
        &mut self,
        alloc: &mut dyn AllocatePage,
        pages: &[Arc<PhysicalPage>],
    ) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        for page in pages {
            page.set_used(PAGE_SIZE);
            self.tiered.push_page(page.clone());
        }
        self.tiered
            .insert_pages(pages, pages.len() as i64 * PAGE_SIZE, alloc)
    }

    /// Takes the most recently parked page out of the tree. Backing pages of
    /// interior nodes emptied by the removal land in the pending buffer.
    pub fn pop_page(&mut self) -> Result<Arc<PhysicalPage>> {
        let (page, freed) = self.tiered.pop_tail_page()?;
        self.pending.extend(freed);
        Ok(page)
    }

    /// Hands out a page freed from the free list's own structure, if any.
    pub fn take_pending(&mut self) -> Option<Arc<PhysicalPage>> {
        self.pending.pop()
    }

    /// Rewrites the live anchor slot at offset 0.
    pub fn flush_anchor(&self) -> Result<()> {
        self.tiered.write_live_slot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::TailAllocator;
    use crate::tiered::scan_anchor;
    use std::fs::OpenOptions;

    fn test_recycling() -> (tempfile::TempDir, Arc<std::fs::File>, RecyclingPage) {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(dir.path().join("pages.db"))
                .unwrap(),
        );
        let mut alloc = TailAllocator::new(&file);
        let anchor = alloc.allocate_page().unwrap();
        let root = alloc.allocate_page().unwrap();
        let rp = RecyclingPage::new(TieredPage::new_empty(anchor, root).unwrap());
        (dir, file, rp)
    }

    #[test]
    fn parked_pages_are_treated_as_full() {
        let (_dir, file, mut rp) = test_recycling();
        let mut alloc = TailAllocator::new(&file);

        let page = alloc.allocate_page().unwrap();
        page.write_at(&[1u8; 100], 0).unwrap();
        rp.add_pages(&mut alloc, &[page.clone()]).unwrap();

        assert_eq!(rp.len(), 1);
        assert_eq!(page.used(), PAGE_SIZE);
    }

    #[test]
    fn pop_returns_pages_most_recent_first() {
        let (_dir, file, mut rp) = test_recycling();
        let mut alloc = TailAllocator::new(&file);

        let a = alloc.allocate_page().unwrap();
        let b = alloc.allocate_page().unwrap();
        rp.add_pages(&mut alloc, &[a.clone(), b.clone()]).unwrap();

        assert_eq!(rp.pop_page().unwrap().file_off(), b.file_off());
        assert_eq!(rp.pop_page().unwrap().file_off(), a.file_off());
        assert_eq!(rp.len(), 0);
        assert!(rp.take_pending().is_none());
    }

    #[test]
    fn pop_from_empty_list_is_an_error() {
        let (_dir, _file, mut rp) = test_recycling();
        assert!(rp.pop_page().is_err());
    }

    #[test]
    fn anchor_tracks_parked_page_count() {
        let (_dir, file, mut rp) = test_recycling();
        let mut alloc = TailAllocator::new(&file);

        let pages: Vec<_> = (0..3).map(|_| alloc.allocate_page().unwrap()).collect();
        rp.add_pages(&mut alloc, &pages).unwrap();

        let (_height, used, _off) = scan_anchor(rp.tiered.anchor()).unwrap();
        assert_eq!(used, 3 * PAGE_SIZE);
    }
}
