//! # Tiered Pages
//!
//! A tiered page is the pairing of a page-table tree with a single "anchor"
//! physical page that records enough of the tree's history to rediscover it
//! after a restart in O(1). Both user entries and the free list are tiered
//! pages; they differ only in the thin wrappers around this module.
//!
//! ## Anchor Layout
//!
//! The anchor holds one 16-byte slot per root height the tree has ever had:
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ----------------------------------------
//! h*16    8     used_bytes at the height-h root (i64, LE)
//! h*16+8  8     file offset of the height-h root (i64, LE)
//! ```
//!
//! Exactly one slot is *live*: the one matching the current root's height.
//! Older slots are historical "full" records: when the tree grows past a
//! root, that root's slot is frozen at the maximum byte count its height can
//! cover, *before* the new root's slot is first written. A crash therefore
//! always leaves the highest occupied slot naming either the current root or
//! a strictly-older-but-complete one, and recovery scans upward for the
//! first slot that is not full.
//!
//! Shrinking runs the protocol in reverse: when defragmentation promotes a
//! root's only child, the child's slot receives the current used size and
//! the old root's slot is zeroed.
//!
//! ## Truncation and Batched Release
//!
//! Truncation walks the tree right-to-left, shrinking the tail page or
//! releasing whole pages, and removing interior nodes that become empty.
//! Released pages are *collected*, never handed to the free list mid-walk:
//! the free list is itself a tiered page and adding to it can allocate,
//! which must not re-enter a tree that is being dismantled. The caller
//! receives the batch after defragmentation completes and forwards it to
//! the recycling layer in one call.

use std::fs::File;
use std::sync::Arc;

use eyre::{ensure, eyre, Result, WrapErr};
use zerocopy::little_endian::I64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{max_bytes, max_leaves, ANCHOR_SLOT_COUNT, ANCHOR_SLOT_SIZE, FAN_OUT, PAGE_SIZE};
use crate::physical::PhysicalPage;
use crate::table::{parse_node, NodeArena, NodeId, PageTable};

/// One anchor record: how many bytes the root at this height covered, and
/// where that root lives.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct AnchorSlot {
    used_bytes: I64,
    page_offset: I64,
}

const _: () = assert!(std::mem::size_of::<AnchorSlot>() as i64 == ANCHOR_SLOT_SIZE);

/// Supplies fresh physical pages to tree mutations. The entry path allocates
/// through the manager (which may recycle); the free list's own mutations
/// allocate straight from the file tail.
pub trait AllocatePage {
    fn allocate_page(&mut self) -> Result<Arc<PhysicalPage>>;
}

#[derive(Debug)]
pub struct TieredPage {
    anchor: Arc<PhysicalPage>,
    arena: NodeArena,
    root: NodeId,
    used_size: i64,
    pages: Vec<Arc<PhysicalPage>>,
}

impl TieredPage {
    /// Builds an empty tree: a height-0 root with no children. Persists the
    /// root's empty marshal and the live anchor slot immediately so the
    /// structure is recoverable from the moment it exists.
    pub fn new_empty(anchor: Arc<PhysicalPage>, root_backing: Arc<PhysicalPage>) -> Result<Self> {
        let mut arena = NodeArena::new();
        let root = arena.insert(PageTable::new(0, None, root_backing));
        let tp = Self {
            anchor,
            arena,
            root,
            used_size: 0,
            pages: Vec::new(),
        };
        tp.arena.write_node(root)?;
        tp.write_live_slot()?;
        Ok(tp)
    }

    pub fn anchor(&self) -> &Arc<PhysicalPage> {
        &self.anchor
    }

    pub fn used_size(&self) -> i64 {
        self.used_size
    }

    /// Every leaf page of the tree, ordered by logical index.
    pub fn pages(&self) -> &[Arc<PhysicalPage>] {
        &self.pages
    }

    pub fn leaf_count(&self) -> usize {
        self.pages.len()
    }

    pub fn root_height(&self) -> u32 {
        self.arena.get(self.root).height()
    }

    /// Appends a page to the ordered leaf list without touching the tree.
    /// The write path stages pages here first so it can fill them, then
    /// installs the batch with [`TieredPage::insert_pages`].
    pub fn push_page(&mut self, page: Arc<PhysicalPage>) {
        self.pages.push(page);
    }

    /// Installs a batch of already-staged pages into the tree and accounts
    /// the byte increase. The batch must be the tail of the leaf list.
    ///
    /// For each insert that grows the tree, the displaced root's anchor slot
    /// is frozen as a full record before the new root's slot is first used;
    /// the live slot is rewritten once at the end of the batch.
    pub fn insert_pages(
        &mut self,
        batch: &[Arc<PhysicalPage>],
        added_bytes: i64,
        alloc: &mut dyn AllocatePage,
    ) -> Result<()> {
        if batch.is_empty() && added_bytes == 0 {
            return Ok(());
        }
        assert!(
            batch.len() <= self.pages.len(),
            "insert batch was not staged on the leaf list"
        );

        let mut index = (self.pages.len() - batch.len()) as u64;
        for page in batch {
            let old_root = self.root;
            let (old_height, old_off) = {
                let node = self.arena.get(old_root);
                (node.height(), node.backing().file_off())
            };

            self.insert_page(index, page.clone(), alloc)?;

            if self.root != old_root {
                self.write_anchor_slot(old_height, max_bytes(old_height), old_off)?;
            }
            index += 1;
        }

        self.used_size += added_bytes;
        self.write_live_slot()
    }

    /// Inserts one leaf page at the given logical index, extending the tree
    /// as needed. Appends only: the index must equal the current number of
    /// leaves in the tree.
    fn insert_page(
        &mut self,
        index: u64,
        page: Arc<PhysicalPage>,
        alloc: &mut dyn AllocatePage,
    ) -> Result<()> {
        while index >= max_leaves(self.root_height()) {
            self.extend_tree(alloc)?;
        }

        let mut node = self.root;
        let mut rem = index;
        while self.arena.get(node).height() > 0 {
            let height = self.arena.get(node).height();
            let span = max_leaves(height - 1);
            let child_idx = (rem / span) as usize;
            rem %= span;

            let child_count = self.arena.get(node).tables().len();
            assert!(
                child_idx <= child_count,
                "inserting page {index} would leave a gap at table index {child_idx}"
            );
            if child_idx == child_count {
                let child = self.new_node(height - 1, Some(node), alloc)?;
                self.arena.get_mut(node).tables_mut().push(child);
                self.arena.write_node(node)?;
            }
            node = self.arena.get(node).tables()[child_idx];
        }

        let leaf = self.arena.get(node);
        assert!(
            (leaf.pages().len() as i64) < FAN_OUT,
            "leaf is full; the tree should have been extended"
        );
        assert!(
            leaf.pages().len() as u64 == rem,
            "inserting page {index} would leave a gap in its leaf"
        );
        self.arena.get_mut(node).pages_mut().push(page);
        self.arena.write_node(node)
    }

    /// Grows the tree by one level: a new root adopts the current root as
    /// its only child. Siblings materialize lazily as data is appended.
    fn extend_tree(&mut self, alloc: &mut dyn AllocatePage) -> Result<()> {
        let old_root = self.root;
        let height = self.arena.get(old_root).height() + 1;

        let new_root = self.new_node(height, None, alloc)?;
        self.arena.get_mut(new_root).tables_mut().push(old_root);
        self.arena.get_mut(old_root).set_parent(Some(new_root));
        self.arena.write_node(new_root)?;
        self.root = new_root;
        Ok(())
    }

    /// Allocates a backing page and creates a node on it. The empty marshal
    /// is persisted right away: recycled pages are not zeroed, so a parent
    /// must never point at a page whose pointer list has not been written.
    fn new_node(
        &mut self,
        height: u32,
        parent: Option<NodeId>,
        alloc: &mut dyn AllocatePage,
    ) -> Result<NodeId> {
        let backing = alloc
            .allocate_page()
            .wrap_err("failed to allocate a backing page for a page table")?;
        let id = self.arena.insert(PageTable::new(height, parent, backing));
        self.arena.write_node(id)?;
        Ok(id)
    }

    /// Shrinks the tree to `target` bytes. Pages and emptied nodes beyond
    /// the target are collected into the returned batch; the caller hands
    /// them to the recycling layer once the tree is fully settled.
    pub fn truncate(&mut self, target: i64) -> Result<Vec<Arc<PhysicalPage>>> {
        debug_assert!((0..=self.used_size).contains(&target));

        let mut released = Vec::new();
        self.truncate_node(self.root, target, &mut released)?;
        self.write_live_slot()?;
        self.defrag(&mut released)?;
        Ok(released)
    }

    fn truncate_node(
        &mut self,
        id: NodeId,
        target: i64,
        released: &mut Vec<Arc<PhysicalPage>>,
    ) -> Result<bool> {
        if self.arena.get(id).height() > 0 {
            for i in (0..self.arena.get(id).tables().len()).rev() {
                if self.used_size <= target {
                    break;
                }
                let child = self.arena.get(id).tables()[i];
                if self.truncate_node(child, target, released)? {
                    let popped = self
                        .arena
                        .get_mut(id)
                        .tables_mut()
                        .pop()
                        .expect("child list underflow");
                    assert!(popped == child, "emptied child is not the tail of its parent");
                    let removed = self.arena.remove(child);
                    released.push(removed.backing().clone());
                    self.arena.write_node(id)?;
                }
            }
            return Ok(self.arena.get(id).is_empty());
        }

        let mut removed_any = false;
        for _ in (0..self.arena.get(id).pages().len()).rev() {
            if self.used_size <= target {
                break;
            }
            let page = self
                .arena
                .get(id)
                .pages()
                .last()
                .expect("page list underflow")
                .clone();

            let excess = self.used_size - target;
            if excess < page.used() {
                page.set_used(page.used() - excess);
                self.used_size = target;
                break;
            }

            self.arena.get_mut(id).pages_mut().pop();
            let tail = self.pages.pop().expect("leaf list underflow");
            assert!(
                tail.file_off() == page.file_off(),
                "released page is not the tail of the leaf list"
            );
            self.used_size -= page.used();
            released.push(page);
            removed_any = true;
        }
        if removed_any {
            self.arena.write_node(id)?;
        }
        Ok(self.arena.get(id).is_empty())
    }

    /// Collapses single-child roots after truncation. Each promotion writes
    /// the child's anchor slot with the current used size, zeroes the old
    /// root's slot, and queues the old root's backing page for release.
    fn defrag(&mut self, released: &mut Vec<Arc<PhysicalPage>>) -> Result<()> {
        while self.root_height() > 0 && self.arena.get(self.root).child_count() == 1 {
            let old_root = self.root;
            let child = self.arena.get(old_root).tables()[0];

            let (child_height, child_off) = {
                let node = self.arena.get(child);
                (node.height(), node.backing().file_off())
            };
            self.write_anchor_slot(child_height, self.used_size, child_off)?;
            self.write_anchor_slot(self.arena.get(old_root).height(), 0, 0)?;

            let removed = self.arena.remove(old_root);
            released.push(removed.backing().clone());
            self.arena.get_mut(child).set_parent(None);
            self.root = child;
        }
        Ok(())
    }

    /// Removes and returns the last leaf page. Interior nodes that become
    /// empty on the way up are dismantled; their backing pages are returned
    /// separately for the caller to consume.
    pub fn pop_tail_page(&mut self) -> Result<(Arc<PhysicalPage>, Vec<Arc<PhysicalPage>>)> {
        ensure!(!self.pages.is_empty(), "cannot pop a page from an empty tree");

        let mut node = self.root;
        while self.arena.get(node).height() > 0 {
            node = *self
                .arena
                .get(node)
                .tables()
                .last()
                .expect("interior node with no children on the tail path");
        }

        let page = self
            .arena
            .get_mut(node)
            .pages_mut()
            .pop()
            .expect("tail leaf with no pages");
        let tail = self.pages.pop().expect("leaf list underflow");
        assert!(
            tail.file_off() == page.file_off(),
            "popped page is not the tail of the leaf list"
        );
        self.used_size -= page.used();
        self.arena.write_node(node)?;

        let mut freed = Vec::new();
        let mut current = node;
        while self.arena.get(current).is_empty() {
            let Some(parent) = self.arena.get(current).parent() else {
                break;
            };
            let popped = self
                .arena
                .get_mut(parent)
                .tables_mut()
                .pop()
                .expect("parent with no children");
            assert!(
                popped == current,
                "emptied child is not the tail of its parent"
            );
            let removed = self.arena.remove(current);
            freed.push(removed.backing().clone());
            self.arena.write_node(parent)?;
            current = parent;
        }

        self.write_live_slot()?;
        Ok((page, freed))
    }

    /// Rebuilds a tiered page from its anchor: reads pointer arrays
    /// top-down, assigns every leaf a full watermark except the final one,
    /// which receives the remainder of `used_size`.
    pub fn recover(
        file: &Arc<File>,
        anchor: Arc<PhysicalPage>,
        height: u32,
        used_size: i64,
        root_off: i64,
    ) -> Result<Self> {
        let mut arena = NodeArena::new();
        let root_backing = Arc::new(PhysicalPage::recovered(file.clone(), root_off, PAGE_SIZE));
        let root = arena.insert(PageTable::new(height, None, root_backing));

        let mut pages = Vec::new();
        let mut remaining = used_size;
        recover_node(&mut arena, file, root, height, &mut remaining, &mut pages)?;
        ensure!(
            remaining == 0,
            "anchor claims {} bytes but the tree covers only {}",
            used_size,
            used_size - remaining
        );

        Ok(Self {
            anchor,
            arena,
            root,
            used_size,
            pages,
        })
    }

    /// Rewrites the anchor slot for the current root.
    pub fn write_live_slot(&self) -> Result<()> {
        let root = self.arena.get(self.root);
        self.write_anchor_slot(root.height(), self.used_size, root.backing().file_off())
    }

    fn write_anchor_slot(&self, height: u32, used_bytes: i64, page_offset: i64) -> Result<()> {
        write_anchor_slot(&self.anchor, height, used_bytes, page_offset)
    }
}

fn recover_node(
    arena: &mut NodeArena,
    file: &Arc<File>,
    id: NodeId,
    height: u32,
    remaining: &mut i64,
    pages: &mut Vec<Arc<PhysicalPage>>,
) -> Result<()> {
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    let read = arena
        .get(id)
        .backing()
        .read_at(&mut buf, 0)
        .wrap_err("failed to read a page table from disk")?;
    let offsets = parse_node(&buf[..read])?;

    for off in offsets {
        if height > 0 {
            let backing = Arc::new(PhysicalPage::recovered(file.clone(), off, PAGE_SIZE));
            let child = arena.insert(PageTable::new(height - 1, Some(id), backing));
            arena.get_mut(id).tables_mut().push(child);
            recover_node(arena, file, child, height - 1, remaining, pages)?;
        } else {
            ensure!(
                *remaining > 0,
                "page table lists more pages than the anchor's used size covers"
            );
            let used = (*remaining).min(PAGE_SIZE);
            *remaining -= used;
            let page = Arc::new(PhysicalPage::recovered(file.clone(), off, used));
            arena.get_mut(id).pages_mut().push(page.clone());
            pages.push(page);
        }
    }
    Ok(())
}

/// Writes one anchor slot at its height-indexed offset.
pub fn write_anchor_slot(
    anchor: &PhysicalPage,
    height: u32,
    used_bytes: i64,
    page_offset: i64,
) -> Result<()> {
    let slot = AnchorSlot {
        used_bytes: I64::new(used_bytes),
        page_offset: I64::new(page_offset),
    };
    anchor.write_at(slot.as_bytes(), height as i64 * ANCHOR_SLOT_SIZE)?;
    Ok(())
}

/// Locates the live root recorded in an anchor page.
///
/// Slots are scanned from height 0 upward; the first slot whose used byte
/// count is below its height's capacity names the live root. A zero offset
/// ends the scan: the previous (full) slot is the live root, which covers
/// the crash window where a tree was exactly full but not yet extended.
pub fn scan_anchor(anchor: &PhysicalPage) -> Result<(u32, i64, i64)> {
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    anchor
        .read_at(&mut buf, 0)
        .wrap_err("failed to read an anchor page")?;

    let mut live = None;
    for height in 0..ANCHOR_SLOT_COUNT as usize {
        let start = height * ANCHOR_SLOT_SIZE as usize;
        let used = i64::from_le_bytes(buf[start..start + 8].try_into().unwrap());
        let off = i64::from_le_bytes(buf[start + 8..start + 16].try_into().unwrap());
        if off == 0 {
            break;
        }
        live = Some((height as u32, used, off));
        if used < max_bytes(height as u32) {
            break;
        }
    }

    live.ok_or_else(|| {
        eyre!(
            "anchor page at offset {} has no root slot",
            anchor.file_off()
        )
    })
}
