//! # Page Manager
//!
//! The `PageManager` owns the store file and everything process-wide: the
//! page allocator, the free list, and the registry of open entry pages. It
//! is a cheap cloneable handle; clones and the entries they hand out share
//! one file descriptor and one set of locked state.
//!
//! ## Allocation Strategy
//!
//! When a page is needed:
//!
//! 1. If recycling is enabled, drain the free list's pending buffer (backing
//!    pages freed from its own dismantled nodes), then pop the most recently
//!    parked page from the recycling tree. Either way the page's watermark
//!    is reset and its stale bytes stay unreachable.
//! 2. Otherwise extend the file: round the current length up to the next
//!    `PAGE_SIZE` multiple (never below `DATA_OFFSET`; page 0 belongs to
//!    the free-list anchor) and zero the fresh page on disk.
//!
//! The recycling flag is a re-entrancy guard, not a feature toggle: every
//! recycling-page mutation clears it for the duration of the call and
//! restores the prior value on exit, so an allocation triggered *by* the
//! free list can never try to pop *from* the free list mid-mutation.
//!
//! ## Startup
//!
//! `new` keeps its two branches strictly apart: an existing non-empty file
//! is opened and its free list recovered from the anchor at offset 0; a
//! missing (or empty) file is initialized with a zeroed anchor page and an
//! empty free list. Durability of everything else is governed by
//! [`Entry::sync`](crate::Entry::sync).

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::config::{DATA_OFFSET, FREE_LIST_OFFSET, PAGE_SIZE};
use crate::entry::{Entry, EntryPage};
use crate::physical::PhysicalPage;
use crate::recycling::RecyclingPage;
use crate::tiered::{scan_anchor, AllocatePage, TieredPage};

static ZERO_PAGE: [u8; PAGE_SIZE as usize] = [0u8; PAGE_SIZE as usize];

/// Stable handle to an entry: the file offset of its anchor page. Suitable
/// for opaque external persistence as a 64-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(i64);

impl Identifier {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for Identifier {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl From<Identifier> for i64 {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct ManagerInner {
    recycling: RecyclingPage,
    recycling_enabled: bool,
    entries: HashMap<Identifier, Arc<EntryPage>>,
}

#[derive(Debug)]
pub(crate) struct ManagerShared {
    file: Arc<File>,
    inner: Mutex<ManagerInner>,
}

impl ManagerShared {
    pub(crate) fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Allocates one page, recycled or fresh. Safe to call from any thread;
    /// takes the manager mutex for the duration.
    pub(crate) fn allocate_page(&self) -> Result<Arc<PhysicalPage>> {
        let mut inner = self.inner.lock();
        allocate_locked(&mut inner, &self.file)
    }

    /// Parks a batch of released pages in the free list. Recycling is
    /// disabled for the duration so the free list's own allocations come
    /// from the file tail.
    pub(crate) fn release_pages(&self, pages: Vec<Arc<PhysicalPage>>) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        debug!("recycling {} released pages", pages.len());

        let prev = std::mem::replace(&mut inner.recycling_enabled, false);
        let inner = &mut *inner;
        let mut alloc = TailAllocator::new(&self.file);
        let result = inner.recycling.add_pages(&mut alloc, &pages);
        inner.recycling_enabled = prev;
        result
    }

    /// Rewrites the free list's live anchor slot at offset 0.
    pub(crate) fn flush_free_list(&self) -> Result<()> {
        self.inner.lock().recycling.flush_anchor()
    }

    /// Drops one handle on an entry page; unregisters it when it was the
    /// last.
    pub(crate) fn release_entry(&self, ep: &Arc<EntryPage>) {
        let mut inner = self.inner.lock();
        if ep.remove_instance() {
            inner.entries.remove(&ep.id());
        }
    }
}

fn allocate_locked(inner: &mut ManagerInner, file: &Arc<File>) -> Result<Arc<PhysicalPage>> {
    if inner.recycling_enabled {
        if let Some(page) = inner.recycling.take_pending() {
            page.reset();
            trace!("reusing pending free-list page at offset {}", page.file_off());
            return Ok(page);
        }
        if inner.recycling.len() > 0 {
            let prev = std::mem::replace(&mut inner.recycling_enabled, false);
            let result = inner.recycling.pop_page();
            inner.recycling_enabled = prev;

            let page = result?;
            page.reset();
            trace!("recycled page at offset {}", page.file_off());
            return Ok(page);
        }
    }
    tail_allocate(file)
}

/// Appends one zeroed page at the end of the file.
fn tail_allocate(file: &Arc<File>) -> Result<Arc<PhysicalPage>> {
    let len = file
        .metadata()
        .wrap_err("failed to stat the store file")?
        .len() as i64;
    let off = (((len + PAGE_SIZE - 1) / PAGE_SIZE) * PAGE_SIZE).max(DATA_OFFSET);

    file.write_all_at(&ZERO_PAGE, off as u64)
        .wrap_err_with(|| format!("failed to zero a fresh page at offset {off}"))?;
    trace!("allocated page at offset {off} from the file tail");
    Ok(Arc::new(PhysicalPage::new(file.clone(), off)))
}

/// Allocator adapter for tree mutations running outside the manager mutex
/// (entry appends). Each allocation takes the mutex and may recycle.
pub(crate) struct ManagedAllocator<'a> {
    shared: &'a ManagerShared,
}

impl<'a> ManagedAllocator<'a> {
    pub(crate) fn new(shared: &'a ManagerShared) -> Self {
        Self { shared }
    }
}

impl AllocatePage for ManagedAllocator<'_> {
    fn allocate_page(&mut self) -> Result<Arc<PhysicalPage>> {
        self.shared.allocate_page()
    }
}

/// Allocator adapter that only ever grows the file. Used inside the manager
/// mutex, where the free list may be mid-mutation.
pub(crate) struct TailAllocator<'a> {
    file: &'a Arc<File>,
}

impl<'a> TailAllocator<'a> {
    pub(crate) fn new(file: &'a Arc<File>) -> Self {
        Self { file }
    }
}

impl AllocatePage for TailAllocator<'_> {
    fn allocate_page(&mut self) -> Result<Arc<PhysicalPage>> {
        tail_allocate(self.file)
    }
}

/// Handle to one page store. Clones share the underlying file and state.
#[derive(Debug, Clone)]
pub struct PageManager {
    shared: Arc<ManagerShared>,
}

impl PageManager {
    /// Opens the store at `path`, recovering the free list from an existing
    /// non-empty file or initializing a fresh one. The two branches never
    /// cross: an existing file is never truncated.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let existing = match std::fs::metadata(path) {
            Ok(meta) => meta.len() > 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("failed to stat '{}'", path.display()))
            }
        };

        let (file, recycling) = if existing {
            let file = Arc::new(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .wrap_err_with(|| format!("failed to open store '{}'", path.display()))?,
            );

            let anchor = Arc::new(PhysicalPage::recovered(
                file.clone(),
                FREE_LIST_OFFSET,
                PAGE_SIZE,
            ));
            let (height, used, root_off) =
                scan_anchor(&anchor).wrap_err("failed to locate the free-list root")?;
            let tiered = TieredPage::recover(&file, anchor, height, used, root_off)
                .wrap_err("failed to recover the free list")?;
            debug!(
                "recovered store '{}' with {} free pages",
                path.display(),
                tiered.leaf_count()
            );
            (file, RecyclingPage::new(tiered))
        } else {
            let file = Arc::new(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)
                    .wrap_err_with(|| format!("failed to create store '{}'", path.display()))?,
            );

            // Page 0 is the free-list anchor.
            file.write_all_at(&ZERO_PAGE, FREE_LIST_OFFSET as u64)
                .wrap_err("failed to initialize the free-list anchor")?;
            let anchor = Arc::new(PhysicalPage::new(file.clone(), FREE_LIST_OFFSET));
            let root_backing = tail_allocate(&file)?;
            let tiered = TieredPage::new_empty(anchor, root_backing)?;
            debug!("initialized new store '{}'", path.display());
            (file, RecyclingPage::new(tiered))
        };

        Ok(Self {
            shared: Arc::new(ManagerShared {
                file,
                inner: Mutex::new(ManagerInner {
                    recycling,
                    recycling_enabled: true,
                    entries: HashMap::new(),
                }),
            }),
        })
    }

    /// Creates a new empty entry and returns it with its identifier.
    pub fn create(&self) -> Result<(Entry, Identifier)> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();

        let anchor = allocate_locked(&mut inner, &shared.file)?;
        let root_backing = allocate_locked(&mut inner, &shared.file)?;
        let id = Identifier(anchor.file_off());
        let tiered = TieredPage::new_empty(anchor, root_backing)
            .wrap_err("failed to initialize a new entry page")?;

        let ep = Arc::new(EntryPage::new(id, tiered));
        inner.entries.insert(id, ep.clone());
        debug!("created entry {id}");

        Ok((Entry::new(shared.clone(), ep), id))
    }

    /// Opens a previously created entry. A registered entry page is shared;
    /// otherwise the tree is recovered from the anchor at the identifier's
    /// offset.
    pub fn open(&self, id: Identifier) -> Result<Entry> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();

        if let Some(ep) = inner.entries.get(&id) {
            ep.add_instance();
            return Ok(Entry::new(shared.clone(), ep.clone()));
        }

        let file_len = shared
            .file
            .metadata()
            .wrap_err("failed to stat the store file")?
            .len() as i64;
        ensure!(
            id.0 >= DATA_OFFSET && id.0 % PAGE_SIZE == 0 && id.0 < file_len,
            "unknown entry identifier {id}"
        );

        let anchor = Arc::new(PhysicalPage::recovered(shared.file.clone(), id.0, PAGE_SIZE));
        let (height, used, root_off) =
            scan_anchor(&anchor).wrap_err_with(|| format!("failed to open entry {id}"))?;
        let tiered = TieredPage::recover(&shared.file, anchor, height, used, root_off)
            .wrap_err_with(|| format!("failed to recover entry {id}"))?;
        debug!("opened entry {id} with {} pages", tiered.leaf_count());

        let ep = Arc::new(EntryPage::new(id, tiered));
        inner.entries.insert(id, ep.clone());
        Ok(Entry::new(shared.clone(), ep))
    }

    /// Number of entry pages currently held open by live `Entry` handles.
    pub fn open_entries(&self) -> usize {
        self.shared.inner.lock().entries.len()
    }

    /// Number of pages parked in the free list.
    pub fn free_pages(&self) -> usize {
        self.shared.inner.lock().recycling.len()
    }

    /// Flushes the store file and releases this handle. The descriptor
    /// closes once the last clone and the last `Entry` are gone.
    pub fn close(self) -> Result<()> {
        self.shared
            .file
            .sync_all()
            .wrap_err("failed to sync the store file on close")?;
        Ok(())
    }
}
