//! # Entries
//!
//! An `Entry` is the user-visible byte stream: a cursor over the ordered
//! leaf pages of one entry page. It behaves like a file (`read`, `write`,
//! `seek`, `read_at`/`write_at`, `truncate`, `sync`) while the tiered page
//! underneath takes care of where the bytes physically live.
//!
//! ## Locking Discipline
//!
//! Every entry page carries one reader/writer lock over its tree state.
//!
//! - `read`/`read_at` run entirely under the read lock.
//! - `write`/`write_at` start under the read lock. Overwrites of existing
//!   bytes never block each other: the page watermark only moves through an
//!   atomic `fetch_max`, which in-bounds writes leave untouched. The first
//!   iteration that must *append* (cursor at the end sentinel, or the tail
//!   page about to grow past its watermark) drops the read lock, takes the
//!   write lock, and re-examines the state (it may have changed while
//!   waiting).
//! - `truncate` takes the write lock outright.
//!
//! Lock order is always entry-page lock before manager mutex; the manager
//! never takes an entry-page lock while holding its own.
//!
//! ## Cursor Semantics
//!
//! The cursor is `(page index, offset within page)`; its byte position is
//! `page * PAGE_SIZE + off`. Seeking past the last page clamps to the
//! sentinel `(leaf_count, 0)`, which reads interpret as end-of-stream and
//! writes as "start appending". `SeekFrom::End` is therefore page-granular:
//! it lands after the last page, not after the last byte. `read_at` and
//! `write_at` run on a private cursor copy and never disturb the entry's
//! own cursor.

use std::io;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use smallvec::SmallVec;

use crate::config::PAGE_SIZE;
use crate::manager::{Identifier, ManagedAllocator, ManagerShared};
use crate::physical::PhysicalPage;
use crate::tiered::TieredPage;

/// The head of one entry: its tiered page behind the entry's reader/writer
/// lock, plus the count of live `Entry` handles referring to it. The counter
/// is read and written only under the manager mutex.
#[derive(Debug)]
pub(crate) struct EntryPage {
    id: Identifier,
    state: RwLock<TieredPage>,
    instances: AtomicU64,
}

impl EntryPage {
    pub(crate) fn new(id: Identifier, tiered: TieredPage) -> Self {
        Self {
            id,
            state: RwLock::new(tiered),
            instances: AtomicU64::new(1),
        }
    }

    pub(crate) fn id(&self) -> Identifier {
        self.id
    }

    pub(crate) fn add_instance(&self) {
        self.instances.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one instance; returns true when it was the last.
    pub(crate) fn remove_instance(&self) -> bool {
        self.instances.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[cfg(test)]
    pub(crate) fn instance_count(&self) -> u64 {
        self.instances.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    page: i64,
    off: i64,
}

impl Cursor {
    fn pos(self) -> i64 {
        self.page * PAGE_SIZE + self.off
    }

    /// Moves the cursor by `delta` bytes, clamping to the end sentinel
    /// `(leaf_count, 0)`. A negative target position fails with
    /// `InvalidInput` and leaves the cursor unchanged.
    fn advance(&mut self, delta: i64, leaf_count: i64) -> io::Result<()> {
        let pos = self.pos() + delta;
        if pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot move the cursor to a negative position",
            ));
        }
        if pos >= leaf_count * PAGE_SIZE {
            self.page = leaf_count;
            self.off = 0;
        } else {
            self.page = pos / PAGE_SIZE;
            self.off = pos % PAGE_SIZE;
        }
        Ok(())
    }
}

/// A byte-stream handle onto one entry. Obtained from
/// [`PageManager::create`](crate::PageManager::create) or
/// [`PageManager::open`](crate::PageManager::open); dropping it releases the
/// handle and, when it was the last one, unregisters the entry page.
#[derive(Debug)]
pub struct Entry {
    shared: Arc<ManagerShared>,
    ep: Arc<EntryPage>,
    cursor: Cursor,
}

impl Entry {
    pub(crate) fn new(shared: Arc<ManagerShared>, ep: Arc<EntryPage>) -> Self {
        Self {
            shared,
            ep,
            cursor: Cursor::default(),
        }
    }

    /// The stable identifier of the underlying entry.
    pub fn id(&self) -> Identifier {
        self.ep.id()
    }

    /// Current size of the entry in bytes.
    pub fn size(&self) -> i64 {
        self.ep.state.read().used_size()
    }

    /// Number of physical pages backing the entry.
    pub fn page_count(&self) -> usize {
        self.ep.state.read().leaf_count()
    }

    /// Reads from the cursor position, advancing it by the count read.
    /// Returns `UnexpectedEof` when no byte could be produced.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.ep.state.read();
        let mut cursor = self.cursor;
        let read = read_stream(&state, &mut cursor, buf)?;
        self.cursor = cursor;
        Ok(read)
    }

    /// Reads from an absolute byte offset. The entry's cursor is untouched.
    pub fn read_at(&self, buf: &mut [u8], off: i64) -> io::Result<usize> {
        let state = self.ep.state.read();
        let mut cursor = Cursor::default();
        cursor.advance(off, state.leaf_count() as i64)?;
        read_stream(&state, &mut cursor, buf)
    }

    /// Writes at the cursor position, advancing it by the count written.
    /// Always writes the whole buffer, allocating pages as needed.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut cursor = self.cursor;
        let written = self.write_stream(&mut cursor, buf)?;
        self.cursor = cursor;
        Ok(written)
    }

    /// Writes at an absolute byte offset. The entry's cursor is untouched.
    pub fn write_at(&self, buf: &[u8], off: i64) -> io::Result<usize> {
        let mut cursor = Cursor::default();
        {
            let state = self.ep.state.read();
            cursor.advance(off, state.leaf_count() as i64)?;
        }
        self.write_stream(&mut cursor, buf)
    }

    /// Moves the cursor. `SeekFrom::End` is relative to the end of the last
    /// page. Returns the new byte position, clamped to the end sentinel.
    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<i64> {
        let state = self.ep.state.read();
        let leaf_count = state.leaf_count() as i64;

        let (mut cursor, delta) = match pos {
            SeekFrom::Start(off) => {
                let delta = i64::try_from(off).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek offset overflows i64")
                })?;
                (Cursor::default(), delta)
            }
            SeekFrom::Current(delta) => (self.cursor, delta),
            SeekFrom::End(delta) => (
                Cursor {
                    page: leaf_count,
                    off: 0,
                },
                delta,
            ),
        };

        cursor.advance(delta, leaf_count)?;
        self.cursor = cursor;
        Ok(cursor.pos())
    }

    /// Shortens the entry to `size` bytes. Freed pages go back to the free
    /// list in one batch once the tree has settled; growing is a no-op.
    /// Durable only after [`Entry::sync`].
    pub fn truncate(&mut self, size: i64) -> io::Result<()> {
        if size < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot truncate to a negative size",
            ));
        }

        let mut state = self.ep.state.write();
        if size >= state.used_size() {
            return Ok(());
        }

        let released = state.truncate(size).map_err(io::Error::other)?;
        self.shared
            .release_pages(released)
            .map_err(io::Error::other)?;
        self.shared.flush_free_list().map_err(io::Error::other)
    }

    /// Flushes the store file to disk.
    pub fn sync(&self) -> io::Result<()> {
        self.shared.file().sync_all()
    }

    /// Releases this handle. Equivalent to dropping the entry.
    pub fn close(self) {}

    fn write_stream(&self, cursor: &mut Cursor, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut read_guard = Some(self.ep.state.read());
        let mut write_guard: Option<RwLockWriteGuard<'_, TieredPage>> = None;
        let mut batch: SmallVec<[Arc<PhysicalPage>; 8]> = SmallVec::new();
        let mut added_bytes: i64 = 0;
        let mut written = 0usize;

        while written < buf.len() {
            let remaining = (buf.len() - written) as i64;

            let appending = {
                let state = current_state(&read_guard, &write_guard);
                let leaf_count = state.leaf_count() as i64;
                cursor.page >= leaf_count
                    || (cursor.page == leaf_count - 1
                        && cursor.off + remaining > state.pages()[cursor.page as usize].used())
            };
            if appending && write_guard.is_none() {
                // The state can change while we wait for exclusivity, so
                // nothing decided under the read lock carries over.
                drop(read_guard.take());
                write_guard = Some(self.ep.state.write());
                continue;
            }

            if let Some(state) = write_guard.as_mut() {
                if cursor.page >= state.leaf_count() as i64 {
                    let page = self.shared.allocate_page().map_err(io::Error::other)?;
                    state.push_page(page.clone());
                    batch.push(page);
                    continue;
                }
            }

            let state = current_state(&read_guard, &write_guard);
            let leaf_count = state.leaf_count() as i64;
            let page = &state.pages()[cursor.page as usize];
            let before = page.used();
            let n = page.write_at(&buf[written..], cursor.off)?;
            added_bytes += page.used() - before;
            written += n;
            cursor.advance(n as i64, leaf_count)?;
        }

        if let Some(state) = write_guard.as_mut() {
            if !batch.is_empty() || added_bytes > 0 {
                let mut alloc = ManagedAllocator::new(&self.shared);
                state
                    .insert_pages(&batch, added_bytes, &mut alloc)
                    .map_err(io::Error::other)?;
            }
        }

        Ok(buf.len())
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.shared.release_entry(&self.ep);
    }
}

fn current_state<'a>(
    read_guard: &'a Option<parking_lot::RwLockReadGuard<'_, TieredPage>>,
    write_guard: &'a Option<RwLockWriteGuard<'_, TieredPage>>,
) -> &'a TieredPage {
    write_guard
        .as_deref()
        .or(read_guard.as_deref())
        .expect("write stream holds neither lock")
}

fn read_stream(state: &TieredPage, cursor: &mut Cursor, buf: &mut [u8]) -> io::Result<usize> {
    let leaf_count = state.leaf_count() as i64;
    let mut total = 0usize;

    while total < buf.len() {
        if cursor.page >= leaf_count {
            break;
        }
        let page = &state.pages()[cursor.page as usize];
        match page.read_at(&mut buf[total..], cursor.off) {
            Ok(n) => {
                total += n;
                cursor.advance(n as i64, leaf_count)?;
            }
            // A partial tail page ends the stream early.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }

    if total == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "read past end of entry",
        ));
    }
    Ok(total)
}
