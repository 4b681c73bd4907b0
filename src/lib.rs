//! # pagestore - Embedded Single-File Paged Storage
//!
//! pagestore turns one regular file into a collection of independently
//! growable, randomly addressable byte streams ("entries"). Each entry looks
//! like an ordinary file (reads, writes, seeks, truncation at arbitrary
//! byte offsets) and survives process restarts through a stable integer
//! handle.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pagestore::PageManager;
//!
//! let store = PageManager::new("./data.pagestore")?;
//!
//! let (mut entry, id) = store.create()?;
//! entry.write(b"hello")?;
//! entry.sync()?;
//! drop(entry);
//!
//! // `id` converts to a plain i64; persist it anywhere and reopen later.
//! let mut entry = store.open(id)?;
//! let mut buf = [0u8; 5];
//! entry.read_at(&mut buf, 0)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Entry (cursor, read/write)        │
//! ├─────────────────────────────────────────┤
//! │  Entry page (RwLock + instance counter)  │
//! ├──────────────────────┬──────────────────┤
//! │      Tiered page     │  Recycling page  │
//! │  (radix tree+anchor) │   (free list)    │
//! ├──────────────────────┴──────────────────┤
//! │     Page table nodes (arena, marshal)    │
//! ├─────────────────────────────────────────┤
//! │    Physical pages (4KB pread/pwrite)     │
//! ├─────────────────────────────────────────┤
//! │   Page manager (allocator, registry)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Every entry is headed by an *anchor page* whose 16-byte slots record,
//! per historical tree height, where that root lived and how many bytes it
//! covered. Opening an entry is O(1): scan the slots, find the live root,
//! rebuild the pointer tree top-down. The free list reuses the exact same
//! machinery with its anchor pinned at file offset 0.
//!
//! ## File Layout
//!
//! ```text
//! offset 0      free-list anchor page
//! offset 4096   append-only arena of 4096-byte physical pages:
//!               entry anchors, page-table nodes, and data pages,
//!               interleaved in allocation order
//! ```
//!
//! ## Concurrency
//!
//! Entries from one store can be used from many threads. Readers of the
//! same entry run in parallel; writers to disjoint existing ranges run in
//! parallel; appends and truncations are exclusive per entry. The manager
//! serializes allocation, open/close, and the free list with one mutex.
//!
//! ## Durability
//!
//! Mutations reach the OS file immediately but are only guaranteed on disk
//! after [`Entry::sync`]. There are no cross-entry transactions and no
//! checksums; a torn write mid-mutation can lose the pages in flight, but a
//! synced anchor is always recoverable.

mod entry;
mod manager;
mod physical;
mod recycling;
mod table;
mod tiered;

pub mod config;

pub use entry::Entry;
pub use manager::{Identifier, PageManager};
