//! # Configuration Constants
//!
//! This module centralizes the on-disk geometry constants. Values that are
//! derived from each other are co-located and checked with compile-time
//! assertions so the file format cannot drift out of self-consistency.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> FAN_OUT (derived: (PAGE_SIZE - 8) / 8)
//!       │     A marshalled page-table node is one u64 child count followed
//!       │     by up to FAN_OUT i64 child offsets; it must fit in the node's
//!       │     backing page.
//!       │
//!       ├─> ANCHOR_SLOT_COUNT (derived: PAGE_SIZE / ANCHOR_SLOT_SIZE)
//!       │     One anchor slot per possible root height. 256 heights covers
//!       │     any file a 64-bit offset can address many times over.
//!       │
//!       └─> DATA_OFFSET (1 page)
//!             Page 0 is reserved for the free-list anchor; allocatable
//!             pages start immediately after it.
//!
//! ANCHOR_SLOT_SIZE (16 bytes)
//!       │
//!       └─> One (i64 used_bytes, i64 page_offset) record, little-endian.
//! ```
//!
//! ## File Layout
//!
//! ```text
//! Offset 0:        free-list anchor page (ANCHOR_SLOT_COUNT slots)
//! Offset 4096:     page 1 ─┐
//! Offset 8192:     page 2  ├─ append-only arena of PAGE_SIZE pages
//! Offset 12288:    page 3 ─┘
//! ```
//!
//! All offsets and sizes are `i64`: the on-disk formats are signed 64-bit
//! little-endian, and negative values are argument errors at the API
//! boundary.

/// Size in bytes of a physical page on disk.
pub const PAGE_SIZE: i64 = 4096;

/// Size of one anchor slot: an `(i64 used_bytes, i64 page_offset)` pair.
pub const ANCHOR_SLOT_SIZE: i64 = 16;

/// Maximum number of children a marshalled page-table node can point to.
/// 8 bytes for the child count and 8 for each child offset.
pub const FAN_OUT: i64 = (PAGE_SIZE - 8) / 8;

/// Number of anchor slots in one anchor page, indexed by root height.
pub const ANCHOR_SLOT_COUNT: i64 = PAGE_SIZE / ANCHOR_SLOT_SIZE;

/// File offset of the free-list anchor page.
pub const FREE_LIST_OFFSET: i64 = 0;

/// File offset of the first allocatable page.
pub const DATA_OFFSET: i64 = PAGE_SIZE;

const _: () = assert!(FAN_OUT == 511);
const _: () = assert!(ANCHOR_SLOT_COUNT == 256);
const _: () = assert!(8 + FAN_OUT * 8 <= PAGE_SIZE);
const _: () = assert!(DATA_OFFSET % PAGE_SIZE == 0);

/// Number of leaf pages a tree of the given root height can address.
/// Saturates instead of overflowing: a saturated capacity simply means the
/// tree never needs another extension at that height.
#[inline]
pub fn max_leaves(height: u32) -> u64 {
    (FAN_OUT as u64).saturating_pow(height + 1)
}

/// Number of bytes a tree of the given root height fully covers.
#[inline]
pub fn max_bytes(height: u32) -> i64 {
    max_leaves(height)
        .saturating_mul(PAGE_SIZE as u64)
        .min(i64::MAX as u64) as i64
}
