//! # Physical Pages
//!
//! A `PhysicalPage` is a fixed-size window into the store file: the low-level
//! building block every other component reads and writes through. It owns no
//! bytes itself; it is `(file, offset, used)` where `offset` is always a
//! `PAGE_SIZE` multiple and `used` is the live-byte watermark within the
//! window.
//!
//! ## Read/Write Contract
//!
//! ```text
//! read_at(buf, off)    off >= used       -> UnexpectedEof
//!                      off < 0           -> InvalidInput
//!                      otherwise         -> reads min(buf.len(), used - off)
//!
//! write_at(buf, off)   off >= PAGE_SIZE  -> UnexpectedEof
//!                      off < 0           -> InvalidInput
//!                      otherwise         -> writes min(buf.len(), PAGE_SIZE - off)
//!                                           used = max(used, off + written)
//! ```
//!
//! A write that runs past the page boundary is *not* an error: it writes the
//! bytes that fit and reports the short count, and the caller continues on
//! the next page. This is what lets the entry layer plaster a byte stream
//! across pages without pre-chunking.
//!
//! ## Sharing
//!
//! Pages are shared (`Arc<PhysicalPage>`) between a tiered page's ordered
//! leaf list and the tree node that owns the slot, so `used` is an
//! `AtomicI64`. Extension goes through `fetch_max`, which makes in-bounds
//! overwrites under a shared lock a no-op on the watermark; shrinking stores
//! only happen under the owning tiered page's exclusive lock.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::config::PAGE_SIZE;

#[derive(Debug)]
pub struct PhysicalPage {
    file: Arc<File>,
    file_off: i64,
    used: AtomicI64,
}

impl PhysicalPage {
    /// A fresh page with nothing live in it yet.
    pub fn new(file: Arc<File>, file_off: i64) -> Self {
        debug_assert!(file_off % PAGE_SIZE == 0);
        Self {
            file,
            file_off,
            used: AtomicI64::new(0),
        }
    }

    /// A page rebuilt from disk during recovery, before its true watermark
    /// is known. Tree nodes and interior leaves are always fully used.
    pub fn recovered(file: Arc<File>, file_off: i64, used: i64) -> Self {
        debug_assert!((0..=PAGE_SIZE).contains(&used));
        Self {
            file,
            file_off,
            used: AtomicI64::new(used),
        }
    }

    pub fn file_off(&self) -> i64 {
        self.file_off
    }

    pub fn used(&self) -> i64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn set_used(&self, used: i64) {
        debug_assert!((0..=PAGE_SIZE).contains(&used));
        self.used.store(used, Ordering::Release);
    }

    /// Clears the watermark so a recycled page can be handed out as new.
    /// Stale bytes are left in place; they are unreachable below `used`.
    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }

    pub fn read_at(&self, buf: &mut [u8], off: i64) -> io::Result<usize> {
        let used = self.used();
        if off >= used {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of page",
            ));
        }
        if off < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read at negative offset",
            ));
        }

        let len = (buf.len() as i64).min(used - off) as usize;
        self.file
            .read_exact_at(&mut buf[..len], (self.file_off + off) as u64)?;
        Ok(len)
    }

    pub fn write_at(&self, buf: &[u8], off: i64) -> io::Result<usize> {
        if off >= PAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "write past end of page",
            ));
        }
        if off < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot write at negative offset",
            ));
        }

        let len = (buf.len() as i64).min(PAGE_SIZE - off) as usize;
        self.file
            .write_all_at(&buf[..len], (self.file_off + off) as u64)?;
        self.used.fetch_max(off + len as i64, Ordering::AcqRel);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn test_page() -> (tempfile::TempDir, PhysicalPage) {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("pages.db"))
            .unwrap();
        let page = PhysicalPage::new(Arc::new(file), 0);
        (dir, page)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, page) = test_page();

        let written = page.write_at(b"hello pages", 0).unwrap();
        assert_eq!(written, 11);
        assert_eq!(page.used(), 11);

        let mut buf = [0u8; 11];
        let read = page.read_at(&mut buf, 0).unwrap();
        assert_eq!(read, 11);
        assert_eq!(&buf, b"hello pages");
    }

    #[test]
    fn read_is_bounded_by_used() {
        let (_dir, page) = test_page();
        page.write_at(&[7u8; 100], 0).unwrap();

        let mut buf = [0u8; 200];
        let read = page.read_at(&mut buf, 40).unwrap();

        assert_eq!(read, 60);
        assert_eq!(&buf[..60], &[7u8; 60]);
    }

    #[test]
    fn read_at_or_past_used_is_eof() {
        let (_dir, page) = test_page();
        page.write_at(&[1u8; 10], 0).unwrap();

        let mut buf = [0u8; 1];
        let err = page.read_at(&mut buf, 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let err = page.read_at(&mut buf, 500).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn negative_offsets_are_invalid_input() {
        let (_dir, page) = test_page();
        page.write_at(&[1u8; 10], 0).unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(
            page.read_at(&mut buf, -1).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(
            page.write_at(&buf, -1).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn write_at_page_boundary_is_eof() {
        let (_dir, page) = test_page();
        let err = page.write_at(&[1u8; 1], PAGE_SIZE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn overlong_write_is_clipped_to_page_end() {
        let (_dir, page) = test_page();

        let data = vec![3u8; PAGE_SIZE as usize];
        let written = page.write_at(&data, 100).unwrap();

        assert_eq!(written, (PAGE_SIZE - 100) as usize);
        assert_eq!(page.used(), PAGE_SIZE);
    }

    #[test]
    fn overwrite_below_watermark_keeps_used() {
        let (_dir, page) = test_page();
        page.write_at(&[9u8; 300], 0).unwrap();

        page.write_at(&[4u8; 10], 50).unwrap();

        assert_eq!(page.used(), 300);
        let mut buf = [0u8; 10];
        page.read_at(&mut buf, 50).unwrap();
        assert_eq!(buf, [4u8; 10]);
    }

    #[test]
    fn reset_clears_watermark() {
        let (_dir, page) = test_page();
        page.write_at(&[9u8; 300], 0).unwrap();

        page.reset();

        assert_eq!(page.used(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(
            page.read_at(&mut buf, 0).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }
}
