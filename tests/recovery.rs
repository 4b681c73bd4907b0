//! # Restart Recovery Tests
//!
//! Closing a store and reopening it from the same path must reproduce every
//! entry byte-for-byte from the anchor pages alone: tree shape, used sizes,
//! and the free list all come back from disk.

use std::io::SeekFrom;

use pagestore::config::{FAN_OUT, PAGE_SIZE};
use pagestore::{Identifier, PageManager};
use rand::RngCore;
use tempfile::tempdir;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    data
}

#[test]
fn large_entry_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let data = random_bytes(10_000 * PAGE_SIZE as usize);

    let id = {
        let pm = PageManager::new(&path).unwrap();
        let (mut entry, id) = pm.create().unwrap();
        assert_eq!(entry.write(&data).unwrap(), data.len());
        assert_eq!(entry.page_count(), 10_000);

        let mut echo = vec![0u8; data.len()];
        assert_eq!(entry.read_at(&mut echo, 0).unwrap(), data.len());
        assert_eq!(echo, data);

        entry.sync().unwrap();
        drop(entry);
        pm.close().unwrap();
        id
    };

    let pm = PageManager::new(&path).unwrap();
    let entry = pm.open(id).unwrap();

    assert_eq!(entry.page_count(), 10_000);
    assert_eq!(entry.size(), data.len() as i64);

    let mut got = vec![0u8; data.len()];
    assert_eq!(entry.read_at(&mut got, 0).unwrap(), data.len());
    assert_eq!(got, data);
}

#[test]
fn partial_tail_page_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let data = random_bytes(2 * PAGE_SIZE as usize + 700);

    let id = {
        let pm = PageManager::new(&path).unwrap();
        let (mut entry, id) = pm.create().unwrap();
        entry.write(&data).unwrap();
        entry.sync().unwrap();
        drop(entry);
        pm.close().unwrap();
        id
    };

    let pm = PageManager::new(&path).unwrap();
    let entry = pm.open(id).unwrap();

    assert_eq!(entry.size(), data.len() as i64);
    assert_eq!(entry.page_count(), 3);
    let mut got = vec![0u8; data.len()];
    entry.read_at(&mut got, 0).unwrap();
    assert_eq!(got, data);
}

#[test]
fn several_entries_recover_independently() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let mut expected: Vec<(Identifier, Vec<u8>)> = Vec::new();
    {
        let pm = PageManager::new(&path).unwrap();
        for i in 1..=3usize {
            let (mut entry, id) = pm.create().unwrap();
            let data = random_bytes(i * PAGE_SIZE as usize + i * 37);
            entry.write(&data).unwrap();
            entry.sync().unwrap();
            expected.push((id, data));
        }
        pm.close().unwrap();
    }

    let pm = PageManager::new(&path).unwrap();
    for (id, data) in &expected {
        let entry = pm.open(*id).unwrap();
        assert_eq!(entry.size(), data.len() as i64);
        let mut got = vec![0u8; data.len()];
        entry.read_at(&mut got, 0).unwrap();
        assert_eq!(&got, data);
    }
}

#[test]
fn tall_tree_recovers_with_its_height() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let pages = FAN_OUT as usize + 30;
    let data = random_bytes(pages * PAGE_SIZE as usize);

    let id = {
        let pm = PageManager::new(&path).unwrap();
        let (mut entry, id) = pm.create().unwrap();
        entry.write(&data).unwrap();
        entry.sync().unwrap();
        drop(entry);
        pm.close().unwrap();
        id
    };

    let pm = PageManager::new(&path).unwrap();
    let entry = pm.open(id).unwrap();

    assert_eq!(entry.page_count(), pages);
    let mut got = vec![0u8; data.len()];
    entry.read_at(&mut got, 0).unwrap();
    assert_eq!(got, data);
}

#[test]
fn free_list_recovers_and_feeds_the_allocator() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
        let pm = PageManager::new(&path).unwrap();
        let (mut entry, _id) = pm.create().unwrap();
        entry.write(&random_bytes(12 * PAGE_SIZE as usize)).unwrap();
        entry.truncate(2 * PAGE_SIZE).unwrap();
        assert_eq!(pm.free_pages(), 10);
        entry.sync().unwrap();
        drop(entry);
        pm.close().unwrap();
    }

    let pm = PageManager::new(&path).unwrap();
    assert_eq!(pm.free_pages(), 10);

    // New allocations drain the recovered free list before growing the file.
    let len_before = std::fs::metadata(&path).unwrap().len();
    let (mut entry, _id) = pm.create().unwrap();
    entry.write(&random_bytes(8 * PAGE_SIZE as usize)).unwrap();
    assert_eq!(pm.free_pages(), 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);
}

#[test]
fn truncated_entry_recovers_with_shrunk_size() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let data = random_bytes(6 * PAGE_SIZE as usize);

    let id = {
        let pm = PageManager::new(&path).unwrap();
        let (mut entry, id) = pm.create().unwrap();
        entry.write(&data).unwrap();
        entry.truncate(15_000).unwrap();
        entry.sync().unwrap();
        drop(entry);
        pm.close().unwrap();
        id
    };

    let pm = PageManager::new(&path).unwrap();
    let entry = pm.open(id).unwrap();

    assert_eq!(entry.size(), 15_000);
    assert_eq!(entry.page_count(), 4);
    let mut got = vec![0u8; 15_000];
    entry.read_at(&mut got, 0).unwrap();
    assert_eq!(got, &data[..15_000]);
}

#[test]
fn identifiers_round_trip_as_plain_integers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");

    let raw = {
        let pm = PageManager::new(&path).unwrap();
        let (mut entry, id) = pm.create().unwrap();
        entry.write(b"persisted externally").unwrap();
        entry.sync().unwrap();
        drop(entry);
        pm.close().unwrap();
        i64::from(id)
    };

    let pm = PageManager::new(&path).unwrap();
    let entry = pm.open(Identifier::from(raw)).unwrap();
    let mut got = vec![0u8; 20];
    entry.read_at(&mut got, 0).unwrap();
    assert_eq!(&got, b"persisted externally");
}

#[test]
fn open_handles_share_state_until_the_last_close() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let pm = PageManager::new(&path).unwrap();

    let (mut first, id) = pm.create().unwrap();
    first.write(b"counted").unwrap();
    assert_eq!(pm.open_entries(), 1);

    let second = pm.open(id).unwrap();
    assert_eq!(pm.open_entries(), 1);
    assert_eq!(second.size(), 7);

    first.close();
    assert_eq!(pm.open_entries(), 1);
    second.close();
    assert_eq!(pm.open_entries(), 0);

    // Reopening after the registry entry is gone recovers from disk.
    let mut reopened = pm.open(id).unwrap();
    assert_eq!(reopened.size(), 7);
    let mut buf = [0u8; 7];
    reopened.read(&mut buf).unwrap();
    assert_eq!(&buf, b"counted");
}

#[test]
fn writes_after_reopen_extend_the_recovered_tree() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.db");
    let head = random_bytes(3 * PAGE_SIZE as usize);

    let id = {
        let pm = PageManager::new(&path).unwrap();
        let (mut entry, id) = pm.create().unwrap();
        entry.write(&head).unwrap();
        entry.sync().unwrap();
        drop(entry);
        pm.close().unwrap();
        id
    };

    let tail = random_bytes(2 * PAGE_SIZE as usize);
    {
        let pm = PageManager::new(&path).unwrap();
        let mut entry = pm.open(id).unwrap();
        entry.seek(SeekFrom::End(0)).unwrap();
        entry.write(&tail).unwrap();
        entry.sync().unwrap();
        drop(entry);
        pm.close().unwrap();
    }

    let pm = PageManager::new(&path).unwrap();
    let entry = pm.open(id).unwrap();
    assert_eq!(entry.page_count(), 5);
    let mut got = vec![0u8; head.len() + tail.len()];
    entry.read_at(&mut got, 0).unwrap();
    assert_eq!(&got[..head.len()], &head[..]);
    assert_eq!(&got[head.len()..], &tail[..]);
}
