//! Path name cache
//!
//! A direct-mapped hash table from canonical path to resolved dirent
//! data. Collisions evict: resolution correctness never depends on the
//! cache, it only skips `read_dir` walks. Entries are replaced whole
//! under the cache lock, and a filesystem's entries are purged in bulk
//! when it unmounts.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{Dirent, FileSize, FileType, Filesystem, Ino, Rights};
use crate::sync::IrqSpinlock;

/// Number of slots; power of two so the hash can be masked.
pub const CACHE_SIZE: usize = 4096;

const _: () = assert!(CACHE_SIZE.is_power_of_two());

/// One cached resolution.
#[derive(Clone)]
pub struct CacheEntry {
    pub path: String,
    pub fs: Arc<dyn Filesystem>,
    pub addr: Ino,
    pub file_size: FileSize,
    pub file_type: FileType,
    pub rights: Rights,
}

impl CacheEntry {
    pub fn to_dirent(&self, name: String) -> Dirent {
        Dirent {
            ino: self.addr,
            file_size: self.file_size,
            file_type: self.file_type,
            rights: self.rights,
            name,
        }
    }
}

struct NameCache {
    slots: Vec<Option<CacheEntry>>,
}

static CACHE: IrqSpinlock<NameCache> = IrqSpinlock::new(NameCache { slots: Vec::new() });

/// FNV-1a over the path bytes, masked to the table size.
fn slot_of(path: &str) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in path.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash as usize) & (CACHE_SIZE - 1)
}

/// Allocate the slot table. Idempotent.
pub fn init() {
    let mut cache = CACHE.lock();
    if cache.slots.is_empty() {
        cache.slots.resize_with(CACHE_SIZE, || None);
    }
}

/// Probe for `path`. A hit requires strict path equality, not just a
/// hash match.
pub fn lookup(path: &str) -> Option<CacheEntry> {
    let cache = CACHE.lock();
    if cache.slots.is_empty() {
        return None;
    }
    let slot = &cache.slots[slot_of(path)];
    match slot {
        Some(entry) if entry.path == path => Some(entry.clone()),
        _ => None,
    }
}

/// Insert or replace the entry for `entry.path`; a colliding entry for a
/// different path is evicted.
pub fn insert(entry: CacheEntry) {
    let mut cache = CACHE.lock();
    if cache.slots.is_empty() {
        return;
    }
    let slot = slot_of(&entry.path);
    cache.slots[slot] = Some(entry);
}

/// Update size/address for `path` if it is cached (the lazy flush path).
pub fn refresh(path: &str, addr: Ino, file_size: FileSize) {
    let mut cache = CACHE.lock();
    if cache.slots.is_empty() {
        return;
    }
    let slot = slot_of(path);
    if let Some(entry) = cache.slots[slot].as_mut() {
        if entry.path == path {
            entry.addr = addr;
            entry.file_size = file_size;
        }
    }
}

/// Drop one path from the cache.
pub fn invalidate(path: &str) {
    let mut cache = CACHE.lock();
    if cache.slots.is_empty() {
        return;
    }
    let slot = slot_of(path);
    if let Some(entry) = &cache.slots[slot] {
        if entry.path == path {
            cache.slots[slot] = None;
        }
    }
}

/// Purge every entry owned by `fs` (it is unmounting).
pub fn invalidate_fs(fs: &Arc<dyn Filesystem>) {
    let mut cache = CACHE.lock();
    for slot in cache.slots.iter_mut() {
        if let Some(entry) = slot {
            if Arc::ptr_eq(&entry.fs, fs) {
                *slot = None;
            }
        }
    }
}

/// Number of live entries, for tests and diagnostics.
pub fn len() -> usize {
    CACHE.lock().slots.iter().filter(|s| s.is_some()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testfs::TestFs;

    fn entry(fs: &Arc<dyn Filesystem>, path: &str, addr: Ino) -> CacheEntry {
        CacheEntry {
            path: String::from(path),
            fs: fs.clone(),
            addr,
            file_size: FileSize::Known(10),
            file_type: FileType::Regular,
            rights: Rights::READ,
        }
    }

    #[test]
    fn hit_requires_exact_path() {
        init();
        let fs: Arc<dyn Filesystem> = Arc::new(TestFs::new(512));
        insert(entry(&fs, "/cache/a", 1));
        assert_eq!(lookup("/cache/a").unwrap().addr, 1);
        assert!(lookup("/cache/b").is_none());
    }

    #[test]
    fn refresh_updates_in_place() {
        init();
        let fs: Arc<dyn Filesystem> = Arc::new(TestFs::new(512));
        insert(entry(&fs, "/cache/r", 5));
        refresh("/cache/r", 9, FileSize::Known(123));
        let got = lookup("/cache/r").unwrap();
        assert_eq!(got.addr, 9);
        assert_eq!(got.file_size, FileSize::Known(123));
    }

    #[test]
    fn unmount_purges_only_owner() {
        init();
        let a: Arc<dyn Filesystem> = Arc::new(TestFs::new(512));
        let b: Arc<dyn Filesystem> = Arc::new(TestFs::new(512));
        insert(entry(&a, "/cache/owner-a", 1));
        insert(entry(&b, "/cache/owner-b", 2));
        invalidate_fs(&a);
        assert!(lookup("/cache/owner-a").is_none());
        assert_eq!(lookup("/cache/owner-b").unwrap().addr, 2);
    }

    #[test]
    fn collision_evicts() {
        init();
        let fs: Arc<dyn Filesystem> = Arc::new(TestFs::new(512));
        // Two different paths in the same slot can only both "hit" if the
        // table kept stale entries; the second insert must win.
        let p1 = String::from("/cache/x");
        let slot = slot_of(&p1);
        // Find another path landing in the same slot.
        let mut p2 = None;
        for i in 0..100_000u32 {
            let cand = alloc::format!("/cache/y{i}");
            if slot_of(&cand) == slot {
                p2 = Some(cand);
                break;
            }
        }
        let p2 = p2.expect("no colliding path found");

        insert(entry(&fs, &p1, 1));
        insert(entry(&fs, &p2, 2));
        assert!(lookup(&p1).is_none());
        assert_eq!(lookup(&p2).unwrap().addr, 2);
    }
}
