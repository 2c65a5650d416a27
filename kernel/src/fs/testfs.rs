//! In-memory sector-granular filesystem used by the unit tests
//!
//! Behaves like a miniature disk filesystem: a flat root directory,
//! sector-addressed file content, honest granularity so the vfile
//! layer's partial-sector paths get exercised.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{Dirent, FileRef, FileSize, FileType, Filesystem, Ino, Rights};
use crate::error::{KernelError, KernelResult};

pub struct TestFs {
    granularity: usize,
    state: Mutex<State>,
    open_files: AtomicUsize,
}

struct State {
    content: BTreeMap<Ino, Vec<u8>>,
    root: Vec<Dirent>,
    next_ino: Ino,
    /// (name, addr, size) tuples pushed by `update_dirent`, for
    /// asserting lazy-flush ordering.
    pub updates: Vec<(String, Ino, u64)>,
}

impl TestFs {
    pub fn new(granularity: usize) -> Self {
        Self {
            granularity,
            state: Mutex::new(State {
                content: BTreeMap::new(),
                root: Vec::new(),
                next_ino: 2,
                updates: Vec::new(),
            }),
            open_files: AtomicUsize::new(0),
        }
    }

    /// Seed a regular file and return its dirent.
    pub fn add_file(&self, name: &str, content: &[u8]) -> Dirent {
        let mut state = self.state.lock();
        let ino = state.next_ino;
        state.next_ino += 1;
        state.content.insert(ino, content.to_vec());
        let d = Dirent {
            ino,
            file_size: FileSize::Known(content.len() as u64),
            file_type: FileType::Regular,
            rights: Rights::READ | Rights::WRITE | Rights::SEEKABLE | Rights::TRUNCATABLE,
            name: String::from(name),
        };
        state.root.push(d.clone());
        d
    }

    /// Seed a subdirectory with its own entries.
    pub fn add_dir(&self, name: &str, children: Vec<Dirent>) -> Dirent {
        let mut state = self.state.lock();
        let ino = state.next_ino;
        state.next_ino += 1;
        let d = Dirent {
            ino,
            file_size: FileSize::Known(0),
            file_type: FileType::Directory,
            rights: Rights::READ | Rights::SEEKABLE,
            name: String::from(name),
        };
        state.root.push(d.clone());
        // Children are attached under the directory's ino + a large
        // offset so read_dir can find them.
        for child in children {
            state.root.push(Dirent {
                name: alloc::format!("{}\u{0}{}", ino, child.name),
                ..child
            });
        }
        d
    }

    pub fn raw_content(&self, ino: Ino) -> Vec<u8> {
        self.state.lock().content.get(&ino).cloned().unwrap_or_default()
    }

    pub fn updates(&self) -> Vec<(String, Ino, u64)> {
        self.state.lock().updates.clone()
    }
}

impl Filesystem for TestFs {
    fn name(&self) -> &str {
        "testfs"
    }

    fn kind(&self) -> super::FsKind {
        super::FsKind::Ram
    }

    fn granularity(&self) -> usize {
        self.granularity
    }

    fn cacheable(&self) -> bool {
        true
    }

    fn root_addr(&self) -> Ino {
        1
    }

    fn open_file_count(&self) -> usize {
        self.open_files.load(Ordering::Relaxed)
    }

    fn read_file_sectors(
        &self,
        file: &FileRef,
        buf: &mut [u8],
        start: u64,
        count: usize,
    ) -> KernelResult<usize> {
        let state = self.state.lock();
        let data = state.content.get(&file.addr).ok_or(KernelError::NotFound)?;
        let from = (start as usize) * self.granularity;
        let want = (count * self.granularity).min(buf.len());

        let mut produced = 0;
        for i in 0..want {
            buf[i] = data.get(from + i).copied().unwrap_or(0);
            produced += 1;
        }
        Ok(produced)
    }

    fn write_file_sectors(
        &self,
        file: &mut FileRef,
        buf: &[u8],
        start: u64,
        count: usize,
    ) -> KernelResult<usize> {
        let mut state = self.state.lock();
        let gran = self.granularity;
        let data = state
            .content
            .get_mut(&file.addr)
            .ok_or(KernelError::NotFound)?;
        let from = (start as usize) * gran;
        let n = (count * gran).min(buf.len());
        if data.len() < from + n {
            data.resize(from + n, 0);
        }
        data[from..from + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn read_dir(&self, ino: Ino) -> KernelResult<Vec<Dirent>> {
        let state = self.state.lock();
        if ino == self.root_addr() {
            Ok(state
                .root
                .iter()
                .filter(|d| !d.name.contains('\u{0}'))
                .cloned()
                .collect())
        } else {
            // Entries attached under a subdirectory.
            let prefix = alloc::format!("{}\u{0}", ino);
            let list: Vec<Dirent> = state
                .root
                .iter()
                .filter(|d| d.name.starts_with(&prefix))
                .map(|d| Dirent {
                    name: String::from(&d.name[prefix.len()..]),
                    ..d.clone()
                })
                .collect();
            if list.is_empty() {
                Err(KernelError::NotFound)
            } else {
                Ok(list)
            }
        }
    }

    fn update_dirent(&self, _parent: Ino, name: &str, addr: Ino, size: u64) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.updates.push((String::from(name), addr, size));
        for d in state.root.iter_mut() {
            if d.name == name {
                d.ino = addr;
                d.file_size = FileSize::Known(size);
            }
        }
        Ok(())
    }

    fn add_dirent(&self, _parent: Ino, name: &str, ftype: FileType) -> KernelResult<Dirent> {
        if ftype != FileType::Regular {
            return Err(KernelError::InvalidArgument);
        }
        Ok(self.add_file(name, &[]))
    }

    fn truncate_file(&self, file: &mut FileRef, new_size: u64) -> KernelResult<()> {
        let mut state = self.state.lock();
        let data = state
            .content
            .get_mut(&file.addr)
            .ok_or(KernelError::NotFound)?;
        data.resize(new_size as usize, 0);
        file.size = FileSize::Known(new_size);
        Ok(())
    }

    fn open_file(&self, _addr: Ino) {
        self.open_files.fetch_add(1, Ordering::Relaxed);
    }

    fn close_file(&self, _addr: Ino) {
        self.open_files.fetch_sub(1, Ordering::Relaxed);
    }
}
