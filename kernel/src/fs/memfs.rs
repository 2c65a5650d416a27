//! Shared-memory filesystem
//!
//! Exposes SHM objects as files: reading one maps the object into the
//! calling process and yields a [`MemDesc`] holding the mapped base
//! address. A process gets exactly one instance per file; re-reading
//! returns the same address. Instances are dropped (and the SHM
//! reference released) when the process exits.
//!
//! Mounted on `/mem`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;

use lazy_static::lazy_static;

use super::{Dirent, FileRef, FileSize, FileType, Filesystem, Ino, Rights};
use crate::error::{KernelError, KernelResult};
use crate::ipc::shm::{self, ShmId, ShmInstance};
use crate::process::Pid;
use crate::sync::IrqSpinlock;

/// What a memfs read returns: the base of the mapping in the calling
/// process's address space.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemDesc {
    pub vaddr: u64,
}

/// User-half base where SHM objects are attached, in 1 GiB slots.
const SHM_MAP_BASE: u64 = 0x0000_7000_0000_0000;

/// Mapping slots available to one process.
const SHM_MAP_SLOTS: usize = 512;

fn slot_vaddr(slot: usize) -> u64 {
    SHM_MAP_BASE + ((slot as u64) << 30)
}

/// Lowest mapping slot not used by any of `pid`'s instances. Slots are
/// allocated per process rather than derived from the object id, so
/// two objects can never alias the same L3 directory slot.
fn lowest_free_slot(files: &[MemFile], pid: Pid) -> KernelResult<usize> {
    let mut used = [0u64; SHM_MAP_SLOTS / 64];
    for file in files {
        for inst in file.instances.iter().filter(|i| i.pid == pid) {
            let slot = ((inst.vaddr - SHM_MAP_BASE) >> 30) as usize;
            used[slot / 64] |= 1 << (slot % 64);
        }
    }
    for slot in 0..SHM_MAP_SLOTS {
        if used[slot / 64] & (1 << (slot % 64)) == 0 {
            return Ok(slot);
        }
    }
    Err(KernelError::Exhausted {
        resource: "shm mapping slots",
    })
}

struct MemInstance {
    pid: Pid,
    instance: ShmInstance,
    vaddr: u64,
}

struct MemFile {
    name: String,
    shm_id: ShmId,
    /// One instance per process that has read the file.
    instances: Vec<MemInstance>,
}

/// The `/mem` filesystem.
pub struct MemFs {
    files: IrqSpinlock<Vec<MemFile>>,
    open_files: AtomicUsize,
}

lazy_static! {
    /// The system memfs, mounted once at boot.
    pub static ref MEMFS: Arc<MemFs> = Arc::new(MemFs::new());
}

const ROOT_INO: Ino = 0;

impl MemFs {
    pub fn new() -> Self {
        Self {
            files: IrqSpinlock::new(Vec::new()),
            open_files: AtomicUsize::new(0),
        }
    }

    /// Expose `shm_id` as the file `name`. The fs does not take a
    /// reference of its own; the creator keeps the object alive.
    pub fn register_file(&self, name: &str, shm_id: ShmId) {
        self.files.lock().push(MemFile {
            name: String::from(name),
            shm_id,
            instances: Vec::new(),
        });
    }

    /// Remove the file for `shm_id`. Fails while instances are live.
    pub fn unregister_file(&self, shm_id: ShmId) -> KernelResult<()> {
        let mut files = self.files.lock();
        let index = files
            .iter()
            .position(|f| f.shm_id == shm_id)
            .ok_or(KernelError::NotFound)?;
        if !files[index].instances.is_empty() {
            return Err(KernelError::WrongState);
        }
        files.swap_remove(index);
        Ok(())
    }

    /// Map `file`'s SHM into `pid` if it is not mapped yet; returns the
    /// descriptor either way.
    fn instance_for(&self, shm_id: ShmId, pid: Pid) -> KernelResult<MemDesc> {
        let mut files = self.files.lock();
        let index = files
            .iter()
            .position(|f| f.shm_id == shm_id)
            .ok_or(KernelError::NotFound)?;

        if let Some(existing) = files[index].instances.iter().find(|i| i.pid == pid) {
            return Ok(MemDesc {
                vaddr: existing.vaddr,
            });
        }

        // The slot scan and the registration happen under the same
        // lock, so concurrent reads cannot pick the same slot.
        let vaddr = slot_vaddr(lowest_free_slot(&files, pid)?);
        let instance = shm::open(shm_id)?;

        #[cfg(target_os = "none")]
        crate::arch::without_interrupts(|| unsafe {
            let directory = shm::directory_of(shm_id).expect("shm vanished while mapped");
            crate::mm::paging::attach_l3_directory(
                crate::mm::VirtAddr::new(vaddr),
                directory,
                crate::mm::paging::PageFlags::user_data(),
            );
        });

        files[index].instances.push(MemInstance {
            pid,
            instance,
            vaddr,
        });
        Ok(MemDesc { vaddr })
    }

    /// Drop every instance `pid` holds; called from process teardown.
    pub fn release_process(&self, pid: Pid) {
        let mut dropped = Vec::new();
        {
            let mut files = self.files.lock();
            for file in files.iter_mut() {
                let mut i = 0;
                while i < file.instances.len() {
                    if file.instances[i].pid == pid {
                        dropped.push(file.instances.swap_remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
        }
        for inst in dropped {
            #[cfg(target_os = "none")]
            crate::arch::without_interrupts(|| unsafe {
                crate::mm::paging::detach_l3_slot(crate::mm::VirtAddr::new(inst.vaddr));
            });
            let _ = shm::close(inst.instance);
        }
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for MemFs {
    fn name(&self) -> &str {
        "memfs"
    }

    fn kind(&self) -> super::FsKind {
        super::FsKind::Mem
    }

    fn granularity(&self) -> usize {
        1
    }

    fn cacheable(&self) -> bool {
        false
    }

    fn root_addr(&self) -> Ino {
        ROOT_INO
    }

    fn open_file_count(&self) -> usize {
        self.open_files.load(Ordering::Relaxed)
    }

    /// Reading a memfs file shares its SHM with the calling process and
    /// produces the mapping descriptor bytes.
    fn read_file_sectors(
        &self,
        file: &FileRef,
        buf: &mut [u8],
        start: u64,
        count: usize,
    ) -> KernelResult<usize> {
        let desc = self.instance_for(file.addr as ShmId, crate::sched::current_pid())?;

        let bytes = desc.vaddr.to_ne_bytes();
        let from = start as usize;
        if from >= bytes.len() {
            return Ok(0);
        }
        let n = count.min(buf.len()).min(bytes.len() - from);
        buf[..n].copy_from_slice(&bytes[from..from + n]);
        Ok(n)
    }

    fn write_file_sectors(
        &self,
        _file: &mut FileRef,
        _buf: &[u8],
        _start: u64,
        _count: usize,
    ) -> KernelResult<usize> {
        Err(KernelError::PermissionDenied)
    }

    fn read_dir(&self, ino: Ino) -> KernelResult<Vec<Dirent>> {
        if ino != ROOT_INO {
            return Err(KernelError::NotADirectory);
        }
        let files = self.files.lock();
        Ok(files
            .iter()
            .map(|f| Dirent {
                ino: f.shm_id as Ino,
                file_size: FileSize::Known(core::mem::size_of::<MemDesc>() as u64),
                file_type: FileType::Regular,
                rights: Rights::READ | Rights::SEEKABLE,
                name: f.name.clone(),
            })
            .collect())
    }

    fn update_dirent(&self, _parent: Ino, _name: &str, _addr: Ino, _size: u64) -> KernelResult<()> {
        Ok(())
    }

    fn add_dirent(&self, _parent: Ino, _name: &str, _ftype: FileType) -> KernelResult<Dirent> {
        Err(KernelError::PermissionDenied)
    }

    fn truncate_file(&self, _file: &mut FileRef, _new_size: u64) -> KernelResult<()> {
        Err(KernelError::PermissionDenied)
    }

    fn open_file(&self, _addr: Ino) {
        self.open_files.fetch_add(1, Ordering::Relaxed);
    }

    fn close_file(&self, _addr: Ino) {
        self.open_files.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::vfile::{self, OpenFlags, Whence};

    #[test]
    fn read_maps_once_per_process() {
        let fs = MemFs::new();
        let a = shm::create(4096).unwrap();
        let id = a.id();
        fs.register_file("frame", id);

        let file = FileRef {
            addr: id as Ino,
            size: FileSize::Known(8),
        };
        let mut d1 = [0u8; 8];
        let mut d2 = [0u8; 8];
        assert_eq!(fs.read_file_sectors(&file, &mut d1, 0, 8).unwrap(), 8);
        assert_eq!(fs.read_file_sectors(&file, &mut d2, 0, 8).unwrap(), 8);
        // Same process, same mapping.
        assert_eq!(d1, d2);
        let vaddr = u64::from_ne_bytes(d1);
        assert!(vaddr >= SHM_MAP_BASE);
        assert!(vaddr < slot_vaddr(SHM_MAP_SLOTS));
        // 1 GiB aligned, as a directory attach requires.
        assert_eq!(vaddr % (1 << 30), 0);

        // The instance took a reference: closing the creator's keeps
        // the object alive.
        shm::close(a).unwrap();
        assert!(shm::size_of(id).is_ok());

        fs.release_process(crate::sched::current_pid());
        assert!(shm::size_of(id).is_err());
        fs.unregister_file(id).unwrap();
    }

    #[test]
    fn listing_and_vfile_read() {
        let fs = Arc::new(MemFs::new());
        let a = shm::create(8192).unwrap();
        let id = a.id();
        fs.register_file("buffer", id);

        let entries = fs.read_dir(ROOT_INO).unwrap();
        let entry = entries.iter().find(|d| d.name == "buffer").unwrap();
        assert_eq!(
            entry.file_size,
            FileSize::Known(core::mem::size_of::<MemDesc>() as u64)
        );

        let dynfs: Arc<dyn Filesystem> = fs.clone();
        let mut h = vfile::open_from(&dynfs, entry, "/mem/buffer", OpenFlags::READ).unwrap();
        let mut raw = [0u8; 8];
        assert_eq!(h.read(&mut raw).unwrap(), 8);
        // Re-reads return the same descriptor.
        h.seek(0, Whence::Set).unwrap();
        let mut raw2 = [0u8; 8];
        h.read(&mut raw2).unwrap();
        assert_eq!(raw, raw2);

        drop(h);
        fs.release_process(crate::sched::current_pid());
        shm::close(a).unwrap();
        fs.unregister_file(id).unwrap();
    }

    #[test]
    fn two_objects_never_share_a_slot() {
        let fs = MemFs::new();
        let a = shm::create(4096).unwrap();
        let b = shm::create(4096).unwrap();
        fs.register_file("one", a.id());
        fs.register_file("two", b.id());

        let read_vaddr = |id: ShmId| {
            let file = FileRef {
                addr: id as Ino,
                size: FileSize::Known(8),
            };
            let mut d = [0u8; 8];
            fs.read_file_sectors(&file, &mut d, 0, 8).unwrap();
            u64::from_ne_bytes(d)
        };

        // Same process maps both: distinct 1 GiB slots, whatever the
        // ids happen to be.
        let va = read_vaddr(a.id());
        let vb = read_vaddr(b.id());
        assert_ne!(va, vb);
        assert_eq!(va, slot_vaddr(0));
        assert_eq!(vb, slot_vaddr(1));

        // Released slots are reusable.
        let pid = crate::sched::current_pid();
        fs.release_process(pid);
        let again = read_vaddr(b.id());
        assert_eq!(again, slot_vaddr(0));

        fs.release_process(pid);
        fs.unregister_file(a.id()).unwrap();
        fs.unregister_file(b.id()).unwrap();
        shm::close(a).unwrap();
        shm::close(b).unwrap();
    }

    #[test]
    fn unregister_refuses_with_instances() {
        let fs = MemFs::new();
        let a = shm::create(4096).unwrap();
        let id = a.id();
        fs.register_file("busy", id);

        let file = FileRef {
            addr: id as Ino,
            size: FileSize::Known(8),
        };
        let mut d = [0u8; 8];
        fs.read_file_sectors(&file, &mut d, 0, 8).unwrap();

        assert_eq!(fs.unregister_file(id).unwrap_err(), KernelError::WrongState);
        fs.release_process(crate::sched::current_pid());
        fs.unregister_file(id).unwrap();
        shm::close(a).unwrap();
    }
}
