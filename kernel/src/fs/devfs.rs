//! Device filesystem
//!
//! A flat registry of character-style device files. Each record carries
//! read/write function pointers and an opaque argument; the adapter's
//! only job is to dispatch sector operations (granularity 1, so sector
//! means byte) to them. Mounted on `/dev`.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;

use lazy_static::lazy_static;

use super::{Dirent, FileRef, FileSize, FileType, Filesystem, Ino, Rights};
use crate::error::{KernelError, KernelResult};
use crate::sync::IrqSpinlock;

lazy_static! {
    /// The system device registry, mounted on `/dev` at boot.
    pub static ref DEVFS: Arc<DevFs> = Arc::new(DevFs::new());
}

/// Device read entry point: fill `buf` from device offset `offset`.
pub type DevReadFn = fn(arg: usize, buf: &mut [u8], offset: u64) -> KernelResult<usize>;

/// Device write entry point.
pub type DevWriteFn = fn(arg: usize, buf: &[u8], offset: u64) -> KernelResult<usize>;

struct Device {
    name: String,
    size: FileSize,
    rights: Rights,
    read: Option<DevReadFn>,
    write: Option<DevWriteFn>,
    arg: usize,
}

/// The `/dev` filesystem.
pub struct DevFs {
    devices: IrqSpinlock<Vec<Device>>,
    open_files: AtomicUsize,
}

/// Root directory inode; device inodes start at 1.
const ROOT_INO: Ino = 0;

impl DevFs {
    pub fn new() -> Self {
        Self {
            devices: IrqSpinlock::new(Vec::new()),
            open_files: AtomicUsize::new(0),
        }
    }

    /// Register a device file, returning its inode.
    pub fn register(
        &self,
        name: &str,
        size: FileSize,
        read: Option<DevReadFn>,
        write: Option<DevWriteFn>,
        arg: usize,
    ) -> Ino {
        let mut rights = Rights::empty();
        if read.is_some() {
            rights |= Rights::READ;
        }
        if write.is_some() {
            rights |= Rights::WRITE;
        }
        if let FileSize::Known(_) = size {
            rights |= Rights::SEEKABLE;
        }

        let mut devices = self.devices.lock();
        devices.push(Device {
            name: String::from(name),
            size,
            rights,
            read,
            write,
            arg,
        });
        devices.len() as Ino
    }

    fn with_device<R>(
        &self,
        ino: Ino,
        f: impl FnOnce(&Device) -> KernelResult<R>,
    ) -> KernelResult<R> {
        let devices = self.devices.lock();
        let device = devices
            .get((ino as usize).wrapping_sub(1))
            .ok_or(KernelError::NotFound)?;
        f(device)
    }
}

impl Default for DevFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for DevFs {
    fn name(&self) -> &str {
        "devfs"
    }

    fn kind(&self) -> super::FsKind {
        super::FsKind::Dev
    }

    fn granularity(&self) -> usize {
        1
    }

    fn cacheable(&self) -> bool {
        // Device reads have side effects; never cache them in handles.
        false
    }

    fn root_addr(&self) -> Ino {
        ROOT_INO
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
        let n = count.min(buf.len());
        self.with_device(file.addr, |device| {
            let read = device.read.ok_or(KernelError::PermissionDenied)?;
            read(device.arg, &mut buf[..n], start)
        })
    }

    fn write_file_sectors(
        &self,
        file: &mut FileRef,
        buf: &[u8],
        start: u64,
        count: usize,
    ) -> KernelResult<usize> {
        let n = count.min(buf.len());
        self.with_device(file.addr, |device| {
            let write = device.write.ok_or(KernelError::PermissionDenied)?;
            write(device.arg, &buf[..n], start)
        })
    }

    fn read_dir(&self, ino: Ino) -> KernelResult<Vec<Dirent>> {
        if ino != ROOT_INO {
            return Err(KernelError::NotADirectory);
        }
        let devices = self.devices.lock();
        Ok(devices
            .iter()
            .enumerate()
            .map(|(i, d)| Dirent {
                ino: (i + 1) as Ino,
                file_size: d.size,
                file_type: FileType::Regular,
                rights: d.rights,
                name: d.name.clone(),
            })
            .collect())
    }

    fn update_dirent(&self, _parent: Ino, _name: &str, _addr: Ino, _size: u64) -> KernelResult<()> {
        // Device metadata is not persistent; nothing to push.
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
