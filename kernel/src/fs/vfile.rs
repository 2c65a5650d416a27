//! Open-file table
//!
//! One vfile per opened physical file, keyed by `(fs, addr)`. The vfile
//! is the source of truth for the file's size and address while it is
//! open; handles carry their own cursor and a one-granule sector buffer.
//!
//! Read/write atomicity is per vfile: an `accessed` flag taken under the
//! table lock serialises whole operations, with contenders yielding and
//! retrying rather than sleeping inside the lock.
//!
//! Stale sector buffers are handled with a generation counter instead of
//! reaching into sibling handles: any update to the vfile's size or
//! address bumps `generation`, and every handle revalidates its buffer
//! against it at the start of each operation. The updating handle
//! re-adopts the new generation, so only the *other* handles lose their
//! cache, which is exactly the invalidation rule the table wants.
//!
//! Metadata changes are not written back synchronously: closing the last
//! handle of a modified vfile enqueues a flush record that the kernel
//! worker drains later, updating the on-fs dirent and then the name
//! cache.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::{name_cache, path, Dirent, FileRef, FileSize, FileType, Filesystem, HandleId, Ino};
use crate::error::{KernelError, KernelResult};
use crate::sync::IrqSpinlock;

/// Identifier of a vfile table entry.
pub type VfileId = u64;

bitflags! {
    /// Handle-level open flags. SEEKABLE and TRUNCATABLE are derived
    /// from the dirent rights at open time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ        = 1 << 0;
        const WRITE       = 1 << 1;
        const CREATE      = 1 << 2;
        const TRUNC       = 1 << 3;
        const APPEND      = 1 << 4;
        const SEEKABLE    = 1 << 5;
        const TRUNCATABLE = 1 << 6;
        const DIRECTORY   = 1 << 7;
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

struct Vfile {
    id: VfileId,
    fs: Arc<dyn Filesystem>,
    file: FileRef,
    path: String,
    /// Type and rights from the opening dirent, kept for the metadata
    /// write-back into the name cache.
    file_type: FileType,
    rights: super::Rights,
    n_handles: u32,
    accessed: bool,
    modified: bool,
    generation: u64,
}

/// Queued metadata write-back.
struct FlushRecord {
    fs: Arc<dyn Filesystem>,
    path: String,
    addr: Ino,
    file_size: u64,
}

static VFILES: IrqSpinlock<Vec<Vfile>> = IrqSpinlock::new(Vec::new());
static FLUSH_QUEUE: IrqSpinlock<Vec<FlushRecord>> = IrqSpinlock::new(Vec::new());
static NEXT_VFILE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Reset the table. Called once at boot.
pub fn init() {
    VFILES.lock().clear();
    FLUSH_QUEUE.lock().clear();
}

/// Number of live vfiles, for tests and diagnostics.
pub fn vfile_count() -> usize {
    VFILES.lock().len()
}

/// A single open-file descriptor-side object: a cursor onto a vfile.
pub struct FileHandle {
    vfile_id: VfileId,
    fs: Arc<dyn Filesystem>,
    flags: OpenFlags,
    id: HandleId,
    file_offset: u64,
    /// Sector the cursor sits in.
    sector_count: u64,
    /// Byte offset inside that sector.
    sector_offset: usize,
    /// One granule of cached file content at sector `sector_count`.
    buffer: Vec<u8>,
    buffer_valid: bool,
    seen_generation: u64,
    closed: bool,
}

/// Snapshot handed out by `acquire`: the vfile's file identity plus the
/// generation the caller must revalidate its buffer against.
struct Access {
    file: FileRef,
    generation: u64,
}

/// Take exclusive access of `vfile_id`, yielding while another thread
/// holds it. Fails only when the vfile vanished (concurrent close).
fn acquire(vfile_id: VfileId) -> KernelResult<Access> {
    loop {
        {
            let mut table = VFILES.lock();
            let vfile = table
                .iter_mut()
                .find(|v| v.id == vfile_id)
                .ok_or(KernelError::WrongState)?;
            if !vfile.accessed {
                vfile.accessed = true;
                return Ok(Access {
                    file: vfile.file,
                    generation: vfile.generation,
                });
            }
        }
        crate::sched::yield_now();
    }
}

fn release(vfile_id: VfileId) {
    let mut table = VFILES.lock();
    let vfile = table
        .iter_mut()
        .find(|v| v.id == vfile_id)
        .expect("release of closed vfile");
    debug_assert!(vfile.accessed);
    vfile.accessed = false;
}

/// Push new size/address into the vfile, invalidating every other
/// handle's sector buffer via the generation counter. Returns the new
/// generation for the updater to adopt.
fn update_vfile(vfile_id: VfileId, file: FileRef) -> u64 {
    let mut table = VFILES.lock();
    let vfile = table
        .iter_mut()
        .find(|v| v.id == vfile_id)
        .expect("update of closed vfile");
    vfile.file = file;
    vfile.generation += 1;
    vfile.generation
}

/// Find or create the vfile for `(fs, addr)`.
fn search_or_insert(
    fs: &Arc<dyn Filesystem>,
    dirent: &Dirent,
    file_path: &str,
) -> VfileId {
    let mut table = VFILES.lock();
    if let Some(v) = table
        .iter_mut()
        .find(|v| v.file.addr == dirent.ino && Arc::ptr_eq(&v.fs, fs))
    {
        v.n_handles += 1;
        return v.id;
    }

    let id = NEXT_VFILE_ID.fetch_add(1, Ordering::Relaxed);
    table.push(Vfile {
        id,
        fs: fs.clone(),
        file: FileRef {
            addr: dirent.ino,
            size: dirent.file_size,
        },
        path: String::from(file_path),
        file_type: dirent.file_type,
        rights: dirent.rights,
        n_handles: 1,
        accessed: false,
        modified: false,
        generation: 0,
    });
    drop(table);

    fs.open_file(dirent.ino);
    id
}

/// Open a handle on an already resolved dirent.
///
/// Directory dirents are refused here; the FD layer owns directory
/// streams. Rights are checked against the requested flags, and the
/// seekable/truncatable rights are folded into the handle flags.
pub fn open_from(
    fs: &Arc<dyn Filesystem>,
    dirent: &Dirent,
    file_path: &str,
    mut flags: OpenFlags,
) -> KernelResult<FileHandle> {
    if dirent.file_type == FileType::Directory {
        return Err(KernelError::IsADirectory);
    }
    if flags.contains(OpenFlags::READ) && !dirent.rights.contains(super::Rights::READ) {
        return Err(KernelError::PermissionDenied);
    }
    if flags.contains(OpenFlags::WRITE) && !dirent.rights.contains(super::Rights::WRITE) {
        return Err(KernelError::PermissionDenied);
    }
    if dirent.rights.contains(super::Rights::SEEKABLE) {
        flags |= OpenFlags::SEEKABLE;
    }
    if dirent.rights.contains(super::Rights::TRUNCATABLE) {
        flags |= OpenFlags::TRUNCATABLE;
    }

    let hid = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
    let vfile_id = search_or_insert(fs, dirent, file_path);
    fs.open_instance(dirent.ino, hid);

    let mut handle = FileHandle {
        vfile_id,
        fs: fs.clone(),
        flags,
        id: hid,
        file_offset: 0,
        sector_count: 0,
        sector_offset: 0,
        buffer: vec![0; fs.granularity()],
        buffer_valid: false,
        seen_generation: 0,
        closed: false,
    };

    if flags.contains(OpenFlags::TRUNC) {
        handle.truncate(0)?;
    }
    if flags.contains(OpenFlags::APPEND) {
        if let FileSize::Known(n) = dirent.file_size {
            handle.set_offset(n);
        }
    }

    Ok(handle)
}

/// Duplicate `from`: same vfile, same cursor position, fresh handle id
/// and an empty sector buffer.
pub fn dup(from: &FileHandle) -> KernelResult<FileHandle> {
    let hid = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
    let addr = {
        let mut table = VFILES.lock();
        let vfile = table
            .iter_mut()
            .find(|v| v.id == from.vfile_id)
            .ok_or(KernelError::WrongState)?;
        vfile.n_handles += 1;
        vfile.file.addr
    };
    from.fs.open_instance(addr, hid);

    Ok(FileHandle {
        vfile_id: from.vfile_id,
        fs: from.fs.clone(),
        flags: from.flags,
        id: hid,
        file_offset: from.file_offset,
        sector_count: from.sector_count,
        sector_offset: from.sector_offset,
        buffer: vec![0; from.fs.granularity()],
        buffer_valid: false,
        seen_generation: 0,
        closed: false,
    })
}

impl FileHandle {
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn handle_id(&self) -> HandleId {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.file_offset
    }

    /// Move the cursor, recomputing the sector split and dropping the
    /// buffer.
    fn set_offset(&mut self, absolute: u64) {
        let gran = self.fs.granularity() as u64;
        self.file_offset = absolute;
        self.sector_offset = (absolute % gran) as usize;
        self.sector_count = absolute / gran;
        self.buffer_valid = false;
    }

    /// Drop the buffer if the vfile changed under us since last time.
    fn revalidate(&mut self, generation: u64) {
        if self.seen_generation != generation {
            self.buffer_valid = false;
            self.seen_generation = generation;
        }
    }

    /// Read up to `buf.len()` bytes at the cursor. Atomic against any
    /// other operation on the same vfile.
    pub fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(KernelError::PermissionDenied);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let gran = self.fs.granularity();
        let cacheable = self.fs.cacheable();

        let access = acquire(self.vfile_id)?;
        let result = self.read_locked(buf, gran, cacheable, &access);
        release(self.vfile_id);
        result
    }

    fn read_locked(
        &mut self,
        buf: &mut [u8],
        gran: usize,
        cacheable: bool,
        access: &Access,
    ) -> KernelResult<usize> {
        self.revalidate(access.generation);
        let file = access.file;

        // Clamp against the file end; unbounded streams never clamp.
        let mut remaining = match file.size {
            FileSize::Known(size) => {
                if size <= self.file_offset {
                    return Ok(0);
                }
                buf.len().min((size - self.file_offset) as usize)
            }
            FileSize::Unbounded => buf.len(),
        };
        if remaining == 0 {
            return Ok(0);
        }

        let mut produced = 0;

        // Serve the unaligned prefix from the handle buffer.
        if self.buffer_valid && cacheable {
            let take = (gran - self.sector_offset).min(remaining);
            buf[..take].copy_from_slice(&self.buffer[self.sector_offset..self.sector_offset + take]);

            self.sector_offset += take;
            self.file_offset += take as u64;
            if self.sector_offset == gran {
                self.sector_offset = 0;
                self.sector_count += 1;
                self.buffer_valid = false;
            }

            produced += take;
            remaining -= take;
            if remaining == 0 {
                return Ok(produced);
            }
            debug_assert_eq!(self.sector_offset, 0);
        }

        // Aligned middle plus ragged tail in sector units.
        let must_read = self.sector_offset + remaining;
        let read_sectors = must_read.div_ceil(gran);
        let end_offset = must_read % gran;
        let aligned = self.sector_offset == 0 && end_offset == 0;

        if aligned {
            // Read straight into the caller's buffer.
            let got = self.fs.read_file_sectors(
                &file,
                &mut buf[produced..produced + remaining],
                self.sector_count,
                read_sectors,
            )?;
            // A short return is only meaningful on byte-granular
            // streams (devices); block filesystems always fill.
            if got < remaining {
                debug_assert!(gran == 1);
                remaining = got;
            }
        } else {
            let mut tmp = vec![0u8; read_sectors * gran];
            let got = self
                .fs
                .read_file_sectors(&file, &mut tmp, self.sector_count, read_sectors)?;

            if got < tmp.len() {
                debug_assert!(gran == 1);
                remaining = remaining.min(got.saturating_sub(self.sector_offset));
            } else if cacheable && end_offset != 0 {
                // Keep the last, partially consumed sector around.
                self.buffer.copy_from_slice(&tmp[tmp.len() - gran..]);
                self.buffer_valid = true;
            }

            buf[produced..produced + remaining]
                .copy_from_slice(&tmp[self.sector_offset..self.sector_offset + remaining]);
        }

        produced += remaining;
        self.file_offset += remaining as u64;
        self.sector_offset = (self.file_offset % gran as u64) as usize;
        self.sector_count = self.file_offset / gran as u64;

        Ok(produced)
    }

    /// Write `buf` at the cursor. Atomic against any other operation on
    /// the same vfile; growing the file or relocating it invalidates the
    /// sector buffers of all other handles.
    pub fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(KernelError::PermissionDenied);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let gran = self.fs.granularity();
        let cacheable = self.fs.cacheable();

        let access = acquire(self.vfile_id)?;
        let result = self.write_locked(buf, gran, cacheable, &access);
        release(self.vfile_id);
        result
    }

    fn write_locked(
        &mut self,
        buf: &[u8],
        gran: usize,
        cacheable: bool,
        access: &Access,
    ) -> KernelResult<usize> {
        self.revalidate(access.generation);
        let mut file = access.file;
        let old_addr = file.addr;

        if self.flags.contains(OpenFlags::APPEND) {
            if let FileSize::Known(n) = file.size {
                self.set_offset(n);
            }
        }

        let size = buf.len();
        let must_write = self.sector_offset + size;
        let write_sectors = must_write.div_ceil(gran);
        let end_offset = must_write % gran;

        if self.sector_offset == 0 && end_offset == 0 {
            // Perfectly aligned: no staging buffer.
            self.fs
                .write_file_sectors(&mut file, buf, self.sector_count, write_sectors)?;
        } else {
            let mut staging = vec![0u8; write_sectors * gran];
            let known_size = file.size.known().unwrap_or(u64::MAX);

            // Ragged head: preserve the bytes of the first sector that
            // precede the cursor (and the tail of that sector when the
            // whole write fits inside it and more file follows).
            let head_in_file = self.sector_offset != 0
                && self.file_offset - (self.sector_offset as u64) < known_size;
            let small_interior = self.sector_offset + size < gran
                && self.file_offset + (size as u64) < known_size;
            if head_in_file || small_interior {
                if self.buffer_valid && cacheable {
                    staging[..self.sector_offset].copy_from_slice(&self.buffer[..self.sector_offset]);
                    let written_end = self.sector_offset + size;
                    if written_end < gran {
                        staging[written_end..gran].copy_from_slice(&self.buffer[written_end..gran]);
                    }
                } else {
                    let got =
                        self.fs
                            .read_file_sectors(&file, &mut staging[..gran], self.sector_count, 1)?;
                    if got < gran {
                        return Err(KernelError::FsFailure);
                    }
                }
            }

            let last_sector = self.sector_count + write_sectors as u64 - 1;
            if last_sector != self.sector_count {
                // The head buffer no longer covers the cursor sector.
                self.buffer_valid = false;

                if end_offset != 0 && self.file_offset + (size as u64) < known_size {
                    // Ragged tail inside the file: read-modify-write.
                    let tail_from = staging.len() - gran;
                    self.fs.read_file_sectors(
                        &file,
                        &mut staging[tail_from..],
                        last_sector,
                        1,
                    )?;
                    if cacheable {
                        self.buffer.copy_from_slice(&staging[tail_from..]);
                        self.buffer_valid = true;
                    }
                }
            }

            staging[self.sector_offset..self.sector_offset + size].copy_from_slice(buf);
            self.fs
                .write_file_sectors(&mut file, &staging, self.sector_count, write_sectors)?;
        }

        // Advance the cursor.
        self.file_offset += size as u64;
        self.sector_offset = (self.file_offset % gran as u64) as usize;
        self.sector_count = self.file_offset / gran as u64;

        // Publish size growth and relocation to the vfile.
        let mut size_update = false;
        if let FileSize::Known(n) = file.size {
            if n < self.file_offset {
                file.size = FileSize::Known(self.file_offset);
                size_update = true;
            }
        }
        if size_update || file.addr != old_addr {
            let generation = update_vfile(self.vfile_id, file);
            // Our own buffer is current; adopt the new generation.
            self.seen_generation = generation;
        }

        Ok(size)
    }

    /// Reposition the cursor. `End` is relative to the vfile's current
    /// size, which unbounded streams do not have.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> KernelResult<u64> {
        if !self.flags.contains(OpenFlags::SEEKABLE) {
            return Err(KernelError::NotSeekable);
        }

        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.file_offset,
            Whence::End => {
                let table = VFILES.lock();
                let vfile = table
                    .iter()
                    .find(|v| v.id == self.vfile_id)
                    .ok_or(KernelError::WrongState)?;
                vfile.file.size.known().ok_or(KernelError::NotSeekable)?
            }
        };

        let absolute = base
            .checked_add_signed(offset)
            .ok_or(KernelError::InvalidArgument)?;
        self.set_offset(absolute);
        Ok(absolute)
    }

    /// Truncate the file to `size` bytes.
    pub fn truncate(&mut self, size: u64) -> KernelResult<()> {
        if !self.flags.contains(OpenFlags::TRUNCATABLE)
            || !self.flags.contains(OpenFlags::WRITE)
        {
            return Err(KernelError::PermissionDenied);
        }

        let access = acquire(self.vfile_id)?;
        let mut file = access.file;
        let result = self.fs.truncate_file(&mut file, size);
        if result.is_ok() {
            let generation = update_vfile(self.vfile_id, file);
            self.seen_generation = generation;
            self.buffer_valid = false;
        }
        release(self.vfile_id);
        result
    }

    /// Current size of the underlying vfile.
    pub fn file_size(&self) -> KernelResult<FileSize> {
        let table = VFILES.lock();
        let vfile = table
            .iter()
            .find(|v| v.id == self.vfile_id)
            .ok_or(KernelError::WrongState)?;
        Ok(vfile.file.size)
    }

    /// Close the handle. The last close of a modified vfile queues its
    /// metadata for the lazy flush worker and retires the vfile.
    pub fn close(mut self) {
        self.close_impl();
    }

    fn close_impl(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Wait for any in-flight operation before tearing down.
        if acquire(self.vfile_id).is_err() {
            return;
        }

        let mut table = VFILES.lock();
        let index = table
            .iter()
            .position(|v| v.id == self.vfile_id)
            .expect("close of missing vfile");

        self.fs.close_instance(table[index].file.addr, self.id);
        table[index].n_handles -= 1;
        if self.flags.contains(OpenFlags::WRITE) {
            table[index].modified = true;
        }

        if table[index].n_handles == 0 {
            let vfile = table.swap_remove(index);
            drop(table);

            if vfile.modified {
                if let FileSize::Known(size) = vfile.file.size {
                    // The on-fs dirent write is deferred to the worker;
                    // the name cache takes the new metadata right away
                    // so a reopen sees the final size immediately.
                    FLUSH_QUEUE.lock().push(FlushRecord {
                        fs: vfile.fs.clone(),
                        path: vfile.path.clone(),
                        addr: vfile.file.addr,
                        file_size: size,
                    });
                    if !vfile.path.is_empty() {
                        name_cache::insert(name_cache::CacheEntry {
                            path: vfile.path.clone(),
                            fs: vfile.fs.clone(),
                            addr: vfile.file.addr,
                            file_size: FileSize::Known(size),
                            file_type: vfile.file_type,
                            rights: vfile.rights,
                        });
                    }
                }
            }
            vfile.fs.close_file(vfile.file.addr);
        } else {
            table[index].accessed = false;
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.close_impl();
    }
}

/// Drain the lazy flush queue: push each record's metadata through the
/// owning filesystem's `update_dirent`, then refresh the name cache.
/// Runs on the kernel idle worker, never synchronously with close.
pub fn flush_pending() {
    let records: Vec<FlushRecord> = core::mem::take(&mut *FLUSH_QUEUE.lock());

    for record in records {
        let canonical = path::simplify(&record.path);
        let Some((parent, name)) = path::split_parent(&canonical) else {
            continue;
        };

        let parent_ino = match super::vfs::resolve(parent) {
            super::vfs::Resolved::Entry { dirent, .. } => dirent.ino,
            _ => record.fs.root_addr(),
        };

        if let Err(e) = record
            .fs
            .update_dirent(parent_ino, name, record.addr, record.file_size)
        {
            log::warn!("metadata flush of {} failed: {}", canonical, e);
            continue;
        }

        name_cache::refresh(&canonical, record.addr, FileSize::Known(record.file_size));
    }
}

/// Number of queued flush records.
pub fn flush_backlog() -> usize {
    FLUSH_QUEUE.lock().len()
}
