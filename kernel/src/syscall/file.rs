//! File and directory system calls
//!
//! The outer `sys_*` functions unpack and validate the user argument
//! structs and construct the user-memory views; the `do_*` layer
//! underneath carries the semantics and works on plain Rust values.
//! FD slots are taken out of the table for the duration of an
//! operation so a blocking read never pins the process lock.

use alloc::string::String;
use alloc::sync::Arc;

use super::{into_rax, SyscallGuard, FAILURE};
use crate::error::{KernelError, KernelResult};
use crate::fs::vfile::{self, OpenFlags, Whence};
use crate::fs::{self, path, pipefs, vfs, FileType, Rights};
use crate::process::fd::{DirStream, FileDescriptor, MAX_FDS};
use crate::process::ProcessRef;

// User-visible open flag bits.
pub const O_READ: u32 = 1 << 0;
pub const O_WRITE: u32 = 1 << 1;
pub const O_CREATE: u32 = 1 << 2;
pub const O_TRUNC: u32 = 1 << 3;
pub const O_APPEND: u32 = 1 << 4;
pub const O_DIRECTORY: u32 = 1 << 5;

// Seek whence values.
pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

// Access mode bits.
pub const ACCESS_READ: u32 = 1 << 0;
pub const ACCESS_WRITE: u32 = 1 << 1;
pub const ACCESS_EXEC: u32 = 1 << 2;

pub(crate) fn field_u64(args: &[u8], off: usize) -> KernelResult<u64> {
    let s = args
        .get(off..off + 8)
        .ok_or(KernelError::InvalidArgument)?;
    Ok(u64::from_ne_bytes(s.try_into().unwrap()))
}

pub(crate) fn field_u32(args: &[u8], off: usize) -> KernelResult<u32> {
    let s = args
        .get(off..off + 4)
        .ok_or(KernelError::InvalidArgument)?;
    Ok(u32::from_ne_bytes(s.try_into().unwrap()))
}

/// Single-u64 argument struct.
pub(crate) fn arg_u64(args: &[u8]) -> KernelResult<u64> {
    field_u64(args, 0)
}

/// Copy a path argument `(ptr, len)` out of user memory.
fn copy_path(process: &ProcessRef, ptr: u64, len: u64) -> KernelResult<String> {
    if len == 0 || len > fs::NAME_MAX as u64 * 16 {
        return Err(KernelError::InvalidArgument);
    }
    process.lock().validate_range(ptr, len)?;

    #[cfg(target_os = "none")]
    {
        let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) };
        core::str::from_utf8(bytes)
            .map(String::from)
            .map_err(|_| KernelError::InvalidArgument)
    }
    #[cfg(not(target_os = "none"))]
    {
        Err(KernelError::InvalidArgument)
    }
}

/// Take an FD out of its slot for the duration of an operation.
fn take_fd(process: &ProcessRef, fd: u32) -> KernelResult<FileDescriptor> {
    let mut proc = process.lock();
    let slot = proc
        .fds
        .get_mut(fd as usize)
        .ok_or(KernelError::BadFileDescriptor { fd: fd as i32 })?;
    if slot.is_none() {
        return Err(KernelError::BadFileDescriptor { fd: fd as i32 });
    }
    Ok(core::mem::replace(slot, FileDescriptor::None))
}

/// Return an FD to its slot. If the slot was reused while the
/// operation ran (a racing close+open), the stale descriptor is
/// dropped, which closes it.
fn put_fd(process: &ProcessRef, fd: u32, desc: FileDescriptor) {
    let mut proc = process.lock();
    let slot = &mut proc.fds[fd as usize];
    if slot.is_none() {
        *slot = desc;
    }
}

/// Store `desc` in the lowest free slot.
fn install_fd(process: &ProcessRef, desc: FileDescriptor) -> KernelResult<u32> {
    let mut proc = process.lock();
    let fd = proc.free_fd()?;
    proc.fds[fd] = desc;
    Ok(fd as u32)
}

fn user_flags(bits: u32) -> KernelResult<OpenFlags> {
    if bits & !(O_READ | O_WRITE | O_CREATE | O_TRUNC | O_APPEND | O_DIRECTORY) != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mut flags = OpenFlags::empty();
    if bits & O_READ != 0 {
        flags |= OpenFlags::READ;
    }
    if bits & O_WRITE != 0 {
        flags |= OpenFlags::WRITE;
    }
    if bits & O_CREATE != 0 {
        flags |= OpenFlags::CREATE;
    }
    if bits & O_TRUNC != 0 {
        flags |= OpenFlags::TRUNC;
    }
    if bits & O_APPEND != 0 {
        flags |= OpenFlags::APPEND;
    }
    if bits & O_DIRECTORY != 0 {
        flags |= OpenFlags::DIRECTORY;
    }
    Ok(flags)
}

/// OPEN: resolve the path and build a file or directory FD.
pub fn sys_open(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let ptr = field_u64(args, 0)?;
        let len = field_u64(args, 8)?;
        let bits = field_u32(args, 16)?;
        let path = copy_path(guard.process(), ptr, len)?;
        Ok::<_, KernelError>((path, bits))
    })();
    match parsed {
        Ok((path, bits)) => into_rax(do_open(guard, &path, bits).map(u64::from)),
        Err(_) => FAILURE,
    }
}

pub fn do_open(guard: &SyscallGuard, raw_path: &str, bits: u32) -> KernelResult<u32> {
    let flags = user_flags(bits)?;
    let cwd = guard.process().lock().cwd.clone();
    let canonical = path::absolute(&cwd, raw_path);

    if flags.contains(OpenFlags::DIRECTORY) {
        let entries = vfs::list_dir(&canonical)?;
        let stream = DirStream {
            path: canonical,
            bytes: fs::render_dirents(&entries),
        };
        return install_fd(guard.process(), FileDescriptor::Dir { stream, offset: 0 });
    }

    let (fs_arc, dirent) = match vfs::resolve(&canonical) {
        vfs::Resolved::Entry { fs, dirent } => {
            if dirent.file_type == FileType::Directory {
                // A directory needs the directory flag.
                return Err(KernelError::IsADirectory);
            }
            (fs, dirent)
        }
        vfs::Resolved::VirtualDir => return Err(KernelError::IsADirectory),
        vfs::Resolved::Missing => {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(KernelError::NotFound);
            }
            // Create through the owning filesystem of the parent.
            let (parent, name) = path::split_parent(&canonical)
                .ok_or(KernelError::InvalidArgument)?;
            match vfs::resolve(parent) {
                vfs::Resolved::Entry { fs, dirent } => {
                    if dirent.file_type != FileType::Directory {
                        return Err(KernelError::NotADirectory);
                    }
                    let created = fs.add_dirent(dirent.ino, name, FileType::Regular)?;
                    (fs, created)
                }
                _ => return Err(KernelError::NotFound),
            }
        }
    };

    let handle = vfile::open_from(&fs_arc, &dirent, &canonical, flags)?;
    install_fd(guard.process(), FileDescriptor::File(handle))
}

/// CLOSE.
pub fn sys_close(guard: &SyscallGuard, args: &[u8]) -> u64 {
    match field_u32(args, 0) {
        Ok(fd) => into_rax(do_close(guard, fd).map(|_| 0)),
        Err(_) => FAILURE,
    }
}

pub fn do_close(guard: &SyscallGuard, fd: u32) -> KernelResult<()> {
    // Take the descriptor out first: closing can spin on the vfile
    // access flag and must not do so under the process lock.
    let desc = take_fd(guard.process(), fd)?;
    drop(desc);
    Ok(())
}

/// READ: into a validated user buffer. Pipe reads are cancellable.
pub fn sys_read(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let fd = field_u32(args, 0)?;
        let buf = field_u64(args, 8)?;
        let count = field_u64(args, 16)?;
        guard.process().lock().validate_range(buf, count)?;
        Ok::<_, KernelError>((fd, buf, count))
    })();
    let Ok((fd, buf, count)) = parsed else {
        return FAILURE;
    };

    #[cfg(target_os = "none")]
    {
        let slice = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, count as usize) };
        into_rax(do_read(guard, fd, slice).map(|n| n as u64))
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (fd, buf, count);
        FAILURE
    }
}

pub fn do_read(guard: &SyscallGuard, fd: u32, buf: &mut [u8]) -> KernelResult<usize> {
    let mut desc = take_fd(guard.process(), fd)?;
    // The blocking region is signal-cancellable (pipes); plain file
    // reads never sleep on signals so the window is harmless there.
    let result = guard.cancellable(|| desc.read(buf));
    put_fd(guard.process(), fd, desc);
    result
}

/// WRITE: from a validated user buffer.
pub fn sys_write(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let fd = field_u32(args, 0)?;
        let buf = field_u64(args, 8)?;
        let count = field_u64(args, 16)?;
        guard.process().lock().validate_range(buf, count)?;
        Ok::<_, KernelError>((fd, buf, count))
    })();
    let Ok((fd, buf, count)) = parsed else {
        return FAILURE;
    };

    #[cfg(target_os = "none")]
    {
        let slice = unsafe { core::slice::from_raw_parts(buf as *const u8, count as usize) };
        into_rax(do_write(guard, fd, slice).map(|n| n as u64))
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (fd, buf, count);
        FAILURE
    }
}

pub fn do_write(guard: &SyscallGuard, fd: u32, buf: &[u8]) -> KernelResult<usize> {
    let mut desc = take_fd(guard.process(), fd)?;
    let result = desc.write(buf);
    put_fd(guard.process(), fd, desc);
    result
}

/// TRUNCATE a file FD.
pub fn sys_truncate(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let fd = field_u32(args, 0)?;
        let size = field_u64(args, 8)?;
        Ok::<_, KernelError>((fd, size))
    })();
    match parsed {
        Ok((fd, size)) => into_rax(do_truncate(guard, fd, size).map(|_| 0)),
        Err(_) => FAILURE,
    }
}

pub fn do_truncate(guard: &SyscallGuard, fd: u32, size: u64) -> KernelResult<()> {
    let mut desc = take_fd(guard.process(), fd)?;
    let result = match &mut desc {
        FileDescriptor::File(handle) => handle.truncate(size),
        FileDescriptor::Dir { .. } => Err(KernelError::IsADirectory),
        FileDescriptor::None => unreachable!(),
    };
    put_fd(guard.process(), fd, desc);
    result
}

/// SEEK.
pub fn sys_seek(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let fd = field_u32(args, 0)?;
        let offset = field_u64(args, 8)? as i64;
        let whence = field_u32(args, 16)?;
        Ok::<_, KernelError>((fd, offset, whence))
    })();
    match parsed {
        Ok((fd, offset, whence)) => into_rax(do_seek(guard, fd, offset, whence)),
        Err(_) => FAILURE,
    }
}

pub fn do_seek(guard: &SyscallGuard, fd: u32, offset: i64, whence: u32) -> KernelResult<u64> {
    let whence = match whence {
        SEEK_SET => Whence::Set,
        SEEK_CUR => Whence::Cur,
        SEEK_END => Whence::End,
        _ => return Err(KernelError::InvalidArgument),
    };
    let mut desc = take_fd(guard.process(), fd)?;
    let result = desc.seek(offset, whence);
    put_fd(guard.process(), fd, desc);
    result
}

/// ACCESS: existence plus rights check, no FD.
pub fn sys_access(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let ptr = field_u64(args, 0)?;
        let len = field_u64(args, 8)?;
        let mode = field_u32(args, 16)?;
        let path = copy_path(guard.process(), ptr, len)?;
        Ok::<_, KernelError>((path, mode))
    })();
    match parsed {
        Ok((path, mode)) => into_rax(do_access(guard, &path, mode).map(|_| 0)),
        Err(_) => FAILURE,
    }
}

pub fn do_access(guard: &SyscallGuard, raw_path: &str, mode: u32) -> KernelResult<()> {
    let cwd = guard.process().lock().cwd.clone();
    let canonical = path::absolute(&cwd, raw_path);

    let rights = match vfs::resolve(&canonical) {
        vfs::Resolved::Missing => return Err(KernelError::NotFound),
        vfs::Resolved::VirtualDir => Rights::READ | Rights::SEEKABLE,
        vfs::Resolved::Entry { dirent, .. } => dirent.rights,
    };

    if mode & ACCESS_READ != 0 && !rights.contains(Rights::READ) {
        return Err(KernelError::PermissionDenied);
    }
    if mode & ACCESS_WRITE != 0 && !rights.contains(Rights::WRITE) {
        return Err(KernelError::PermissionDenied);
    }
    if mode & ACCESS_EXEC != 0 && !rights.contains(Rights::EXEC) {
        return Err(KernelError::PermissionDenied);
    }
    Ok(())
}

/// DUP / DUP2: `fd2 == -1` picks the lowest free slot.
pub fn sys_dup(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let fd = field_u32(args, 0)? as i32;
        let fd2 = field_u32(args, 4)? as i32;
        Ok::<_, KernelError>((fd, fd2))
    })();
    match parsed {
        Ok((fd, fd2)) => into_rax(do_dup(guard, fd, fd2).map(u64::from)),
        Err(_) => FAILURE,
    }
}

pub fn do_dup(guard: &SyscallGuard, fd: i32, fd2: i32) -> KernelResult<u32> {
    if fd < 0 || fd as usize >= MAX_FDS {
        return Err(KernelError::BadFileDescriptor { fd });
    }

    let duplicate = {
        let proc = guard.process().lock();
        let slot = &proc.fds[fd as usize];
        if slot.is_none() {
            return Err(KernelError::BadFileDescriptor { fd });
        }
        slot.duplicate()?
    };

    if fd2 < 0 {
        return install_fd(guard.process(), duplicate);
    }
    if fd2 as usize >= MAX_FDS {
        return Err(KernelError::BadFileDescriptor { fd: fd2 });
    }

    let displaced = {
        let mut proc = guard.process().lock();
        core::mem::replace(&mut proc.fds[fd2 as usize], duplicate)
    };
    // Dropping the displaced descriptor closes it, outside the lock.
    drop(displaced);
    Ok(fd2 as u32)
}

/// PIPE: returns `(write_fd << 32) | read_fd`.
pub fn sys_pipe(guard: &SyscallGuard) -> u64 {
    into_rax(do_pipe(guard))
}

pub fn do_pipe(guard: &SyscallGuard) -> KernelResult<u64> {
    let (read_dirent, write_dirent) = pipefs::PIPEFS.create_pipe();
    let fs_arc: Arc<dyn fs::Filesystem> = pipefs::PIPEFS.clone();

    let read_handle = vfile::open_from(&fs_arc, &read_dirent, "", OpenFlags::READ)?;
    let write_handle = match vfile::open_from(&fs_arc, &write_dirent, "", OpenFlags::WRITE) {
        Ok(h) => h,
        Err(e) => {
            read_handle.close();
            return Err(e);
        }
    };

    let rfd = install_fd(guard.process(), FileDescriptor::File(read_handle))?;
    let wfd = match install_fd(guard.process(), FileDescriptor::File(write_handle)) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = do_close(guard, rfd);
            return Err(e);
        }
    };

    Ok(((wfd as u64) << 32) | rfd as u64)
}

/// CHDIR: the path must resolve to a directory.
pub fn sys_chdir(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let ptr = field_u64(args, 0)?;
        let len = field_u64(args, 8)?;
        copy_path(guard.process(), ptr, len)
    })();
    match parsed {
        Ok(path) => into_rax(do_chdir(guard, &path).map(|_| 0)),
        Err(_) => FAILURE,
    }
}

pub fn do_chdir(guard: &SyscallGuard, raw_path: &str) -> KernelResult<()> {
    let cwd = guard.process().lock().cwd.clone();
    let canonical = path::absolute(&cwd, raw_path);

    match vfs::resolve(&canonical) {
        vfs::Resolved::Missing => Err(KernelError::NotFound),
        vfs::Resolved::VirtualDir => {
            guard.process().lock().cwd = canonical;
            Ok(())
        }
        vfs::Resolved::Entry { dirent, .. } => {
            if dirent.file_type != FileType::Directory {
                return Err(KernelError::NotADirectory);
            }
            guard.process().lock().cwd = canonical;
            Ok(())
        }
    }
}

/// GETCWD: `buf == 0, size == 0` queries the needed length
/// (`strlen(cwd) + 1`); otherwise the cwd is copied out.
pub fn sys_getcwd(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let buf = field_u64(args, 0)?;
        let size = field_u64(args, 8)?;
        Ok::<_, KernelError>((buf, size))
    })();
    let Ok((buf, size)) = parsed else {
        return FAILURE;
    };

    let needed = do_getcwd_len(guard);
    if buf == 0 && size == 0 {
        return needed;
    }
    if size < needed {
        return FAILURE;
    }
    if guard.process().lock().validate_range(buf, needed).is_err() {
        return FAILURE;
    }

    #[cfg(target_os = "none")]
    {
        let cwd = guard.process().lock().cwd.clone();
        unsafe {
            core::ptr::copy_nonoverlapping(cwd.as_ptr(), buf as *mut u8, cwd.len());
            (buf as *mut u8).add(cwd.len()).write(0);
        }
        needed
    }
    #[cfg(not(target_os = "none"))]
    {
        FAILURE
    }
}

/// Length a getcwd buffer needs, NUL included.
pub fn do_getcwd_len(guard: &SyscallGuard) -> u64 {
    guard.process().lock().cwd.len() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testfs::TestFs;
    use crate::process::table;
    use crate::syscall::tests::test_process;

    fn guard() -> (crate::process::ProcessRef, SyscallGuard) {
        let (process, tid) = test_process();
        let g = SyscallGuard::enter(process.clone(), tid, 0x7000_8000).unwrap();
        (process, g)
    }

    fn finish(process: crate::process::ProcessRef, g: SyscallGuard) {
        drop(g);
        let pid = process.lock().pid;
        table::remove(pid);
    }

    #[test]
    fn open_read_write_through_fds() {
        let raw = Arc::new(TestFs::new(64));
        raw.add_file("notes.txt", b"first line");
        vfs::mount(raw.clone(), "/sc1").unwrap();
        let (process, g) = guard();

        let fd = do_open(&g, "/sc1/notes.txt", O_READ | O_WRITE).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(do_read(&g, fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"first");

        // Overwrite the tail, then read it back through a seek.
        assert_eq!(do_write(&g, fd, b" byte").unwrap(), 5);
        do_seek(&g, fd, 0, SEEK_SET).unwrap();
        let mut all = [0u8; 10];
        assert_eq!(do_read(&g, fd, &mut all).unwrap(), 10);
        assert_eq!(&all, b"first byte");

        do_close(&g, fd).unwrap();
        assert_eq!(
            do_close(&g, fd).unwrap_err(),
            KernelError::BadFileDescriptor { fd: fd as i32 }
        );

        finish(process, g);
        vfs::unmount("/sc1").unwrap();
    }

    #[test]
    fn directory_needs_the_directory_flag() {
        let raw = Arc::new(TestFs::new(64));
        raw.add_file("a", b"x");
        vfs::mount(raw.clone(), "/sc2").unwrap();
        let (process, g) = guard();

        // A directory without O_DIRECTORY is refused.
        assert_eq!(
            do_open(&g, "/sc2", O_READ).unwrap_err(),
            KernelError::IsADirectory
        );

        // With the flag the FD reads packed dirents.
        let fd = do_open(&g, "/sc2", O_READ | O_DIRECTORY).unwrap();
        let record = core::mem::size_of::<crate::fs::WireDirent>();
        let mut buf = alloc::vec![0u8; 4 * record];
        let n = do_read(&g, fd, &mut buf).unwrap();
        assert_eq!(n % record, 0);
        assert!(n >= record);
        do_close(&g, fd).unwrap();

        finish(process, g);
        vfs::unmount("/sc2").unwrap();
    }

    #[test]
    fn create_flag_makes_missing_files() {
        crate::fs::name_cache::init();
        let raw = Arc::new(TestFs::new(64));
        raw.add_file("seed", b"");
        vfs::mount(raw.clone(), "/sc3").unwrap();
        let (process, g) = guard();

        assert_eq!(
            do_open(&g, "/sc3/fresh", O_WRITE).unwrap_err(),
            KernelError::NotFound
        );
        let fd = do_open(&g, "/sc3/fresh", O_WRITE | O_CREATE).unwrap();
        assert_eq!(do_write(&g, fd, b"made").unwrap(), 4);
        do_close(&g, fd).unwrap();

        // Visible to a second open now.
        let fd = do_open(&g, "/sc3/fresh", O_READ).unwrap();
        assert_eq!(do_seek(&g, fd, 0, SEEK_END).unwrap(), 4);
        do_close(&g, fd).unwrap();

        finish(process, g);
        vfs::unmount("/sc3").unwrap();
    }

    #[test]
    fn metadata_survives_unmount_remount() {
        crate::fs::name_cache::init();
        let raw = Arc::new(TestFs::new(64));
        raw.add_file("c", b"");
        vfs::mount(raw.clone(), "/sc4").unwrap();
        let (process, g) = guard();

        let fd = do_open(&g, "/sc4/c", O_WRITE | O_READ).unwrap();
        assert_eq!(do_write(&g, fd, b"0123456789").unwrap(), 10);
        do_close(&g, fd).unwrap();

        // Reopen: the close refreshed the cached metadata.
        let fd = do_open(&g, "/sc4/c", O_READ).unwrap();
        assert_eq!(do_seek(&g, fd, 0, SEEK_END).unwrap(), 10);
        do_close(&g, fd).unwrap();

        // Unmount drains the lazy flush queue into the dirent, so the
        // size survives remount with a cold cache.
        vfs::unmount("/sc4").unwrap();
        vfs::mount(raw.clone(), "/sc4").unwrap();

        let fd = do_open(&g, "/sc4/c", O_READ).unwrap();
        assert_eq!(do_seek(&g, fd, 0, SEEK_END).unwrap(), 10);
        do_close(&g, fd).unwrap();

        finish(process, g);
        vfs::unmount("/sc4").unwrap();
    }

    #[test]
    fn pipe_scenario_write_close_read_eof() {
        let (process, g) = guard();

        let packed = do_pipe(&g).unwrap();
        let rfd = (packed & 0xffff_ffff) as u32;
        let wfd = (packed >> 32) as u32;
        assert_ne!(rfd, wfd);

        assert_eq!(do_write(&g, wfd, b"hello").unwrap(), 5);
        do_close(&g, wfd).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(do_read(&g, rfd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        // EOF after the writer is gone.
        assert_eq!(do_read(&g, rfd, &mut buf).unwrap(), 0);
        do_close(&g, rfd).unwrap();

        finish(process, g);
    }

    #[test]
    fn dup_and_dup2() {
        let (process, g) = guard();

        let packed = do_pipe(&g).unwrap();
        let rfd = (packed & 0xffff_ffff) as u32;
        let wfd = (packed >> 32) as u32;

        // Plain dup takes the lowest free slot.
        let dup_w = do_dup(&g, wfd as i32, -1).unwrap();
        assert_ne!(dup_w, wfd);

        // dup2 onto an explicit slot.
        let target = 9;
        assert_eq!(do_dup(&g, rfd as i32, target).unwrap(), target as u32);

        // EOF needs *both* write descriptors closed.
        do_write(&g, dup_w, b"x").unwrap();
        do_close(&g, wfd).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(do_read(&g, target as u32, &mut buf).unwrap(), 1);
        do_close(&g, dup_w).unwrap();
        assert_eq!(do_read(&g, target as u32, &mut buf).unwrap(), 0);

        assert!(do_dup(&g, 31, -1).is_err());
        finish(process, g);
    }

    #[test]
    fn chdir_and_getcwd_length() {
        let raw = Arc::new(TestFs::new(64));
        let child = raw.add_file("inner", b"");
        let _ = child;
        vfs::mount(raw.clone(), "/sc5/mnt").unwrap();
        let (process, g) = guard();

        // Virtual directories are valid working directories.
        do_chdir(&g, "/sc5").unwrap();
        assert_eq!(process.lock().cwd, "/sc5");
        // getcwd(NULL, 0) semantics: strlen + 1.
        assert_eq!(do_getcwd_len(&g), 5);

        // Relative resolution now goes through the cwd.
        do_chdir(&g, "mnt").unwrap();
        assert_eq!(process.lock().cwd, "/sc5/mnt");

        // A file is not a directory.
        assert_eq!(
            do_chdir(&g, "inner").unwrap_err(),
            KernelError::NotADirectory
        );
        assert_eq!(
            do_chdir(&g, "/sc5/absent").unwrap_err(),
            KernelError::NotFound
        );

        finish(process, g);
        vfs::unmount("/sc5/mnt").unwrap();
    }

    #[test]
    fn access_checks_rights() {
        let raw = Arc::new(TestFs::new(64));
        raw.add_file("plain", b"z");
        vfs::mount(raw.clone(), "/sc6").unwrap();
        let (process, g) = guard();

        do_access(&g, "/sc6/plain", ACCESS_READ | ACCESS_WRITE).unwrap();
        // Seeded files carry no exec right.
        assert_eq!(
            do_access(&g, "/sc6/plain", ACCESS_EXEC).unwrap_err(),
            KernelError::PermissionDenied
        );
        assert_eq!(
            do_access(&g, "/sc6/missing", ACCESS_READ).unwrap_err(),
            KernelError::NotFound
        );

        finish(process, g);
        vfs::unmount("/sc6").unwrap();
    }

    #[test]
    fn bad_fd_numbers_fail_cleanly() {
        let (process, g) = guard();
        let mut buf = [0u8; 4];
        assert!(do_read(&g, 31, &mut buf).is_err());
        assert!(do_read(&g, 1000, &mut buf).is_err());
        assert!(do_seek(&g, 0, 0, SEEK_SET).is_err());
        assert!(do_seek(&g, 0, 0, 99).is_err());
        finish(process, g);
    }
}
