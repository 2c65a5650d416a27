//! File descriptors
//!
//! A process FD is either empty, an open file handle, or a directory
//! stream: directories are rendered into a packed dirent byte stream at
//! open time and the FD carries a byte offset into it.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::fs::vfile::{self, Whence};
use crate::fs::FileHandle;

/// FD table size per process.
pub const MAX_FDS: usize = 32;

/// Bitmask of FDs a child inherits on spawn; bit `i` keeps fd `i`.
pub type FdMask = u32;

/// An open directory: the rendered entries plus the path they came
/// from.
pub struct DirStream {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// One slot of the process FD table.
pub enum FileDescriptor {
    None,
    File(FileHandle),
    Dir {
        stream: DirStream,
        /// Byte offset of the next directory read.
        offset: usize,
    },
}

impl FileDescriptor {
    pub fn is_none(&self) -> bool {
        matches!(self, FileDescriptor::None)
    }

    /// Duplicate the descriptor: files get a fresh handle on the same
    /// vfile, directory streams are copied with their offset.
    pub fn duplicate(&self) -> KernelResult<FileDescriptor> {
        match self {
            FileDescriptor::None => Ok(FileDescriptor::None),
            FileDescriptor::File(handle) => Ok(FileDescriptor::File(vfile::dup(handle)?)),
            FileDescriptor::Dir { stream, offset } => Ok(FileDescriptor::Dir {
                stream: DirStream {
                    path: stream.path.clone(),
                    bytes: stream.bytes.clone(),
                },
                offset: *offset,
            }),
        }
    }

    /// Read from the descriptor into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> KernelResult<usize> {
        match self {
            FileDescriptor::None => Err(KernelError::BadFileDescriptor { fd: -1 }),
            FileDescriptor::File(handle) => handle.read(buf),
            FileDescriptor::Dir { stream, offset } => {
                let remaining = stream.bytes.len().saturating_sub(*offset);
                let n = remaining.min(buf.len());
                buf[..n].copy_from_slice(&stream.bytes[*offset..*offset + n]);
                *offset += n;
                Ok(n)
            }
        }
    }

    /// Write `buf` through the descriptor. Directories are not
    /// writable.
    pub fn write(&mut self, buf: &[u8]) -> KernelResult<usize> {
        match self {
            FileDescriptor::None => Err(KernelError::BadFileDescriptor { fd: -1 }),
            FileDescriptor::File(handle) => handle.write(buf),
            FileDescriptor::Dir { .. } => Err(KernelError::IsADirectory),
        }
    }

    /// Seek; directory streams clamp to the rendered size.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> KernelResult<u64> {
        match self {
            FileDescriptor::None => Err(KernelError::BadFileDescriptor { fd: -1 }),
            FileDescriptor::File(handle) => handle.seek(offset, whence),
            FileDescriptor::Dir {
                stream,
                offset: cur,
            } => {
                let len = stream.bytes.len() as i64;
                let base = match whence {
                    Whence::Set => 0,
                    Whence::Cur => *cur as i64,
                    Whence::End => len,
                };
                let target = base.checked_add(offset).ok_or(KernelError::InvalidArgument)?;
                if target < 0 {
                    return Err(KernelError::InvalidArgument);
                }
                *cur = (target.min(len)) as usize;
                Ok(*cur as u64)
            }
        }
    }

    /// Close the slot, leaving `None` behind.
    pub fn close(&mut self) -> KernelResult<()> {
        match core::mem::replace(self, FileDescriptor::None) {
            FileDescriptor::None => Err(KernelError::WrongState),
            FileDescriptor::File(handle) => {
                handle.close();
                Ok(())
            }
            FileDescriptor::Dir { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{render_dirents, Dirent, FileSize, FileType, Rights, WireDirent};

    fn dir_fd() -> FileDescriptor {
        let entries = alloc::vec![
            Dirent {
                ino: 1,
                file_size: FileSize::Known(10),
                file_type: FileType::Regular,
                rights: Rights::READ,
                name: String::from("a"),
            },
            Dirent {
                ino: 2,
                file_size: FileSize::Known(20),
                file_type: FileType::Directory,
                rights: Rights::READ,
                name: String::from("b"),
            },
        ];
        FileDescriptor::Dir {
            stream: DirStream {
                path: String::from("/d"),
                bytes: render_dirents(&entries),
            },
            offset: 0,
        }
    }

    #[test]
    fn directory_reads_are_offset_tracked() {
        let mut fd = dir_fd();
        let record = core::mem::size_of::<WireDirent>();

        let mut buf = alloc::vec![0u8; record];
        assert_eq!(fd.read(&mut buf).unwrap(), record);
        let mut buf2 = alloc::vec![0u8; 2 * record];
        // Only one record left.
        assert_eq!(fd.read(&mut buf2).unwrap(), record);
        assert_eq!(fd.read(&mut buf2).unwrap(), 0);
    }

    #[test]
    fn directory_seek_clamps() {
        let mut fd = dir_fd();
        let len = 2 * core::mem::size_of::<WireDirent>() as u64;
        assert_eq!(fd.seek(0, Whence::End).unwrap(), len);
        assert_eq!(fd.seek(1_000_000, Whence::Set).unwrap(), len);
        assert_eq!(fd.seek(0, Whence::Set).unwrap(), 0);
        assert!(fd.seek(-1, Whence::Cur).is_err());
    }

    #[test]
    fn directory_rejects_write() {
        let mut fd = dir_fd();
        assert_eq!(fd.write(b"x").unwrap_err(), KernelError::IsADirectory);
    }

    #[test]
    fn close_empties_the_slot() {
        let mut fd = dir_fd();
        fd.close().unwrap();
        assert!(fd.is_none());
        assert_eq!(fd.close().unwrap_err(), KernelError::WrongState);
    }

    #[test]
    fn duplicate_keeps_offset() {
        let mut fd = dir_fd();
        let record = core::mem::size_of::<WireDirent>();
        let mut buf = alloc::vec![0u8; record];
        fd.read(&mut buf).unwrap();

        let mut copy = fd.duplicate().unwrap();
        let mut rest = alloc::vec![0u8; 4 * record];
        assert_eq!(copy.read(&mut rest).unwrap(), record);
    }
}
