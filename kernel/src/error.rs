//! Kernel error types
//!
//! Recoverable failures are values, not panics: every fallible kernel API
//! returns `Result<T, KernelError>` and propagates with `?`. The syscall
//! layer is the single place where a `KernelError` becomes the `-1` a user
//! program sees.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A resource pool ran dry: frames, heap, FD slots, SHM slots.
    OutOfMemory,
    /// A pointer argument failed the process address-space check.
    BadAddress { addr: u64 },
    /// Path, pid, tid, SHM id or signal number does not exist.
    NotFound,
    /// The required right is absent (e.g. read on a write-only pipe end).
    PermissionDenied,
    /// The operation does not make sense in the current state
    /// (e.g. `sigreturn` outside a handler, closing an unopened FD).
    WrongState,
    /// FD number out of range or not open.
    BadFileDescriptor { fd: i32 },
    /// No free slot in the process FD table.
    TooManyOpenFiles,
    /// Non-blocking operation would have to block.
    WouldBlock,
    /// A blocking operation was cut short by signal arming.
    Interrupted,
    /// Write on a pipe whose read end is gone.
    BrokenPipe,
    /// Directory operation on a non-directory.
    NotADirectory,
    /// File operation on a directory opened without the directory flag.
    IsADirectory,
    /// Seek on a stream without the seekable right.
    NotSeekable,
    /// A fixed-size kernel table is full (vfiles, SHM table, mounts).
    Exhausted { resource: &'static str },
    /// Unknown flag bits or an out-of-range enum value from user space.
    InvalidArgument,
    /// The filesystem refused the operation (propagated from the fs layer).
    FsFailure,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::BadAddress { addr } => write!(f, "bad address {addr:#x}"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::PermissionDenied => write!(f, "permission denied"),
            KernelError::WrongState => write!(f, "wrong state"),
            KernelError::BadFileDescriptor { fd } => write!(f, "bad file descriptor {fd}"),
            KernelError::TooManyOpenFiles => write!(f, "too many open files"),
            KernelError::WouldBlock => write!(f, "operation would block"),
            KernelError::Interrupted => write!(f, "interrupted by signal"),
            KernelError::BrokenPipe => write!(f, "broken pipe"),
            KernelError::NotADirectory => write!(f, "not a directory"),
            KernelError::IsADirectory => write!(f, "is a directory"),
            KernelError::NotSeekable => write!(f, "stream is not seekable"),
            KernelError::Exhausted { resource } => write!(f, "{resource} table exhausted"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::FsFailure => write!(f, "filesystem operation failed"),
        }
    }
}

/// Shorthand used across the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        let e = KernelError::BadFileDescriptor { fd: 7 };
        assert_eq!(alloc::format!("{e}"), "bad file descriptor 7");
        let e = KernelError::BadAddress { addr: 0x1000 };
        assert_eq!(alloc::format!("{e}"), "bad address 0x1000");
    }
}
