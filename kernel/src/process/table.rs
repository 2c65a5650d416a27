//! Process table
//!
//! Every live process sits behind its own lock; the table itself maps
//! pids to entries and is only held long enough to find or insert one.
//! The pid is stored beside the entry so lookups never take a process
//! lock while holding the table lock (the lock order is always table,
//! then one process).

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{Pid, Process};
use crate::sync::IrqSpinlock;

/// Highest pid ever allocated; allocation wraps and skips live pids.
pub const MAX_PID: Pid = 0xffff;

/// A shared, individually locked process entry.
pub type ProcessRef = Arc<IrqSpinlock<Process>>;

static TABLE: IrqSpinlock<Vec<(Pid, ProcessRef)>> = IrqSpinlock::new(Vec::new());
static NEXT_PID: IrqSpinlock<Pid> = IrqSpinlock::new(1);

/// Insert `process`, returning its shared reference.
pub fn insert(process: Process) -> ProcessRef {
    let pid = process.pid;
    let entry = Arc::new(IrqSpinlock::new(process));
    TABLE.lock().push((pid, entry.clone()));
    entry
}

/// Find the process with `pid`.
pub fn get(pid: Pid) -> Option<ProcessRef> {
    TABLE
        .lock()
        .iter()
        .find(|(p, _)| *p == pid)
        .map(|(_, entry)| entry.clone())
}

/// Drop the table entry for `pid`. Outstanding references keep the
/// structure alive until they go away.
pub fn remove(pid: Pid) -> Option<ProcessRef> {
    let mut table = TABLE.lock();
    let index = table.iter().position(|(p, _)| *p == pid)?;
    Some(table.swap_remove(index).1)
}

/// Number of live processes.
pub fn count() -> usize {
    TABLE.lock().len()
}

/// A fresh pid that collides with no live process.
pub fn alloc_pid() -> Pid {
    let mut next = NEXT_PID.lock();
    loop {
        let candidate = *next;
        *next = if *next >= MAX_PID { 1 } else { *next + 1 };
        let taken = TABLE.lock().iter().any(|(p, _)| *p == candidate);
        if !taken {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let pid = alloc_pid();
        insert(Process::bare(pid, 0));
        assert!(get(pid).is_some());
        assert_eq!(get(pid).unwrap().lock().pid, pid);
        remove(pid).unwrap();
        assert!(get(pid).is_none());
    }

    #[test]
    fn pids_are_unique_among_live_processes() {
        let a = alloc_pid();
        insert(Process::bare(a, 0));
        let b = alloc_pid();
        assert_ne!(a, b);
        remove(a);
    }
}
