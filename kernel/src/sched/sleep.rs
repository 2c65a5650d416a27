//! Sleep list
//!
//! Sleeping threads, ordered by wake deadline. Every timer tick pops
//! the due prefix and unblocks it; cancellation (signal arming) removes
//! the entry out of order.

use alloc::vec::Vec;

use crate::process::{Pid, Tid};

#[derive(Debug, Clone, Copy)]
struct Sleeper {
    deadline_ns: u64,
    pid: Pid,
    tid: Tid,
}

pub struct SleepList {
    /// Ascending by deadline.
    entries: Vec<Sleeper>,
}

impl SleepList {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert a sleeper, keeping the list sorted.
    pub fn insert(&mut self, deadline_ns: u64, pid: Pid, tid: Tid) {
        let at = self
            .entries
            .partition_point(|s| s.deadline_ns <= deadline_ns);
        self.entries.insert(
            at,
            Sleeper {
                deadline_ns,
                pid,
                tid,
            },
        );
    }

    /// Remove and return every sleeper whose deadline has passed.
    pub fn pop_due(&mut self, now_ns: u64) -> Vec<(Pid, Tid)> {
        let due = self.entries.partition_point(|s| s.deadline_ns <= now_ns);
        self.entries
            .drain(..due)
            .map(|s| (s.pid, s.tid))
            .collect()
    }

    /// Next deadline, for the idle heuristic.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.first().map(|s| s.deadline_ns)
    }

    /// Cancel a sleeper (its sleep was interrupted).
    pub fn remove(&mut self, pid: Pid, tid: Tid) {
        self.entries.retain(|s| s.pid != pid || s.tid != tid);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SleepList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakes_in_deadline_order() {
        let mut list = SleepList::new();
        list.insert(300, 3, 1);
        list.insert(100, 1, 1);
        list.insert(200, 2, 1);

        assert_eq!(list.pop_due(50), alloc::vec![]);
        assert_eq!(list.pop_due(150), alloc::vec![(1, 1)]);
        assert_eq!(list.pop_due(400), alloc::vec![(2, 1), (3, 1)]);
        assert!(list.is_empty());
    }

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let mut list = SleepList::new();
        list.insert(100, 1, 1);
        list.insert(100, 2, 1);
        assert_eq!(list.pop_due(100), alloc::vec![(1, 1), (2, 1)]);
    }

    #[test]
    fn cancellation_removes_mid_list() {
        let mut list = SleepList::new();
        list.insert(100, 1, 1);
        list.insert(200, 2, 1);
        list.insert(300, 3, 1);
        list.remove(2, 1);
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop_due(1000), alloc::vec![(1, 1), (3, 1)]);
    }

    #[test]
    fn next_deadline_tracks_head() {
        let mut list = SleepList::new();
        assert_eq!(list.next_deadline(), None);
        list.insert(500, 1, 1);
        list.insert(100, 2, 1);
        assert_eq!(list.next_deadline(), Some(100));
    }
}
