//! Ready queues
//!
//! Four priority levels of `(pid, tid)` entries. Dispatch pops from the
//! highest non-empty level, then promotes one entry from each lower
//! level a step up, so nothing starves no matter how busy the top
//! levels stay.

use alloc::collections::VecDeque;

use crate::process::{Pid, Tid};

/// Number of priority levels; 0 is the highest.
pub const PRIORITY_LEVELS: usize = 4;

pub struct ReadyQueue {
    levels: [VecDeque<(Pid, Tid)>; PRIORITY_LEVELS],
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            levels: [const { VecDeque::new() }; PRIORITY_LEVELS],
        }
    }

    /// Append at `level` (clamped to the lowest).
    pub fn enqueue(&mut self, pid: Pid, tid: Tid, level: usize) {
        let level = level.min(PRIORITY_LEVELS - 1);
        self.levels[level].push_back((pid, tid));
    }

    /// Append at the highest priority (fresh wake-ups).
    pub fn enqueue_top(&mut self, pid: Pid, tid: Tid) {
        self.enqueue(pid, tid, 0);
    }

    /// Pop the next runnable entry and rotate one entry of every lower
    /// level up a step.
    pub fn pop_next(&mut self) -> Option<(Pid, Tid)> {
        let level = (0..PRIORITY_LEVELS).find(|&l| !self.levels[l].is_empty())?;
        let entry = self.levels[level].pop_front();

        for lower in (level + 1)..PRIORITY_LEVELS {
            if let Some(promoted) = self.levels[lower].pop_front() {
                self.levels[lower - 1].push_back(promoted);
            }
        }
        entry
    }

    /// Drop every queued entry of `pid` (process kill) or of one thread
    /// when `tid` is given.
    pub fn purge(&mut self, pid: Pid, tid: Option<Tid>) {
        for level in self.levels.iter_mut() {
            level.retain(|&(p, t)| p != pid || tid.is_some_and(|wanted| t != wanted));
        }
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_highest_priority_first() {
        let mut q = ReadyQueue::new();
        q.enqueue(1, 1, 2);
        q.enqueue(2, 1, 0);
        q.enqueue(3, 1, 1);
        assert_eq!(q.pop_next(), Some((2, 1)));
    }

    #[test]
    fn fifo_within_a_level() {
        let mut q = ReadyQueue::new();
        q.enqueue(1, 1, 1);
        q.enqueue(1, 2, 1);
        q.enqueue(1, 3, 1);
        assert_eq!(q.pop_next(), Some((1, 1)));
        assert_eq!(q.pop_next(), Some((1, 2)));
        assert_eq!(q.pop_next(), Some((1, 3)));
    }

    #[test]
    fn promotion_prevents_starvation() {
        let mut q = ReadyQueue::new();
        q.enqueue(9, 1, 3);
        // A steady stream of high-priority work.
        for i in 0..PRIORITY_LEVELS as u32 {
            q.enqueue(1, i + 1, 0);
        }

        // Each pop promotes the lowly entry one level; within a bounded
        // number of dispatches it must surface even though fresh
        // top-level work keeps arriving.
        for round in 0..16 {
            let (pid, _) = q.pop_next().unwrap();
            if pid == 9 {
                assert!(round >= PRIORITY_LEVELS - 1);
                return;
            }
            q.enqueue(1, 99, 0);
        }
        panic!("low-priority entry starved");
    }

    #[test]
    fn purge_removes_process_entries() {
        let mut q = ReadyQueue::new();
        q.enqueue(5, 1, 0);
        q.enqueue(5, 2, 1);
        q.enqueue(6, 1, 2);
        q.purge(5, None);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_next(), Some((6, 1)));
    }

    #[test]
    fn purge_single_thread() {
        let mut q = ReadyQueue::new();
        q.enqueue(5, 1, 0);
        q.enqueue(5, 2, 0);
        q.purge(5, Some(2));
        assert_eq!(q.pop_next(), Some((5, 1)));
        assert!(q.is_empty());
    }
}
