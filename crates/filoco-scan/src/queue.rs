//! The scan request queue
//!
//! A priority queue of pending scan work. Priority is the target's inode
//! number so a full walk touches the disk roughly sequentially; a
//! monotone sequence number breaks ties in arrival order. When the queue
//! holds more open descriptors than [`ScanQueue::max_fds`], newly queued
//! targets are demoted to weak (handle-only) references and reopened when
//! processed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::inode::InodeInfo;

/// What to do with a queued target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    /// Stat and compare against the stored tuple; rescan if changed
    Check,
    /// Read directory contents and reconcile links
    Scan,
    /// Scan and queue every subdirectory the same way
    ScanRecursive,
}

/// One queued request
#[derive(Debug)]
pub struct ScanRequest {
    /// Sort priority, normally the target inode number
    pub prio: u64,
    /// Arrival order tie-breaker
    pub seq: u64,
    /// Requested action
    pub action: ScanAction,
    /// The inode to act on
    pub target: InodeInfo,
}

struct Entry(ScanRequest);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        (self.0.prio, self.0.seq) == (other.0.prio, other.0.seq)
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest (prio, seq)
        // pops first.
        (other.0.prio, other.0.seq).cmp(&(self.0.prio, self.0.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of scan requests with descriptor accounting
pub struct ScanQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    open_fds: usize,
    max_fds: usize,
}

impl ScanQueue {
    /// Creates a queue that demotes targets beyond `max_fds` descriptors
    pub fn new(max_fds: usize) -> Self {
        ScanQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
            open_fds: 0,
            max_fds,
        }
    }

    /// Queues a request, demoting the target under descriptor pressure
    pub fn push(&mut self, action: ScanAction, mut target: InodeInfo) {
        if self.open_fds >= self.max_fds {
            target.release_fd();
        }
        if target.has_fd() {
            self.open_fds += 1;
        }
        self.next_seq += 1;
        let prio = target.ino.unwrap_or(0);
        self.heap.push(Entry(ScanRequest {
            prio,
            seq: self.next_seq,
            action,
            target,
        }));
    }

    /// Pops the lowest-priority request
    pub fn pop(&mut self) -> Option<ScanRequest> {
        let req = self.heap.pop()?.0;
        if req.target.has_fd() {
            self.open_fds -= 1;
        }
        Some(req)
    }

    /// True if no requests are queued
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of queued requests
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Number of strong descriptors currently queued
    pub fn open_fds(&self) -> usize {
        self.open_fds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(ino: u64) -> InodeInfo {
        let mut info = InodeInfo::from_db(&filoco_store::InodeRow {
            iid: format!("i{ino}"),
            ino,
            handle: filoco_store::FileHandle {
                handle_type: 1,
                bytes: vec![0],
            },
            ftype: filoco_core::FobType::Directory,
            size: None,
            mtime: None,
            ctime: None,
            btime: None,
            scan_state: filoco_store::ScanState::NeverScanned,
            fob: None,
            flv: None,
            fcv: None,
        });
        info.ino = Some(ino);
        info
    }

    #[test]
    fn test_pops_in_inode_order() {
        let mut q = ScanQueue::new(10);
        q.push(ScanAction::Scan, target(30));
        q.push(ScanAction::Scan, target(10));
        q.push(ScanAction::Scan, target(20));
        let order: Vec<u64> = std::iter::from_fn(|| q.pop()).map(|r| r.prio).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn test_sequence_breaks_ties() {
        let mut q = ScanQueue::new(10);
        q.push(ScanAction::Scan, target(5));
        q.push(ScanAction::Check, target(5));
        let first = q.pop().unwrap();
        let second = q.pop().unwrap();
        assert!(first.seq < second.seq);
        assert_eq!(first.action, ScanAction::Scan);
        assert_eq!(second.action, ScanAction::Check);
    }

    #[test]
    fn test_empty() {
        let mut q = ScanQueue::new(10);
        assert!(q.is_empty());
        assert!(q.pop().is_none());
        q.push(ScanAction::Scan, target(1));
        assert_eq!(q.len(), 1);
    }
}
