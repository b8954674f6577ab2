use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;

use crate::storage::SourceKind;

/// One discovered unit of work, not yet a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    pub kind: SourceKind,
}

fn weight(kind: SourceKind) -> u8 {
    // Directories drain first so discovery keeps flowing.
    match kind {
        SourceKind::Directory => 0,
        SourceKind::File => 1,
    }
}

struct HeapEntry {
    weight: u8,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the std max-heap pops the smallest (weight, seq) first:
    // lowest weight wins, FIFO within equal weight.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.weight, other.seq).cmp(&(self.weight, self.seq))
    }
}

/// Bounded priority heap of discovered work items. Once full, discovery
/// pauses until the foreman drains it.
pub struct WorkItemHeap {
    entries: BinaryHeap<HeapEntry>,
    capacity: usize,
    next_seq: u64,
}

impl WorkItemHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BinaryHeap::new(),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    /// Returns false without inserting when the heap is at capacity.
    pub fn push(&mut self, item: WorkItem) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        let entry = HeapEntry {
            weight: weight(item.kind),
            seq: self.next_seq,
            item,
        };
        self.next_seq += 1;
        self.entries.push(entry);
        true
    }

    pub fn pop(&mut self) -> Option<WorkItem> {
        self.entries.pop().map(|entry| entry.item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_room(&self) -> bool {
        self.entries.len() < self.capacity
    }

    pub fn room(&self) -> usize {
        self.capacity.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, kind: SourceKind) -> WorkItem {
        WorkItem {
            path: PathBuf::from(path),
            kind,
        }
    }

    #[test]
    fn directory_pops_before_file_regardless_of_insert_order() {
        let mut heap = WorkItemHeap::new(10);
        assert!(heap.push(item("/f", SourceKind::File)));
        assert!(heap.push(item("/d", SourceKind::Directory)));
        assert_eq!(heap.pop().map(|i| i.path), Some(PathBuf::from("/d")));
        assert_eq!(heap.pop().map(|i| i.path), Some(PathBuf::from("/f")));

        let mut heap = WorkItemHeap::new(10);
        assert!(heap.push(item("/d", SourceKind::Directory)));
        assert!(heap.push(item("/f", SourceKind::File)));
        assert_eq!(heap.pop().map(|i| i.path), Some(PathBuf::from("/d")));
        assert_eq!(heap.pop().map(|i| i.path), Some(PathBuf::from("/f")));
    }

    #[test]
    fn equal_weight_drains_fifo() {
        let mut heap = WorkItemHeap::new(10);
        for name in ["/a", "/b", "/c"] {
            assert!(heap.push(item(name, SourceKind::File)));
        }
        let order: Vec<PathBuf> = std::iter::from_fn(|| heap.pop().map(|i| i.path)).collect();
        assert_eq!(
            order,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut heap = WorkItemHeap::new(2);
        assert!(heap.push(item("/a", SourceKind::File)));
        assert!(heap.push(item("/b", SourceKind::File)));
        assert!(!heap.push(item("/c", SourceKind::File)));
        assert_eq!(heap.len(), 2);
        assert!(!heap.has_room());

        heap.pop();
        assert!(heap.has_room());
        assert!(heap.push(item("/c", SourceKind::File)));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut heap = WorkItemHeap::new(0);
        assert!(heap.push(item("/a", SourceKind::File)));
        assert!(!heap.push(item("/b", SourceKind::File)));
    }
}
