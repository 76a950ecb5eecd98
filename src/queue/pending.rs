//! 等待集合的存储后端
//! Storage backends for the pending set

use crate::heap::MinHeap;
use crate::item::{QueuedEntry, TimeoutId};
use std::collections::BTreeMap;
use std::time::Instant;

/// 按截止时间排序的等待条目集合，由队列在锁内访问
/// Deadline-ordered set of pending entries, accessed by the queue under its lock
pub trait PendingSet: Default + Send + 'static {
    fn insert(&mut self, entry: QueuedEntry);

    fn peek(&self) -> Option<&QueuedEntry>;

    fn pop(&mut self) -> Option<QueuedEntry>;

    /// `deadline` is the snapshot taken when the entry was inserted.
    fn remove(&mut self, id: TimeoutId, deadline: Instant) -> bool;

    fn clear(&mut self);

    fn len(&self) -> usize;
}

impl PendingSet for MinHeap<QueuedEntry> {
    fn insert(&mut self, entry: QueuedEntry) {
        MinHeap::insert(self, entry);
    }

    fn peek(&self) -> Option<&QueuedEntry> {
        MinHeap::peek(self)
    }

    fn pop(&mut self) -> Option<QueuedEntry> {
        self.extract_min()
    }

    fn remove(&mut self, id: TimeoutId, _deadline: Instant) -> bool {
        self.remove_where(|entry| entry.item.id() == id).is_some()
    }

    fn clear(&mut self) {
        MinHeap::clear(self);
    }

    fn len(&self) -> usize {
        MinHeap::len(self)
    }
}

/// 以 `(截止时间, ID)` 为键的有序映射
/// Ordered map keyed by `(deadline, id)`
#[derive(Debug, Default)]
pub struct OrderedPending {
    entries: BTreeMap<(Instant, TimeoutId), QueuedEntry>,
}

impl PendingSet for OrderedPending {
    fn insert(&mut self, entry: QueuedEntry) {
        self.entries.insert((entry.deadline, entry.item.id()), entry);
    }

    fn peek(&self) -> Option<&QueuedEntry> {
        self.entries.values().next()
    }

    fn pop(&mut self) -> Option<QueuedEntry> {
        self.entries.pop_first().map(|(_, entry)| entry)
    }

    fn remove(&mut self, id: TimeoutId, deadline: Instant) -> bool {
        self.entries.remove(&(deadline, id)).is_some()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
