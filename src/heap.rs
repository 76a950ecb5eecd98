//! 二叉最小堆
//! Binary min-heap
//!
//! 基于可增长数组的二叉最小堆。本身不做任何同步，所有者（协作定时器或解耦队列）
//! 必须在自己的锁内访问它。
//!
//! A binary min-heap backed by a growable array. It does no synchronization of
//! its own; the owner (cooperative timer or decoupled queue) must serialize
//! access under its own lock.

/// 二叉最小堆，父节点总是不大于子节点
/// Binary min-heap, every parent is less than or equal to its children
#[derive(Debug, Clone)]
pub struct MinHeap<T: Ord> {
    nodes: Vec<T>,
}

impl<T: Ord> Default for MinHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> MinHeap<T> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// 插入元素并恢复堆序，O(log n)
    /// Insert an item and restore heap order, O(log n)
    pub fn insert(&mut self, item: T) {
        self.nodes.push(item);
        let last = self.nodes.len() - 1;
        self.sift_up(last);
    }

    /// 查看最小元素但不移除
    /// Peek at the minimum without removing it
    pub fn peek(&self) -> Option<&T> {
        self.nodes.first()
    }

    /// 移除并返回最小元素，O(log n)
    /// Remove and return the minimum, O(log n)
    pub fn extract_min(&mut self) -> Option<T> {
        self.remove_at(0)
    }

    /// 移除第一个满足条件的元素，O(n) 查找加 O(log n) 修复
    /// Remove the first item matching `pred`, O(n) search plus O(log n) repair
    pub fn remove_where<F>(&mut self, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let index = self.nodes.iter().position(|n| pred(n))?;
        self.remove_at(index)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn remove_at(&mut self, index: usize) -> Option<T> {
        if index >= self.nodes.len() {
            return None;
        }
        let removed = self.nodes.swap_remove(index);
        if index < self.nodes.len() {
            // the moved tail node may belong above or below its new slot
            let index = self.sift_up(index);
            self.sift_down(index);
        }
        Some(removed)
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.nodes[index] >= self.nodes[parent] {
                break;
            }
            self.nodes.swap(index, parent);
            index = parent;
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.nodes.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let smallest = if right < len && self.nodes[right] < self.nodes[left] {
                right
            } else {
                left
            };
            if self.nodes[index] <= self.nodes[smallest] {
                break;
            }
            self.nodes.swap(index, smallest);
            index = smallest;
        }
    }

    #[cfg(test)]
    fn is_valid(&self) -> bool {
        (1..self.nodes.len()).all(|i| self.nodes[(i - 1) / 2] <= self.nodes[i])
    }
}
