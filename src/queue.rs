//! 解耦超时队列
//! Decoupled timeout queue
//!
//! 线程安全的优先队列抽象。多个生产者线程可以并发调用 `offer`，
//! 由唯一的分发线程调用 `take` 取出到期条目。
//!
//! A thread-safe priority queue abstraction. Many producer threads may call
//! `offer` concurrently while exactly one dispatcher thread drains due entries
//! through `take`.
//!
//! 具体实现通过名称从进程级注册表中选择（内置 `"heap"` 和 `"btree"`）。
//! Implementations are selected by name from a process-wide registry
//! (`"heap"` and `"btree"` are built in).

mod blocking;
mod pending;


pub use blocking::BlockingTimeoutQueue;
pub use pending::{OrderedPending, PendingSet};

use crate::error::{Error, Result};
use crate::heap::MinHeap;
use crate::item::{QueuedEntry, Timeout, TimeoutTarget};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// 基于二叉最小堆的默认队列，`remove` 为 O(n)
/// Default queue backed by the binary min-heap, O(n) `remove`
pub type HeapTimeoutQueue = BlockingTimeoutQueue<MinHeap<QueuedEntry>>;

/// 基于有序映射的队列，`remove` 为 O(log n)
/// Queue backed by an ordered map, O(log n) `remove`
pub type BTreeTimeoutQueue = BlockingTimeoutQueue<OrderedPending>;

/// 默认队列实现的注册名
/// Registered name of the default queue implementation
pub const DEFAULT_QUEUE: &str = "heap";

/// 超时优先队列 trait
/// Timeout priority queue trait
pub trait TimeoutQueue: Send + Sync + 'static {
    /// 插入新条目并返回其句柄；队列无界，总是成功
    /// Insert a new entry and return its handle; the queue is unbounded and always accepts
    ///
    /// After `cancel()` the returned handle is already cancelled.
    fn offer(&self, deadline: Instant, target: Arc<dyn TimeoutTarget>) -> Timeout;

    /// 阻塞直到最小条目到期并将其移除；仅在队列被取消后返回 `None`
    /// Block until the minimum entry is due and remove it; `None` only once cancelled
    fn take(&self) -> Option<Timeout>;

    /// 非阻塞版本的 `take`
    /// Non-blocking `take`
    fn poll(&self) -> Option<Timeout>;

    /// 最多等待 `wait` 的 `take`
    /// `take` bounded by `wait`
    fn poll_timeout(&self, wait: Duration) -> Option<Timeout>;

    /// 查看最小条目但不移除
    /// View the minimum entry without removing it
    fn peek(&self) -> Option<Timeout>;

    /// 移除仍在队列中的条目
    /// Remove an entry still present in the queue
    fn remove(&self, timeout: &Timeout) -> bool;

    /// 丢弃所有等待中的条目，不触发它们
    /// Discard every pending entry without firing it
    fn clear(&self);

    /// 永久关闭队列并唤醒所有阻塞的 `take`
    /// Permanently close the queue and wake every blocked `take`
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 队列构造函数
/// Queue constructor
pub type QueueConstructor = fn() -> Arc<dyn TimeoutQueue>;

fn new_heap_queue() -> Arc<dyn TimeoutQueue> {
    HeapTimeoutQueue::new()
}

fn new_btree_queue() -> Arc<dyn TimeoutQueue> {
    BTreeTimeoutQueue::new()
}

fn registry() -> &'static DashMap<String, QueueConstructor> {
    static REGISTRY: OnceLock<DashMap<String, QueueConstructor>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let map: DashMap<String, QueueConstructor> = DashMap::new();
        map.insert(DEFAULT_QUEUE.to_string(), new_heap_queue);
        map.insert("btree".to_string(), new_btree_queue);
        map
    })
}

/// 以名称注册队列实现，返回被替换的构造函数
/// Register a queue implementation under `name`, returning any replaced constructor
pub fn register_queue(name: &str, constructor: QueueConstructor) -> Option<QueueConstructor> {
    let previous = registry().insert(name.to_ascii_lowercase(), constructor);
    debug!(name, replaced = previous.is_some(), "Timeout queue implementation registered");
    previous
}

/// 按名称创建队列（不区分大小写）
/// Create a queue by name (case-insensitive)
pub fn create_queue(name: &str) -> Result<Arc<dyn TimeoutQueue>> {
    let constructor = registry()
        .get(&name.to_ascii_lowercase())
        .map(|entry| *entry.value())
        .ok_or_else(|| Error::UnknownQueue(name.to_string()))?;
    Ok(constructor())
}

/// 已注册的实现名称（已排序）
/// Names of registered implementations, sorted
pub fn registered_queues() -> Vec<String> {
    let mut names: Vec<String> = registry().iter().map(|entry| entry.key().clone()).collect();
    names.sort();
    names
}
