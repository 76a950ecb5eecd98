//! 阻塞式超时队列核心
//! Blocking timeout queue core
//!
//! 在一把互斥锁和一个条件变量之上实现 `TimeoutQueue`，等待集合的存储方式由
//! `PendingSet` 决定。取消的条目在 `cancel()` 时被立即移除；若与出队竞争而残留，
//! 则在到达队首时被惰性丢弃。
//!
//! Implements `TimeoutQueue` on one mutex plus one condition variable; the
//! storage of the pending set is chosen through `PendingSet`. Cancelled entries
//! are removed eagerly by `cancel()`; any that survive a race with the
//! dispatcher are dropped lazily once they reach the head.

use super::{PendingSet, TimeoutQueue};
use crate::clock;
use crate::item::{QueuedEntry, ScheduledItem, Timeout, TimeoutTarget};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct QueueState<S> {
    pending: S,
    cancelled: bool,
}

/// 基于条件变量的超时队列
/// Condition-variable based timeout queue
pub struct BlockingTimeoutQueue<S: PendingSet> {
    state: Mutex<QueueState<S>>,
    /// 在新的队首插入或队列取消时通知
    /// Signalled when a new head is inserted or the queue is cancelled
    available: Condvar,
    self_ref: Weak<Self>,
}

impl<S: PendingSet> BlockingTimeoutQueue<S> {
    /// 创建新队列。条目持有队列的弱引用，以便句柄取消时立即移除。
    /// Create a new queue. Entries keep a weak reference back to it so that
    /// cancelling a handle removes the entry right away.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(QueueState {
                pending: S::default(),
                cancelled: false,
            }),
            available: Condvar::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 丢弃队首的陈旧条目
    /// Drop stale entries sitting at the head
    fn purge_stale(pending: &mut S) {
        while pending
            .peek()
            .is_some_and(|head| head.item.state().is_stale())
        {
            if let Some(stale) = pending.pop() {
                trace!(timeout_id = stale.item.id(), "Discarded stale timeout");
            }
        }
    }

    /// Pop the head if it is due at `now`.
    fn pop_due(pending: &mut S, now: Instant) -> Option<Timeout> {
        Self::purge_stale(pending);
        let due = pending.peek().is_some_and(|head| head.deadline <= now);
        if !due {
            return None;
        }
        pending.pop().map(|entry| Timeout::from_item(entry.item))
    }

    /// 等待队首到期；`limit` 为 `None` 时无限等待
    /// Wait for the head to become due; waits forever when `limit` is `None`
    fn wait_for_due(&self, limit: Option<Instant>) -> Option<Timeout> {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return None;
            }
            let now = Instant::now();
            if let Some(timeout) = Self::pop_due(&mut state.pending, now) {
                return Some(timeout);
            }

            // either empty or the head is in the future
            let head_wait = state
                .pending
                .peek()
                .and_then(|head| clock::time_until(head.deadline, now));
            let limit_wait = match limit {
                Some(limit) => match clock::time_until(limit, now) {
                    Some(wait) => Some(wait),
                    None => return None,
                },
                None => None,
            };
            let wait = match (head_wait, limit_wait) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            state = match wait {
                Some(wait) => {
                    self.available
                        .wait_timeout(state, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

impl<S: PendingSet> TimeoutQueue for BlockingTimeoutQueue<S> {
    fn offer(&self, deadline: Instant, target: Arc<dyn TimeoutTarget>) -> Timeout {
        let owner: Weak<dyn TimeoutQueue> = self.self_ref.clone();
        let item = ScheduledItem::new(deadline, None, target, Some(owner));
        let timeout = Timeout::from_item(item.clone());

        let mut state = self.lock();
        if state.cancelled {
            item.try_cancel();
            debug!(timeout_id = item.id(), "Offer to cancelled queue discarded");
            return timeout;
        }
        item.mark_scheduled();
        let entry = QueuedEntry::new(item);
        let new_head = state.pending.peek().is_none_or(|head| entry < *head);
        state.pending.insert(entry);
        drop(state);

        if new_head {
            self.available.notify_all();
        }
        timeout
    }

    fn take(&self) -> Option<Timeout> {
        self.wait_for_due(None)
    }

    fn poll(&self) -> Option<Timeout> {
        let mut state = self.lock();
        if state.cancelled {
            return None;
        }
        Self::pop_due(&mut state.pending, Instant::now())
    }

    fn poll_timeout(&self, wait: Duration) -> Option<Timeout> {
        self.wait_for_due(Some(clock::deadline_after(wait)))
    }

    fn peek(&self) -> Option<Timeout> {
        let mut state = self.lock();
        Self::purge_stale(&mut state.pending);
        state
            .pending
            .peek()
            .map(|head| Timeout::from_item(head.item.clone()))
    }

    fn remove(&self, timeout: &Timeout) -> bool {
        let removed = self.lock().pending.remove(timeout.id(), timeout.deadline());
        if removed {
            trace!(timeout_id = timeout.id(), "Timeout removed from queue");
        }
        removed
    }

    fn clear(&self) {
        let mut state = self.lock();
        let discarded = state.pending.len();
        state.pending.clear();
        debug!(discarded, "Timeout queue cleared");
    }

    fn cancel(&self) {
        let mut state = self.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        drop(state);
        self.available.notify_all();
        debug!("Timeout queue cancelled");
    }

    fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    fn len(&self) -> usize {
        self.lock().pending.len()
    }
}

impl<S: PendingSet> fmt::Debug for BlockingTimeoutQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BlockingTimeoutQueue")
            .field("pending", &state.pending.len())
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
