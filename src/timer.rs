//! 协作式定时器
//! Cooperative timer
//!
//! 单个专用线程持有一个最小堆：它既等待下一个截止时间，也亲自执行到期的任务。
//! 单线程保证了触发的全序，代价是任务的执行时间会推迟后续的触发。
//! 周期性任务在执行前就被重新插入，因此下一次触发在本次执行期间已可调度。
//!
//! One dedicated thread owns a min-heap: it both waits for the next deadline
//! and runs the due task itself. A single thread gives a total order of
//! firings, at the cost of task duration delaying later firings. Periodic
//! tasks are re-inserted before they run, so the next occurrence is already
//! schedulable while the current one executes.
//!
//! 取消是惰性的：句柄只翻转状态，出队时过滤掉陈旧条目。
//! Cancellation is lazy: a handle only flips the state and stale entries are
//! filtered out when they are dequeued.


use crate::clock;
use crate::config::TimerConfig;
use crate::error::{Error, Result};
use crate::heap::MinHeap;
use crate::item::{ItemState, QueuedEntry, ScheduledItem, Timeout, TimeoutTarget};
use crate::sink::SinkRef;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// 定时器统计信息
/// Timer statistics
#[derive(Debug, Clone, Default)]
pub struct TimerStats {
    /// 堆中条目数（含尚未清理的已取消条目）
    /// Entries in the heap, including cancelled ones not yet cleaned up
    pub pending: usize,
    /// 成功执行的次数
    /// Successful firings
    pub fired: u64,
    /// 目标返回错误或 panic 的次数
    /// Firings whose target returned an error or panicked
    pub failed: u64,
    /// 出队时被丢弃的陈旧条目数
    /// Stale entries discarded on dequeue
    pub discarded: u64,
}

impl fmt::Display for TimerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TimerStats {{ pending: {}, fired: {}, failed: {}, discarded: {} }}",
            self.pending, self.fired, self.failed, self.discarded
        )
    }
}

struct TimerState {
    heap: MinHeap<QueuedEntry>,
    shutdown: bool,
}

#[derive(Default)]
struct TimerCounters {
    fired: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    counters: TimerCounters,
    sink: SinkRef,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, item: Arc<ScheduledItem>) -> Result<()> {
        let mut state = self.lock();
        if state.shutdown {
            item.try_cancel();
            return Err(Error::Shutdown);
        }
        item.mark_scheduled();
        let entry = QueuedEntry::new(item);
        let new_head = state.heap.peek().is_none_or(|head| entry < *head);
        state.heap.insert(entry);
        drop(state);

        if new_head {
            self.wakeup.notify_all();
        }
        Ok(())
    }

    /// 阻塞直到有条目到期，返回要执行的条目；关闭时返回 `None`
    /// Block until an item is due and return it; `None` on shutdown
    fn next_due(&self) -> Option<Arc<ScheduledItem>> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return None;
            }
            let Some(entry) = state.heap.extract_min() else {
                state = self.wakeup.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            if entry.item.state().is_stale() {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                trace!(timeout_id = entry.item.id(), "Discarded stale timer entry");
                continue;
            }

            match clock::time_until(entry.deadline, Instant::now()) {
                Some(wait) => {
                    // still the global minimum; put it back and sleep until it is due
                    state.heap.insert(entry);
                    state = self
                        .wakeup
                        .wait_timeout(state, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    let item = entry.item;
                    if item.advance().is_some() {
                        state.heap.insert(QueuedEntry::new(item.clone()));
                    } else if !item.done() {
                        // cancelled between the stale check and now
                        continue;
                    }
                    return Some(item);
                }
            }
        }
    }

    fn fire(&self, item: &Arc<ScheduledItem>) {
        if item.state() == ItemState::Cancelled {
            return;
        }
        match item.invoke() {
            Ok(()) => {
                self.counters.fired.fetch_add(1, Ordering::Relaxed);
                trace!(timeout_id = item.id(), periodic = item.period().is_some(), "Timer fired");
            }
            Err(failure) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.sink.report(&failure);
            }
        }
    }

    fn run(&self) {
        info!("Cooperative timer started");
        while let Some(item) = self.next_due() {
            self.fire(&item);
        }
        let discarded = {
            let mut state = self.lock();
            let pending = state.heap.len();
            state.heap.clear();
            pending
        };
        info!(discarded, "Cooperative timer stopped");
    }
}

/// 协作式定时器：一个线程负责等待和执行
/// Cooperative timer: one thread both waits and executes
pub struct CooperativeTimer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CooperativeTimer {
    /// 使用默认配置创建定时器并启动其线程
    /// Create a timer with the default configuration and start its thread
    pub fn new() -> Result<Self> {
        Self::with_config(TimerConfig::default())
    }

    pub fn with_config(config: TimerConfig) -> Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: MinHeap::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            counters: TimerCounters::default(),
            sink: SinkRef::from(config.error_sink),
        });

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || thread_shared.run())?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// 在 `delay` 之后执行一次
    /// Run once after `delay`
    pub fn schedule<T: TimeoutTarget>(&self, delay: Duration, target: T) -> Result<Timeout> {
        self.schedule_at(clock::deadline_after(delay), target)
    }

    /// 在 `deadline` 执行一次
    /// Run once at `deadline`
    pub fn schedule_at<T: TimeoutTarget>(&self, deadline: Instant, target: T) -> Result<Timeout> {
        self.insert(deadline, None, Arc::new(target))
    }

    /// 在纪元毫秒时间 `deadline_millis` 执行一次；负值被拒绝
    /// Run once at wall-clock `deadline_millis`; negative values are rejected
    pub fn schedule_at_millis<T: TimeoutTarget>(
        &self,
        deadline_millis: i64,
        target: T,
    ) -> Result<Timeout> {
        let deadline = clock::instant_from_millis(deadline_millis)?;
        self.schedule_at(deadline, target)
    }

    /// 在 `delay` 之后首次执行，此后每隔 `period` 执行一次，直到取消
    /// First run after `delay`, then every `period` until cancelled
    ///
    /// Each next deadline is the previous computed deadline plus `period`, not
    /// the time the previous firing finished.
    pub fn schedule_periodic<T: TimeoutTarget>(
        &self,
        delay: Duration,
        period: Duration,
        target: T,
    ) -> Result<Timeout> {
        if period.is_zero() {
            return Err(Error::InvalidPeriod);
        }
        self.insert(clock::deadline_after(delay), Some(period), Arc::new(target))
    }

    fn insert(
        &self,
        deadline: Instant,
        period: Option<Duration>,
        target: Arc<dyn TimeoutTarget>,
    ) -> Result<Timeout> {
        let item = ScheduledItem::new(deadline, period, target, None);
        let timeout = Timeout::from_item(item.clone());
        self.shared.insert(item)?;
        Ok(timeout)
    }

    /// 停止定时器：唤醒线程，丢弃所有等待中的条目，不触发它们
    /// Stop the timer: wake the thread and discard every pending item unfired
    ///
    /// 正在执行的目标不会被打断。若从定时器线程自身调用，不会等待线程退出。
    /// An in-progress target is not interrupted. When called from the timer
    /// thread itself, this does not wait for the thread to exit.
    pub fn cancel(&self) {
        let first = {
            let mut state = self.shared.lock();
            !std::mem::replace(&mut state.shutdown, true)
        };
        self.shared.wakeup.notify_all();
        if first {
            debug!("Cooperative timer cancelling");
        }

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Cooperative timer thread terminated abnormally");
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// 堆中的条目数（含尚未清理的已取消条目）
    /// Entries in the heap, including cancelled ones not yet cleaned up
    pub fn pending(&self) -> usize {
        self.shared.lock().heap.len()
    }

    pub fn stats(&self) -> TimerStats {
        let counters = &self.shared.counters;
        TimerStats {
            pending: self.pending(),
            fired: counters.fired.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CooperativeTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for CooperativeTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CooperativeTimer")
            .field("stats", &self.stats())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
