//! 超时工厂
//! Timeout factory
//!
//! 解耦调度：一个专用的分发线程只负责等待截止时间，到期的目标被交给工作线程池执行。
//! 慢的目标不会推迟其他目标的触发，代价是触发之间不再有全序。
//!
//! Decoupled scheduling: one dedicated dispatcher thread only waits for
//! deadlines and hands due targets to a worker pool. A slow target never delays
//! the firing of others, at the cost of losing a total order between firings.
//!
//! 分发线程在提交之前就通过 `done()` 认领条目，因此在提交之后调用 `cancel()`
//! 不会阻止执行并返回 `false`。
//! The dispatcher claims an item with `done()` before submitting it, so a
//! `cancel()` arriving after submission cannot prevent the run and returns `false`.


use crate::clock;
use crate::config::{FactoryConfig, PoolConfig};
use crate::error::{Error, Result};
use crate::item::{ScheduledItem, Timeout, TimeoutTarget};
use crate::pool::{BoundedThreadPool, Work, WorkerPool};
use crate::queue::{self, TimeoutQueue};
use crate::sink::{FailureKind, FiringFailure, SinkRef};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// 超时工厂统计信息
/// Timeout factory statistics
#[derive(Debug, Clone, Default)]
pub struct FactoryStats {
    /// 队列中等待的条目数
    /// Entries waiting in the queue
    pub pending: usize,
    /// 已提交给线程池的条目数
    /// Items handed to the worker pool
    pub submitted: u64,
    /// 线程池拒绝（或在接收时 panic）的条目数
    /// Items the worker pool refused or panicked on while accepting
    pub rejected: u64,
    /// 成功执行的次数
    /// Successful firings
    pub fired: u64,
    /// 目标返回错误或 panic 的次数
    /// Firings whose target returned an error or panicked
    pub failed: u64,
    /// 出队时发现已被取消而跳过的条目数
    /// Items found cancelled on dequeue and skipped
    pub skipped: u64,
}

impl fmt::Display for FactoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FactoryStats {{ pending: {}, submitted: {}, rejected: {}, fired: {}, failed: {}, skipped: {} }}",
            self.pending, self.submitted, self.rejected, self.fired, self.failed, self.skipped
        )
    }
}

#[derive(Default)]
struct FactoryCounters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    fired: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// 分发线程退出时置位
/// Set once the dispatcher thread has exited
#[derive(Default)]
struct Termination {
    done: Mutex<bool>,
    signal: Condvar,
}

impl Termination {
    fn mark(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.signal.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, limit: Duration) -> bool {
        let give_up = clock::deadline_after(limit);
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            let Some(wait) = clock::time_until(give_up, Instant::now()) else {
                return false;
            };
            done = self
                .signal
                .wait_timeout(done, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

struct Dispatcher {
    queue: Arc<dyn TimeoutQueue>,
    pool: Arc<dyn WorkerPool>,
    counters: Arc<FactoryCounters>,
    sink: SinkRef,
    termination: Arc<Termination>,
}

/// 分发线程退出时关闭队列并标记终止，线程因 panic 展开时同样生效
/// Closes the queue and marks termination when the dispatcher exits, unwinding included
struct DispatcherExit {
    queue: Arc<dyn TimeoutQueue>,
    termination: Arc<Termination>,
}

impl Drop for DispatcherExit {
    fn drop(&mut self) {
        // later offers come back cancelled, so schedules fail with `Shutdown`
        self.queue.cancel();
        let discarded = self.queue.len();
        self.queue.clear();
        if thread::panicking() {
            warn!(discarded, "Timeout dispatcher terminated abnormally");
        } else {
            info!(discarded, "Timeout dispatcher stopped");
        }
        self.termination.mark();
    }
}

impl Dispatcher {
    fn run(self) {
        let _exit = DispatcherExit {
            queue: self.queue.clone(),
            termination: self.termination.clone(),
        };
        info!("Timeout dispatcher started");
        while let Some(timeout) = self.queue.take() {
            self.dispatch(timeout.item().clone());
        }
    }

    fn dispatch(&self, item: Arc<ScheduledItem>) {
        if !item.done() {
            // lost the race against a cancel
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            trace!(timeout_id = item.id(), "Skipped cancelled timeout");
            return;
        }

        let id = item.id();
        let counters = self.counters.clone();
        let sink = self.sink.clone();
        let work: Work = Box::new(move || {
            match item.invoke() {
                Ok(()) => {
                    counters.fired.fetch_add(1, Ordering::Relaxed);
                }
                Err(failure) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    sink.report(&failure);
                }
            }
            item.done();
        });

        match panic::catch_unwind(AssertUnwindSafe(|| self.pool.execute(work))) {
            Ok(Ok(())) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(timeout_id = id, error = %err, "Worker pool refused timeout");
                self.sink
                    .report(&FiringFailure::new(id, FailureKind::Submit(err)));
            }
            Err(payload) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(timeout_id = id, "Worker pool panicked while accepting timeout");
                self.sink.report(&FiringFailure::from_panic(id, payload));
            }
        }
    }
}

/// 超时工厂：一个分发线程加一个工作线程池
/// Timeout factory: one dispatcher thread plus a worker pool
pub struct TimeoutFactory {
    queue: Arc<dyn TimeoutQueue>,
    counters: Arc<FactoryCounters>,
    termination: Arc<Termination>,
    cancelled: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    queue_impl: String,
}

impl TimeoutFactory {
    /// 使用默认队列实现创建工厂
    /// Create a factory with the default queue implementation
    pub fn new(pool: Arc<dyn WorkerPool>) -> Result<Self> {
        Self::with_config(FactoryConfig::default(), pool)
    }

    /// 按配置创建工厂并启动分发线程
    /// Create a factory from `config` and start its dispatcher thread
    ///
    /// Fails with `Error::UnknownQueue` when `config.queue_impl` is not registered.
    pub fn with_config(config: FactoryConfig, pool: Arc<dyn WorkerPool>) -> Result<Self> {
        let queue = queue::create_queue(&config.queue_impl)?;
        let counters = Arc::new(FactoryCounters::default());
        let termination = Arc::new(Termination::default());

        let dispatcher = Dispatcher {
            queue: queue.clone(),
            pool,
            counters: counters.clone(),
            sink: SinkRef::from(config.error_sink),
            termination: termination.clone(),
        };
        let thread = thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || dispatcher.run())?;

        debug!(queue_impl = %config.queue_impl, "Timeout factory created");
        Ok(Self {
            queue,
            counters,
            termination,
            cancelled: AtomicBool::new(false),
            thread: Mutex::new(Some(thread)),
            queue_impl: config.queue_impl,
        })
    }

    /// 进程级共享工厂，见 [`global`]
    /// Process-wide shared factory, see [`global`]
    pub fn global() -> Result<&'static TimeoutFactory> {
        global()
    }

    /// 在纪元毫秒时间 `deadline_millis` 执行 `target`
    /// Run `target` at wall-clock `deadline_millis`
    ///
    /// A deadline already in the past fires as soon as possible. Negative
    /// values fail with `Error::InvalidDeadline`.
    pub fn schedule<T: TimeoutTarget>(&self, deadline_millis: i64, target: T) -> Result<Timeout> {
        let deadline = clock::instant_from_millis(deadline_millis)?;
        self.schedule_at(deadline, target)
    }

    pub fn schedule_at<T: TimeoutTarget>(&self, deadline: Instant, target: T) -> Result<Timeout> {
        if self.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let timeout = self.queue.offer(deadline, Arc::new(target));
        if timeout.is_cancelled() {
            // the queue was closed between the check and the offer
            return Err(Error::Shutdown);
        }
        Ok(timeout)
    }

    pub fn schedule_after<T: TimeoutTarget>(&self, delay: Duration, target: T) -> Result<Timeout> {
        self.schedule_at(clock::deadline_after(delay), target)
    }

    /// 停止分发：不再接受新的调度，尚未提交的条目被丢弃
    /// Stop dispatching: new schedules are refused and unsubmitted items are dropped
    ///
    /// Work already handed to the pool still runs. Does not wait for the
    /// dispatcher thread; use `await_termination` for that.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.cancel();
        debug!("Timeout factory cancelling");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 分发线程是否已退出
    /// Whether the dispatcher thread has exited
    pub fn is_terminated(&self) -> bool {
        self.termination.is_done()
    }

    /// 最多等待 `limit` 直到分发线程退出；返回是否已退出
    /// Wait up to `limit` for the dispatcher thread to exit; returns whether it has
    pub fn await_termination(&self, limit: Duration) -> bool {
        if !self.termination.wait(limit) {
            return false;
        }
        self.join_dispatcher();
        true
    }

    fn join_dispatcher(&self) {
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
                warn!("Timeout dispatcher thread terminated abnormally");
            }
        }
    }

    /// 队列中等待的条目数
    /// Entries waiting in the queue
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_impl(&self) -> &str {
        &self.queue_impl
    }

    pub fn stats(&self) -> FactoryStats {
        let counters = &self.counters;
        FactoryStats {
            pending: self.pending(),
            submitted: counters.submitted.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            fired: counters.fired.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for TimeoutFactory {
    fn drop(&mut self) {
        self.cancel();
        self.join_dispatcher();
    }
}

impl fmt::Debug for TimeoutFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutFactory")
            .field("queue_impl", &self.queue_impl)
            .field("stats", &self.stats())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

static GLOBAL_FACTORY: OnceLock<TimeoutFactory> = OnceLock::new();
static GLOBAL_INIT: Mutex<()> = Mutex::new(());

/// 进程级共享工厂，首次使用时创建
/// Process-wide shared factory, created on first use
///
/// 队列实现和线程池参数读取自 `DEFERRAL_*` 环境变量；无法解析的值会被记录并回退到默认值。
/// 创建失败不会被缓存，下次调用会重试。
///
/// The queue implementation and pool parameters come from the `DEFERRAL_*`
/// environment variables; values that cannot be parsed are logged and the
/// defaults are used instead. A failed creation is not cached and the next
/// call retries.
pub fn global() -> Result<&'static TimeoutFactory> {
    if let Some(factory) = GLOBAL_FACTORY.get() {
        return Ok(factory);
    }
    let _guard = GLOBAL_INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(factory) = GLOBAL_FACTORY.get() {
        return Ok(factory);
    }

    let factory_config = FactoryConfig::from_env().unwrap_or_else(|err| {
        warn!(error = %err, "Ignoring invalid factory configuration");
        FactoryConfig::default()
    });
    let pool_config = PoolConfig::from_env().unwrap_or_else(|err| {
        warn!(error = %err, "Ignoring invalid worker pool configuration");
        PoolConfig::default()
    });
    let pool = Arc::new(BoundedThreadPool::new(&pool_config)?);
    let factory = TimeoutFactory::with_config(factory_config, pool)?;
    info!(queue_impl = factory.queue_impl(), "Global timeout factory initialized");
    Ok(GLOBAL_FACTORY.get_or_init(|| factory))
}
