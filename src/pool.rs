//! 工作线程池
//! Worker pools
//!
//! 超时工厂只要求线程池提供一个操作：“接受一个工作单元并异步执行”。
//! 饱和时拒绝、阻塞还是在调用者线程上执行，由线程池自己的策略决定。
//!
//! The timeout factory needs exactly one operation from a pool: "accept a unit
//! of work for asynchronous execution". Whether a saturated pool rejects,
//! blocks or runs the work on the caller's thread is the pool's own policy.

use crate::clock;
use crate::config::PoolConfig;
use crate::error::{Error, Result, SubmitError};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// 一个工作单元
/// A unit of work
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// 工作线程池 trait
/// Worker pool trait
pub trait WorkerPool: Send + Sync + 'static {
    /// 提交工作单元以异步执行
    /// Submit a unit of work for asynchronous execution
    fn execute(&self, work: Work) -> std::result::Result<(), SubmitError>;
}

/// 线程池饱和时的处理策略
/// What a pool does when its queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaturationPolicy {
    /// Run the work inline on the submitting thread.
    /// 在提交线程上直接执行。
    CallerRuns,
    /// Reject the work with `SubmitError::Saturated`.
    /// 以 `SubmitError::Saturated` 拒绝。
    Abort,
    /// Wait up to the given time for space, then reject.
    /// 最多等待给定时间，之后拒绝。
    Block(Duration),
}

impl FromStr for SaturationPolicy {
    type Err = String;

    /// Accepts `caller-runs`, `abort`, `block` (one second) and `block:<millis>`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "caller-runs" | "caller_runs" | "callerruns" => Ok(SaturationPolicy::CallerRuns),
            "abort" | "reject" => Ok(SaturationPolicy::Abort),
            "block" => Ok(SaturationPolicy::Block(Duration::from_secs(1))),
            other => match other.strip_prefix("block:") {
                Some(millis) => millis
                    .parse::<u64>()
                    .map(|ms| SaturationPolicy::Block(Duration::from_millis(ms)))
                    .map_err(|e| format!("invalid block timeout: {e}")),
                None => Err(format!("unknown saturation policy: {s}")),
            },
        }
    }
}

/// 在调用者线程上直接执行的线程池
/// Pool that runs every unit of work on the caller's thread
#[derive(Debug, Clone, Copy, Default)]
pub struct InlinePool;

impl WorkerPool for InlinePool {
    fn execute(&self, work: Work) -> std::result::Result<(), SubmitError> {
        work();
        Ok(())
    }
}

/// 固定线程数、有界队列的线程池
/// Fixed-size thread pool with a bounded queue
///
/// 工作线程从同一个 tokio `mpsc` 通道中以阻塞方式取任务，因此 `execute` 不能在
/// 异步运行时的上下文中以 `Block` 策略调用。
///
/// Workers pull from one tokio `mpsc` channel in blocking mode, so `execute`
/// with the `Block` policy must not be called from inside an async runtime.
pub struct BoundedThreadPool {
    sender: Mutex<Option<mpsc::Sender<Work>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    policy: SaturationPolicy,
    threads: usize,
}

impl BoundedThreadPool {
    /// 创建线程池并立即启动所有工作线程
    /// Create the pool and start every worker right away
    pub fn new(config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel::<Work>(config.capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || Self::worker_loop(&receiver))
                .map_err(Error::Io)?;
            workers.push(worker);
        }

        info!(
            threads = config.threads,
            capacity = config.capacity,
            policy = ?config.policy,
            "Worker pool started"
        );
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            policy: config.policy,
            threads: config.threads,
        })
    }

    fn worker_loop(receiver: &Mutex<mpsc::Receiver<Work>>) {
        loop {
            let next = receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .blocking_recv();
            let Some(work) = next else {
                break;
            };
            if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
                warn!("Work unit panicked inside worker pool");
            }
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn policy(&self) -> SaturationPolicy {
        self.policy
    }

    /// 关闭线程池：不再接受新任务，已排队的任务执行完后工作线程退出
    /// Shut the pool down: no new work is accepted, queued work drains, then workers exit
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for worker in workers {
            // a worker shutting down its own pool cannot join itself
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("Worker thread terminated abnormally");
            }
        }
        debug!("Worker pool shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// 以轮询方式等待队列空位：`try_send` 失败后按指数退避休眠（最长 5 毫秒）再重试
    /// Wait for space by polling: after a failed `try_send`, sleep with
    /// exponential backoff capped at 5 ms and retry
    ///
    /// A slot that frees up mid-sleep is only noticed on the next attempt, so
    /// each retry may add up to 5 ms of latency.
    fn block_send(
        sender: &mpsc::Sender<Work>,
        mut work: Work,
        limit: Duration,
    ) -> std::result::Result<(), SubmitError> {
        let give_up = clock::deadline_after(limit);
        let mut backoff = Duration::from_micros(50);
        loop {
            match sender.try_send(work) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(SubmitError::ShutDown),
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= give_up {
                        return Err(SubmitError::Saturated);
                    }
                    work = returned;
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(5));
                }
            }
        }
    }
}

impl WorkerPool for BoundedThreadPool {
    fn execute(&self, work: Work) -> std::result::Result<(), SubmitError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SubmitError::ShutDown)?;

        match self.policy {
            SaturationPolicy::CallerRuns => match sender.try_send(work) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(work)) => {
                    work();
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(SubmitError::ShutDown),
            },
            SaturationPolicy::Abort => match sender.try_send(work) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(SubmitError::Saturated),
                Err(TrySendError::Closed(_)) => Err(SubmitError::ShutDown),
            },
            SaturationPolicy::Block(limit) => Self::block_send(&sender, work, limit),
        }
    }
}

impl Drop for BoundedThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for BoundedThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedThreadPool")
            .field("threads", &self.threads)
            .field("policy", &self.policy)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// 将工作交给 tokio 运行时阻塞线程池的适配器
/// Adapter handing work to a tokio runtime's blocking thread pool
///
/// Lets a server that already runs tokio reuse its runtime instead of a
/// dedicated `BoundedThreadPool`.
#[derive(Debug, Clone)]
pub struct TokioWorkerPool {
    handle: tokio::runtime::Handle,
}

impl TokioWorkerPool {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// 使用当前运行时；不在运行时上下文中时返回 `None`
    /// Use the current runtime; `None` outside a runtime context
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl WorkerPool for TokioWorkerPool {
    fn execute(&self, work: Work) -> std::result::Result<(), SubmitError> {
        // the JoinHandle is detached; the factory reports failures itself
        drop(self.handle.spawn_blocking(work));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;

    fn pool(threads: usize, capacity: usize, policy: SaturationPolicy) -> BoundedThreadPool {
        BoundedThreadPool::new(&PoolConfig {
            threads,
            capacity,
            policy,
            thread_name: "test-worker".to_string(),
        })
        .unwrap()
    }

    fn wait_for(counter: &AtomicUsize, expected: usize) {
        let give_up = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < expected && Instant::now() < give_up {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("caller-runs".parse::<SaturationPolicy>(), Ok(SaturationPolicy::CallerRuns));
        assert_eq!("ABORT".parse::<SaturationPolicy>(), Ok(SaturationPolicy::Abort));
        assert_eq!(
            "block".parse::<SaturationPolicy>(),
            Ok(SaturationPolicy::Block(Duration::from_secs(1)))
        );
        assert_eq!(
            "block:20".parse::<SaturationPolicy>(),
            Ok(SaturationPolicy::Block(Duration::from_millis(20)))
        );
        assert!("block:soon".parse::<SaturationPolicy>().is_err());
        assert!("drop-oldest".parse::<SaturationPolicy>().is_err());
    }

    #[test]
    fn test_executes_submitted_work() {
        let pool = pool(2, 16, SaturationPolicy::Abort);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        wait_for(&counter, 10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    /// Occupies the single worker and fills the one queue slot.
    fn saturate(pool: &BoundedThreadPool) -> std_mpsc::Sender<()> {
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let (started_tx, started_rx) = std_mpsc::channel::<()>();
        pool.execute(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }))
        .unwrap();
        started_rx.recv().unwrap();
        pool.execute(Box::new(|| {})).unwrap();
        release_tx
    }

    #[test]
    fn test_caller_runs_when_saturated() {
        let pool = pool(1, 1, SaturationPolicy::CallerRuns);
        let release = saturate(&pool);

        let ran_on = Arc::new(Mutex::new(None));
        let ran_on_clone = ran_on.clone();
        pool.execute(Box::new(move || {
            *ran_on_clone.lock().unwrap() = Some(thread::current().id());
        }))
        .unwrap();
        assert_eq!(*ran_on.lock().unwrap(), Some(thread::current().id()));
        release.send(()).unwrap();
    }

    #[test]
    fn test_abort_when_saturated() {
        let pool = pool(1, 1, SaturationPolicy::Abort);
        let release = saturate(&pool);
        assert_eq!(
            pool.execute(Box::new(|| {})),
            Err(SubmitError::Saturated)
        );
        release.send(()).unwrap();
    }

    #[test]
    fn test_block_gives_up_after_limit() {
        let pool = pool(1, 1, SaturationPolicy::Block(Duration::from_millis(30)));
        let release = saturate(&pool);
        let started = Instant::now();
        assert_eq!(
            pool.execute(Box::new(|| {})),
            Err(SubmitError::Saturated)
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
        release.send(()).unwrap();
    }

    #[test]
    fn test_unbounded_block_limit_accepts_work() {
        let pool = pool(1, 4, SaturationPolicy::Block(Duration::MAX));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        pool.execute(Box::new(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        wait_for(&counter, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oversized_capacity_is_rejected() {
        let result = BoundedThreadPool::new(&PoolConfig {
            threads: 1,
            capacity: usize::MAX,
            policy: SaturationPolicy::Abort,
            thread_name: "test-worker".to_string(),
        });
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_shutdown_rejects_and_drains() {
        let pool = pool(1, 8, SaturationPolicy::Abort);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = counter.clone();
            pool.execute(Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(pool.is_shutdown());
        assert_eq!(pool.execute(Box::new(|| {})), Err(SubmitError::ShutDown));
    }

    fn bad_work() {
        panic!("bad work");
    }

    #[test]
    fn test_worker_survives_panicking_work() {
        let pool = pool(1, 4, SaturationPolicy::Abort);
        pool.execute(Box::new(bad_work)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        pool.execute(Box::new(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        wait_for(&counter, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tokio_pool_runs_work() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let pool = TokioWorkerPool::new(runtime.handle().clone());
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        pool.execute(Box::new(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        wait_for(&counter, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(TokioWorkerPool::current().is_none());
    }

    #[test]
    fn test_inline_pool_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        InlinePool
            .execute(Box::new(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
