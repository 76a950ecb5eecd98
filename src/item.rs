//! 调度条目与句柄
//! Scheduled items and handles
//!
//! `ScheduledItem` 保存一个任务的截止时间、目标、生命周期状态以及可选的重复周期，
//! 两种调度策略共用。调用者持有的 `Timeout` 句柄只会把状态推向 `Cancelled`，
//! 从不直接修改堆的内部结构。
//!
//! `ScheduledItem` holds a task's deadline, target, lifecycle state and optional
//! repeat period; both scheduling strategies share it. The caller-held `Timeout`
//! handle only ever moves the state toward `Cancelled` and never touches heap
//! internals directly.

use crate::clock;
use crate::error::TargetError;
use crate::queue::TimeoutQueue;
use crate::sink::FiringFailure;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

/// 定时器ID，进程内唯一
/// Timeout ID, unique within the process
pub type TimeoutId = u64;

static NEXT_TIMEOUT_ID: AtomicU64 = AtomicU64::new(1);

/// 条目生命周期状态
/// Item lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemState {
    /// 刚创建，尚未入队
    /// Just constructed, not yet queued
    New = 0,
    /// 已入队，等待触发（周期性条目在每次触发后回到此状态）
    /// Queued and awaiting its deadline (periodic items stay here between firings)
    Scheduled = 1,
    /// 一次性条目已触发（终止状态）
    /// One-shot item has fired (terminal)
    Executed = 2,
    /// 已取消（吸收状态）
    /// Cancelled (absorbing)
    Cancelled = 3,
}

impl ItemState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ItemState::New,
            1 => ItemState::Scheduled,
            2 => ItemState::Executed,
            _ => ItemState::Cancelled,
        }
    }

    /// Stale items are skipped and dropped when they reach the head of a queue.
    pub fn is_stale(self) -> bool {
        matches!(self, ItemState::Executed | ItemState::Cancelled)
    }
}

/// 定时器目标回调 trait
/// Timer target callback trait
///
/// 目标运行在唯一的定时器线程或共享的工作线程上，不得无限期阻塞。
/// 返回的错误和 panic 都会被捕获并交给错误接收器。
///
/// Targets run either on the sole timer thread or on a shared pool thread and
/// must not block indefinitely. Returned errors and panics are both caught and
/// handed to the error sink.
pub trait TimeoutTarget: Send + Sync + 'static {
    fn timed_out(&self, timeout: &Timeout) -> Result<(), TargetError>;
}

impl<F> TimeoutTarget for F
where
    F: Fn(&Timeout) + Send + Sync + 'static,
{
    fn timed_out(&self, timeout: &Timeout) -> Result<(), TargetError> {
        self(timeout);
        Ok(())
    }
}

/// 基于可失败闭包的目标
/// Target built from a fallible closure
pub struct FallibleTarget<F>(F);

impl<F> FallibleTarget<F>
where
    F: Fn(&Timeout) -> Result<(), TargetError> + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self(callback)
    }
}

impl<F> TimeoutTarget for FallibleTarget<F>
where
    F: Fn(&Timeout) -> Result<(), TargetError> + Send + Sync + 'static,
{
    fn timed_out(&self, timeout: &Timeout) -> Result<(), TargetError> {
        (self.0)(timeout)
    }
}

impl<F> fmt::Debug for FallibleTarget<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallibleTarget")
            .field("callback", &"<closure>")
            .finish()
    }
}

/// 调度条目
/// Scheduled item
pub(crate) struct ScheduledItem {
    id: TimeoutId,
    deadline: Mutex<Instant>,
    period: Option<Duration>,
    state: AtomicU8,
    target: Arc<dyn TimeoutTarget>,
    /// 拥有此条目的解耦队列，用于取消时立即移除
    /// Decoupled queue owning this item, used for eager removal on cancel
    owner: Option<Weak<dyn TimeoutQueue>>,
}

impl ScheduledItem {
    pub(crate) fn new(
        deadline: Instant,
        period: Option<Duration>,
        target: Arc<dyn TimeoutTarget>,
        owner: Option<Weak<dyn TimeoutQueue>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TIMEOUT_ID.fetch_add(1, Ordering::Relaxed),
            deadline: Mutex::new(deadline),
            period,
            state: AtomicU8::new(ItemState::New as u8),
            target,
            owner,
        })
    }

    pub(crate) fn id(&self) -> TimeoutId {
        self.id
    }

    pub(crate) fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn period(&self) -> Option<Duration> {
        self.period
    }

    pub(crate) fn state(&self) -> ItemState {
        ItemState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ItemState, to: ItemState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `New → Scheduled`
    pub(crate) fn mark_scheduled(&self) -> bool {
        self.transition(ItemState::New, ItemState::Scheduled)
    }

    /// 把仍在等待的条目标记为已完成；幂等，重复调用返回 `false`
    /// Mark a still-pending item as done; idempotent, repeated calls return `false`
    pub(crate) fn done(&self) -> bool {
        self.transition(ItemState::Scheduled, ItemState::Executed)
    }

    /// `New | Scheduled → Cancelled`; true only for the call that made the move.
    pub(crate) fn try_cancel(&self) -> bool {
        self.transition(ItemState::Scheduled, ItemState::Cancelled)
            || self.transition(ItemState::New, ItemState::Cancelled)
    }

    /// 周期性条目推进到下一次截止时间并返回；一次性条目返回 `None`
    /// Advance a periodic item to its next deadline and return it; `None` for one-shots
    pub(crate) fn advance(&self) -> Option<Instant> {
        let period = self.period?;
        let mut deadline = self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        *deadline = clock::saturating_add(*deadline, period);
        Some(*deadline)
    }

    /// 调用目标，把错误和 panic 转换为 `FiringFailure`
    /// Invoke the target, turning errors and panics into a `FiringFailure`
    pub(crate) fn invoke(self: &Arc<Self>) -> Result<(), FiringFailure> {
        let handle = Timeout::from_item(self.clone());
        match panic::catch_unwind(AssertUnwindSafe(|| self.target.timed_out(&handle))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(FiringFailure::new(
                self.id,
                crate::sink::FailureKind::Target(err),
            )),
            Err(payload) => Err(FiringFailure::from_panic(self.id, payload)),
        }
    }
}

impl fmt::Debug for ScheduledItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledItem")
            .field("id", &self.id)
            .field("deadline", &self.deadline())
            .field("period", &self.period)
            .field("state", &self.state())
            .finish()
    }
}

/// 堆中的条目：截止时间快照加上共享条目
/// Heap entry: a deadline snapshot plus the shared item
///
/// The snapshot keeps ordering stable while the entry sits in a heap.
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub(crate) deadline: Instant,
    pub(crate) item: Arc<ScheduledItem>,
}

impl QueuedEntry {
    pub(crate) fn new(item: Arc<ScheduledItem>) -> Self {
        Self {
            deadline: item.deadline(),
            item,
        }
    }
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.item.id.cmp(&other.item.id))
    }
}

/// 调用者持有的定时器句柄
/// Caller-held timeout handle
///
/// 句柄可以自由克隆并在任意线程上调用 `cancel()`。
/// Handles can be cloned freely and `cancel()` may be called from any thread.
#[derive(Clone)]
pub struct Timeout {
    item: Arc<ScheduledItem>,
}

impl Timeout {
    pub(crate) fn from_item(item: Arc<ScheduledItem>) -> Self {
        Self { item }
    }

    pub(crate) fn item(&self) -> &Arc<ScheduledItem> {
        &self.item
    }

    pub fn id(&self) -> TimeoutId {
        self.item.id
    }

    /// 当前截止时间；周期性条目每次触发后都会前移
    /// Current deadline; moves forward after every firing of a periodic item
    pub fn deadline(&self) -> Instant {
        self.item.deadline()
    }

    pub fn period(&self) -> Option<Duration> {
        self.item.period
    }

    pub fn state(&self) -> ItemState {
        self.item.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ItemState::Cancelled
    }

    /// 一次性条目是否已触发（或已交给工作线程池）
    /// Whether a one-shot item has fired (or been handed to the worker pool)
    pub fn is_expired(&self) -> bool {
        self.state() == ItemState::Executed
    }

    /// 取消定时器
    /// Cancel the timeout
    ///
    /// 幂等且在任意状态下都可安全调用。仅当本次调用阻止了一次仍在等待的执行时返回 `true`。
    /// Idempotent and safe in any state. Returns `true` only when this call
    /// prevented a still-pending execution.
    pub fn cancel(&self) -> bool {
        if !self.item.try_cancel() {
            return false;
        }
        if let Some(queue) = self.item.owner.as_ref().and_then(Weak::upgrade) {
            queue.remove(self);
        }
        trace!(timeout_id = self.item.id, "Timeout cancelled");
        true
    }
}

impl PartialEq for Timeout {
    fn eq(&self, other: &Self) -> bool {
        self.item.id == other.item.id
    }
}

impl Eq for Timeout {}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("id", &self.item.id)
            .field("state", &self.item.state())
            .field("period", &self.item.period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn exploding(_: &Timeout) {
        panic!("target exploded");
    }

    fn noop_item(period: Option<Duration>) -> Arc<ScheduledItem> {
        ScheduledItem::new(Instant::now(), period, Arc::new(|_: &Timeout| {}), None)
    }

    #[test]
    fn test_state_transitions() {
        let item = noop_item(None);
        assert_eq!(item.state(), ItemState::New);
        assert!(item.mark_scheduled());
        assert!(!item.mark_scheduled());
        assert!(item.done());
        assert!(!item.done());
        assert_eq!(item.state(), ItemState::Executed);
        assert!(!item.try_cancel());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let timeout = Timeout::from_item(noop_item(None));
        assert!(timeout.cancel());
        assert!(!timeout.cancel());
        assert!(!timeout.cancel());
        assert!(timeout.is_cancelled());
        assert!(!timeout.item().done());
    }

    #[test]
    fn test_cancel_from_new_state() {
        let item = noop_item(None);
        assert!(item.try_cancel());
        assert!(!item.mark_scheduled());
    }

    #[test]
    fn test_periodic_advance() {
        let item = noop_item(Some(Duration::from_millis(25)));
        let start = item.deadline();
        assert_eq!(item.advance(), Some(start + Duration::from_millis(25)));
        assert_eq!(item.advance(), Some(start + Duration::from_millis(50)));
        assert_eq!(noop_item(None).advance(), None);
    }

    #[test]
    fn test_periodic_advance_saturates() {
        let item = noop_item(Some(Duration::MAX));
        let start = item.deadline();
        let next = item.advance().unwrap();
        assert!(next > start);
        // a second step from the capped deadline must not overflow either
        assert!(item.advance().is_some());
    }

    #[test]
    fn test_invoke_catches_errors_and_panics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let ok = ScheduledItem::new(
            Instant::now(),
            None,
            Arc::new(move |_: &Timeout| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
        assert!(ok.invoke().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let failing = ScheduledItem::new(
            Instant::now(),
            None,
            Arc::new(FallibleTarget::new(|_: &Timeout| Err("nope".into()))),
            None,
        );
        let failure = failing.invoke().unwrap_err();
        assert_eq!(failure.timeout_id, failing.id());
        assert!(matches!(failure.kind, crate::sink::FailureKind::Target(_)));

        let panicking = ScheduledItem::new(Instant::now(), None, Arc::new(exploding), None);
        let failure = panicking.invoke().unwrap_err();
        assert!(
            matches!(&failure.kind, crate::sink::FailureKind::Panic(m) if m.contains("exploded"))
        );
    }

    #[test]
    fn test_queued_entry_ordering() {
        let now = Instant::now();
        let early = ScheduledItem::new(now, None, Arc::new(|_: &Timeout| {}), None);
        let late = ScheduledItem::new(
            now + Duration::from_millis(5),
            None,
            Arc::new(|_: &Timeout| {}),
            None,
        );
        assert!(QueuedEntry::new(early.clone()) < QueuedEntry::new(late));

        // equal deadlines fall back to creation order
        let twin = ScheduledItem::new(now, None, Arc::new(|_: &Timeout| {}), None);
        assert!(QueuedEntry::new(early) < QueuedEntry::new(twin));
    }
}
