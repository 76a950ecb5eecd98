#![deny(clippy::expect_used, clippy::unwrap_used)]

//! 延迟执行引擎的根。
//! The root of the deferred-execution engine.
//!
//! 提供两种调度策略：
//! Two scheduling strategies are provided:
//!
//! - [`CooperativeTimer`]: 一个线程既等待又执行，触发严格有序。
//!   One thread both waits and executes; firings are strictly ordered.
//! - [`TimeoutFactory`]: 一个分发线程等待截止时间，目标在 [`WorkerPool`] 上执行。
//!   A dispatcher thread waits for deadlines and targets run on a [`WorkerPool`].
//!
//! 两者都返回 [`Timeout`] 句柄，可在任意线程上取消。
//! Both return [`Timeout`] handles that can be cancelled from any thread.

pub mod clock;
pub mod config;
pub mod error;
pub mod factory;
pub mod heap;
pub mod item;
pub mod pool;
pub mod queue;
pub mod sink;
pub mod timer;

pub use config::{Config, FactoryConfig, PoolConfig, TimerConfig};
pub use error::{Error, Result, SubmitError, TargetError};
pub use factory::{FactoryStats, TimeoutFactory, global};
pub use heap::MinHeap;
pub use item::{FallibleTarget, ItemState, Timeout, TimeoutId, TimeoutTarget};
pub use pool::{BoundedThreadPool, InlinePool, SaturationPolicy, TokioWorkerPool, WorkerPool};
pub use queue::{TimeoutQueue, create_queue, register_queue};
pub use sink::{
    ErrorSink, FailureKind, FiringFailure, TracingSink, reset_error_sink, set_error_sink,
};
pub use timer::{CooperativeTimer, TimerStats};
