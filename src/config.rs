//! 定义了定时器、超时工厂和工作线程池的可配置参数。
//! Defines configurable parameters for the timer, the timeout factory and the worker pool.

use crate::error::{Error, Result};
use crate::pool::SaturationPolicy;
use crate::queue::DEFAULT_QUEUE;
use crate::sink::ErrorSink;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// 选择队列实现的环境变量
/// Environment variable selecting the queue implementation
pub const ENV_QUEUE_IMPL: &str = "DEFERRAL_QUEUE_IMPL";
/// 默认线程池线程数的环境变量
/// Environment variable for the default pool's thread count
pub const ENV_POOL_THREADS: &str = "DEFERRAL_POOL_THREADS";
/// 默认线程池队列容量的环境变量
/// Environment variable for the default pool's queue capacity
pub const ENV_POOL_CAPACITY: &str = "DEFERRAL_POOL_CAPACITY";
/// 默认线程池饱和策略的环境变量
/// Environment variable for the default pool's saturation policy
pub const ENV_POOL_POLICY: &str = "DEFERRAL_POOL_POLICY";

/// 线程池队列容量上限
/// Upper bound on the worker pool's queue capacity
pub const MAX_POOL_CAPACITY: usize = 1 << 24;

/// 包含所有可配置参数的结构体。
///
/// A structure containing all configurable parameters.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Cooperative timer parameters.
    /// 协作定时器参数。
    pub timer: TimerConfig,

    /// Timeout factory parameters.
    /// 超时工厂参数。
    pub factory: FactoryConfig,

    /// Worker pool parameters.
    /// 工作线程池参数。
    pub pool: PoolConfig,
}

impl Config {
    /// 从环境变量读取配置，未设置的项使用默认值。
    /// Read the configuration from environment variables, using defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            timer: TimerConfig::default(),
            factory: FactoryConfig::from_env()?,
            pool: PoolConfig::from_env()?,
        })
    }
}

/// 协作定时器参数。
///
/// Cooperative timer parameters.
#[derive(Clone)]
pub struct TimerConfig {
    /// Name of the timer thread.
    /// 定时器线程名。
    pub thread_name: String,
    /// Sink for this timer's firing failures; `None` uses the process-wide sink.
    /// 此定时器触发失败的接收器；`None` 表示使用进程级接收器。
    pub error_sink: Option<Arc<dyn ErrorSink>>,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            thread_name: "deferral-timer".to_string(),
            error_sink: None,
        }
    }
}

impl fmt::Debug for TimerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerConfig")
            .field("thread_name", &self.thread_name)
            .field("error_sink", &self.error_sink.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

/// 超时工厂参数。
///
/// Timeout factory parameters.
#[derive(Clone)]
pub struct FactoryConfig {
    /// Registered name of the priority queue implementation.
    /// 优先队列实现的注册名。
    pub queue_impl: String,
    /// Name of the dispatcher thread.
    /// 分发线程名。
    pub thread_name: String,
    /// Sink for this factory's firing failures; `None` uses the process-wide sink.
    /// 此工厂触发失败的接收器；`None` 表示使用进程级接收器。
    pub error_sink: Option<Arc<dyn ErrorSink>>,
}

impl FactoryConfig {
    /// Reads `DEFERRAL_QUEUE_IMPL`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = read_env(ENV_QUEUE_IMPL) {
            config.queue_impl = name;
        }
        Ok(config)
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            queue_impl: DEFAULT_QUEUE.to_string(),
            thread_name: "deferral-timeout-dispatcher".to_string(),
            error_sink: None,
        }
    }
}

impl fmt::Debug for FactoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryConfig")
            .field("queue_impl", &self.queue_impl)
            .field("thread_name", &self.thread_name)
            .field("error_sink", &self.error_sink.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

/// 工作线程池参数。
///
/// Worker pool parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    /// 工作线程数。
    pub threads: usize,
    /// Capacity of the queue in front of the workers.
    /// 工作线程前的队列容量。
    pub capacity: usize,
    /// What to do when the queue is full.
    /// 队列已满时的处理方式。
    pub policy: SaturationPolicy,
    /// Prefix of worker thread names.
    /// 工作线程名前缀。
    pub thread_name: String,
}

impl PoolConfig {
    /// Reads `DEFERRAL_POOL_THREADS`, `DEFERRAL_POOL_CAPACITY` and `DEFERRAL_POOL_POLICY`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(threads) = read_env(ENV_POOL_THREADS) {
            config.threads = parse_env(ENV_POOL_THREADS, &threads)?;
        }
        if let Some(capacity) = read_env(ENV_POOL_CAPACITY) {
            config.capacity = parse_env(ENV_POOL_CAPACITY, &capacity)?;
        }
        if let Some(policy) = read_env(ENV_POOL_POLICY) {
            config.policy = parse_env(ENV_POOL_POLICY, &policy)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::InvalidConfig("pool needs at least one thread".into()));
        }
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("pool capacity must be positive".into()));
        }
        if self.capacity > MAX_POOL_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "pool capacity {} exceeds {}",
                self.capacity, MAX_POOL_CAPACITY
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            threads,
            capacity: 1024,
            policy: SaturationPolicy::CallerRuns,
            thread_name: "deferral-worker".to_string(),
        }
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse()
        .map_err(|e| Error::InvalidConfig(format!("{key}={raw:?}: {e}")))
}
