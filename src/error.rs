//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use thiserror::Error;

/// 调度 API 的主要错误类型。
/// The primary error type for the scheduling API.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying I/O error occurred, e.g. a dispatcher thread could not be spawned.
    /// 发生了底层的I/O错误，例如无法启动分发线程。
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The absolute deadline was negative.
    /// 绝对截止时间为负数。
    #[error("deadline must be non-negative, got {0}")]
    InvalidDeadline(i64),

    /// A periodic schedule was requested with a zero period.
    /// 请求了周期为零的周期性调度。
    #[error("period must be greater than zero")]
    InvalidPeriod,

    /// The timer or factory has been cancelled and no longer accepts schedules.
    /// 定时器或工厂已被取消，不再接受新的调度。
    #[error("scheduler has been cancelled")]
    Shutdown,

    /// No priority queue implementation is registered under this name.
    /// 没有以此名称注册的优先队列实现。
    #[error("unknown timeout queue implementation: {0}")]
    UnknownQueue(String),

    /// A configuration value could not be used.
    /// 配置值无法使用。
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// 本库专用的 `Result` 类型。
/// A specialized `Result` type for this library.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a worker pool refused a unit of work.
/// 工作线程池拒绝工作单元的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The pool is saturated and its policy rejects new work.
    /// 线程池已饱和，其策略拒绝新的工作。
    #[error("worker pool is saturated")]
    Saturated,

    /// The pool has been shut down.
    /// 线程池已关闭。
    #[error("worker pool has been shut down")]
    ShutDown,
}

/// Error returned by a failing target callback.
/// 目标回调失败时返回的错误。
pub type TargetError = Box<dyn std::error::Error + Send + Sync + 'static>;

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::Io(e) => e,
            Error::InvalidDeadline(_) | Error::InvalidPeriod => {
                std::io::Error::new(ErrorKind::InvalidInput, err)
            }
            Error::Shutdown => ErrorKind::NotConnected.into(),
            Error::UnknownQueue(_) => std::io::Error::new(ErrorKind::NotFound, err),
            Error::InvalidConfig(_) => std::io::Error::new(ErrorKind::InvalidInput, err),
        }
    }
}
