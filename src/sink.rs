//! 进程级错误汇报接收器
//! Process-wide error reporting sink
//!
//! 目标回调在分发线程或工作线程上运行，其失败无法通过调度 API 返回给调用者。
//! 所有此类失败都会被捕获并转发到这里的接收器。
//!
//! Target callbacks run on the dispatcher thread or a worker thread, so their
//! failures cannot travel back through the scheduling API. Every such failure
//! is caught and forwarded to the sink defined here.

use crate::error::{SubmitError, TargetError};
use crate::item::TimeoutId;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// 一次失败触发的原因
/// Cause of a failed firing
#[derive(Debug)]
pub enum FailureKind {
    /// The target returned an error.
    Target(TargetError),
    /// The target panicked; carries the panic message when one was available.
    Panic(String),
    /// The worker pool refused the work unit.
    Submit(SubmitError),
}

/// 一次失败的触发
/// A failed firing
#[derive(Debug)]
pub struct FiringFailure {
    /// 触发失败的定时器ID
    /// ID of the timeout whose firing failed
    pub timeout_id: TimeoutId,
    /// 失败原因
    /// Failure cause
    pub kind: FailureKind,
}

impl FiringFailure {
    pub fn new(timeout_id: TimeoutId, kind: FailureKind) -> Self {
        Self { timeout_id, kind }
    }

    /// Builds a failure from the payload of a caught panic.
    pub fn from_panic(timeout_id: TimeoutId, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self::new(timeout_id, FailureKind::Panic(message))
    }
}

impl fmt::Display for FiringFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Target(err) => {
                write!(f, "timeout {} target failed: {}", self.timeout_id, err)
            }
            FailureKind::Panic(msg) => {
                write!(f, "timeout {} target panicked: {}", self.timeout_id, msg)
            }
            FailureKind::Submit(err) => {
                write!(f, "timeout {} could not be submitted: {}", self.timeout_id, err)
            }
        }
    }
}

/// 错误接收器 trait
/// Error sink trait
pub trait ErrorSink: Send + Sync + 'static {
    /// 汇报一次失败的触发。实现不得 panic。
    /// Report one failed firing. Implementations must not panic.
    fn report(&self, failure: &FiringFailure);
}

impl<F> ErrorSink for F
where
    F: Fn(&FiringFailure) + Send + Sync + 'static,
{
    fn report(&self, failure: &FiringFailure) {
        self(failure)
    }
}

/// 默认接收器，通过 `tracing` 记录失败
/// Default sink, logs failures through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, failure: &FiringFailure) {
        tracing::error!(timeout_id = failure.timeout_id, "{}", failure);
    }
}

static GLOBAL_SINK: RwLock<Option<Arc<dyn ErrorSink>>> = RwLock::new(None);

/// 安装进程级错误接收器，替换之前的接收器
/// Install the process-wide error sink, replacing the previous one
pub fn set_error_sink(sink: Arc<dyn ErrorSink>) {
    *GLOBAL_SINK.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
}

/// 恢复默认的 `TracingSink`
/// Restore the default `TracingSink`
pub fn reset_error_sink() {
    *GLOBAL_SINK.write().unwrap_or_else(PoisonError::into_inner) = None;
}

/// 汇报到进程级接收器
/// Report to the process-wide sink
pub fn report(failure: &FiringFailure) {
    let sink = GLOBAL_SINK
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match sink {
        Some(sink) => sink.report(failure),
        None => TracingSink.report(failure),
    }
}

/// Where a timer or factory instance sends its failures.
///
/// Instances default to the process-wide sink; a config may pin a dedicated one.
#[derive(Clone, Default)]
pub(crate) enum SinkRef {
    #[default]
    Global,
    Local(Arc<dyn ErrorSink>),
}

impl SinkRef {
    pub(crate) fn report(&self, failure: &FiringFailure) {
        match self {
            SinkRef::Global => report(failure),
            SinkRef::Local(sink) => sink.report(failure),
        }
    }
}

impl From<Option<Arc<dyn ErrorSink>>> for SinkRef {
    fn from(sink: Option<Arc<dyn ErrorSink>>) -> Self {
        sink.map_or(SinkRef::Global, SinkRef::Local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_messages() {
        let failure = FiringFailure::from_panic(7, Box::new("boom"));
        assert!(matches!(&failure.kind, FailureKind::Panic(m) if m == "boom"));

        let failure = FiringFailure::from_panic(8, Box::new(String::from("owned boom")));
        assert!(matches!(&failure.kind, FailureKind::Panic(m) if m == "owned boom"));

        let failure = FiringFailure::from_panic(9, Box::new(42u32));
        assert!(matches!(&failure.kind, FailureKind::Panic(m) if m.contains("non-string")));
    }

    #[test]
    fn test_display_mentions_id() {
        let failure = FiringFailure::new(3, FailureKind::Submit(SubmitError::Saturated));
        let text = failure.to_string();
        assert!(text.contains("timeout 3"));
        assert!(text.contains("saturated"));
    }

    #[test]
    fn test_local_sink_receives_reports() {
        use std::sync::Mutex;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink: Arc<dyn ErrorSink> = Arc::new(move |f: &FiringFailure| {
            seen_clone.lock().unwrap().push(f.timeout_id);
        });
        let local = SinkRef::from(Some(sink));
        local.report(&FiringFailure::new(11, FailureKind::Panic("x".into())));
        assert_eq!(*seen.lock().unwrap(), vec![11]);
    }
}
