//! 截止时间换算
//! Deadline conversions
//!
//! 内部统一使用单调时钟 `Instant`；对外的毫秒接口使用自 Unix 纪元起的墙钟毫秒数。
//!
//! Internally every deadline is a monotonic `Instant`; the millisecond APIs take
//! wall-clock milliseconds since the Unix epoch.

use crate::error::{Error, Result};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// 当前墙钟时间（自 Unix 纪元起的毫秒数）
/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

/// 将纪元毫秒截止时间转换为单调时钟时刻
/// Convert an epoch-millisecond deadline into a monotonic instant
///
/// Negative deadlines are rejected. Deadlines in the past map to "now".
pub fn instant_from_millis(deadline_millis: i64) -> Result<Instant> {
    if deadline_millis < 0 {
        return Err(Error::InvalidDeadline(deadline_millis));
    }
    let now = Instant::now();
    let remaining = deadline_millis.saturating_sub(now_millis());
    if remaining <= 0 {
        return Ok(now);
    }
    // remaining > 0 here
    let delay = Duration::from_millis(remaining as u64);
    Ok(now.checked_add(delay).unwrap_or_else(far_future))
}

/// 将延迟转换为截止时刻，溢出时饱和到遥远的未来
/// Convert a delay into a deadline, saturating to the far future on overflow
pub fn deadline_after(delay: Duration) -> Instant {
    saturating_add(Instant::now(), delay)
}

/// `instant + delay`，溢出时饱和到遥远的未来
/// `instant + delay`, saturating to the far future on overflow
pub fn saturating_add(instant: Instant, delay: Duration) -> Instant {
    instant.checked_add(delay).unwrap_or_else(far_future)
}

/// 距离截止时刻的剩余时间，已到期时为 `None`
/// Time left until `deadline`, `None` once it is due
pub fn time_until(deadline: Instant, now: Instant) -> Option<Duration> {
    let wait = deadline.saturating_duration_since(now);
    if wait.is_zero() { None } else { Some(wait) }
}

fn far_future() -> Instant {
    // roughly 30 years; large enough to never fire, small enough to not overflow
    let now = Instant::now();
    now + Duration::from_secs(60 * 60 * 24 * 365 * 30)
}
