//! 输出延迟估算
//!
//! delay = in_flight × block_duration
//!
//! 采用降频采样：距上次采样不足刷新间隔时直接返回缓存值，
//! 避免上游每次查询都去争用完成计数器的锁。

use std::time::{Duration, Instant};

use super::tracker::CompletionTracker;

/// 默认刷新间隔
pub const DEFAULT_DELAY_REFRESH: Duration = Duration::from_millis(10);

/// 延迟估算器（生产者独占）
#[derive(Debug, Clone)]
pub struct DelayEstimator {
    block_duration: Duration,
    refresh: Duration,
    value: Duration,
    last_sampled: Option<Instant>,
}

impl DelayEstimator {
    pub fn new(block_duration: Duration, refresh: Duration) -> Self {
        Self {
            block_duration,
            refresh,
            value: Duration::ZERO,
            last_sampled: None,
        }
    }

    /// 估算 `now` 时刻的输出延迟
    pub fn estimate(&mut self, now: Instant, tracker: &CompletionTracker) -> Duration {
        if let Some(last) = self.last_sampled {
            if now.saturating_duration_since(last) < self.refresh {
                return self.value;
            }
        }

        let in_flight = tracker.snapshot() as u32;
        self.value = self.block_duration * in_flight;
        self.last_sampled = Some(now);
        self.value
    }

    /// 上次采样的值
    #[inline]
    pub fn cached(&self) -> Duration {
        self.value
    }

    /// 让下一次 estimate 立即重新采样
    pub fn invalidate(&mut self) {
        self.last_sampled = None;
    }
}
