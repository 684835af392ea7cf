//! 完成计数器
//!
//! 生产者（提交块）与设备通知上下文（块播放完成）之间唯一的共享状态：
//! - in_flight：设备持有的块数，始终满足 0 ≤ in_flight ≤ N
//! - flushing：close 期间置位，通知上下文看到后只做递减
//!
//! 两者由同一把 Mutex 保护。锁只在修改期间持有，从不跨越设备调用，
//! 避免与通知线程之间的优先级反转或死锁。
//! Condvar 只用于生产者侧的有界等待（overrun 策略、close 时的排空）。

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct TrackerState {
    in_flight: usize,
    flushing: bool,
    /// 会话内已完成的块数
    completed: u64,
    /// 计数为 0 时收到的多余通知
    stray: u64,
}

/// 会话级完成计数器
///
/// 每次 open 创建新的实例，上一个会话迟到的通知只会落在旧实例上
pub struct CompletionTracker {
    capacity: usize,
    state: Mutex<TrackerState>,
    changed: Condvar,
}

impl CompletionTracker {
    /// `capacity` = 块数 N
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(TrackerState::default()),
            changed: Condvar::new(),
        }
    }

    /// 通知上下文绝不能因为 poison 而 panic，直接取回内部状态
    #[inline]
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 生产者把一个满块交给设备之后调用，返回新的计数
    pub fn on_submitted(&self) -> usize {
        let mut state = self.lock();
        debug_assert!(
            state.in_flight < self.capacity,
            "submitted more blocks than the pool holds"
        );
        state.in_flight = (state.in_flight + 1).min(self.capacity);
        state.in_flight
    }

    /// 撤销一次 on_submitted（设备拒绝了这个块）
    pub fn cancel_submitted(&self) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.changed.notify_all();
    }

    /// 设备通知：一个块播放完成
    ///
    /// 可在任意线程、任意时刻调用（包括 close 期间），只做递减，不会阻塞
    pub fn on_completed(&self) {
        {
            let mut state = self.lock();
            if state.in_flight == 0 {
                state.stray += 1;
            } else {
                state.in_flight -= 1;
                state.completed += 1;
            }
        }
        self.changed.notify_all();
    }

    /// 当前计数
    #[inline]
    pub fn snapshot(&self) -> usize {
        self.lock().in_flight
    }

    /// 进入 flush 状态（close 开始时调用）
    pub fn begin_flush(&self) {
        self.lock().flushing = true;
        self.changed.notify_all();
    }

    #[inline]
    pub fn is_flushing(&self) -> bool {
        self.lock().flushing
    }

    /// 等待至少一个槽位空出来，超时返回 false
    pub fn wait_for_free_slot(&self, timeout: Duration) -> bool {
        let capacity = self.capacity;
        self.wait_until(timeout, |state| state.in_flight < capacity)
    }

    /// 等待所有块完成，超时返回 false
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.in_flight == 0)
    }

    fn wait_until(&self, timeout: Duration, ready: impl Fn(&TrackerState) -> bool) -> bool {
        let guard = self.lock();
        if ready(&guard) {
            return true;
        }
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| !ready(state))
            .unwrap_or_else(PoisonError::into_inner);
        ready(&guard)
    }

    /// 强制清零（设备已回收所有缓冲但没有逐个通知时），返回被回收的块数
    pub fn force_reset(&self) -> usize {
        let reclaimed = {
            let mut state = self.lock();
            std::mem::take(&mut state.in_flight)
        };
        self.changed.notify_all();
        reclaimed
    }

    /// 会话内已完成的块数
    pub fn completed(&self) -> u64 {
        self.lock().completed
    }

    /// 计数为 0 时收到的通知数
    pub fn stray_completions(&self) -> u64 {
        self.lock().stray
    }
}

/// 注册给设备的完成回调句柄
///
/// 设备在每个块播放完成时调用 `notify()`，每块恰好一次。
/// 持有 Arc，即使引擎已经 close，迟到的通知也不会访问已释放的内存。
#[derive(Clone)]
pub struct CompletionNotifier {
    tracker: Arc<CompletionTracker>,
}

impl CompletionNotifier {
    pub fn new(tracker: Arc<CompletionTracker>) -> Self {
        Self { tracker }
    }

    /// 一个块播放完成
    #[inline]
    pub fn notify(&self) {
        self.tracker.on_completed();
    }

    /// 会话是否正在关闭（设备可以据此停止渲染剩余的块）
    #[inline]
    pub fn is_flushing(&self) -> bool {
        self.tracker.is_flushing()
    }
}

impl std::fmt::Debug for CompletionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionNotifier")
            .field("in_flight", &self.tracker.snapshot())
            .finish()
    }
}
