//! 播放统计
//!
//! 只统计生产者侧事件（提交、溢出、设备错误），完成通知路径不碰这里。
//! 计数器都是原子的，其他线程（例如状态显示）可以随时读取。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::format::BlockLayout;

/// 播放统计收集器
#[derive(Debug, Default)]
pub struct PlaybackStats {
    /// 交给设备的块数
    blocks_submitted: AtomicU64,
    /// 写入槽位的字节数
    bytes_accepted: AtomicU64,
    /// 因 overrun 丢弃的字节数
    bytes_dropped: AtomicU64,
    /// 发生丢弃的 submit 次数
    overrun_drops: AtomicU64,
    /// overrun 时进入等待的次数
    overrun_waits: AtomicU64,
    /// 设备拒绝块的次数
    device_errors: AtomicU64,
    /// 为补齐尾块写入的静音字节
    padded_bytes: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_submitted(&self) {
        self.blocks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_accepted(&self, bytes: usize) {
        self.bytes_accepted.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self, bytes: usize) {
        self.overrun_drops.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overrun_wait(&self) {
        self.overrun_waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_padding(&self, bytes: usize) {
        self.padded_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// 生成报告
    ///
    /// `completed` / `stray` 来自会话的完成计数器
    pub fn report(&self, layout: &BlockLayout, completed: u64, stray: u64) -> StatsReport {
        let blocks_submitted = self.blocks_submitted.load(Ordering::Relaxed);
        let bytes_accepted = self.bytes_accepted.load(Ordering::Relaxed);

        StatsReport {
            blocks_submitted,
            blocks_completed: completed,
            stray_completions: stray,
            bytes_accepted,
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            overrun_drops: self.overrun_drops.load(Ordering::Relaxed),
            overrun_waits: self.overrun_waits.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            padded_bytes: self.padded_bytes.load(Ordering::Relaxed),
            played: layout.block_duration() * completed.min(u32::MAX as u64) as u32,
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.blocks_submitted.store(0, Ordering::Relaxed);
        self.bytes_accepted.store(0, Ordering::Relaxed);
        self.bytes_dropped.store(0, Ordering::Relaxed);
        self.overrun_drops.store(0, Ordering::Relaxed);
        self.overrun_waits.store(0, Ordering::Relaxed);
        self.device_errors.store(0, Ordering::Relaxed);
        self.padded_bytes.store(0, Ordering::Relaxed);
    }
}

/// 统计报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub blocks_submitted: u64,
    pub blocks_completed: u64,
    pub stray_completions: u64,
    pub bytes_accepted: u64,
    pub bytes_dropped: u64,
    pub overrun_drops: u64,
    pub overrun_waits: u64,
    pub device_errors: u64,
    pub padded_bytes: u64,
    /// 已播放完成的时长
    pub played: Duration,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Playback Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Blocks submitted: {}", self.blocks_submitted)?;
        writeln!(f, "Blocks completed: {}", self.blocks_completed)?;
        if self.stray_completions > 0 {
            writeln!(f, "Stray completions: {}", self.stray_completions)?;
        }
        writeln!(f, "Played: {:.2} s", self.played.as_secs_f64())?;
        writeln!(f)?;

        writeln!(f, "Bytes accepted: {}", self.bytes_accepted)?;
        writeln!(f, "Silence padding: {} bytes", self.padded_bytes)?;
        writeln!(f)?;

        writeln!(f, "Overrun waits: {}", self.overrun_waits)?;
        writeln!(
            f,
            "Overrun drops: {} ({} bytes)",
            self.overrun_drops, self.bytes_dropped
        )?;
        writeln!(f, "Device errors: {}", self.device_errors)?;

        Ok(())
    }
}
