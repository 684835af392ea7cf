//! 输出设备抽象
//!
//! 设备契约：
//! - open：拿到块布局和完成回调句柄，准备 N 个与槽位一一对应的硬件缓冲
//! - write_block(index, data)：把一个满块交给设备；index 对应的缓冲此前一定已完成
//! - 按提交顺序播放，每块播放完成后恰好调用一次 `notifier.notify()`
//! - reset：停止播放并丢弃所有排队的块（被丢弃的块可以通知，也可以不通知）
//! - close 返回之后不再有任何通知
//!
//! 通知在设备自己的线程上发出，实现方在通知路径上只能调用 `notify()`，
//! 不能加锁等待生产者、不能分配、不能记日志。

pub mod clock;

#[cfg(target_os = "macos")]
pub mod audio_queue;

#[cfg(test)]
pub(crate) mod mock;

use thiserror::Error;

use super::format::BlockLayout;
use super::tracker::CompletionNotifier;

pub use clock::ClockDevice;

#[cfg(target_os = "macos")]
pub use audio_queue::AudioQueueDevice;

/// 设备错误
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("output device {0} not found")]
    NotFound(u32),

    #[error("unsupported output format: {0}")]
    Unsupported(String),

    #[error("{op} failed: OSStatus {status}")]
    Platform { op: &'static str, status: i32 },

    #[error("device rejected block: {0}")]
    Rejected(String),

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device is not open")]
    NotOpen,

    #[error("device worker disconnected")]
    Disconnected,
}

/// 块输出设备
///
/// 对象安全，引擎以 `Box<dyn OutputDevice>` 持有，运行时选择后端
pub trait OutputDevice: Send {
    /// 后端名称（"clock"、"audio-queue" ...）
    fn name(&self) -> &str;

    /// 以给定布局打开设备，`device_id` 为 None 时使用系统默认设备
    fn open(
        &mut self,
        layout: &BlockLayout,
        device_id: Option<u32>,
        notifier: CompletionNotifier,
    ) -> Result<(), DeviceError>;

    /// 提交一个满块
    fn write_block(&mut self, index: usize, block: &[u8]) -> Result<(), DeviceError>;

    /// 停止播放并丢弃排队中的块
    fn reset(&mut self) -> Result<(), DeviceError>;

    /// 释放设备，返回后不再有通知
    fn close(&mut self) -> Result<(), DeviceError>;

    fn is_open(&self) -> bool;
}

/// 检查块长度是否等于布局的块容量
pub(crate) fn check_block_len(layout: &BlockLayout, block: &[u8]) -> Result<(), DeviceError> {
    if block.len() != layout.block_bytes {
        return Err(DeviceError::Rejected(format!(
            "block is {} bytes, expected {}",
            block.len(),
            layout.block_bytes
        )));
    }
    Ok(())
}
