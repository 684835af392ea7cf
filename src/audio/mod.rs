//! 音频核心模块
//!
//! 包含：
//! - Format: PCM 格式与块布局
//! - Pool: 固定块缓冲池
//! - Tracker: 在途块计数（生产者与设备通知之间唯一的共享状态）
//! - Delay: 输出延迟估算
//! - Stats: 播放统计
//! - Priority: 生产者线程优先级
//! - Device: 输出设备抽象与后端
//! - Output: 块输出引擎

pub mod delay;
pub mod device;
pub mod format;
pub mod output;
pub mod pool;
pub mod priority;
pub mod stats;
pub mod tracker;

pub use device::{ClockDevice, DeviceError, OutputDevice};
pub use format::{BlockLayout, ConfigError, PcmFormat, SampleEncoding};
pub use output::{
    AudioMessage, BlockOutput, OutputConfig, OutputError, OutputState, OverrunPolicy,
    PipelineSink, SubmitReport,
};
pub use stats::{PlaybackStats, StatsReport};
pub use tracker::{CompletionNotifier, CompletionTracker};

#[cfg(target_os = "macos")]
pub use device::AudioQueueDevice;
