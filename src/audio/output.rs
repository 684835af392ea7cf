//! 块输出引擎
//!
//! 生产者（流水线线程）调用 submit，把任意长度的 s16le 数据切成固定大小的块：
//!
//! ```text
//! submit(bytes) → 当前槽位累积 → 满块 → 设备 write_block → InFlight
//!                                                  │
//!            设备线程 notify() ← 播放完成 ←────────┘
//!                   │
//!                   └→ CompletionTracker 递减 → 生产者回收槽位
//! ```
//!
//! 槽位没有空闲时按 OverrunPolicy 处理：有界等待或直接丢弃，二者都计入统计。

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::delay::{DelayEstimator, DEFAULT_DELAY_REFRESH};
use super::device::{DeviceError, OutputDevice};
use super::format::{BlockLayout, ConfigError, PcmFormat};
use super::pool::BufferPool;
use super::priority;
use super::stats::{PlaybackStats, StatsReport};
use super::tracker::{CompletionNotifier, CompletionTracker};

/// close 时等待设备归还缓冲的下限
const MIN_CLOSE_DRAIN: Duration = Duration::from_millis(100);

/// 所有槽位都在播放时的处理方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverrunPolicy {
    /// 等待一个块完成，超时后丢弃本次 submit 剩余的数据
    #[default]
    Wait,
    /// 立即丢弃
    Drop,
}

/// 输出配置，一次会话内不变
#[derive(Clone, Debug)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// 单块时长
    pub block_duration: Duration,
    /// 缓冲总时长，块数 N = buffer_duration / block_duration
    pub buffer_duration: Duration,
    /// 指定输出设备（None 表示系统默认设备）
    pub device_id: Option<u32>,
    /// 第一次 submit 时提升生产者线程优先级
    pub high_priority: bool,
    pub overrun: OverrunPolicy,
    /// Wait 策略的超时，None 表示两个块的时长
    pub overrun_timeout: Option<Duration>,
    /// 延迟估算的刷新间隔
    pub delay_refresh: Duration,
    /// mlock 缓冲池
    pub lock_memory: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            block_duration: Duration::from_millis(20),
            buffer_duration: Duration::from_secs(10),
            device_id: None,
            high_priority: false,
            overrun: OverrunPolicy::Wait,
            overrun_timeout: None,
            delay_refresh: DEFAULT_DELAY_REFRESH,
            lock_memory: true,
        }
    }
}

impl OutputConfig {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            ..Self::default()
        }
    }

    /// 推导块布局（同时完成参数校验）
    pub fn layout(&self) -> Result<BlockLayout, ConfigError> {
        BlockLayout::derive(
            self.sample_rate,
            self.channels,
            self.block_duration,
            self.buffer_duration,
        )
    }

    fn effective_overrun_timeout(&self, layout: &BlockLayout) -> Duration {
        self.overrun_timeout
            .unwrap_or_else(|| layout.block_duration() * 2)
    }
}

/// 输出错误
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("output is not open")]
    NotOpen,

    #[error("output is already open")]
    AlreadyOpen,

    #[error("audio format {got} does not match the open session ({expected})")]
    FormatMismatch { expected: PcmFormat, got: PcmFormat },

    #[error("chunk of {len} bytes is not a whole number of {frame_bytes}-byte frames")]
    MisalignedChunk { len: usize, frame_bytes: usize },
}

/// 一次 submit 的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmitReport {
    /// 写入槽位的字节数
    pub accepted: usize,
    /// 因 overrun 丢弃的字节数
    pub dropped: usize,
    /// 本次交给设备的块数
    pub submitted_blocks: usize,
}

impl SubmitReport {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.dropped == 0
    }
}

/// 流水线送来的一条音频消息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioMessage {
    pub format: PcmFormat,
    pub data: Vec<u8>,
}

impl AudioMessage {
    pub fn new(format: PcmFormat, data: Vec<u8>) -> Self {
        Self { format, data }
    }

    /// s16le 交织数据
    pub fn s16le(sample_rate: u32, channels: u16, data: Vec<u8>) -> Self {
        Self::new(PcmFormat::s16le(sample_rate, channels), data)
    }

    /// 消息的播放时长
    pub fn duration(&self) -> Duration {
        self.format.bytes_to_duration(self.data.len() as u64)
    }
}

/// 流水线中的 sink 节点：只接收，不产出
pub trait PipelineSink {
    fn push(&mut self, message: &AudioMessage) -> Result<SubmitReport, OutputError>;

    /// sink 不产出数据
    fn pull(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// 输出状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputState {
    Closed,
    Open,
}

/// 一次 open 到 close 之间的全部资源
struct Session {
    layout: BlockLayout,
    pool: BufferPool,
    tracker: Arc<CompletionTracker>,
    delay: DelayEstimator,
    overrun: OverrunPolicy,
    overrun_timeout: Duration,
    high_priority: bool,
    priority_applied: bool,
}

impl Session {
    /// 确保当前槽位可写：先回收已完成的块，不行再按策略处理
    fn acquire_slot(&mut self, stats: &PlaybackStats) -> bool {
        if self.pool.current_is_free() {
            return true;
        }

        self.pool.reclaim(self.tracker.snapshot());
        if self.pool.current_is_free() {
            return true;
        }

        if self.overrun == OverrunPolicy::Wait {
            stats.record_overrun_wait();
            if self.tracker.wait_for_free_slot(self.overrun_timeout) {
                self.pool.reclaim(self.tracker.snapshot());
            }
        }

        self.pool.current_is_free()
    }

    /// 把当前满块交给设备
    ///
    /// 先计数再提交：设备可能在 write_block 返回之前就发出完成通知
    fn submit_current(
        &mut self,
        device: &mut dyn OutputDevice,
        stats: &PlaybackStats,
    ) -> Result<(), DeviceError> {
        let index = self.pool.current_index();
        self.tracker.on_submitted();

        if let Err(e) = device.write_block(index, self.pool.current_slot().data()) {
            self.tracker.cancel_submitted();
            self.pool.discard_current();
            stats.record_device_error();
            log::warn!("Device rejected block {}: {}", index, e);
            return Err(e);
        }

        self.pool.mark_current_in_flight();
        stats.record_submitted();
        Ok(())
    }
}

/// 块输出引擎
pub struct BlockOutput {
    device: Box<dyn OutputDevice>,
    session: Option<Session>,
    stats: PlaybackStats,
    /// 上一次会话结束时的统计
    last_report: Option<StatsReport>,
}

impl BlockOutput {
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        Self {
            device,
            session: None,
            stats: PlaybackStats::new(),
            last_report: None,
        }
    }

    /// 打开会话
    ///
    /// 失败时不改变任何状态：已分配的缓冲随 pool 一起释放
    pub fn open(&mut self, config: &OutputConfig) -> Result<(), OutputError> {
        if self.session.is_some() {
            return Err(OutputError::AlreadyOpen);
        }

        let layout = config.layout()?;

        let tracker = Arc::new(CompletionTracker::new(layout.block_count));
        let mut pool = BufferPool::new(layout.block_count, layout.block_bytes);
        if config.lock_memory {
            pool.lock_memory();
        }

        self.device.open(
            &layout,
            config.device_id,
            CompletionNotifier::new(Arc::clone(&tracker)),
        )?;

        self.stats.reset();
        self.last_report = None;

        log::info!("Output opened on {} device: {}", self.device.name(), layout);
        log::info!(
            "Buffer: {} blocks, {:.0} ms total",
            layout.block_count,
            layout.total_duration().as_secs_f64() * 1000.0
        );

        self.session = Some(Session {
            layout,
            pool,
            tracker,
            delay: DelayEstimator::new(layout.block_duration(), config.delay_refresh),
            overrun: config.overrun,
            overrun_timeout: config.effective_overrun_timeout(&layout),
            high_priority: config.high_priority,
            priority_applied: false,
        });
        Ok(())
    }

    /// 关闭会话
    ///
    /// flush → 设备 reset → 等待（或强制回收）在途块 → 释放设备 → 释放缓冲。
    /// 返回之后，迟到的通知只会落在已经脱离引擎的旧计数器上。
    pub fn close(&mut self) -> Result<(), OutputError> {
        let session = self.session.take().ok_or(OutputError::NotOpen)?;
        let tracker = &session.tracker;

        tracker.begin_flush();

        if let Err(e) = self.device.reset() {
            log::warn!("Device reset failed during close: {}", e);
        }

        let drain = (session.layout.block_duration() * 2).max(MIN_CLOSE_DRAIN);
        if !tracker.wait_drained(drain) {
            let reclaimed = tracker.force_reset();
            log::warn!(
                "Device still held {} blocks after reset, reclaimed forcibly",
                reclaimed
            );
        }

        let closed = self.device.close();

        let report = self
            .stats
            .report(&session.layout, tracker.completed(), tracker.stray_completions());
        log::info!(
            "Output closed: {} blocks submitted, {} completed",
            report.blocks_submitted,
            report.blocks_completed
        );
        self.last_report = Some(report);

        drop(session);
        closed.map_err(OutputError::from)
    }

    /// 提交 s16le 交织数据，长度必须是整帧
    ///
    /// 不足一块的数据留在当前槽位，等后续 submit 补满。
    /// overrun 丢弃不算错误，体现在返回的 SubmitReport 里。
    /// 设备拒绝块时返回错误，会话保持打开，该块数据丢弃。
    pub fn submit(&mut self, data: &[u8]) -> Result<SubmitReport, OutputError> {
        let session = self.session.as_mut().ok_or(OutputError::NotOpen)?;

        let frame_bytes = session.layout.format.bytes_per_frame();
        if data.len() % frame_bytes != 0 {
            return Err(OutputError::MisalignedChunk {
                len: data.len(),
                frame_bytes,
            });
        }

        if session.high_priority && !session.priority_applied {
            session.priority_applied = true;
            priority::elevate_current_thread(session.layout.block_duration());
        }

        let mut report = SubmitReport::default();
        let mut rest = data;

        while !rest.is_empty() {
            if !session.acquire_slot(&self.stats) {
                self.stats.record_dropped(rest.len());
                log::warn!(
                    "Overrun: all {} blocks in flight, dropped {} bytes",
                    session.layout.block_count,
                    rest.len()
                );
                report.dropped = rest.len();
                break;
            }

            let written = session.pool.write_current(rest);
            self.stats.record_accepted(written);
            report.accepted += written;
            rest = &rest[written..];

            if session.pool.current_slot().is_full() {
                session.submit_current(self.device.as_mut(), &self.stats)?;
                report.submitted_blocks += 1;
            }
        }

        Ok(report)
    }

    /// 用静音补齐当前未满的块并提交，返回补齐的字节数
    ///
    /// 流结束时调用，让最后不足一块的数据也能播出
    pub fn flush_partial(&mut self) -> Result<usize, OutputError> {
        let session = self.session.as_mut().ok_or(OutputError::NotOpen)?;
        if session.pool.buffered_bytes() == 0 {
            return Ok(0);
        }

        let padded = session.pool.pad_current();
        self.stats.record_padding(padded);
        session.submit_current(self.device.as_mut(), &self.stats)?;
        Ok(padded)
    }

    /// 等待所有在途块播放完成，超时返回 false
    pub fn drain(&mut self, timeout: Duration) -> Result<bool, OutputError> {
        let session = self.session.as_mut().ok_or(OutputError::NotOpen)?;
        let drained = session.tracker.wait_drained(timeout);
        session.pool.reclaim(session.tracker.snapshot());
        session.delay.invalidate();
        Ok(drained)
    }

    /// 当前输出延迟
    pub fn delay(&mut self) -> Duration {
        self.delay_at(Instant::now())
    }

    /// `now` 时刻的输出延迟，关闭时为 0
    pub fn delay_at(&mut self, now: Instant) -> Duration {
        match self.session.as_mut() {
            Some(session) => session.delay.estimate(now, &session.tracker),
            None => Duration::ZERO,
        }
    }

    pub fn state(&self) -> OutputState {
        if self.session.is_some() {
            OutputState::Open
        } else {
            OutputState::Closed
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// 当前会话的块布局
    pub fn layout(&self) -> Option<BlockLayout> {
        self.session.as_ref().map(|s| s.layout)
    }

    /// 设备仍持有的块数
    pub fn in_flight(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |s| s.tracker.snapshot())
    }

    /// 当前槽位中等待补满的字节数
    pub fn buffered_bytes(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |s| s.pool.buffered_bytes())
    }

    /// 统计报告：打开时为当前会话，关闭后为上一次会话
    pub fn stats(&self) -> Option<StatsReport> {
        match &self.session {
            Some(session) => Some(self.stats.report(
                &session.layout,
                session.tracker.completed(),
                session.tracker.stray_completions(),
            )),
            None => self.last_report.clone(),
        }
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }
}

impl PipelineSink for BlockOutput {
    /// 检查消息格式与会话一致后提交
    fn push(&mut self, message: &AudioMessage) -> Result<SubmitReport, OutputError> {
        let expected = self
            .session
            .as_ref()
            .ok_or(OutputError::NotOpen)?
            .layout
            .format;
        if message.format != expected {
            return Err(OutputError::FormatMismatch {
                expected,
                got: message.format,
            });
        }
        self.submit(&message.data)
    }
}

impl Drop for BlockOutput {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.close() {
                log::error!("Failed to close output: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::mock::{MockDevice, MockHandle};
    use crate::audio::device::ClockDevice;
    use crate::audio::format::SampleEncoding;
    use std::thread;

    /// 8000Hz 单声道，20ms 块，200ms 缓冲 → 10 块 × 320 字节
    fn config_8k() -> OutputConfig {
        OutputConfig {
            sample_rate: 8000,
            channels: 1,
            block_duration: Duration::from_millis(20),
            buffer_duration: Duration::from_millis(200),
            lock_memory: false,
            ..OutputConfig::default()
        }
    }

    fn open_mock(config: &OutputConfig) -> (BlockOutput, MockHandle) {
        let (device, handle) = MockDevice::new();
        let mut output = BlockOutput::new(Box::new(device));
        output.open(config).unwrap();
        (output, handle)
    }

    #[test]
    fn test_full_buffer_scenario() {
        let (mut output, handle) = open_mock(&config_8k());
        let layout = output.layout().unwrap();
        assert_eq!(layout.block_count, 10);
        assert_eq!(layout.block_bytes, 320);

        let report = output.submit(&vec![0x11; 3200]).unwrap();
        assert_eq!(report.accepted, 3200);
        assert_eq!(report.submitted_blocks, 10);
        assert!(report.is_complete());
        assert_eq!(handle.submitted(), 10);
        assert_eq!(output.in_flight(), 10);
        assert_eq!(output.buffered_bytes(), 0);

        assert_eq!(handle.complete(4), 4);
        assert_eq!(output.in_flight(), 6);
        assert_eq!(output.delay(), Duration::from_millis(120));

        output.close().unwrap();
        assert_eq!(output.state(), OutputState::Closed);
        assert_eq!(output.in_flight(), 0);
        assert_eq!(output.delay(), Duration::ZERO);

        // 迟到的通知不影响任何东西
        handle.notify_stale();
        assert_eq!(output.in_flight(), 0);

        let report = output.stats().unwrap();
        assert_eq!(report.blocks_submitted, 10);
        assert_eq!(report.blocks_completed, 4);
    }

    #[test]
    fn test_open_close_across_layouts() {
        // (采样率, 声道, 块 ms, 缓冲 ms, 期望帧数, 期望块数)
        let cases = [
            (44100, 2, 20, 200, 882, 10),
            (48000, 2, 10, 10, 480, 1),
            (22050, 1, 15, 100, 331, 6),
            (44100, 2, 1, 5, 44, 5),
        ];

        for (i, case) in cases.iter().enumerate() {
            let &(rate, channels, block_ms, buffer_ms, frames, count) = case;
            let config = OutputConfig {
                sample_rate: rate,
                channels,
                block_duration: Duration::from_millis(block_ms),
                buffer_duration: Duration::from_millis(buffer_ms),
                overrun: OverrunPolicy::Drop,
                lock_memory: i % 2 == 0,
                ..OutputConfig::default()
            };
            let (mut output, handle) = open_mock(&config);
            let layout = output.layout().unwrap();
            assert_eq!(layout.block_frames, frames);
            assert_eq!(layout.block_count, count);

            // 一半设备在 reset 时通知，另一半走强制回收
            let notifying = i % 2 == 1;
            handle.state().notify_on_reset = notifying;

            for round in 0..2 {
                if round > 0 {
                    output.open(&config).unwrap();
                }

                // 重新打开后缓冲池是全新的，整池数据都能放下
                let report = output.submit(&vec![0; layout.total_bytes()]).unwrap();
                assert!(report.is_complete());
                assert_eq!(report.submitted_blocks, count);
                assert_eq!(output.in_flight(), count);

                let notifier = handle.notifier().unwrap();
                output.close().unwrap();

                // 会话自己的计数器在 close 返回时已经归零
                assert_eq!(
                    format!("{:?}", notifier),
                    "CompletionNotifier { in_flight: 0 }"
                );
                assert_eq!(output.in_flight(), 0);
                assert_eq!(output.buffered_bytes(), 0);

                let stats = output.stats().unwrap();
                assert_eq!(stats.blocks_submitted, count as u64);
                let completed = if notifying { count as u64 } else { 0 };
                assert_eq!(stats.blocks_completed, completed);
                assert_eq!(stats.stray_completions, 0);
            }

            let state = handle.state();
            assert_eq!(state.opens, 2);
            assert_eq!(state.closes, 2);
            assert_eq!(state.resets, 2);
            assert_eq!(state.blocks.len(), count * 2);
        }
    }

    #[test]
    fn test_late_notification_does_not_reach_new_session() {
        let config = config_8k();
        let (mut output, handle) = open_mock(&config);
        output.submit(&vec![0; 640]).unwrap();
        let stale = handle.notifier().unwrap();
        output.close().unwrap();

        output.open(&config).unwrap();
        output.submit(&vec![0; 320]).unwrap();
        assert_eq!(output.in_flight(), 1);

        // 上一个会话的通知落在旧计数器上
        stale.notify();
        stale.notify();
        assert_eq!(output.in_flight(), 1);
        assert_eq!(output.stats().unwrap().blocks_completed, 0);
    }

    #[test]
    fn test_chunk_boundaries_are_arbitrary() {
        let (mut output, handle) = open_mock(&config_8k());

        let input: Vec<u8> = (0..3200u32).map(|i| (i % 251) as u8).collect();
        let mut submitted = 0;
        for chunk in input.chunks(14) {
            submitted += output.submit(chunk).unwrap().submitted_blocks;
        }

        assert_eq!(submitted, 10);
        assert_eq!(output.buffered_bytes(), 0);

        let state = handle.state();
        let indices: Vec<usize> = state.blocks.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        let played: Vec<u8> = state.blocks.iter().flat_map(|(_, b)| b.clone()).collect();
        assert_eq!(played, input);
    }

    #[test]
    fn test_partial_block_stays_buffered() {
        let (mut output, handle) = open_mock(&config_8k());

        let report = output.submit(&[1; 100]).unwrap();
        assert_eq!(report.submitted_blocks, 0);
        assert_eq!(output.buffered_bytes(), 100);
        assert_eq!(handle.submitted(), 0);
        assert_eq!(output.delay(), Duration::ZERO);

        let report = output.submit(&[2; 220]).unwrap();
        assert_eq!(report.submitted_blocks, 1);
        assert_eq!(output.buffered_bytes(), 0);
        assert_eq!(handle.submitted(), 1);
    }

    #[test]
    fn test_misaligned_chunk_rejected() {
        let mut config = config_8k();
        config.channels = 2;
        let (mut output, handle) = open_mock(&config);

        let result = output.submit(&[0; 6]);
        assert!(matches!(
            result,
            Err(OutputError::MisalignedChunk {
                len: 6,
                frame_bytes: 4
            })
        ));
        assert_eq!(output.buffered_bytes(), 0);
        assert_eq!(handle.submitted(), 0);
    }

    #[test]
    fn test_state_errors() {
        let (device, handle) = MockDevice::new();
        let mut output = BlockOutput::new(Box::new(device));

        assert!(matches!(output.submit(&[0; 2]), Err(OutputError::NotOpen)));
        assert!(matches!(output.close(), Err(OutputError::NotOpen)));
        assert!(matches!(output.flush_partial(), Err(OutputError::NotOpen)));
        assert!(matches!(
            output.drain(Duration::ZERO),
            Err(OutputError::NotOpen)
        ));
        assert_eq!(output.delay(), Duration::ZERO);
        assert!(output.stats().is_none());

        output.open(&config_8k()).unwrap();
        assert!(matches!(
            output.open(&config_8k()),
            Err(OutputError::AlreadyOpen)
        ));
        assert_eq!(handle.state().opens, 1);
        assert_eq!(output.state(), OutputState::Open);
    }

    #[test]
    fn test_invalid_config_leaves_closed() {
        let (device, handle) = MockDevice::new();
        let mut output = BlockOutput::new(Box::new(device));

        let mut config = config_8k();
        config.sample_rate = 0;
        assert!(matches!(
            output.open(&config),
            Err(OutputError::Config(ConfigError::InvalidSampleRate(0)))
        ));

        let mut config = config_8k();
        config.buffer_duration = Duration::from_millis(10);
        assert!(matches!(
            output.open(&config),
            Err(OutputError::Config(ConfigError::BufferShorterThanBlock { .. }))
        ));

        // 缓冲池过大时在打开设备前拒绝，不分配内存
        let mut config = config_8k();
        config.sample_rate = 48000;
        config.channels = 2;
        config.block_duration = Duration::from_secs(3600);
        config.buffer_duration = Duration::from_secs(36000);
        assert!(matches!(
            output.open(&config),
            Err(OutputError::Config(ConfigError::PoolTooLarge { .. }))
        ));

        assert_eq!(handle.state().opens, 0);
        assert_eq!(output.state(), OutputState::Closed);
    }

    #[test]
    fn test_device_open_failure_leaves_closed() {
        let (device, handle) = MockDevice::new();
        let mut output = BlockOutput::new(Box::new(device));

        handle.state().fail_open = true;
        assert!(matches!(
            output.open(&config_8k()),
            Err(OutputError::Device(DeviceError::Platform { .. }))
        ));
        assert_eq!(output.state(), OutputState::Closed);

        handle.state().fail_open = false;
        output.open(&config_8k()).unwrap();
        assert_eq!(output.state(), OutputState::Open);
    }

    #[test]
    fn test_device_id_passed_through() {
        let mut config = config_8k();
        config.device_id = Some(3);
        let (_output, handle) = open_mock(&config);
        assert_eq!(handle.state().device_id, Some(3));
    }

    #[test]
    fn test_overrun_drop_policy() {
        let mut config = config_8k();
        config.overrun = OverrunPolicy::Drop;
        let (mut output, handle) = open_mock(&config);

        let report = output.submit(&vec![0; 3200 + 320]).unwrap();
        assert_eq!(report.accepted, 3200);
        assert_eq!(report.dropped, 320);
        assert_eq!(report.submitted_blocks, 10);
        assert_eq!(handle.submitted(), 10);
        assert_eq!(output.in_flight(), 10);

        let stats = output.stats().unwrap();
        assert_eq!(stats.overrun_drops, 1);
        assert_eq!(stats.bytes_dropped, 320);
        assert_eq!(stats.overrun_waits, 0);

        // 一个块完成后，下一次 submit 复用最早的槽位
        handle.complete(1);
        let report = output.submit(&vec![0; 320]).unwrap();
        assert_eq!(report.submitted_blocks, 1);
        assert_eq!(handle.state().blocks.last().map(|(i, _)| *i), Some(0));
    }

    #[test]
    fn test_overrun_wait_succeeds_when_block_completes() {
        let mut config = config_8k();
        config.overrun_timeout = Some(Duration::from_secs(5));
        let (mut output, handle) = open_mock(&config);

        output.submit(&vec![0; 3200]).unwrap();

        let completer = handle.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            completer.complete(1)
        });

        let report = output.submit(&vec![0; 320]).unwrap();
        assert_eq!(worker.join().unwrap(), 1);
        assert_eq!(report.dropped, 0);
        assert_eq!(report.submitted_blocks, 1);
        assert_eq!(output.in_flight(), 10);
        assert_eq!(output.stats().unwrap().overrun_waits, 1);
    }

    #[test]
    fn test_overrun_wait_times_out_and_drops() {
        let mut config = config_8k();
        config.overrun_timeout = Some(Duration::from_millis(20));
        let (mut output, _handle) = open_mock(&config);

        output.submit(&vec![0; 3200]).unwrap();
        let report = output.submit(&vec![0; 640]).unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.dropped, 640);

        let stats = output.stats().unwrap();
        assert_eq!(stats.overrun_waits, 1);
        assert_eq!(stats.overrun_drops, 1);
    }

    #[test]
    fn test_device_rejection_keeps_session_open() {
        let (mut output, handle) = open_mock(&config_8k());
        handle.state().reject_writes = 1;

        let result = output.submit(&vec![0; 320]);
        assert!(matches!(
            result,
            Err(OutputError::Device(DeviceError::Rejected(_)))
        ));
        assert_eq!(output.state(), OutputState::Open);
        assert_eq!(output.in_flight(), 0);
        assert_eq!(output.buffered_bytes(), 0);

        let report = output.submit(&vec![0; 320]).unwrap();
        assert_eq!(report.submitted_blocks, 1);
        assert_eq!(output.in_flight(), 1);
        assert_eq!(output.stats().unwrap().device_errors, 1);
    }

    #[test]
    fn test_flush_partial_pads_with_silence() {
        let (mut output, handle) = open_mock(&config_8k());

        assert_eq!(output.flush_partial().unwrap(), 0);

        output.submit(&[0x7F; 100]).unwrap();
        assert_eq!(output.flush_partial().unwrap(), 220);
        assert_eq!(output.buffered_bytes(), 0);
        assert_eq!(output.in_flight(), 1);

        let state = handle.state();
        let (_, block) = &state.blocks[0];
        assert_eq!(block.len(), 320);
        assert!(block[..100].iter().all(|&b| b == 0x7F));
        assert!(block[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_drain_waits_for_completions() {
        let (mut output, handle) = open_mock(&config_8k());
        output.submit(&vec![0; 640]).unwrap();

        assert!(!output.drain(Duration::from_millis(10)).unwrap());

        let completer = handle.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(2);
        });

        assert!(output.drain(Duration::from_secs(5)).unwrap());
        assert_eq!(output.in_flight(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn test_close_with_notifying_reset() {
        let (mut output, handle) = open_mock(&config_8k());
        handle.state().notify_on_reset = true;
        output.submit(&vec![0; 1600]).unwrap();

        output.close().unwrap();
        let state = handle.state();
        assert_eq!(state.resets, 1);
        assert_eq!(state.closes, 1);
        drop(state);

        // 设备在 reset 时逐个通知，全部计入完成
        assert_eq!(output.stats().unwrap().blocks_completed, 5);
    }

    #[test]
    fn test_push_checks_format() {
        let (mut output, _handle) = open_mock(&config_8k());

        let wrong_rate = AudioMessage::s16le(16000, 1, vec![0; 320]);
        assert!(matches!(
            output.push(&wrong_rate),
            Err(OutputError::FormatMismatch { .. })
        ));

        let wrong_encoding = AudioMessage::new(
            PcmFormat {
                sample_rate: 8000,
                channels: 1,
                encoding: SampleEncoding::F32Le,
            },
            vec![0; 320],
        );
        assert!(matches!(
            output.push(&wrong_encoding),
            Err(OutputError::FormatMismatch { .. })
        ));

        let message = AudioMessage::s16le(8000, 1, vec![0; 320]);
        assert_eq!(message.duration(), Duration::from_millis(20));
        assert_eq!(output.push(&message).unwrap().submitted_blocks, 1);
        assert_eq!(output.pull(), None);
    }

    #[test]
    fn test_delay_refresh_interval() {
        let (mut output, handle) = open_mock(&config_8k());
        let t0 = Instant::now();

        assert_eq!(output.delay_at(t0), Duration::ZERO);
        output.submit(&vec![0; 640]).unwrap();
        assert_eq!(output.delay_at(t0 + Duration::from_millis(5)), Duration::ZERO);
        assert_eq!(
            output.delay_at(t0 + Duration::from_millis(10)),
            Duration::from_millis(40)
        );

        handle.complete(1);
        assert_eq!(
            output.delay_at(t0 + Duration::from_millis(20)),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_drop_closes_device() {
        let (mut output, handle) = open_mock(&config_8k());
        output.submit(&vec![0; 320]).unwrap();
        drop(output);

        let state = handle.state();
        assert_eq!(state.resets, 1);
        assert_eq!(state.closes, 1);
    }

    #[test]
    fn test_high_priority_is_best_effort() {
        let mut config = config_8k();
        config.high_priority = true;

        let worker = thread::spawn(move || {
            let (mut output, _handle) = open_mock(&config);
            output.submit(&vec![0; 320]).unwrap().submitted_blocks
        });
        assert_eq!(worker.join().unwrap(), 1);
    }

    #[test]
    fn test_clock_device_end_to_end() {
        let config = OutputConfig {
            sample_rate: 8000,
            channels: 1,
            block_duration: Duration::from_millis(10),
            buffer_duration: Duration::from_millis(50),
            overrun_timeout: Some(Duration::from_secs(2)),
            lock_memory: false,
            ..OutputConfig::default()
        };
        let mut output = BlockOutput::new(Box::new(ClockDevice::new()));
        output.open(&config).unwrap();
        assert_eq!(output.device_name(), "clock");

        // 20 块穿过 5 个槽位
        let report = output.submit(&vec![0; 20 * 160]).unwrap();
        assert_eq!(report.submitted_blocks, 20);
        assert_eq!(report.dropped, 0);
        assert!(output.in_flight() <= 5);

        assert!(output.drain(Duration::from_secs(5)).unwrap());
        output.close().unwrap();

        let stats = output.stats().unwrap();
        assert_eq!(stats.blocks_submitted, 20);
        assert_eq!(stats.blocks_completed, 20);
        assert_eq!(stats.played, Duration::from_millis(200));
    }
}
