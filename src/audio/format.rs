//! PCM 格式与块布局
//!
//! sink 只接受 signed 16-bit little-endian 交织 PCM：
//! - 帧 = 每声道一个 i16 样本，LRLRLR...
//! - 块 = 固定时长、固定字节数的数据单元，一次提交给设备
//!
//! 块布局在 open 时由配置推导，会话期间不变。

use std::time::Duration;

use thiserror::Error;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// 缓冲池总字节数上限（1 GiB）
pub const MAX_POOL_BYTES: usize = 1 << 30;

/// 样本编码
///
/// 只有 `S16Le` 会被 sink 接受，其余编码用于识别并拒绝上游送来的错误消息。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleEncoding {
    #[default]
    S16Le,
    S16Be,
    U8,
    F32Le,
}

impl SampleEncoding {
    /// 每样本字节数
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16Le | Self::S16Be => 2,
            Self::F32Le => 4,
        }
    }
}

impl std::fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::S16Le => "s16le",
            Self::S16Be => "s16be",
            Self::U8 => "u8",
            Self::F32Le => "f32le",
        };
        f.write_str(name)
    }
}

/// PCM 格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl PcmFormat {
    /// sink 使用的唯一格式：s16le 交织
    pub fn s16le(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            encoding: SampleEncoding::S16Le,
        }
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }

    /// 帧数对应的播放时长
    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = frames as u128 * NANOS_PER_SEC / self.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// 字节数对应的播放时长（不足一帧的尾部忽略）
    pub fn bytes_to_duration(&self, bytes: u64) -> Duration {
        let frame = self.bytes_per_frame() as u64;
        if frame == 0 {
            return Duration::ZERO;
        }
        self.frames_to_duration(bytes / frame)
    }
}

impl std::fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Hz {}ch {}", self.sample_rate, self.channels, self.encoding)
    }
}

/// 配置错误
///
/// 全部在 open 时同步检出，失败的 open 不改变任何状态。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid sample rate: {0} Hz")]
    InvalidSampleRate(u32),

    #[error("invalid channel count: {0}")]
    InvalidChannels(u16),

    #[error("block duration {block:?} holds no frames at {sample_rate} Hz")]
    ZeroBlockSize { block: Duration, sample_rate: u32 },

    #[error("buffer duration {buffer:?} is shorter than one block ({block:?})")]
    BufferShorterThanBlock { buffer: Duration, block: Duration },

    #[error("buffer pool of {bytes} bytes exceeds the {limit} byte limit")]
    PoolTooLarge { bytes: u128, limit: usize },
}

/// 会话的块布局
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLayout {
    pub format: PcmFormat,
    /// 每块帧数
    pub block_frames: usize,
    /// 每块字节数（= 块容量）
    pub block_bytes: usize,
    /// 块数 N
    pub block_count: usize,
}

impl BlockLayout {
    /// 从采样率、声道数和两个时长推导布局
    ///
    /// - block_frames = round(block_duration × sample_rate)
    /// - block_bytes  = block_frames × channels × 2
    /// - block_count  = floor(buffer_duration / block_duration)
    ///
    /// 全部用整数纳秒计算，200ms / 20ms 这类整除比例得到精确的 N。
    pub fn derive(
        sample_rate: u32,
        channels: u16,
        block_duration: Duration,
        buffer_duration: Duration,
    ) -> Result<Self, ConfigError> {
        if sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(sample_rate));
        }
        if channels == 0 {
            return Err(ConfigError::InvalidChannels(channels));
        }

        let format = PcmFormat::s16le(sample_rate, channels);

        let block_ns = block_duration.as_nanos();
        let block_frames = (block_ns * sample_rate as u128 + NANOS_PER_SEC / 2) / NANOS_PER_SEC;
        if block_frames == 0 {
            return Err(ConfigError::ZeroBlockSize {
                block: block_duration,
                sample_rate,
            });
        }

        if buffer_duration < block_duration {
            return Err(ConfigError::BufferShorterThanBlock {
                buffer: buffer_duration,
                block: block_duration,
            });
        }

        // 全部在 u128 里算完再检查上限，通过之后转换到 usize 不会截断
        let block_count = buffer_duration.as_nanos() / block_ns;
        let block_bytes = block_frames * format.bytes_per_frame() as u128;
        let total = block_bytes.saturating_mul(block_count);
        let too_large = ConfigError::PoolTooLarge {
            bytes: total,
            limit: MAX_POOL_BYTES,
        };
        if total > MAX_POOL_BYTES as u128 {
            return Err(too_large);
        }

        Ok(Self {
            format,
            block_frames: usize::try_from(block_frames).map_err(|_| too_large.clone())?,
            block_bytes: usize::try_from(block_bytes).map_err(|_| too_large.clone())?,
            block_count: usize::try_from(block_count).map_err(|_| too_large)?,
        })
    }

    /// 单块的实际播放时长（按取整后的帧数计算）
    pub fn block_duration(&self) -> Duration {
        self.format.frames_to_duration(self.block_frames as u64)
    }

    /// 所有块的总字节数
    pub fn total_bytes(&self) -> usize {
        self.block_bytes * self.block_count
    }

    /// 所有块的总时长，即最大输出延迟
    pub fn total_duration(&self) -> Duration {
        self.block_duration() * self.block_count as u32
    }
}

impl std::fmt::Display for BlockLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} | {} blocks x {} bytes ({} frames, {:.2} ms)",
            self.format,
            self.block_count,
            self.block_bytes,
            self.block_frames,
            self.block_duration().as_secs_f64() * 1000.0
        )
    }
}

/// 将 i16 样本打包为 s16le 字节，追加到 `output`
pub fn encode_s16le(samples: &[i16], output: &mut Vec<u8>) {
    output.reserve(samples.len() * 2);
    for &sample in samples {
        output.extend_from_slice(&sample.to_le_bytes());
    }
}
