//! 音频来源
//!
//! 把各种输入统一成 s16le 交织数据块，交给 sink：
//! - RawSource: 原始 s16le 字节流（文件或 stdin）
//! - FileDecoder: symphonia 解码 FLAC / WAV / AIFF / MP3
//! - ToneSource: 正弦测试音

use std::f64::consts::TAU;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use pcmout::audio::format::encode_s16le;

/// 来源错误
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open input: {0}")]
    Open(#[source] io::Error),

    #[error("unsupported audio format")]
    UnsupportedFormat,

    #[error("no audio track found")]
    NoAudioTrack,

    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// 来源信息
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// 总帧数（如果已知）
    pub total_frames: Option<u64>,
    pub description: String,
}

impl SourceInfo {
    pub fn duration(&self) -> Option<Duration> {
        self.total_frames
            .map(|frames| Duration::from_secs_f64(frames as f64 / self.sample_rate as f64))
    }
}

/// s16le 数据来源
pub trait AudioSource {
    fn info(&self) -> &SourceInfo;

    /// 读取下一段数据（整帧）追加到 `out`，返回 false 表示结束
    fn read_chunk(&mut self, out: &mut Vec<u8>) -> Result<bool, SourceError>;
}

/// 原始 s16le 字节流
pub struct RawSource<R: Read> {
    reader: R,
    info: SourceInfo,
    chunk_bytes: usize,
    frame_bytes: usize,
    /// 上一次读到的不完整帧
    carry: Vec<u8>,
    buffer: Vec<u8>,
}

impl<R: Read> RawSource<R> {
    pub fn new(reader: R, sample_rate: u32, channels: u16, chunk_frames: usize) -> Self {
        let frame_bytes = channels.max(1) as usize * 2;
        Self {
            reader,
            info: SourceInfo {
                sample_rate,
                channels,
                total_frames: None,
                description: format!("raw s16le {}Hz {}ch", sample_rate, channels),
            },
            chunk_bytes: chunk_frames.max(1) * frame_bytes,
            frame_bytes,
            carry: Vec::with_capacity(frame_bytes),
            buffer: Vec::new(),
        }
    }

    /// 已知总长度时设置（例如普通文件）
    pub fn with_total_bytes(mut self, bytes: u64) -> Self {
        self.info.total_frames = Some(bytes / self.frame_bytes as u64);
        self
    }
}

impl RawSource<File> {
    pub fn open<P: AsRef<Path>>(
        path: P,
        sample_rate: u32,
        channels: u16,
        chunk_frames: usize,
    ) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(SourceError::Open)?;
        let len = file.metadata().map(|m| m.len()).ok();

        let mut source = Self::new(file, sample_rate, channels, chunk_frames);
        source.info.description = format!("{} ({})", path.display(), source.info.description);
        if let Some(len) = len {
            source = source.with_total_bytes(len);
        }
        Ok(source)
    }
}

impl<R: Read> AudioSource for RawSource<R> {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_chunk(&mut self, out: &mut Vec<u8>) -> Result<bool, SourceError> {
        // 上次剩下的半帧放在最前面
        let mut pos = self.carry.len();
        self.buffer.clear();
        self.buffer.append(&mut self.carry);
        self.buffer.resize(self.chunk_bytes.max(pos), 0);

        let mut eof = false;
        while pos < self.buffer.len() {
            match self.reader.read(&mut self.buffer[pos..]) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => pos += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let aligned = pos - pos % self.frame_bytes;
        if aligned < pos {
            if eof {
                log::warn!(
                    "Input ended inside a frame, dropping {} trailing bytes",
                    pos - aligned
                );
            } else {
                self.carry.extend_from_slice(&self.buffer[aligned..pos]);
            }
        }

        out.extend_from_slice(&self.buffer[..aligned]);
        Ok(!(eof && aligned == 0))
    }
}

/// 音频文件解码器
pub struct FileDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: SourceInfo,
    /// 交织 i16 样本缓冲，按第一个 packet 的容量分配
    samples: Option<SampleBuffer<i16>>,
}

impl FileDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref();

        let file = File::open(path).map_err(SourceError::Open)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|_| SourceError::UnsupportedFormat)?;

        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(SourceError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.ok_or(SourceError::NoAudioTrack)?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(2);

        let codec_name = symphonia::default::get_codecs()
            .get_codec(codec_params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let info = SourceInfo {
            sample_rate,
            channels,
            total_frames: codec_params.n_frames,
            description: format!("{} ({}, {}Hz {}ch)", path.display(), codec_name, sample_rate, channels),
        };

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| SourceError::DecoderCreation(e.to_string()))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            samples: None,
        })
    }
}

impl AudioSource for FileDecoder {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    /// 解码一个 packet，任意源格式都转换为 i16
    fn read_chunk(&mut self, out: &mut Vec<u8>) -> Result<bool, SourceError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(SourceError::DecodeFailed(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 跳过损坏的帧
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(SourceError::DecodeFailed(e.to_string())),
            };

            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let capacity = decoded.capacity();
            let needed = capacity * spec.channels.count();
            if self.samples.as_ref().is_some_and(|buf| buf.capacity() < needed) {
                self.samples = None;
            }
            let samples = self
                .samples
                .get_or_insert_with(|| SampleBuffer::new(capacity as u64, spec));
            samples.copy_interleaved_ref(decoded);
            encode_s16le(samples.samples(), out);
            return Ok(true);
        }
    }
}

/// 正弦测试音
pub struct ToneSource {
    info: SourceInfo,
    frequency: f64,
    amplitude: f64,
    chunk_frames: usize,
    /// 已生成帧数
    position: u64,
    scratch: Vec<i16>,
}

impl ToneSource {
    pub fn new(
        frequency: f64,
        duration: Duration,
        sample_rate: u32,
        channels: u16,
        chunk_frames: usize,
    ) -> Self {
        let total_frames = (duration.as_secs_f64() * sample_rate as f64).round() as u64;
        Self {
            info: SourceInfo {
                sample_rate,
                channels,
                total_frames: Some(total_frames),
                description: format!("{:.0} Hz tone", frequency),
            },
            frequency,
            amplitude: 0.5,
            chunk_frames: chunk_frames.max(1),
            position: 0,
            scratch: Vec::new(),
        }
    }
}

impl AudioSource for ToneSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_chunk(&mut self, out: &mut Vec<u8>) -> Result<bool, SourceError> {
        let total = self.info.total_frames.unwrap_or(0);
        let remaining = total.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(false);
        }

        let frames = remaining.min(self.chunk_frames as u64);
        let channels = self.info.channels as usize;
        let rate = self.info.sample_rate as f64;

        self.scratch.clear();
        for i in 0..frames {
            let t = (self.position + i) as f64 / rate;
            let value = (TAU * self.frequency * t).sin() * self.amplitude;
            let sample = (value * i16::MAX as f64) as i16;
            for _ in 0..channels {
                self.scratch.push(sample);
            }
        }
        self.position += frames;

        encode_s16le(&self.scratch, out);
        Ok(true)
    }
}
