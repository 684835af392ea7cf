//! pcmout - 块缓冲 PCM 播放
//!
//! 充当 sink 外面的"流水线"：从来源读取 s16le 数据，逐段推给 BlockOutput，
//! 显示播放位置、输出延迟和在途块数。

mod source;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};

use pcmout::audio::{
    AudioMessage, BlockLayout, BlockOutput, ClockDevice, OutputConfig, OutputDevice, OutputError,
    OverrunPolicy, PipelineSink,
};

use crate::source::{AudioSource, FileDecoder, RawSource, ToneSource};

/// 状态行刷新间隔
const STATUS_INTERVAL: Duration = Duration::from_millis(100);

/// pcmout - Buffered block-based PCM playback
#[derive(Parser)]
#[command(name = "pcmout")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play an audio file, a raw s16le file, or stdin ("-")
    Play {
        /// Audio file to play, or "-" for raw s16le on stdin
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Treat input as raw s16le interleaved PCM
        #[arg(long)]
        raw: bool,

        /// Sample rate of raw input
        #[arg(short = 'r', long, default_value = "44100")]
        rate: u32,

        /// Channel count of raw input
        #[arg(short, long, default_value = "2")]
        channels: u16,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Play a sine test tone
    Tone {
        /// Tone frequency in Hz
        #[arg(long, default_value = "440")]
        freq: f64,

        /// Tone length in seconds
        #[arg(long, default_value = "3")]
        seconds: f64,

        #[arg(short = 'r', long, default_value = "44100")]
        rate: u32,

        #[arg(short, long, default_value = "2")]
        channels: u16,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Show the block layout derived from a configuration
    Layout {
        #[arg(short = 'r', long, default_value = "44100")]
        rate: u32,

        #[arg(short, long, default_value = "2")]
        channels: u16,

        /// Block duration in milliseconds
        #[arg(long, default_value = "20")]
        block_ms: u32,

        /// Total buffer duration in milliseconds
        #[arg(long, default_value = "2000")]
        buffer_ms: u32,
    },
}

/// 输出相关参数（play / tone 共用）
#[derive(Args, Clone, Debug)]
struct OutputArgs {
    /// Block duration in milliseconds
    #[arg(long, default_value = "20")]
    block_ms: u32,

    /// Total buffer duration in milliseconds
    #[arg(long, default_value = "2000")]
    buffer_ms: u32,

    /// Output device ID (default: system default device)
    #[arg(short, long)]
    device: Option<u32>,

    /// Raise the producer thread to realtime priority
    #[arg(long)]
    high_priority: bool,

    /// Drop data immediately when all blocks are in flight instead of waiting
    #[arg(long)]
    drop_on_overrun: bool,

    /// Output backend
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Write rendered PCM to FILE (clock backend)
    #[arg(long, value_name = "FILE")]
    sink: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Software clock, no sound card needed
    Clock,
    /// CoreAudio AudioQueue (macOS)
    AudioQueue,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Backend::AudioQueue
        } else {
            Backend::Clock
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Play {
            ref path,
            raw,
            rate,
            channels,
            ref output,
        } => {
            let chunk_frames = chunk_frames(rate, output.block_ms);
            let source: Box<dyn AudioSource> = if path.as_os_str() == "-" {
                Box::new(RawSource::new(io::stdin(), rate, channels, chunk_frames))
            } else if raw || is_raw_pcm(path) {
                Box::new(RawSource::open(path, rate, channels, chunk_frames)?)
            } else {
                Box::new(
                    FileDecoder::open(path)
                        .with_context(|| format!("cannot play {}", path.display()))?,
                )
            };
            play(source, output)?;
        }
        Commands::Tone {
            freq,
            seconds,
            rate,
            channels,
            ref output,
        } => {
            let source = ToneSource::new(
                freq,
                Duration::from_secs_f64(seconds.max(0.0)),
                rate,
                channels,
                chunk_frames(rate, output.block_ms),
            );
            play(Box::new(source), output)?;
        }
        Commands::Layout {
            rate,
            channels,
            block_ms,
            buffer_ms,
        } => {
            show_layout(rate, channels, block_ms, buffer_ms)?;
        }
    }

    Ok(())
}

/// .pcm / .raw 按原始数据处理
fn is_raw_pcm(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pcm") || e.eq_ignore_ascii_case("raw"))
        .unwrap_or(false)
}

/// 每次从来源读取一个块时长的数据
fn chunk_frames(rate: u32, block_ms: u32) -> usize {
    (rate as usize * block_ms as usize / 1000).max(1)
}

/// 显示块布局
fn show_layout(rate: u32, channels: u16, block_ms: u32, buffer_ms: u32) -> anyhow::Result<()> {
    let layout = BlockLayout::derive(
        rate,
        channels,
        Duration::from_millis(block_ms as u64),
        Duration::from_millis(buffer_ms as u64),
    )?;

    println!("=== Block Layout ===\n");
    println!("Format:        {}", layout.format);
    println!("Block:         {} frames, {} bytes", layout.block_frames, layout.block_bytes);
    println!(
        "Block length:  {:.3} ms",
        layout.block_duration().as_secs_f64() * 1000.0
    );
    println!("Blocks:        {}", layout.block_count);
    println!("Pool size:     {} bytes", layout.total_bytes());
    println!(
        "Max delay:     {:.1} ms",
        layout.total_duration().as_secs_f64() * 1000.0
    );
    Ok(())
}

/// 创建输出配置
fn create_output_config(args: &OutputArgs, sample_rate: u32, channels: u16) -> OutputConfig {
    OutputConfig {
        sample_rate,
        channels,
        block_duration: Duration::from_millis(args.block_ms as u64),
        buffer_duration: Duration::from_millis(args.buffer_ms as u64),
        device_id: args.device,
        high_priority: args.high_priority,
        overrun: if args.drop_on_overrun {
            OverrunPolicy::Drop
        } else {
            OverrunPolicy::Wait
        },
        ..OutputConfig::default()
    }
}

/// 按参数选择输出后端
fn create_device(args: &OutputArgs) -> anyhow::Result<Box<dyn OutputDevice>> {
    // 指定了 --sink 又没指定后端时用 clock
    let backend = match (args.backend, &args.sink) {
        (Some(backend), _) => backend,
        (None, Some(_)) => Backend::Clock,
        (None, None) => Backend::default(),
    };

    match backend {
        Backend::Clock => match &args.sink {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("cannot create sink file {}", path.display()))?;
                Ok(Box::new(ClockDevice::with_sink(BufWriter::new(file))))
            }
            None => Ok(Box::new(ClockDevice::new())),
        },
        Backend::AudioQueue => audio_queue_device(args),
    }
}

#[cfg(target_os = "macos")]
fn audio_queue_device(args: &OutputArgs) -> anyhow::Result<Box<dyn OutputDevice>> {
    if args.sink.is_some() {
        log::warn!("--sink is ignored by the audio-queue backend");
    }
    Ok(Box::new(pcmout::audio::AudioQueueDevice::new()))
}

#[cfg(not(target_os = "macos"))]
fn audio_queue_device(_args: &OutputArgs) -> anyhow::Result<Box<dyn OutputDevice>> {
    anyhow::bail!("the audio-queue backend is only available on macOS, use --backend clock")
}

/// 播放一个来源直到结束或 Ctrl+C
fn play(mut source: Box<dyn AudioSource>, args: &OutputArgs) -> anyhow::Result<()> {
    let info = source.info().clone();
    println!("pcmout - Playing: {}", info.description);

    let config = create_output_config(args, info.sample_rate, info.channels);
    let mut output = BlockOutput::new(create_device(args)?);
    output
        .open(&config)
        .with_context(|| format!("failed to open {} output", output.device_name()))?;

    let layout = output
        .layout()
        .context("output reported no layout after open")?;
    println!("Output: {} ({})", output.device_name(), layout);
    println!("Playing. Press Ctrl+C to stop.\n");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let total = info.duration();
    let mut last_status: Option<Instant> = None;
    let mut buffer = Vec::new();
    let mut device_errors = 0u64;
    let mut finished = false;

    while running.load(Ordering::SeqCst) {
        buffer.clear();
        if !source.read_chunk(&mut buffer)? {
            finished = true;
            break;
        }
        if buffer.is_empty() {
            continue;
        }

        // Drop 策略下由驱动自己控制节奏，只在有空闲槽位时推送
        if config.overrun == OverrunPolicy::Drop {
            while output.in_flight() >= layout.block_count && running.load(Ordering::SeqCst) {
                std::thread::sleep(layout.block_duration() / 2);
            }
        }

        let message = AudioMessage::s16le(info.sample_rate, info.channels, buffer);
        match output.push(&message) {
            Ok(report) if !report.is_complete() => {
                log::debug!("Overrun dropped {} bytes", report.dropped);
            }
            Ok(_) => {}
            Err(OutputError::Device(e)) => {
                device_errors += 1;
                log::warn!("Block dropped by device: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
        buffer = message.data;

        if last_status.map_or(true, |t| t.elapsed() >= STATUS_INTERVAL) {
            print_status(&mut output, total)?;
            last_status = Some(Instant::now());
        }
    }

    if finished {
        output.flush_partial()?;
        while running.load(Ordering::SeqCst) && !output.drain(STATUS_INTERVAL)? {
            print_status(&mut output, total)?;
        }
        print_status(&mut output, total)?;
    }

    println!();
    output.close()?;

    if let Some(report) = output.stats() {
        println!("\n{}", report);
    }
    if device_errors > 0 {
        eprintln!("Warning: {} blocks were rejected by the device", device_errors);
    }

    Ok(())
}

/// 打印一行播放状态
fn print_status(output: &mut BlockOutput, total: Option<Duration>) -> anyhow::Result<()> {
    let delay = output.delay();
    let in_flight = output.in_flight();
    let blocks = output.layout().map_or(0, |l| l.block_count);
    let (played, drops) = output
        .stats()
        .map_or((Duration::ZERO, 0), |s| (s.played, s.overrun_drops));

    print!(
        "\r  {} / {}  |  Delay: {:4.0} ms  |  In flight: {:3}/{}  |  Drops: {}  ",
        format_time(played),
        total.map_or_else(|| "--:--.--".to_string(), format_time),
        delay.as_secs_f64() * 1000.0,
        in_flight,
        blocks,
        drops
    );
    io::stdout().flush()?;
    Ok(())
}

/// mm:ss.ss
fn format_time(d: Duration) -> String {
    let secs = d.as_secs_f64();
    format!("{:02}:{:05.2}", (secs / 60.0) as u32, secs % 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_config_mapping() {
        let cli = Cli::try_parse_from([
            "pcmout",
            "tone",
            "--block-ms",
            "10",
            "--buffer-ms",
            "500",
            "-d",
            "2",
            "--drop-on-overrun",
            "--high-priority",
        ])
        .unwrap();

        let Commands::Tone { output, .. } = cli.command else {
            panic!("expected tone command");
        };
        let config = create_output_config(&output, 48000, 1);
        assert_eq!(config.block_duration, Duration::from_millis(10));
        assert_eq!(config.buffer_duration, Duration::from_millis(500));
        assert_eq!(config.device_id, Some(2));
        assert_eq!(config.overrun, OverrunPolicy::Drop);
        assert!(config.high_priority);

        let layout = config.layout().unwrap();
        assert_eq!(layout.block_frames, 480);
        assert_eq!(layout.block_count, 50);
    }

    #[test]
    fn test_play_defaults() {
        let cli = Cli::try_parse_from(["pcmout", "-v", "play", "-"]).unwrap();
        assert!(cli.verbose);
        let Commands::Play {
            path,
            raw,
            rate,
            channels,
            output,
        } = cli.command
        else {
            panic!("expected play command");
        };
        assert_eq!(path, PathBuf::from("-"));
        assert!(!raw);
        assert_eq!((rate, channels), (44100, 2));
        assert_eq!(output.block_ms, 20);
        assert_eq!(output.buffer_ms, 2000);
        assert_eq!(create_output_config(&output, rate, channels).overrun, OverrunPolicy::Wait);
    }

    #[test]
    fn test_raw_extension_detection() {
        assert!(is_raw_pcm(Path::new("take.pcm")));
        assert!(is_raw_pcm(Path::new("TAKE.RAW")));
        assert!(!is_raw_pcm(Path::new("song.flac")));
        assert!(!is_raw_pcm(Path::new("noext")));
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(Duration::from_millis(83_250)), "01:23.25");
        assert_eq!(format_time(Duration::ZERO), "00:00.00");
    }

    #[test]
    fn test_tone_through_clock_sink_file() {
        let path = std::env::temp_dir().join(format!("pcmout-sink-{}.pcm", std::process::id()));
        let args = OutputArgs {
            block_ms: 10,
            buffer_ms: 50,
            device: None,
            high_priority: false,
            drop_on_overrun: false,
            backend: None,
            sink: Some(path.clone()),
        };

        let mut config = create_output_config(&args, 8000, 1);
        config.overrun_timeout = Some(Duration::from_secs(2));
        config.lock_memory = false;
        let mut output = BlockOutput::new(create_device(&args).unwrap());
        output.open(&config).unwrap();

        let mut tone = ToneSource::new(440.0, Duration::from_millis(105), 8000, 1, 80);
        let mut buffer = Vec::new();
        while tone.read_chunk(&mut buffer).unwrap() {
            output.submit(&buffer).unwrap();
            buffer.clear();
        }
        // 105ms = 10 个整块 + 半块
        assert_eq!(output.flush_partial().unwrap(), 80);
        assert!(output.drain(Duration::from_secs(5)).unwrap());
        output.close().unwrap();
        drop(output);

        let written = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(written.len(), 11 * 160);
    }
}
